//! Evaluation metrics over model result files.
//!
//! Each metric declares which evaluation sets it needs; the evaluation
//! pipeline loads only those. Metrics are registered under category
//! factories (`rating`, `ranking`, `coverage`) and resolved by a linear
//! scan across categories.

use std::collections::{HashMap, HashSet};

use rayon::prelude::*;

use crate::data::{RatingTable, ResultRow};
use crate::errors::CoreError;
use crate::factory::{Factory, FactoryNode, GroupFactory};
use crate::params::{ParamSchema, ParamValue};
use crate::{ItemId, UserId};

/// The evaluation sets a metric may consume. Ratings are always present;
/// train and test are loaded only when the metric requires them.
pub struct EvaluationSets {
    /// Rows of the model's result file.
    pub ratings: Vec<ResultRow>,
    /// The train set, when required.
    pub train: Option<RatingTable>,
    /// The test set, when required.
    pub test: Option<RatingTable>,
}

/// A single evaluation measure.
pub trait Metric: Send {
    /// Whether [`EvaluationSets::train`] must be loaded.
    fn requires_train_set(&self) -> bool {
        false
    }

    /// Whether [`EvaluationSets::test`] must be loaded.
    fn requires_test_set(&self) -> bool {
        false
    }

    /// Computes the metric value.
    fn evaluate(&self, sets: &EvaluationSets) -> Result<f64, CoreError>;
}

/// Metric factories nested under category keys.
pub type MetricFactories = GroupFactory<Box<dyn Metric>, ()>;

fn scored_pairs(ratings: &[ResultRow]) -> Result<Vec<(f64, f64)>, CoreError> {
    let pairs: Vec<(f64, f64)> = ratings
        .iter()
        .filter_map(|row| row.rating.map(|truth| (row.score, truth)))
        .collect();

    if pairs.is_empty() {
        return Err(CoreError::Numeric(
            "no rows with ground-truth ratings to evaluate".to_owned(),
        ));
    }
    Ok(pairs)
}

struct MeanAbsoluteError;

impl Metric for MeanAbsoluteError {
    fn evaluate(&self, sets: &EvaluationSets) -> Result<f64, CoreError> {
        let pairs = scored_pairs(&sets.ratings)?;
        let total: f64 = pairs.iter().map(|(score, truth)| (score - truth).abs()).sum();
        Ok(total / pairs.len() as f64)
    }
}

struct RootMeanSquaredError;

impl Metric for RootMeanSquaredError {
    fn evaluate(&self, sets: &EvaluationSets) -> Result<f64, CoreError> {
        let pairs = scored_pairs(&sets.ratings)?;
        let total: f64 = pairs
            .iter()
            .map(|(score, truth)| (score - truth) * (score - truth))
            .sum();
        Ok((total / pairs.len() as f64).sqrt())
    }
}

fn results_by_user(ratings: &[ResultRow]) -> HashMap<UserId, Vec<&ResultRow>> {
    let mut by_user: HashMap<UserId, Vec<&ResultRow>> = HashMap::new();
    for row in ratings {
        by_user.entry(row.user).or_insert_with(Vec::new).push(row);
    }
    for rows in by_user.values_mut() {
        // Result files are rank-ordered already; sort defensively by rank
        // then score so hand-built fixtures behave the same.
        rows.sort_by(|a, b| match (a.rank, b.rank) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal),
        });
    }
    by_user
}

fn relevant_by_user(test: &RatingTable, threshold: Option<f64>) -> HashMap<UserId, HashSet<ItemId>> {
    let mut by_user: HashMap<UserId, HashSet<ItemId>> = HashMap::new();
    for row in test.rows() {
        if threshold.map_or(true, |t| row.rating >= t) {
            by_user.entry(row.user).or_insert_with(HashSet::new).insert(row.item);
        }
    }
    by_user
}

/// Mean reciprocal rank of the first test-set hit per user.
struct MeanReciprocalRank;

impl Metric for MeanReciprocalRank {
    fn requires_test_set(&self) -> bool {
        true
    }

    fn evaluate(&self, sets: &EvaluationSets) -> Result<f64, CoreError> {
        let test = sets
            .test
            .as_ref()
            .ok_or_else(|| CoreError::Logic("test set not loaded".to_owned()))?;
        let relevant = relevant_by_user(test, None);
        let by_user = results_by_user(&sets.ratings);

        let reciprocal_ranks: Vec<f64> = by_user
            .par_iter()
            .filter_map(|(user, rows)| {
                let items = relevant.get(user)?;
                let hit = rows
                    .iter()
                    .position(|row| items.contains(&row.item))
                    .map(|position| 1.0 / (position + 1) as f64)
                    .unwrap_or(0.0);
                Some(hit)
            })
            .collect();

        if reciprocal_ranks.is_empty() {
            return Err(CoreError::Numeric(
                "no users shared between results and test set".to_owned(),
            ));
        }
        Ok(reciprocal_ranks.iter().sum::<f64>() / reciprocal_ranks.len() as f64)
    }
}

/// Fraction of the top-k recommendations that are relevant in the test
/// set, averaged over users.
struct PrecisionAtK {
    k: usize,
    relevance_threshold: f64,
}

impl Metric for PrecisionAtK {
    fn requires_test_set(&self) -> bool {
        true
    }

    fn evaluate(&self, sets: &EvaluationSets) -> Result<f64, CoreError> {
        let test = sets
            .test
            .as_ref()
            .ok_or_else(|| CoreError::Logic("test set not loaded".to_owned()))?;
        let relevant = relevant_by_user(test, Some(self.relevance_threshold));
        let by_user = results_by_user(&sets.ratings);

        let precisions: Vec<f64> = by_user
            .par_iter()
            .filter_map(|(user, rows)| {
                let items = relevant.get(user)?;
                let top = rows.iter().take(self.k);
                let hits = top.filter(|row| items.contains(&row.item)).count();
                Some(hits as f64 / self.k as f64)
            })
            .collect();

        if precisions.is_empty() {
            return Err(CoreError::Numeric(
                "no users shared between results and test set".to_owned(),
            ));
        }
        Ok(precisions.iter().sum::<f64>() / precisions.len() as f64)
    }
}

/// Fraction of the train-set item catalog appearing in the results.
struct ItemCoverage;

impl Metric for ItemCoverage {
    fn requires_train_set(&self) -> bool {
        true
    }

    fn evaluate(&self, sets: &EvaluationSets) -> Result<f64, CoreError> {
        let train = sets
            .train
            .as_ref()
            .ok_or_else(|| CoreError::Logic("train set not loaded".to_owned()))?;
        let catalog: HashSet<ItemId> = train.unique_items().into_iter().collect();
        if catalog.is_empty() {
            return Err(CoreError::Numeric("empty item catalog".to_owned()));
        }

        let covered: HashSet<ItemId> = sets
            .ratings
            .iter()
            .map(|row| row.item)
            .filter(|item| catalog.contains(item))
            .collect();
        Ok(covered.len() as f64 / catalog.len() as f64)
    }
}

/// Builds the metric category factories.
pub fn create_metric_factories() -> MetricFactories {
    let mut rating: Factory<Box<dyn Metric>, ()> = Factory::new("rating");
    rating
        .add(
            "mae",
            Box::new(|_, _, _| Ok(Box::new(MeanAbsoluteError) as Box<dyn Metric>)),
            None,
        )
        .expect("fresh factory");
    rating
        .add(
            "rmse",
            Box::new(|_, _, _| Ok(Box::new(RootMeanSquaredError) as Box<dyn Metric>)),
            None,
        )
        .expect("fresh factory");

    let mut ranking: Factory<Box<dyn Metric>, ()> = Factory::new("ranking");
    ranking
        .add(
            "mrr",
            Box::new(|_, _, _| Ok(Box::new(MeanReciprocalRank) as Box<dyn Metric>)),
            None,
        )
        .expect("fresh factory");
    ranking
        .add(
            "precision_at_k",
            Box::new(|_, params, _| {
                let k = params
                    .get("k")
                    .and_then(ParamValue::as_u64)
                    .ok_or_else(|| CoreError::Logic("missing parameter 'k'".to_owned()))?;
                if k == 0 {
                    return Err(CoreError::Logic("'k' must be positive".to_owned()));
                }
                let relevance_threshold = params
                    .get("relevance_threshold")
                    .and_then(ParamValue::as_f64)
                    .ok_or_else(|| {
                        CoreError::Logic("missing parameter 'relevance_threshold'".to_owned())
                    })?;
                Ok(Box::new(PrecisionAtK {
                    k: k as usize,
                    relevance_threshold,
                }) as Box<dyn Metric>)
            }),
            Some(Box::new(|| {
                ParamSchema::new()
                    .with_int_range("k", 10, 1, 1_000)
                    .with_range("relevance_threshold", 1.0, 0.0, 1_000.0)
            })),
        )
        .expect("fresh factory");

    let mut coverage: Factory<Box<dyn Metric>, ()> = Factory::new("coverage");
    coverage
        .add(
            "item_coverage",
            Box::new(|_, _, _| Ok(Box::new(ItemCoverage) as Box<dyn Metric>)),
            None,
        )
        .expect("fresh factory");

    let mut group = MetricFactories::new("metrics");
    group.add(FactoryNode::Leaf(rating)).expect("fresh group");
    group.add(FactoryNode::Leaf(ranking)).expect("fresh group");
    group.add(FactoryNode::Leaf(coverage)).expect("fresh group");
    group
}
