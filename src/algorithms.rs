//! The algorithm capability surface and the built-in baselines.
//!
//! Concrete ML-library wrappers live outside the core; the pipelines only
//! rely on the uniform train/predict/recommend surface below. The
//! baselines registered here keep experiments runnable end to end without
//! any external library and serve as reference points in evaluations.

use std::collections::{HashMap, HashSet};
use std::hash::Hasher;

use rand::Rng;
use siphasher::sip::SipHasher;

use crate::data::RatingTable;
use crate::errors::CoreError;
use crate::factory::{Factory, FactoryNode, GroupFactory};
use crate::params::{ParamSchema, ParamValue, Params};
use crate::{ItemId, UserId};

/// Construction context shared by all algorithms of one model batch.
/// Replaces the keyword-argument soup of loosely-typed hosts: each
/// constructor reads only the fields it needs.
#[derive(Clone, Copy, Debug)]
pub struct AlgorithmContext {
    /// Threads available to internally-parallel implementations.
    pub num_threads: usize,
    /// Rating range of the training data.
    pub rating_scale: (f64, f64),
    /// Whether recommenders exclude items the user already rated.
    pub rated_items_filter: bool,
    /// Batch-level seed used when a model has none of its own.
    pub seed: Option<u64>,
}

/// A rating-prediction model.
pub trait Predictor: Send {
    /// Fits the model on the train set. The table is shared read-only
    /// across the whole model batch and must not be mutated.
    fn train(&mut self, train: &RatingTable) -> Result<(), CoreError>;

    /// Predicts a rating for each `(user, item)` pair.
    fn predict(&self, pairs: &[(UserId, ItemId)]) -> Result<Vec<f64>, CoreError>;
}

/// A top-K recommendation model.
pub trait Recommender: Send {
    /// Fits the model on the train set; same sharing contract as
    /// [`Predictor::train`].
    fn train(&mut self, train: &RatingTable) -> Result<(), CoreError>;

    /// Returns the `num_items` highest-scored items per user, best first.
    fn recommend(
        &self,
        users: &[UserId],
        num_items: usize,
    ) -> Result<Vec<Vec<(ItemId, f64)>>, CoreError>;
}

/// Factories of predictors grouped by API name.
pub type PredictorFactories = GroupFactory<Box<dyn Predictor>, AlgorithmContext>;
/// Factories of recommenders grouped by API name.
pub type RecommenderFactories = GroupFactory<Box<dyn Recommender>, AlgorithmContext>;

fn keyed_unit_hash(seed: u64, user: UserId, item: ItemId) -> f64 {
    let mut hasher = SipHasher::new_with_keys(seed, seed.rotate_left(17));
    hasher.write_u64(user);
    hasher.write_u64(item);
    hasher.finish() as f64 / u64::max_value() as f64
}

fn resolve_seed(params: &Params, context: &AlgorithmContext) -> u64 {
    params
        .get("seed")
        .and_then(ParamValue::as_u64)
        .or(context.seed)
        .unwrap_or_else(|| rand::thread_rng().gen())
}

/// Global mean plus damped user and item offsets.
struct BiasPredictor {
    damping: f64,
    rating_scale: (f64, f64),
    global_mean: Option<f64>,
    user_bias: HashMap<UserId, f64>,
    item_bias: HashMap<ItemId, f64>,
}

impl BiasPredictor {
    fn new(damping: f64, rating_scale: (f64, f64)) -> BiasPredictor {
        BiasPredictor {
            damping,
            rating_scale,
            global_mean: None,
            user_bias: HashMap::new(),
            item_bias: HashMap::new(),
        }
    }
}

impl Predictor for BiasPredictor {
    fn train(&mut self, train: &RatingTable) -> Result<(), CoreError> {
        if train.is_empty() {
            return Err(CoreError::Numeric("empty train set".to_owned()));
        }

        let mean = train.rows().iter().map(|row| row.rating).sum::<f64>() / train.len() as f64;

        let mut item_sums: HashMap<ItemId, (f64, usize)> = HashMap::new();
        for row in train.rows() {
            let entry = item_sums.entry(row.item).or_insert((0.0, 0));
            entry.0 += row.rating - mean;
            entry.1 += 1;
        }
        self.item_bias = item_sums
            .into_iter()
            .map(|(item, (sum, count))| (item, sum / (count as f64 + self.damping)))
            .collect();

        let mut user_sums: HashMap<UserId, (f64, usize)> = HashMap::new();
        for row in train.rows() {
            let item_bias = self.item_bias.get(&row.item).copied().unwrap_or(0.0);
            let entry = user_sums.entry(row.user).or_insert((0.0, 0));
            entry.0 += row.rating - mean - item_bias;
            entry.1 += 1;
        }
        self.user_bias = user_sums
            .into_iter()
            .map(|(user, (sum, count))| (user, sum / (count as f64 + self.damping)))
            .collect();

        self.global_mean = Some(mean);
        Ok(())
    }

    fn predict(&self, pairs: &[(UserId, ItemId)]) -> Result<Vec<f64>, CoreError> {
        let mean = self
            .global_mean
            .ok_or_else(|| CoreError::Logic("model is not trained".to_owned()))?;
        let (min, max) = self.rating_scale;

        Ok(pairs
            .iter()
            .map(|(user, item)| {
                let estimate = mean
                    + self.user_bias.get(user).copied().unwrap_or(0.0)
                    + self.item_bias.get(item).copied().unwrap_or(0.0);
                estimate.max(min).min(max)
            })
            .collect())
    }
}

/// Predicts the same value for every pair; useful as an evaluation floor.
struct ConstantPredictor {
    value: f64,
}

impl Predictor for ConstantPredictor {
    fn train(&mut self, _train: &RatingTable) -> Result<(), CoreError> {
        Ok(())
    }

    fn predict(&self, pairs: &[(UserId, ItemId)]) -> Result<Vec<f64>, CoreError> {
        Ok(vec![self.value; pairs.len()])
    }
}

/// Uniform predictions on the rating scale, deterministic per seed.
struct RandomPredictor {
    seed: u64,
    rating_scale: (f64, f64),
}

impl Predictor for RandomPredictor {
    fn train(&mut self, _train: &RatingTable) -> Result<(), CoreError> {
        Ok(())
    }

    fn predict(&self, pairs: &[(UserId, ItemId)]) -> Result<Vec<f64>, CoreError> {
        let (min, max) = self.rating_scale;
        Ok(pairs
            .iter()
            .map(|&(user, item)| min + keyed_unit_hash(self.seed, user, item) * (max - min))
            .collect())
    }
}

/// Ranks items by their interaction count in the train set.
struct PopularityRecommender {
    rated_items_filter: bool,
    ranked_items: Vec<(ItemId, f64)>,
    rated: HashMap<UserId, HashSet<ItemId>>,
    trained: bool,
}

impl PopularityRecommender {
    fn new(rated_items_filter: bool) -> PopularityRecommender {
        PopularityRecommender {
            rated_items_filter,
            ranked_items: Vec::new(),
            rated: HashMap::new(),
            trained: false,
        }
    }
}

impl Recommender for PopularityRecommender {
    fn train(&mut self, train: &RatingTable) -> Result<(), CoreError> {
        let mut counts: HashMap<ItemId, usize> = HashMap::new();
        for row in train.rows() {
            *counts.entry(row.item).or_insert(0) += 1;
        }

        let total = train.len().max(1) as f64;
        let mut ranked: Vec<(ItemId, f64)> = counts
            .into_iter()
            .map(|(item, count)| (item, count as f64 / total))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap().then(a.0.cmp(&b.0)));

        self.ranked_items = ranked;
        self.rated = train.items_by_user();
        self.trained = true;
        Ok(())
    }

    fn recommend(
        &self,
        users: &[UserId],
        num_items: usize,
    ) -> Result<Vec<Vec<(ItemId, f64)>>, CoreError> {
        if !self.trained {
            return Err(CoreError::Logic("model is not trained".to_owned()));
        }

        Ok(users
            .iter()
            .map(|user| {
                let rated = self.rated.get(user);
                self.ranked_items
                    .iter()
                    .filter(|(item, _)| {
                        !self.rated_items_filter
                            || rated.map_or(true, |items| !items.contains(item))
                    })
                    .take(num_items)
                    .cloned()
                    .collect()
            })
            .collect())
    }
}

/// Recommends items in a per-user pseudo-random order.
struct RandomRecommender {
    seed: u64,
    rated_items_filter: bool,
    items: Vec<ItemId>,
    rated: HashMap<UserId, HashSet<ItemId>>,
    trained: bool,
}

impl RandomRecommender {
    fn new(seed: u64, rated_items_filter: bool) -> RandomRecommender {
        RandomRecommender {
            seed,
            rated_items_filter,
            items: Vec::new(),
            rated: HashMap::new(),
            trained: false,
        }
    }
}

impl Recommender for RandomRecommender {
    fn train(&mut self, train: &RatingTable) -> Result<(), CoreError> {
        self.items = train.unique_items();
        self.rated = train.items_by_user();
        self.trained = true;
        Ok(())
    }

    fn recommend(
        &self,
        users: &[UserId],
        num_items: usize,
    ) -> Result<Vec<Vec<(ItemId, f64)>>, CoreError> {
        if !self.trained {
            return Err(CoreError::Logic("model is not trained".to_owned()));
        }

        Ok(users
            .iter()
            .map(|&user| {
                let rated = self.rated.get(&user);
                let mut scored: Vec<(ItemId, f64)> = self
                    .items
                    .iter()
                    .filter(|item| {
                        !self.rated_items_filter
                            || rated.map_or(true, |items| !items.contains(item))
                    })
                    .map(|&item| (item, keyed_unit_hash(self.seed, user, item)))
                    .collect();
                scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap().then(a.0.cmp(&b.0)));
                scored.truncate(num_items);
                scored
            })
            .collect())
    }
}

/// Builds the predictor factories: the `baseline` API with its models.
pub fn create_predictor_factories() -> PredictorFactories {
    let mut baseline: Factory<Box<dyn Predictor>, AlgorithmContext> = Factory::new("baseline");

    baseline
        .add(
            "bias",
            Box::new(|_, params, context: &AlgorithmContext| {
                let damping = params
                    .get("damping")
                    .and_then(ParamValue::as_f64)
                    .ok_or_else(|| CoreError::Logic("missing parameter 'damping'".to_owned()))?;
                Ok(Box::new(BiasPredictor::new(damping, context.rating_scale))
                    as Box<dyn Predictor>)
            }),
            Some(Box::new(|| {
                ParamSchema::new().with_range("damping", 10.0, 0.0, 1_000.0)
            })),
        )
        .expect("fresh factory");
    baseline
        .add(
            "constant",
            Box::new(|_, params, _| {
                let value = params
                    .get("value")
                    .and_then(ParamValue::as_f64)
                    .ok_or_else(|| CoreError::Logic("missing parameter 'value'".to_owned()))?;
                Ok(Box::new(ConstantPredictor { value }) as Box<dyn Predictor>)
            }),
            Some(Box::new(|| {
                ParamSchema::new().with_range("value", 3.0, -1_000.0, 1_000.0)
            })),
        )
        .expect("fresh factory");
    baseline
        .add(
            "random",
            Box::new(|_, params, context: &AlgorithmContext| {
                Ok(Box::new(RandomPredictor {
                    seed: resolve_seed(params, context),
                    rating_scale: context.rating_scale,
                }) as Box<dyn Predictor>)
            }),
            Some(Box::new(|| ParamSchema::new().with_seed("seed"))),
        )
        .expect("fresh factory");

    let mut group = PredictorFactories::new("predictor_apis");
    group.add(FactoryNode::Leaf(baseline)).expect("fresh group");
    group
}

/// Builds the recommender factories: the `baseline` API with its models.
pub fn create_recommender_factories() -> RecommenderFactories {
    let mut baseline: Factory<Box<dyn Recommender>, AlgorithmContext> = Factory::new("baseline");

    baseline
        .add(
            "popularity",
            Box::new(|_, _, context: &AlgorithmContext| {
                Ok(Box::new(PopularityRecommender::new(context.rated_items_filter))
                    as Box<dyn Recommender>)
            }),
            None,
        )
        .expect("fresh factory");
    baseline
        .add(
            "random",
            Box::new(|_, params, context: &AlgorithmContext| {
                Ok(Box::new(RandomRecommender::new(
                    resolve_seed(params, context),
                    context.rated_items_filter,
                )) as Box<dyn Recommender>)
            }),
            Some(Box::new(|| ParamSchema::new().with_seed("seed"))),
        )
        .expect("fresh factory");

    let mut group = RecommenderFactories::new("recommender_apis");
    group.add(FactoryNode::Leaf(baseline)).expect("fresh group");
    group
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::RatingRow;

    fn context() -> AlgorithmContext {
        AlgorithmContext {
            num_threads: 1,
            rating_scale: (1.0, 5.0),
            rated_items_filter: true,
            seed: Some(13),
        }
    }

    fn train_table() -> RatingTable {
        vec![
            RatingRow { user: 1, item: 10, rating: 5.0, timestamp: None },
            RatingRow { user: 1, item: 11, rating: 4.0, timestamp: None },
            RatingRow { user: 2, item: 10, rating: 5.0, timestamp: None },
            RatingRow { user: 2, item: 12, rating: 1.0, timestamp: None },
            RatingRow { user: 3, item: 10, rating: 4.0, timestamp: None },
            RatingRow { user: 3, item: 11, rating: 2.0, timestamp: None },
        ]
        .into()
    }

    #[test]
    fn constant_predictor_predicts_its_value() {
        let factories = create_predictor_factories();
        let factory = factories.resolve_factory("constant").unwrap();

        let mut params = Params::new();
        params.insert("value".to_owned(), ParamValue::Float(3.0));
        let mut model = factory.create("constant", Some(&params), &context()).unwrap().unwrap();

        model.train(&train_table()).unwrap();
        let predictions = model.predict(&[(1, 10), (9, 99)]).unwrap();
        assert_eq!(predictions, vec![3.0, 3.0]);
    }

    #[test]
    fn bias_predictor_stays_on_scale_and_tracks_item_quality() {
        let factories = create_predictor_factories();
        let factory = factories.resolve_factory("bias").unwrap();
        let mut model = factory.create("bias", None, &context()).unwrap().unwrap();

        model.train(&train_table()).unwrap();
        let predictions = model.predict(&[(1, 10), (1, 12), (7, 10)]).unwrap();

        for prediction in &predictions {
            assert!(*prediction >= 1.0 && *prediction <= 5.0);
        }
        // Item 10 averages far above item 12.
        assert!(predictions[0] > predictions[1]);
    }

    #[test]
    fn untrained_models_refuse_to_predict() {
        let factories = create_predictor_factories();
        let factory = factories.resolve_factory("bias").unwrap();
        let model = factory.create("bias", None, &context()).unwrap().unwrap();

        assert!(model.predict(&[(1, 10)]).is_err());
    }

    #[test]
    fn popularity_recommender_filters_rated_items() {
        let factories = create_recommender_factories();
        let factory = factories.resolve_factory("popularity").unwrap();
        let mut model = factory.create("popularity", None, &context()).unwrap().unwrap();

        model.train(&train_table()).unwrap();
        let recommended = model.recommend(&[1], 10).unwrap();

        // User 1 already rated items 10 and 11; only 12 remains.
        assert_eq!(
            recommended[0].iter().map(|(item, _)| *item).collect::<Vec<_>>(),
            vec![12]
        );

        // Unknown users get the full popularity ranking.
        let fresh = model.recommend(&[42], 2).unwrap();
        assert_eq!(fresh[0][0].0, 10);
    }

    #[test]
    fn random_recommender_is_deterministic_per_seed() {
        let factories = create_recommender_factories();
        let factory = factories.resolve_factory("random").unwrap();

        let mut model_a = factory.create("random", None, &context()).unwrap().unwrap();
        let mut model_b = factory.create("random", None, &context()).unwrap().unwrap();
        model_a.train(&train_table()).unwrap();
        model_b.train(&train_table()).unwrap();

        assert_eq!(
            model_a.recommend(&[5], 3).unwrap(),
            model_b.recommend(&[5], 3).unwrap()
        );
    }
}
