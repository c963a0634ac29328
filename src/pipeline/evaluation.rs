//! The evaluation stage: metrics over one model's result file.
//!
//! Results are written incrementally: the evaluations file starts empty
//! and is rewritten after every metric that completes, so a crashed or
//! cancelled run leaves a readable file covering the finished metrics.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::{DataSubsetConfig, MetricConfig};
use crate::data::{read_matrix, read_results, RatingRow, RatingTable, ResultRow};
use crate::errors::CoreError;
use crate::events::{timed, EventDispatcher, EventId, PipelineEvent};
use crate::factory::resolve_nested;
use crate::filters::{apply_filter_passes, FilterFactories};
use crate::metrics::{EvaluationSets, Metric, MetricFactories};
use crate::params::Params;
use crate::threading::CancellationToken;
use crate::{ItemId, UserId};

/// The files one evaluation run reads from.
#[derive(Clone, Debug)]
pub struct EvaluationSetPaths {
    /// The model's result file.
    pub ratings: PathBuf,
    /// The persisted train set.
    pub train: PathBuf,
    /// The persisted test set.
    pub test: PathBuf,
}

/// The computed value of one metric.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// The metric value.
    pub value: f64,
    /// The subgroup the value was computed over, if any.
    pub subgroup: Option<DataSubsetConfig>,
}

/// One entry of the evaluations file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvaluationEntry {
    /// Metric name.
    pub name: String,
    /// Metric parameters as configured.
    pub params: Params,
    /// The computed result.
    pub evaluation: EvaluationResult,
}

/// The persisted evaluations file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EvaluationFile {
    /// Entries in completion order.
    pub evaluations: Vec<EvaluationEntry>,
}

/// Reads a persisted evaluations file.
pub fn read_evaluations(path: &Path) -> Result<EvaluationFile, CoreError> {
    if !path.exists() {
        return Err(CoreError::Resource(format!(
            "evaluations file '{}' does not exist",
            path.display()
        )));
    }
    Ok(serde_json::from_reader(File::open(path)?)?)
}

fn write_evaluations(path: &Path, file: &EvaluationFile) -> Result<(), CoreError> {
    serde_json::to_writer_pretty(File::create(path)?, file)?;
    Ok(())
}

/// Runs configured metrics over one model's output.
pub struct EvaluationPipeline<'a> {
    dispatcher: &'a EventDispatcher,
    metric_factories: &'a MetricFactories,
    filter_factories: &'a FilterFactories,
}

impl<'a> EvaluationPipeline<'a> {
    /// Creates a pipeline over the given metric and filter registries.
    pub fn new(
        dispatcher: &'a EventDispatcher,
        metric_factories: &'a MetricFactories,
        filter_factories: &'a FilterFactories,
    ) -> EvaluationPipeline<'a> {
        EvaluationPipeline {
            dispatcher,
            metric_factories,
            filter_factories,
        }
    }

    /// Evaluates every configured metric, appending each completed result
    /// to the file at `output_path`. A failing metric is reported and
    /// skipped; a missing input file aborts the run.
    pub fn run(
        &self,
        output_path: &Path,
        paths: &EvaluationSetPaths,
        metrics: &[MetricConfig],
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        let label = paths.ratings.display().to_string();
        let start = Instant::now();
        self.dispatcher
            .dispatch(&PipelineEvent::begin(EventId::BeginEvalPipeline, &label));

        let mut file = EvaluationFile::default();
        write_evaluations(output_path, &file)?;

        for metric_config in metrics {
            if !cancel.is_running() {
                break;
            }

            let factory = match self.metric_factories.resolve_factory(&metric_config.name) {
                Some(factory) => factory,
                None => {
                    self.dispatcher.report_failure(&format!(
                        "metric '{}' is not registered",
                        metric_config.name
                    ));
                    continue;
                }
            };
            let metric = match factory.create(&metric_config.name, Some(&metric_config.params), &())
            {
                Some(Ok(metric)) => metric,
                Some(Err(error)) => {
                    self.dispatcher.report_failure(&format!(
                        "metric '{}' could not be constructed: {}",
                        metric_config.name, error
                    ));
                    continue;
                }
                None => continue,
            };

            match self.evaluate_metric(&*metric, metric_config, paths, &label) {
                Ok(value) => {
                    file.evaluations.push(EvaluationEntry {
                        name: metric_config.name.clone(),
                        params: factory
                            .create_params(&metric_config.name)
                            .resolved(Some(&metric_config.params)),
                        evaluation: EvaluationResult {
                            value,
                            subgroup: metric_config.subgroup.clone(),
                        },
                    });
                    write_evaluations(output_path, &file)?;
                }
                Err(error) => {
                    if error.is_resource() {
                        return Err(error);
                    }
                    self.dispatcher.report_failure(&format!(
                        "metric '{}' failed: {}",
                        metric_config.name, error
                    ));
                }
            }
        }

        self.dispatcher.dispatch(&PipelineEvent::end(
            EventId::EndEvalPipeline,
            &label,
            start.elapsed(),
        ));
        Ok(())
    }

    fn evaluate_metric(
        &self,
        metric: &dyn Metric,
        config: &MetricConfig,
        paths: &EvaluationSetPaths,
        label: &str,
    ) -> Result<f64, CoreError> {
        let detail = format!("{}:{}", label, config.name);
        self.dispatcher
            .dispatch(&PipelineEvent::begin(EventId::BeginMetric, &detail));
        let start = Instant::now();

        let mut sets = timed(
            self.dispatcher,
            EventId::BeginLoadEvalSets,
            EventId::EndLoadEvalSets,
            &detail,
            || {
                Ok(EvaluationSets {
                    ratings: read_results(&paths.ratings)?,
                    train: if metric.requires_train_set() {
                        Some(read_matrix(&paths.train, false)?)
                    } else {
                        None
                    },
                    test: if metric.requires_test_set() {
                        Some(read_matrix(&paths.test, false)?)
                    } else {
                        None
                    },
                })
            },
        )?;

        if let Some(subgroup) = &config.subgroup {
            sets = timed(
                self.dispatcher,
                EventId::BeginFilterEvalSets,
                EventId::EndFilterEvalSets,
                &detail,
                || self.filter_sets(sets, subgroup),
            )?;
        }

        let value = metric.evaluate(&sets)?;
        self.dispatcher.dispatch(&PipelineEvent::end(
            EventId::EndMetric,
            &detail,
            start.elapsed(),
        ));
        Ok(value)
    }

    fn filter_sets(
        &self,
        sets: EvaluationSets,
        subgroup: &DataSubsetConfig,
    ) -> Result<EvaluationSets, CoreError> {
        let factory = resolve_nested(self.filter_factories, &subgroup.dataset, &subgroup.matrix)
            .ok_or_else(|| {
                CoreError::Logic(format!(
                    "no filters registered for subgroup '{}/{}'",
                    subgroup.dataset, subgroup.matrix
                ))
            })?;

        let ratings = filter_result_rows(sets.ratings, |view| {
            apply_filter_passes(factory, view, &subgroup.filter_passes)
        })?;
        let train = match sets.train {
            Some(train) => Some(apply_filter_passes(factory, &train, &subgroup.filter_passes)?),
            None => None,
        };
        let test = match sets.test {
            Some(test) => Some(apply_filter_passes(factory, &test, &subgroup.filter_passes)?),
            None => None,
        };

        Ok(EvaluationSets {
            ratings,
            train,
            test,
        })
    }
}

/// Filters result rows through a rating-table view: rows survive when
/// their `(user, item)` key survives the table filter. Rows without a
/// merged ground-truth rating expose a NaN rating, which rating-valued
/// filters reject.
fn filter_result_rows(
    rows: Vec<ResultRow>,
    filter: impl FnOnce(&RatingTable) -> Result<RatingTable, CoreError>,
) -> Result<Vec<ResultRow>, CoreError> {
    let view: RatingTable = rows
        .iter()
        .map(|row| RatingRow {
            user: row.user,
            item: row.item,
            rating: row.rating.unwrap_or(f64::NAN),
            timestamp: None,
        })
        .collect::<Vec<_>>()
        .into();

    let surviving: HashSet<(UserId, ItemId)> = filter(&view)?
        .rows()
        .iter()
        .map(|row| (row.user, row.item))
        .collect();

    Ok(rows
        .into_iter()
        .filter(|row| surviving.contains(&(row.user, row.item)))
        .collect())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::config::{FilterConfig, FilterPassConfig};
    use crate::data::{
        write_matrix, write_results_with_ratings, Dataset, DatasetRegistry, MatrixMeta,
        RatingType,
    };
    use crate::events::CallbackPair;
    use crate::filters::create_filter_factories;
    use crate::metrics::create_metric_factories;
    use crate::params::ParamValue;

    fn write_sets(dir: &Path) -> EvaluationSetPaths {
        let train: RatingTable = vec![
            RatingRow { user: 1, item: 10, rating: 4.0, timestamp: None },
            RatingRow { user: 2, item: 11, rating: 2.0, timestamp: None },
        ]
        .into();
        let test: RatingTable = vec![
            RatingRow { user: 1, item: 12, rating: 5.0, timestamp: None },
            RatingRow { user: 2, item: 10, rating: 1.0, timestamp: None },
        ]
        .into();
        let results = vec![
            ResultRow { rank: None, user: 1, item: 12, score: 3.0, rating: Some(5.0) },
            ResultRow { rank: None, user: 2, item: 10, score: 3.0, rating: Some(1.0) },
        ];

        let paths = EvaluationSetPaths {
            ratings: dir.join("ratings.tsv"),
            train: dir.join("train_set.tsv"),
            test: dir.join("test_set.tsv"),
        };
        write_matrix(&paths.train, &train, false).unwrap();
        write_matrix(&paths.test, &test, false).unwrap();
        write_results_with_ratings(&paths.ratings, &results).unwrap();
        paths
    }

    fn filter_factories() -> FilterFactories {
        let mut registry = DatasetRegistry::new();
        registry.add(Dataset::new("movies").with_matrix(
            "ratings",
            MatrixMeta {
                file: PathBuf::from("unused.tsv"),
                has_timestamp: false,
                rating_type: RatingType::Explicit,
                rating_scale: (1.0, 5.0),
            },
        ));
        create_filter_factories(&registry)
    }

    fn metric(name: &str) -> MetricConfig {
        MetricConfig {
            name: name.to_owned(),
            params: Params::new(),
            subgroup: None,
        }
    }

    #[test]
    fn completed_metrics_land_in_the_evaluations_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_sets(dir.path());
        let dispatcher = EventDispatcher::new();
        let metric_factories = create_metric_factories();
        let filter_factories = filter_factories();
        let pipeline =
            EvaluationPipeline::new(&dispatcher, &metric_factories, &filter_factories);

        let output = dir.path().join("evaluations.json");
        pipeline
            .run(
                &output,
                &paths,
                &[metric("mae"), metric("rmse")],
                &CancellationToken::new(),
            )
            .unwrap();

        let file = read_evaluations(&output).unwrap();
        assert_eq!(file.evaluations.len(), 2);
        assert_eq!(file.evaluations[0].name, "mae");
        // Errors are |3-5| and |3-1|.
        assert!((file.evaluations[0].evaluation.value - 2.0).abs() < 1e-12);
        assert!((file.evaluations[1].evaluation.value - 2.0).abs() < 1e-12);
    }

    #[test]
    fn metrics_only_load_the_sets_they_require() {
        let dir = tempfile::tempdir().unwrap();
        // Only the result file exists; mae touches neither train nor test.
        let paths = EvaluationSetPaths {
            ratings: dir.path().join("ratings.tsv"),
            train: dir.path().join("train_set.tsv"),
            test: dir.path().join("test_set.tsv"),
        };
        let results = vec![
            ResultRow { rank: None, user: 1, item: 12, score: 3.0, rating: Some(5.0) },
            ResultRow { rank: None, user: 2, item: 10, score: 3.0, rating: Some(1.0) },
        ];
        write_results_with_ratings(&paths.ratings, &results).unwrap();

        let dispatcher = EventDispatcher::new();
        let metric_factories = create_metric_factories();
        let filter_factories = filter_factories();
        let pipeline =
            EvaluationPipeline::new(&dispatcher, &metric_factories, &filter_factories);

        let output = dir.path().join("evaluations.json");
        pipeline
            .run(&output, &paths, &[metric("mae")], &CancellationToken::new())
            .unwrap();

        let file = read_evaluations(&output).unwrap();
        assert_eq!(file.evaluations.len(), 1);
        assert!((file.evaluations[0].evaluation.value - 2.0).abs() < 1e-12);
    }

    #[test]
    fn a_missing_required_set_aborts_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let paths = EvaluationSetPaths {
            ratings: dir.path().join("ratings.tsv"),
            train: dir.path().join("train_set.tsv"),
            test: dir.path().join("test_set.tsv"),
        };
        let results = vec![
            ResultRow { rank: Some(1), user: 1, item: 12, score: 0.9, rating: None },
        ];
        write_results_with_ratings(&paths.ratings, &results).unwrap();

        let dispatcher = EventDispatcher::new();
        let metric_factories = create_metric_factories();
        let filter_factories = filter_factories();
        let pipeline =
            EvaluationPipeline::new(&dispatcher, &metric_factories, &filter_factories);

        // mrr requires the test set, which does not exist.
        let output = dir.path().join("evaluations.json");
        let error = pipeline
            .run(&output, &paths, &[metric("mrr")], &CancellationToken::new())
            .unwrap_err();
        assert!(error.is_resource());
    }

    #[test]
    fn unknown_and_failing_metrics_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_sets(dir.path());

        let mut dispatcher = EventDispatcher::new();
        let failures = Arc::new(Mutex::new(0usize));
        let sink = failures.clone();
        dispatcher
            .add_listener(
                EventId::Failure,
                "recorder",
                CallbackPair::internal_only(Arc::new(move |_, _| {
                    *sink.lock().unwrap() += 1;
                })),
            )
            .unwrap();

        let metric_factories = create_metric_factories();
        let filter_factories = filter_factories();
        let pipeline =
            EvaluationPipeline::new(&dispatcher, &metric_factories, &filter_factories);

        let output = dir.path().join("evaluations.json");
        pipeline
            .run(
                &output,
                &paths,
                &[metric("novelty"), metric("mae")],
                &CancellationToken::new(),
            )
            .unwrap();

        assert_eq!(*failures.lock().unwrap(), 1);
        let file = read_evaluations(&output).unwrap();
        assert_eq!(file.evaluations.len(), 1);
        assert_eq!(file.evaluations[0].name, "mae");
    }

    #[test]
    fn subgroups_restrict_the_evaluated_rows() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_sets(dir.path());
        let dispatcher = EventDispatcher::new();
        let metric_factories = create_metric_factories();
        let filter_factories = filter_factories();
        let pipeline =
            EvaluationPipeline::new(&dispatcher, &metric_factories, &filter_factories);

        let mut params = Params::new();
        params.insert("modulo".to_owned(), ParamValue::Int(2));
        params.insert("remainder".to_owned(), ParamValue::Int(1));
        let config = MetricConfig {
            name: "mae".to_owned(),
            params: Params::new(),
            subgroup: Some(DataSubsetConfig {
                dataset: "movies".to_owned(),
                matrix: "ratings".to_owned(),
                filter_passes: vec![FilterPassConfig {
                    filters: vec![FilterConfig {
                        name: "user_modulo".to_owned(),
                        params,
                    }],
                }],
            }),
        };

        let output = dir.path().join("evaluations.json");
        pipeline
            .run(&output, &paths, &[config], &CancellationToken::new())
            .unwrap();

        let file = read_evaluations(&output).unwrap();
        // Only user 1 remains; its error is |3-5|.
        assert!((file.evaluations[0].evaluation.value - 2.0).abs() < 1e-12);
        assert!(file.evaluations[0].evaluation.subgroup.is_some());
    }

    #[test]
    fn missing_result_files_abort_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let paths = EvaluationSetPaths {
            ratings: dir.path().join("missing.tsv"),
            train: dir.path().join("train_set.tsv"),
            test: dir.path().join("test_set.tsv"),
        };
        let dispatcher = EventDispatcher::new();
        let metric_factories = create_metric_factories();
        let filter_factories = filter_factories();
        let pipeline =
            EvaluationPipeline::new(&dispatcher, &metric_factories, &filter_factories);

        let output = dir.path().join("evaluations.json");
        let error = pipeline
            .run(&output, &paths, &[metric("mae")], &CancellationToken::new())
            .unwrap_err();
        assert!(error.is_resource());

        // The file was still initialized before the abort.
        assert!(read_evaluations(&output).unwrap().evaluations.is_empty());
    }

    #[test]
    fn cancellation_leaves_a_readable_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_sets(dir.path());
        let dispatcher = EventDispatcher::new();
        let metric_factories = create_metric_factories();
        let filter_factories = filter_factories();
        let pipeline =
            EvaluationPipeline::new(&dispatcher, &metric_factories, &filter_factories);

        let output = dir.path().join("evaluations.json");
        pipeline
            .run(&output, &paths, &[metric("mae")], &CancellationToken::cancelled())
            .unwrap();

        assert!(read_evaluations(&output).unwrap().evaluations.is_empty());
    }
}
