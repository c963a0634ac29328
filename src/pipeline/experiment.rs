//! Top-level composition of the data, model, and evaluation stages.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::algorithms::{
    create_predictor_factories, create_recommender_factories, AlgorithmContext,
    PredictorFactories, RecommenderFactories,
};
use crate::config::{ExperimentConfig, ExperimentType};
use crate::converters::{create_converter_factories, ConverterFactories};
use crate::data::DatasetRegistry;
use crate::errors::CoreError;
use crate::events::EventDispatcher;
use crate::filters::{create_filter_factories, FilterFactories};
use crate::metrics::{create_metric_factories, MetricFactories};
use crate::pipeline::data::DataPipeline;
use crate::pipeline::evaluation::{EvaluationPipeline, EvaluationSetPaths};
use crate::pipeline::model::{
    ModelArtifact, ModelPipeline, PredictionPipeline, RecommendationPipeline,
};
use crate::splitters::{create_split_factory, SplitFactory};
use crate::threading::CancellationToken;

/// File name of the experiment overview inside the output directory.
pub const OVERVIEW_FILE: &str = "overview.json";
/// File name of a model's evaluations inside its directory.
pub const EVALUATIONS_FILE: &str = "evaluations.json";

/// One completed experiment unit in the overview.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OverviewEntry {
    /// Model directory name, unique within the experiment.
    pub name: String,
    /// Source dataset name.
    pub dataset: String,
    /// Algorithm API the model came from.
    pub recommender_system: String,
    /// Path of the evaluations file; absent when no metrics were
    /// configured or the evaluation failed.
    pub evaluation_path: Option<PathBuf>,
    /// Path of the model's result file.
    pub ratings_path: PathBuf,
    /// Path of the model's settings file.
    pub ratings_settings_path: PathBuf,
}

/// The persisted experiment overview.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExperimentOverview {
    /// Entries in completion order.
    pub overview: Vec<OverviewEntry>,
}

/// Reads a persisted overview file.
pub fn read_overview(path: &Path) -> Result<ExperimentOverview, CoreError> {
    if !path.exists() {
        return Err(CoreError::Resource(format!(
            "overview file '{}' does not exist",
            path.display()
        )));
    }
    Ok(serde_json::from_reader(File::open(path)?)?)
}

/// Owns the component registries and runs whole experiments through the
/// three stages. `run` takes `&self`, so one pipeline value can be moved
/// to a worker thread and reused across repeated runs.
pub struct ExperimentPipeline {
    dispatcher: EventDispatcher,
    registry: DatasetRegistry,
    split_factory: SplitFactory,
    converter_factories: ConverterFactories,
    filter_factories: FilterFactories,
    predictor_factories: PredictorFactories,
    recommender_factories: RecommenderFactories,
    metric_factories: MetricFactories,
}

impl ExperimentPipeline {
    /// Creates a pipeline over the given datasets with every built-in
    /// component registered.
    pub fn new(registry: DatasetRegistry) -> ExperimentPipeline {
        let converter_factories = create_converter_factories(&registry);
        let filter_factories = create_filter_factories(&registry);

        ExperimentPipeline {
            dispatcher: EventDispatcher::new(),
            registry,
            split_factory: create_split_factory(),
            converter_factories,
            filter_factories,
            predictor_factories: create_predictor_factories(),
            recommender_factories: create_recommender_factories(),
            metric_factories: create_metric_factories(),
        }
    }

    /// The dataset registry.
    pub fn registry(&self) -> &DatasetRegistry {
        &self.registry
    }

    /// The event dispatcher.
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Mutable dispatcher access for listener registration.
    pub fn dispatcher_mut(&mut self) -> &mut EventDispatcher {
        &mut self.dispatcher
    }

    /// Mutable splitter registry, for registering custom splitters.
    pub fn split_factory_mut(&mut self) -> &mut SplitFactory {
        &mut self.split_factory
    }

    /// Mutable predictor registry, for registering custom APIs.
    pub fn predictor_factories_mut(&mut self) -> &mut PredictorFactories {
        &mut self.predictor_factories
    }

    /// Mutable recommender registry, for registering custom APIs.
    pub fn recommender_factories_mut(&mut self) -> &mut RecommenderFactories {
        &mut self.recommender_factories
    }

    /// Mutable metric registry, for registering custom metrics.
    pub fn metric_factories_mut(&mut self) -> &mut MetricFactories {
        &mut self.metric_factories
    }

    /// Runs one whole experiment into `output_dir`, which must not yet
    /// exist. Returns the overview of every completed unit; a run in
    /// which no unit completed (and that was not cancelled) is an error.
    pub fn run(
        &self,
        output_dir: &Path,
        config: &ExperimentConfig,
        cancel: &CancellationToken,
    ) -> Result<ExperimentOverview, CoreError> {
        if output_dir.exists() {
            return Err(CoreError::Resource(format!(
                "output directory '{}' already exists",
                output_dir.display()
            )));
        }
        fs::create_dir_all(output_dir)?;
        info!("running experiment '{}' in '{}'", config.name, output_dir.display());

        let mut data_pipeline = DataPipeline::new(
            &self.dispatcher,
            &self.split_factory,
            &self.converter_factories,
            &self.filter_factories,
        );

        let mut transitions = Vec::new();
        for dataset_config in &config.datasets {
            if !cancel.is_running() {
                break;
            }
            match data_pipeline.run(output_dir, &self.registry, dataset_config, cancel) {
                Ok(Some(transition)) => transitions.push(transition),
                Ok(None) => break,
                Err(error) => self.dispatcher.report_failure(&format!(
                    "data stage failed for '{}/{}': {}",
                    dataset_config.dataset, dataset_config.matrix, error
                )),
            }
        }

        let mut overview = ExperimentOverview::default();
        for transition in &transitions {
            if !cancel.is_running() {
                break;
            }

            let context = AlgorithmContext {
                num_threads: config.num_threads,
                rating_scale: transition.rating_scale,
                rated_items_filter: config.rated_items_filter,
                seed: None,
            };
            let artifacts = match config.experiment_type {
                ExperimentType::Prediction => {
                    PredictionPipeline::new(&self.dispatcher, &self.predictor_factories).run(
                        &transition.output_dir,
                        transition,
                        &config.models,
                        &context,
                        cancel,
                    )
                }
                ExperimentType::Recommendation => RecommendationPipeline::new(
                    &self.dispatcher,
                    &self.recommender_factories,
                    config.top_k,
                )
                .run(
                    &transition.output_dir,
                    transition,
                    &config.models,
                    &context,
                    cancel,
                ),
            };

            let artifacts = match artifacts {
                Ok(artifacts) => artifacts,
                Err(error) => {
                    self.dispatcher.report_failure(&format!(
                        "model stage failed for '{}/{}': {}",
                        transition.dataset, transition.matrix, error
                    ));
                    continue;
                }
            };

            for artifact in artifacts {
                let evaluation_path = self.evaluate_artifact(transition, &artifact, config, cancel);
                overview.overview.push(OverviewEntry {
                    name: artifact
                        .dir
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    dataset: transition.dataset.clone(),
                    recommender_system: artifact.api.clone(),
                    evaluation_path,
                    ratings_path: artifact.ratings_path(),
                    ratings_settings_path: artifact.settings_path(),
                });
            }
        }

        serde_json::to_writer_pretty(File::create(output_dir.join(OVERVIEW_FILE))?, &overview)?;

        if overview.overview.is_empty() && cancel.is_running() {
            return Err(CoreError::Logic(format!(
                "no unit of experiment '{}' completed",
                config.name
            )));
        }
        Ok(overview)
    }

    fn evaluate_artifact(
        &self,
        transition: &crate::data::DataTransition,
        artifact: &ModelArtifact,
        config: &ExperimentConfig,
        cancel: &CancellationToken,
    ) -> Option<PathBuf> {
        if config.evaluation.is_empty() {
            return None;
        }

        let output_path = artifact.dir.join(EVALUATIONS_FILE);
        let paths = EvaluationSetPaths {
            ratings: artifact.ratings_path(),
            train: transition.train_set_path.clone(),
            test: transition.test_set_path.clone(),
        };
        let pipeline = EvaluationPipeline::new(
            &self.dispatcher,
            &self.metric_factories,
            &self.filter_factories,
        );

        match pipeline.run(&output_path, &paths, &config.evaluation, cancel) {
            Ok(()) => Some(output_path),
            Err(error) => {
                self.dispatcher.report_failure(&format!(
                    "evaluation failed for '{}': {}",
                    artifact.dir.display(),
                    error
                ));
                None
            }
        }
    }
}
