//! The model stage: train, batch-test, and persist per-model results.
//!
//! The stage is generic over the algorithm capability through the
//! [`ModelPipeline`] trait: prediction and recommendation share the same
//! orchestration (shared train/test sets, per-model directories, error
//! containment, rating reconstruction) and differ only in how a model is
//! built and how its test output is produced.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{debug, warn};
use serde::Serialize;

use crate::algorithms::{AlgorithmContext, PredictorFactories, RecommenderFactories};
use crate::config::{ApiModels, ModelConfig};
use crate::data::{
    read_matrix, read_results, write_results_with_ratings, DataTransition, RatingTable,
};
use crate::errors::CoreError;
use crate::events::{timed, EventDispatcher, EventId, PipelineEvent};
use crate::params::Params;
use crate::pipeline::DirCounter;
use crate::threading::CancellationToken;
use crate::{ItemId, UserId};

/// File name of a model's result file inside its directory.
pub const RATINGS_FILE: &str = "ratings.tsv";
/// File name of a model's resolved-parameter record.
pub const SETTINGS_FILE: &str = "settings.json";

/// Pairs or users are fed to a model in batches of this size, with a
/// cancellation check between batches.
const TEST_BATCH_SIZE: usize = 1024;

/// One successfully trained and tested model.
#[derive(Clone, Debug)]
pub struct ModelArtifact {
    /// Algorithm API the model came from.
    pub api: String,
    /// Model name within the API.
    pub model: String,
    /// Directory holding the model's settings and result files.
    pub dir: PathBuf,
}

impl ModelArtifact {
    /// Path of the model's result file.
    pub fn ratings_path(&self) -> PathBuf {
        self.dir.join(RATINGS_FILE)
    }

    /// Path of the model's settings file.
    pub fn settings_path(&self) -> PathBuf {
        self.dir.join(SETTINGS_FILE)
    }
}

#[derive(Serialize)]
struct ModelSettings<'a> {
    name: &'a str,
    params: &'a Params,
}

fn write_settings(dir: &Path, name: &str, params: &Params) -> Result<(), CoreError> {
    let file = File::create(dir.join(SETTINGS_FILE))?;
    serde_json::to_writer_pretty(file, &ModelSettings { name, params })?;
    Ok(())
}

fn remove_model_dir(dir: &Path) {
    if let Err(error) = fs::remove_dir_all(dir) {
        warn!("could not remove '{}': {}", dir.display(), error);
    }
}

/// Shared orchestration of the model stage.
///
/// A failing model unit is reported, its directory removed, and the run
/// continues with the next model; resource errors abort the whole batch
/// since every remaining unit would hit the same wall.
pub trait ModelPipeline {
    /// The trained-model type this pipeline drives.
    type Model;

    /// The dispatcher progress events go to.
    fn dispatcher(&self) -> &EventDispatcher;

    /// Claims a fresh model directory under `parent`.
    fn claim_dir(&mut self, parent: &Path, key: &str) -> PathBuf;

    /// Whether an algorithm API is registered.
    fn api_available(&self, api: &str) -> bool;

    /// Constructs a model; `None` when the name is unknown to the API.
    fn create_model(
        &self,
        api: &str,
        config: &ModelConfig,
        context: &AlgorithmContext,
    ) -> Option<Result<Self::Model, CoreError>>;

    /// The model's parameters with schema defaults filled in, as recorded
    /// in its settings file.
    fn settings_params(&self, api: &str, config: &ModelConfig) -> Params;

    /// Fits the model on the shared train set.
    fn train_model(&self, model: &mut Self::Model, train: &RatingTable) -> Result<(), CoreError>;

    /// Produces the model's result file from the test set, in batches.
    /// Returns early without error when cancelled between batches; the
    /// caller discards the incomplete unit.
    fn test_model(
        &self,
        model: &Self::Model,
        test: &RatingTable,
        ratings_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError>;

    /// Runs every configured model against one data transition and
    /// returns the artifacts of the models that completed.
    fn run(
        &mut self,
        output_dir: &Path,
        data: &DataTransition,
        apis: &[ApiModels],
        context: &AlgorithmContext,
        cancel: &CancellationToken,
    ) -> Result<Vec<ModelArtifact>, CoreError> {
        let label = format!("{}/{}", data.dataset, data.matrix);
        let start = Instant::now();
        self.dispatcher()
            .dispatch(&PipelineEvent::begin(EventId::BeginModelPipeline, &label));

        let train = timed(
            self.dispatcher(),
            EventId::BeginLoadTrainSet,
            EventId::EndLoadTrainSet,
            &label,
            || read_matrix(&data.train_set_path, false),
        )?;
        let test = timed(
            self.dispatcher(),
            EventId::BeginLoadTestSet,
            EventId::EndLoadTestSet,
            &label,
            || read_matrix(&data.test_set_path, false),
        )?;

        let mut artifacts: Vec<ModelArtifact> = Vec::new();
        'apis: for api_models in apis {
            if !cancel.is_running() {
                break;
            }
            if !self.api_available(&api_models.api) {
                self.dispatcher().report_failure(&format!(
                    "unknown algorithm API '{}'",
                    api_models.api
                ));
                continue;
            }

            for model_config in &api_models.models {
                if !cancel.is_running() {
                    break 'apis;
                }

                let detail = format!("{}/{}", api_models.api, model_config.name);
                let dir =
                    self.claim_dir(output_dir, &format!("{}_{}", api_models.api, model_config.name));
                fs::create_dir_all(&dir)?;

                let outcome = run_model_unit(
                    self,
                    &dir,
                    &detail,
                    &api_models.api,
                    model_config,
                    context,
                    &train,
                    &test,
                    cancel,
                );
                match outcome {
                    Ok(()) if cancel.is_running() => {
                        debug!("model '{}' completed in '{}'", detail, dir.display());
                        artifacts.push(ModelArtifact {
                            api: api_models.api.clone(),
                            model: model_config.name.clone(),
                            dir,
                        });
                    }
                    Ok(()) => {
                        // Cancelled mid-test; the unit is incomplete.
                        remove_model_dir(&dir);
                        break 'apis;
                    }
                    Err(error) => {
                        remove_model_dir(&dir);
                        if error.is_resource() {
                            return Err(error);
                        }
                        self.dispatcher()
                            .report_failure(&format!("model '{}' failed: {}", detail, error));
                    }
                }
            }
        }

        // Free the shared sets before reconstruction reloads them; the
        // merge works off the persisted files, the same source a later
        // standalone evaluation would use.
        drop(train);
        drop(test);

        if !artifacts.is_empty() {
            timed(
                self.dispatcher(),
                EventId::BeginReconstructRatings,
                EventId::EndReconstructRatings,
                &label,
                || reconstruct_ratings(&data.train_set_path, &data.test_set_path, &artifacts),
            )?;
        }

        self.dispatcher().dispatch(&PipelineEvent::end(
            EventId::EndModelPipeline,
            &label,
            start.elapsed(),
        ));
        Ok(artifacts)
    }
}

fn run_model_unit<P: ModelPipeline + ?Sized>(
    pipeline: &P,
    dir: &Path,
    detail: &str,
    api: &str,
    config: &ModelConfig,
    context: &AlgorithmContext,
    train: &RatingTable,
    test: &RatingTable,
    cancel: &CancellationToken,
) -> Result<(), CoreError> {
    let dispatcher = pipeline.dispatcher();
    dispatcher.dispatch(&PipelineEvent::begin(EventId::BeginModel, detail));
    let start = Instant::now();

    let mut model = pipeline
        .create_model(api, config, context)
        .ok_or_else(|| CoreError::Logic(format!("model '{}' is not registered", detail)))??;

    write_settings(dir, &config.name, &pipeline.settings_params(api, config))?;

    timed(
        dispatcher,
        EventId::BeginTrainModel,
        EventId::EndTrainModel,
        detail,
        || pipeline.train_model(&mut model, train),
    )?;
    timed(
        dispatcher,
        EventId::BeginTestModel,
        EventId::EndTestModel,
        detail,
        || pipeline.test_model(&model, test, &dir.join(RATINGS_FILE), cancel),
    )?;

    dispatcher.dispatch(&PipelineEvent::end(EventId::EndModel, detail, start.elapsed()));
    Ok(())
}

/// Merges the ground-truth ratings of the persisted train and test sets
/// into every artifact's result file; rows without a ground-truth rating
/// keep an empty rating column.
pub fn reconstruct_ratings(
    train_set_path: &Path,
    test_set_path: &Path,
    artifacts: &[ModelArtifact],
) -> Result<(), CoreError> {
    let mut ratings = read_matrix(train_set_path, false)?.rating_map();
    ratings.extend(read_matrix(test_set_path, false)?.rating_map());

    for artifact in artifacts {
        let path = artifact.ratings_path();
        let mut rows = read_results(&path)?;
        for row in &mut rows {
            row.rating = ratings.get(&(row.user, row.item)).copied();
        }
        write_results_with_ratings(&path, &rows)?;
    }
    Ok(())
}

/// Model stage over rating predictors: each test `(user, item)` pair gets
/// a predicted rating.
pub struct PredictionPipeline<'a> {
    dispatcher: &'a EventDispatcher,
    factories: &'a PredictorFactories,
    counter: DirCounter,
}

impl<'a> PredictionPipeline<'a> {
    /// Creates a pipeline over the given predictor factories.
    pub fn new(
        dispatcher: &'a EventDispatcher,
        factories: &'a PredictorFactories,
    ) -> PredictionPipeline<'a> {
        PredictionPipeline {
            dispatcher,
            factories,
            counter: DirCounter::new(),
        }
    }
}

impl<'a> ModelPipeline for PredictionPipeline<'a> {
    type Model = Box<dyn crate::algorithms::Predictor>;

    fn dispatcher(&self) -> &EventDispatcher {
        self.dispatcher
    }

    fn claim_dir(&mut self, parent: &Path, key: &str) -> PathBuf {
        self.counter.claim(parent, key)
    }

    fn api_available(&self, api: &str) -> bool {
        self.factories.child_factory(api).is_some()
    }

    fn create_model(
        &self,
        api: &str,
        config: &ModelConfig,
        context: &AlgorithmContext,
    ) -> Option<Result<Self::Model, CoreError>> {
        self.factories
            .child_factory(api)?
            .create(&config.name, Some(&config.params), context)
    }

    fn settings_params(&self, api: &str, config: &ModelConfig) -> Params {
        match self.factories.child_factory(api) {
            Some(factory) => factory
                .create_params(&config.name)
                .resolved(Some(&config.params)),
            None => config.params.clone(),
        }
    }

    fn train_model(&self, model: &mut Self::Model, train: &RatingTable) -> Result<(), CoreError> {
        model.train(train)
    }

    fn test_model(
        &self,
        model: &Self::Model,
        test: &RatingTable,
        ratings_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        let pairs: Vec<(UserId, ItemId)> =
            test.rows().iter().map(|row| (row.user, row.item)).collect();

        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_path(ratings_path)?;
        writer.write_record(&["user", "item", "prediction"])?;

        for batch in pairs.chunks(TEST_BATCH_SIZE) {
            if !cancel.is_running() {
                return Ok(());
            }

            let predictions = model.predict(batch)?;
            for ((user, item), prediction) in batch.iter().zip(predictions) {
                writer.write_record(&[
                    user.to_string(),
                    item.to_string(),
                    prediction.to_string(),
                ])?;
            }
        }

        writer.flush()?;
        Ok(())
    }
}

/// Model stage over recommenders: each test user gets a ranked top-K
/// item list.
pub struct RecommendationPipeline<'a> {
    dispatcher: &'a EventDispatcher,
    factories: &'a RecommenderFactories,
    counter: DirCounter,
    top_k: usize,
}

impl<'a> RecommendationPipeline<'a> {
    /// Creates a pipeline recommending `top_k` items per test user.
    pub fn new(
        dispatcher: &'a EventDispatcher,
        factories: &'a RecommenderFactories,
        top_k: usize,
    ) -> RecommendationPipeline<'a> {
        RecommendationPipeline {
            dispatcher,
            factories,
            counter: DirCounter::new(),
            top_k,
        }
    }
}

impl<'a> ModelPipeline for RecommendationPipeline<'a> {
    type Model = Box<dyn crate::algorithms::Recommender>;

    fn dispatcher(&self) -> &EventDispatcher {
        self.dispatcher
    }

    fn claim_dir(&mut self, parent: &Path, key: &str) -> PathBuf {
        self.counter.claim(parent, key)
    }

    fn api_available(&self, api: &str) -> bool {
        self.factories.child_factory(api).is_some()
    }

    fn create_model(
        &self,
        api: &str,
        config: &ModelConfig,
        context: &AlgorithmContext,
    ) -> Option<Result<Self::Model, CoreError>> {
        self.factories
            .child_factory(api)?
            .create(&config.name, Some(&config.params), context)
    }

    fn settings_params(&self, api: &str, config: &ModelConfig) -> Params {
        match self.factories.child_factory(api) {
            Some(factory) => factory
                .create_params(&config.name)
                .resolved(Some(&config.params)),
            None => config.params.clone(),
        }
    }

    fn train_model(&self, model: &mut Self::Model, train: &RatingTable) -> Result<(), CoreError> {
        model.train(train)
    }

    fn test_model(
        &self,
        model: &Self::Model,
        test: &RatingTable,
        ratings_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        let users = test.unique_users();

        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_path(ratings_path)?;
        writer.write_record(&["rank", "user", "item", "score"])?;

        for batch in users.chunks(TEST_BATCH_SIZE) {
            if !cancel.is_running() {
                return Ok(());
            }

            let recommendations = model.recommend(batch, self.top_k)?;
            for (user, items) in batch.iter().zip(recommendations) {
                for (rank, (item, score)) in items.into_iter().enumerate() {
                    writer.write_record(&[
                        (rank as u64 + 1).to_string(),
                        user.to_string(),
                        item.to_string(),
                        score.to_string(),
                    ])?;
                }
            }
        }

        writer.flush()?;
        Ok(())
    }
}
