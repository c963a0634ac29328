//! Configuration value objects consumed by the pipelines.
//!
//! Parsing and validation of user-facing configuration files happens
//! outside the core; the pipelines receive these already-validated
//! values.

use serde::{Deserialize, Serialize};

use crate::params::Params;

/// One row filter by factory name.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Name in the filter factory of the target matrix.
    pub name: String,
    /// Constructor parameters.
    #[serde(default)]
    pub params: Params,
}

/// One conjunctive chain of row filters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilterPassConfig {
    /// Filters applied in order, ANDed together.
    pub filters: Vec<FilterConfig>,
}

/// A filterable slice of one dataset matrix; multiple passes are unioned.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataSubsetConfig {
    /// Dataset name.
    pub dataset: String,
    /// Matrix name within the dataset.
    pub matrix: String,
    /// OR-of-ANDs filter passes; empty means the whole matrix.
    #[serde(default)]
    pub filter_passes: Vec<FilterPassConfig>,
}

impl DataSubsetConfig {
    /// A subset covering the whole matrix.
    pub fn whole(dataset: &str, matrix: &str) -> DataSubsetConfig {
        DataSubsetConfig {
            dataset: dataset.to_owned(),
            matrix: matrix.to_owned(),
            filter_passes: Vec::new(),
        }
    }
}

/// Rating conversion applied before splitting.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConverterConfig {
    /// Name in the converter factory of the target matrix.
    pub name: String,
    /// Constructor parameters.
    #[serde(default)]
    pub params: Params,
}

/// Train/test splitting configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Splitter factory name.
    pub name: String,
    /// Fraction of data assigned to the test set, in `[0.01, 0.99]`.
    pub test_ratio: f64,
    /// Additional splitter parameters (e.g. the random seed).
    #[serde(default)]
    pub params: Params,
}

/// One dataset-matrix unit of the data stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataMatrixConfig {
    /// Dataset name.
    pub dataset: String,
    /// Matrix name within the dataset.
    pub matrix: String,
    /// Pre-split row filtering.
    pub subset: DataSubsetConfig,
    /// Optional rating conversion.
    pub converter: Option<ConverterConfig>,
    /// Train/test splitting.
    pub splitting: SplitConfig,
}

/// One model to train and test.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Name in the algorithm factory of the configured API.
    pub name: String,
    /// Constructor parameters.
    #[serde(default)]
    pub params: Params,
}

/// The models configured for one algorithm API.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiModels {
    /// API (factory group) name.
    pub api: String,
    /// Models run in list order.
    pub models: Vec<ModelConfig>,
}

/// One metric to evaluate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricConfig {
    /// Name in one of the metric category factories.
    pub name: String,
    /// Constructor parameters.
    #[serde(default)]
    pub params: Params,
    /// Optional subgroup restricting the evaluated rows.
    pub subgroup: Option<DataSubsetConfig>,
}

/// Whether an experiment trains predictors or recommenders.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentType {
    /// Rating prediction over test `(user, item)` pairs.
    Prediction,
    /// Top-K recommendation over test users.
    Recommendation,
}

/// A full experiment: datasets x models x metrics.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Experiment name, used for the output directory.
    pub name: String,
    /// Prediction or recommendation.
    pub experiment_type: ExperimentType,
    /// Dataset-matrix configurations for the data stage.
    pub datasets: Vec<DataMatrixConfig>,
    /// Models grouped by API, run per produced data transition.
    pub models: Vec<ApiModels>,
    /// Metrics evaluated over every model output; may be empty.
    #[serde(default)]
    pub evaluation: Vec<MetricConfig>,
    /// Number of recommendations per user (recommendation experiments).
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Whether recommenders exclude items the user already rated.
    #[serde(default = "default_true")]
    pub rated_items_filter: bool,
    /// Passed through to algorithm implementations that parallelize
    /// internally; the orchestration itself stays single-threaded.
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
}

fn default_top_k() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_num_threads() -> usize {
    1
}
