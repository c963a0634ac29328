//! Runs the full pipeline against a generated synthetic dataset.
//!
//! Usage: `synthetic_experiment [output_dir]`. The output directory is
//! created and must not already contain experiment runs.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use reclab::config::{
    ApiModels, DataMatrixConfig, DataSubsetConfig, ExperimentConfig, ExperimentType,
    MetricConfig, ModelConfig, SplitConfig,
};
use reclab::data::{write_matrix, Dataset, DatasetRegistry, MatrixMeta, RatingRow, RatingTable, RatingType};
use reclab::errors::CoreError;
use reclab::events::{CallbackPair, EventId};
use reclab::params::{ParamValue, Params};
use reclab::pipeline::evaluation::read_evaluations;
use reclab::pipeline::experiment::ExperimentPipeline;
use reclab::threading::ThreadExperiment;

const NUM_USERS: u64 = 200;
const NUM_ITEMS: u64 = 100;
const RATINGS_PER_USER: usize = 30;

fn generate_matrix(path: &PathBuf) -> Result<(), CoreError> {
    let mut rng = StdRng::seed_from_u64(17);
    let mut table = RatingTable::new();

    for user in 0..NUM_USERS {
        let user_shift = rng.gen_range(-1.0..1.0);
        for step in 0..RATINGS_PER_USER {
            // Skew item draws so a popularity ranking has something to find.
            let item = (rng.gen::<f64>().powi(2) * NUM_ITEMS as f64) as u64;
            let quality = 3.0 + 2.0 * (item as f64 / NUM_ITEMS as f64 - 0.5);
            let rating = (quality + user_shift + rng.gen_range(-1.0..1.0))
                .round()
                .max(1.0)
                .min(5.0);
            table.push(RatingRow {
                user,
                item,
                rating,
                timestamp: Some(step as i64),
            });
        }
    }

    write_matrix(path, &table, true)
}

fn params(entries: &[(&str, ParamValue)]) -> Params {
    entries
        .iter()
        .map(|(name, value)| ((*name).to_owned(), value.clone()))
        .collect()
}

fn prediction_config() -> ExperimentConfig {
    ExperimentConfig {
        name: "synthetic-prediction".to_owned(),
        experiment_type: ExperimentType::Prediction,
        datasets: vec![DataMatrixConfig {
            dataset: "synthetic".to_owned(),
            matrix: "ratings".to_owned(),
            subset: DataSubsetConfig::whole("synthetic", "ratings"),
            converter: None,
            splitting: SplitConfig {
                name: "random".to_owned(),
                test_ratio: 0.2,
                params: params(&[("seed", ParamValue::Int(42))]),
            },
        }],
        models: vec![ApiModels {
            api: "baseline".to_owned(),
            models: vec![
                ModelConfig {
                    name: "bias".to_owned(),
                    params: params(&[("damping", ParamValue::Float(10.0))]),
                },
                ModelConfig {
                    name: "constant".to_owned(),
                    params: params(&[("value", ParamValue::Float(3.0))]),
                },
                ModelConfig {
                    name: "random".to_owned(),
                    params: params(&[("seed", ParamValue::Int(7))]),
                },
            ],
        }],
        evaluation: vec![
            MetricConfig {
                name: "mae".to_owned(),
                params: Params::new(),
                subgroup: None,
            },
            MetricConfig {
                name: "rmse".to_owned(),
                params: Params::new(),
                subgroup: None,
            },
        ],
        top_k: 10,
        rated_items_filter: true,
        num_threads: 1,
    }
}

fn recommendation_config() -> ExperimentConfig {
    let mut config = prediction_config();
    config.name = "synthetic-recommendation".to_owned();
    config.experiment_type = ExperimentType::Recommendation;
    config.models = vec![ApiModels {
        api: "baseline".to_owned(),
        models: vec![
            ModelConfig {
                name: "popularity".to_owned(),
                params: Params::new(),
            },
            ModelConfig {
                name: "random".to_owned(),
                params: params(&[("seed", ParamValue::Int(7))]),
            },
        ],
    }];
    config.evaluation = vec![
        MetricConfig {
            name: "mrr".to_owned(),
            params: Params::new(),
            subgroup: None,
        },
        MetricConfig {
            name: "precision_at_k".to_owned(),
            params: params(&[
                ("k", ParamValue::Int(10)),
                ("relevance_threshold", ParamValue::Float(4.0)),
            ]),
            subgroup: None,
        },
        MetricConfig {
            name: "item_coverage".to_owned(),
            params: Params::new(),
            subgroup: None,
        },
    ];
    config
}

fn run_experiment(
    registry: &DatasetRegistry,
    output_dir: PathBuf,
    config: ExperimentConfig,
) -> Result<(), CoreError> {
    let mut pipeline = ExperimentPipeline::new(registry.clone());
    pipeline.dispatcher_mut().add_listener(
        EventId::Failure,
        "console",
        CallbackPair::internal_only(Arc::new(|_, event| {
            warn!("pipeline failure: {}", event.detail);
        })),
    )?;
    for id in [
        EventId::EndDataPipeline,
        EventId::EndModel,
        EventId::EndEvalPipeline,
    ] {
        pipeline.dispatcher_mut().add_listener(
            id,
            "console",
            CallbackPair::internal_only(Arc::new(move |_, event| {
                info!("{:?} {} ({:?})", event.id, event.detail, event.elapsed);
            })),
        )?;
    }

    let name = config.name.clone();
    let worker = ThreadExperiment::spawn(pipeline, output_dir, config, 1);
    let overviews = worker.join()?;

    for overview in overviews {
        for entry in overview.overview {
            info!("[{}] unit '{}' on dataset '{}'", name, entry.name, entry.dataset);
            if let Some(path) = entry.evaluation_path {
                for evaluation in read_evaluations(&path)?.evaluations {
                    info!(
                        "[{}]   {} = {:.4}",
                        name, evaluation.name, evaluation.evaluation.value
                    );
                }
            }
        }
    }
    Ok(())
}

fn main() -> Result<(), CoreError> {
    env_logger::init();

    let base_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("synthetic_output"));
    fs::create_dir_all(&base_dir)?;

    let matrix_path = base_dir.join("synthetic_matrix.tsv");
    generate_matrix(&matrix_path)?;
    info!("wrote synthetic matrix to '{}'", matrix_path.display());

    let mut registry = DatasetRegistry::new();
    registry.add(Dataset::new("synthetic").with_matrix(
        "ratings",
        MatrixMeta {
            file: matrix_path,
            has_timestamp: true,
            rating_type: RatingType::Explicit,
            rating_scale: (1.0, 5.0),
        },
    ));

    run_experiment(&registry, base_dir.join("prediction"), prediction_config())?;
    run_experiment(
        &registry,
        base_dir.join("recommendation"),
        recommendation_config(),
    )?;

    Ok(())
}
