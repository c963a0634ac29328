//! The data stage: load, filter, convert, split, persist.

use std::fs;
use std::path::Path;
use std::time::Instant;

use log::{debug, info};

use crate::config::DataMatrixConfig;
use crate::converters::{ConverterContext, ConverterFactories};
use crate::data::{
    read_matrix, write_matrix, DataTransition, DatasetRegistry, RatingTable,
};
use crate::errors::CoreError;
use crate::events::{timed, EventDispatcher, EventId, PipelineEvent};
use crate::factory::resolve_nested;
use crate::filters::{apply_filter_passes, FilterFactories};
use crate::params::{ParamValue, Params};
use crate::pipeline::DirCounter;
use crate::splitters::SplitFactory;
use crate::threading::CancellationToken;

/// File name of the persisted train set inside a transition directory.
pub const TRAIN_SET_FILE: &str = "train_set.tsv";
/// File name of the persisted test set inside a transition directory.
pub const TEST_SET_FILE: &str = "test_set.tsv";

/// Turns one dataset-matrix configuration into a persisted train/test
/// split described by a [`DataTransition`].
pub struct DataPipeline<'a> {
    dispatcher: &'a EventDispatcher,
    split_factory: &'a SplitFactory,
    converter_factories: &'a ConverterFactories,
    filter_factories: &'a FilterFactories,
    counter: DirCounter,
}

impl<'a> DataPipeline<'a> {
    /// Creates a pipeline over the given component registries.
    pub fn new(
        dispatcher: &'a EventDispatcher,
        split_factory: &'a SplitFactory,
        converter_factories: &'a ConverterFactories,
        filter_factories: &'a FilterFactories,
    ) -> DataPipeline<'a> {
        DataPipeline {
            dispatcher,
            split_factory,
            converter_factories,
            filter_factories,
            counter: DirCounter::new(),
        }
    }

    /// Runs the data stage for one configuration. Returns `Ok(None)` when
    /// cancelled between steps; no partial transition is ever returned.
    pub fn run(
        &mut self,
        output_dir: &Path,
        registry: &DatasetRegistry,
        config: &DataMatrixConfig,
        cancel: &CancellationToken,
    ) -> Result<Option<DataTransition>, CoreError> {
        let label = format!("{}/{}", config.dataset, config.matrix);
        let start = Instant::now();
        self.dispatcher
            .dispatch(&PipelineEvent::begin(EventId::BeginDataPipeline, &label));

        if !cancel.is_running() {
            return Ok(None);
        }
        let data_dir = self.create_data_output_dir(output_dir, config)?;

        if !cancel.is_running() {
            return Ok(None);
        }
        let meta = registry.matrix(&config.dataset, &config.matrix)?;
        let table = timed(
            self.dispatcher,
            EventId::BeginLoadDataset,
            EventId::EndLoadDataset,
            &label,
            || read_matrix(&meta.file, meta.has_timestamp),
        )?;
        debug!("loaded {} rows from '{}'", table.len(), meta.file.display());

        if !cancel.is_running() {
            return Ok(None);
        }
        let table = self.filter_rows(table, config, &label)?;

        if !cancel.is_running() {
            return Ok(None);
        }
        let mut rating_scale = meta.rating_scale;
        let mut rating_type = meta.rating_type;
        let table = match &config.converter {
            None => table,
            Some(converter_config) => {
                let converted = timed(
                    self.dispatcher,
                    EventId::BeginConvertRatings,
                    EventId::EndConvertRatings,
                    &label,
                    || {
                        let factory = resolve_nested(
                            self.converter_factories,
                            &config.dataset,
                            &config.matrix,
                        )
                        .ok_or_else(|| {
                            CoreError::Logic(format!("no converters registered for '{}'", label))
                        })?;
                        let converter = factory
                            .create(
                                &converter_config.name,
                                Some(&converter_config.params),
                                &ConverterContext {
                                    rating_scale: meta.rating_scale,
                                },
                            )
                            .ok_or_else(|| {
                                CoreError::Logic(format!(
                                    "rating converter '{}' is not registered for '{}'",
                                    converter_config.name, label
                                ))
                            })??;

                        rating_scale = converter.output_scale();
                        rating_type = converter.output_type();
                        Ok(converter.convert(table))
                    },
                )?;
                converted
            }
        };

        if !cancel.is_running() {
            return Ok(None);
        }
        let (train, test) = timed(
            self.dispatcher,
            EventId::BeginSplit,
            EventId::EndSplit,
            &label,
            || {
                let mut params: Params = config.splitting.params.clone();
                params.insert(
                    "test_ratio".to_owned(),
                    ParamValue::Float(config.splitting.test_ratio),
                );

                let splitter = self
                    .split_factory
                    .create(&config.splitting.name, Some(&params), &())
                    .ok_or_else(|| {
                        CoreError::Logic(format!(
                            "splitter '{}' is not registered",
                            config.splitting.name
                        ))
                    })??;
                splitter.split(table)
            },
        )?;

        if !cancel.is_running() {
            return Ok(None);
        }
        let train_set_path = data_dir.join(TRAIN_SET_FILE);
        let test_set_path = data_dir.join(TEST_SET_FILE);
        timed(
            self.dispatcher,
            EventId::BeginSaveSets,
            EventId::EndSaveSets,
            &label,
            || {
                write_matrix(&train_set_path, &train, false)?;
                write_matrix(&test_set_path, &test, false)
            },
        )?;
        info!(
            "split '{}' into {} train and {} test rows",
            label,
            train.len(),
            test.len()
        );

        self.dispatcher.dispatch(&PipelineEvent::end(
            EventId::EndDataPipeline,
            &label,
            start.elapsed(),
        ));

        Ok(Some(DataTransition {
            dataset: config.dataset.clone(),
            matrix: config.matrix.clone(),
            output_dir: data_dir,
            train_set_path,
            test_set_path,
            rating_scale,
            rating_type,
        }))
    }

    fn create_data_output_dir(
        &mut self,
        output_dir: &Path,
        config: &DataMatrixConfig,
    ) -> Result<std::path::PathBuf, CoreError> {
        let key = format!("{}_{}", config.dataset, config.matrix);
        let data_dir = self.counter.claim(output_dir, &key);
        fs::create_dir_all(&data_dir)?;
        Ok(data_dir)
    }

    fn filter_rows(
        &self,
        table: RatingTable,
        config: &DataMatrixConfig,
        label: &str,
    ) -> Result<RatingTable, CoreError> {
        if config.subset.filter_passes.is_empty() {
            return Ok(table);
        }

        timed(
            self.dispatcher,
            EventId::BeginFilterRows,
            EventId::EndFilterRows,
            label,
            || {
                let factory = resolve_nested(
                    self.filter_factories,
                    &config.subset.dataset,
                    &config.subset.matrix,
                )
                .ok_or_else(|| {
                    CoreError::Logic(format!("no filters registered for '{}'", label))
                })?;
                apply_filter_passes(factory, &table, &config.subset.filter_passes)
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::{ConverterConfig, DataSubsetConfig, SplitConfig};
    use crate::converters::create_converter_factories;
    use crate::data::{Dataset, MatrixMeta, RatingType};
    use crate::filters::create_filter_factories;
    use crate::splitters::create_split_factory;

    fn write_sample_matrix(dir: &Path) -> PathBuf {
        let path = dir.join("ratings_matrix.tsv");
        let mut table = RatingTable::new();
        for user in 0..50u64 {
            for step in 0..20u64 {
                table.push(crate::data::RatingRow {
                    user,
                    item: (user + step) % 100,
                    rating: 1.0 + ((user * step) % 5) as f64,
                    timestamp: Some((step * 10) as i64),
                });
            }
        }
        write_matrix(&path, &table, true).unwrap();
        path
    }

    fn registry(matrix_file: PathBuf) -> DatasetRegistry {
        let mut registry = DatasetRegistry::new();
        registry.add(Dataset::new("movies").with_matrix(
            "ratings",
            MatrixMeta {
                file: matrix_file,
                has_timestamp: true,
                rating_type: RatingType::Explicit,
                rating_scale: (1.0, 5.0),
            },
        ));
        registry
    }

    fn config(converter: Option<ConverterConfig>) -> DataMatrixConfig {
        let mut params = Params::new();
        params.insert("seed".to_owned(), ParamValue::Int(42));
        DataMatrixConfig {
            dataset: "movies".to_owned(),
            matrix: "ratings".to_owned(),
            subset: DataSubsetConfig::whole("movies", "ratings"),
            converter,
            splitting: SplitConfig {
                name: "random".to_owned(),
                test_ratio: 0.2,
                params,
            },
        }
    }

    struct Fixture {
        dispatcher: EventDispatcher,
        split_factory: SplitFactory,
        converter_factories: ConverterFactories,
        filter_factories: FilterFactories,
        registry: DatasetRegistry,
    }

    fn fixture(matrix_file: PathBuf) -> Fixture {
        let registry = registry(matrix_file);
        Fixture {
            dispatcher: EventDispatcher::new(),
            split_factory: create_split_factory(),
            converter_factories: create_converter_factories(&registry),
            filter_factories: create_filter_factories(&registry),
            registry,
        }
    }

    #[test]
    fn run_produces_a_complete_split_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let matrix_file = write_sample_matrix(dir.path());
        let fixture = fixture(matrix_file);
        let mut pipeline = DataPipeline::new(
            &fixture.dispatcher,
            &fixture.split_factory,
            &fixture.converter_factories,
            &fixture.filter_factories,
        );

        let transition = pipeline
            .run(dir.path(), &fixture.registry, &config(None), &CancellationToken::new())
            .unwrap()
            .unwrap();

        assert_eq!(transition.output_dir, dir.path().join("movies_ratings_0"));
        let train = read_matrix(&transition.train_set_path, false).unwrap();
        let test = read_matrix(&transition.test_set_path, false).unwrap();
        assert_eq!(train.len() + test.len(), 1000);
        assert_eq!(transition.rating_scale, (1.0, 5.0));
        assert_eq!(transition.rating_type, RatingType::Explicit);

        // A second run of the same configuration gets a fresh directory.
        let again = pipeline
            .run(dir.path(), &fixture.registry, &config(None), &CancellationToken::new())
            .unwrap()
            .unwrap();
        assert_eq!(again.output_dir, dir.path().join("movies_ratings_1"));
    }

    #[test]
    fn converters_update_the_transition_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let matrix_file = write_sample_matrix(dir.path());
        let fixture = fixture(matrix_file);
        let mut pipeline = DataPipeline::new(
            &fixture.dispatcher,
            &fixture.split_factory,
            &fixture.converter_factories,
            &fixture.filter_factories,
        );

        let mut params = Params::new();
        params.insert("threshold".to_owned(), ParamValue::Float(3.0));
        let transition = pipeline
            .run(
                dir.path(),
                &fixture.registry,
                &config(Some(ConverterConfig {
                    name: "implicit".to_owned(),
                    params,
                })),
                &CancellationToken::new(),
            )
            .unwrap()
            .unwrap();

        assert_eq!(transition.rating_scale, (0.0, 1.0));
        assert_eq!(transition.rating_type, RatingType::Implicit);
        let train = read_matrix(&transition.train_set_path, false).unwrap();
        assert!(train.rows().iter().all(|row| row.rating == 0.0 || row.rating == 1.0));
    }

    #[test]
    fn unknown_converters_are_fatal_for_this_run() {
        let dir = tempfile::tempdir().unwrap();
        let matrix_file = write_sample_matrix(dir.path());
        let fixture = fixture(matrix_file);
        let mut pipeline = DataPipeline::new(
            &fixture.dispatcher,
            &fixture.split_factory,
            &fixture.converter_factories,
            &fixture.filter_factories,
        );

        let error = pipeline
            .run(
                dir.path(),
                &fixture.registry,
                &config(Some(ConverterConfig {
                    name: "kl".to_owned(),
                    params: Params::new(),
                })),
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert!(!error.is_resource());
    }

    #[test]
    fn missing_matrix_files_propagate_as_resource_errors() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = fixture(dir.path().join("missing.tsv"));
        let mut pipeline = DataPipeline::new(
            &fixture.dispatcher,
            &fixture.split_factory,
            &fixture.converter_factories,
            &fixture.filter_factories,
        );

        let error = pipeline
            .run(dir.path(), &fixture.registry, &config(None), &CancellationToken::new())
            .unwrap_err();
        assert!(error.is_resource());
    }

    #[test]
    fn cancellation_returns_no_partial_transition() {
        let dir = tempfile::tempdir().unwrap();
        let matrix_file = write_sample_matrix(dir.path());
        let fixture = fixture(matrix_file);
        let mut pipeline = DataPipeline::new(
            &fixture.dispatcher,
            &fixture.split_factory,
            &fixture.converter_factories,
            &fixture.filter_factories,
        );

        let result = pipeline
            .run(
                dir.path(),
                &fixture.registry,
                &config(None),
                &CancellationToken::cancelled(),
            )
            .unwrap();
        assert!(result.is_none());
    }
}
