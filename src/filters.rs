//! Row filtering for subgroup (fairness) experiments.
//!
//! A filter pass is one conjunctive chain of row filters; a subgroup is
//! the union of the slices produced by its passes (OR-of-ANDs). Filters
//! are registered per dataset matrix so configuration layers can only
//! offer filters that make sense for the matrix at hand.

use std::collections::HashSet;

use crate::config::FilterPassConfig;
use crate::data::{DatasetRegistry, RatingTable};
use crate::errors::CoreError;
use crate::factory::{Factory, FactoryNode, GroupFactory};
use crate::params::{ParamSchema, ParamValue, Params};

/// A row predicate over a rating table.
pub trait RowFilter: Send {
    /// Returns the rows that pass the filter, preserving order.
    fn filter(&self, table: &RatingTable) -> RatingTable;
}

/// Factory of row filters for one matrix.
pub type FilterFactory = Factory<Box<dyn RowFilter>, ()>;
/// Filter factories nested by dataset then matrix.
pub type FilterFactories = GroupFactory<Box<dyn RowFilter>, ()>;

struct RatingRange {
    min: f64,
    max: f64,
}

impl RowFilter for RatingRange {
    fn filter(&self, table: &RatingTable) -> RatingTable {
        table
            .rows()
            .iter()
            .filter(|row| row.rating >= self.min && row.rating <= self.max)
            .cloned()
            .collect::<Vec<_>>()
            .into()
    }
}

struct TimestampRange {
    min: i64,
    max: i64,
}

impl RowFilter for TimestampRange {
    fn filter(&self, table: &RatingTable) -> RatingTable {
        table
            .rows()
            .iter()
            .filter(|row| {
                row.timestamp
                    .map_or(false, |ts| ts >= self.min && ts <= self.max)
            })
            .cloned()
            .collect::<Vec<_>>()
            .into()
    }
}

/// Partitions users by `user % modulo == remainder`; a cheap stand-in for
/// demographic subgroup columns the core does not carry.
struct UserModulo {
    modulo: u64,
    remainder: u64,
}

impl RowFilter for UserModulo {
    fn filter(&self, table: &RatingTable) -> RatingTable {
        table
            .rows()
            .iter()
            .filter(|row| row.user % self.modulo == self.remainder)
            .cloned()
            .collect::<Vec<_>>()
            .into()
    }
}

fn float_param(params: &Params, name: &str) -> Result<f64, CoreError> {
    params
        .get(name)
        .and_then(ParamValue::as_f64)
        .ok_or_else(|| CoreError::Logic(format!("missing numeric parameter '{}'", name)))
}

fn int_param(params: &Params, name: &str) -> Result<i64, CoreError> {
    params
        .get(name)
        .and_then(ParamValue::as_i64)
        .ok_or_else(|| CoreError::Logic(format!("missing integer parameter '{}'", name)))
}

/// Builds the built-in filter factory for one matrix with the given
/// rating scale.
pub fn create_filter_factory(matrix: &str, rating_scale: (f64, f64)) -> FilterFactory {
    let mut factory = FilterFactory::new(matrix);
    let (min, max) = rating_scale;

    factory
        .add(
            "rating_range",
            Box::new(|_, params, _| {
                Ok(Box::new(RatingRange {
                    min: float_param(params, "min")?,
                    max: float_param(params, "max")?,
                }) as Box<dyn RowFilter>)
            }),
            Some(Box::new(move || {
                ParamSchema::new()
                    .with_range("min", min, min, max)
                    .with_range("max", max, min, max)
            })),
        )
        .expect("fresh factory");
    factory
        .add(
            "timestamp_range",
            Box::new(|_, params, _| {
                Ok(Box::new(TimestampRange {
                    min: int_param(params, "min")?,
                    max: int_param(params, "max")?,
                }) as Box<dyn RowFilter>)
            }),
            Some(Box::new(|| {
                ParamSchema::new()
                    .with_int_range("min", 0, 0, i64::max_value())
                    .with_int_range("max", i64::max_value(), 0, i64::max_value())
            })),
        )
        .expect("fresh factory");
    factory
        .add(
            "user_modulo",
            Box::new(|_, params, _| {
                let modulo = int_param(params, "modulo")?;
                if modulo <= 0 {
                    return Err(CoreError::Logic("modulo must be positive".to_owned()));
                }
                Ok(Box::new(UserModulo {
                    modulo: modulo as u64,
                    remainder: int_param(params, "remainder")? as u64,
                }) as Box<dyn RowFilter>)
            }),
            Some(Box::new(|| {
                ParamSchema::new()
                    .with_int_range("modulo", 2, 1, 1 << 32)
                    .with_int_range("remainder", 0, 0, 1 << 32)
            })),
        )
        .expect("fresh factory");

    factory
}

/// Builds the dataset -> matrix nested filter factories for every matrix
/// in the registry.
pub fn create_filter_factories(registry: &DatasetRegistry) -> FilterFactories {
    let mut root = FilterFactories::new("filters");

    for dataset_name in registry.dataset_names() {
        let dataset = registry.dataset(dataset_name).expect("listed name");
        let mut group = GroupFactory::new(dataset_name);
        for matrix_name in dataset.matrix_names() {
            let meta = dataset.matrix(matrix_name).expect("listed name");
            group
                .add(FactoryNode::Leaf(create_filter_factory(
                    matrix_name,
                    meta.rating_scale,
                )))
                .expect("unique matrix names");
        }
        root.add(FactoryNode::Group(group)).expect("unique dataset names");
    }

    root
}

fn row_key(row: &crate::data::RatingRow) -> (u64, u64, u64, Option<i64>) {
    (row.user, row.item, row.rating.to_bits(), row.timestamp)
}

/// Applies the OR-of-ANDs filter passes to a table. Zero passes is the
/// identity; each pass filters the full input conjunctively and the pass
/// outputs are concatenated with duplicate rows removed.
pub fn apply_filter_passes(
    factory: &FilterFactory,
    table: &RatingTable,
    passes: &[FilterPassConfig],
) -> Result<RatingTable, CoreError> {
    if passes.is_empty() {
        return Ok(table.clone());
    }

    let mut seen = HashSet::new();
    let mut union = RatingTable::new();

    for pass in passes {
        let mut slice = table.clone();
        for filter_config in &pass.filters {
            let filter = factory
                .create(&filter_config.name, Some(&filter_config.params), &())
                .ok_or_else(|| {
                    CoreError::Logic(format!(
                        "filter '{}' is not registered for '{}'",
                        filter_config.name,
                        factory.name()
                    ))
                })??;
            slice = filter.filter(&slice);
        }

        for row in slice {
            if seen.insert(row_key(&row)) {
                union.push(row);
            }
        }
    }

    Ok(union)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfig;
    use crate::data::RatingRow;

    fn table() -> RatingTable {
        (1..=10u64)
            .map(|user| RatingRow {
                user,
                item: 100 + user,
                rating: user as f64 / 2.0,
                timestamp: Some(user as i64 * 10),
            })
            .collect::<Vec<_>>()
            .into()
    }

    fn filter(name: &str, params: &[(&str, ParamValue)]) -> FilterConfig {
        FilterConfig {
            name: name.to_owned(),
            params: params
                .iter()
                .map(|(k, v)| ((*k).to_owned(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn zero_passes_is_the_identity() {
        let factory = create_filter_factory("ratings", (0.5, 5.0));
        let filtered = apply_filter_passes(&factory, &table(), &[]).unwrap();
        assert_eq!(filtered.len(), 10);
    }

    #[test]
    fn filters_within_a_pass_are_conjunctive() {
        let factory = create_filter_factory("ratings", (0.5, 5.0));
        let passes = vec![FilterPassConfig {
            filters: vec![
                filter(
                    "rating_range",
                    &[("min", ParamValue::Float(2.0)), ("max", ParamValue::Float(5.0))],
                ),
                filter(
                    "user_modulo",
                    &[("modulo", ParamValue::Int(2)), ("remainder", ParamValue::Int(0))],
                ),
            ],
        }];

        let filtered = apply_filter_passes(&factory, &table(), &passes).unwrap();

        // rating >= 2.0 keeps users 4..=10, even users of those: 4, 6, 8, 10.
        assert_eq!(
            filtered.rows().iter().map(|r| r.user).collect::<Vec<_>>(),
            vec![4, 6, 8, 10]
        );
    }

    #[test]
    fn passes_are_unioned_without_duplicates() {
        let factory = create_filter_factory("ratings", (0.5, 5.0));
        let passes = vec![
            FilterPassConfig {
                filters: vec![filter(
                    "user_modulo",
                    &[("modulo", ParamValue::Int(2)), ("remainder", ParamValue::Int(0))],
                )],
            },
            FilterPassConfig {
                filters: vec![filter(
                    "rating_range",
                    &[("min", ParamValue::Float(4.0)), ("max", ParamValue::Float(5.0))],
                )],
            },
        ];

        let filtered = apply_filter_passes(&factory, &table(), &passes).unwrap();

        // Evens (5 users) OR rating >= 4.0 (users 8, 9, 10); 8 and 10 overlap.
        let mut users: Vec<_> = filtered.rows().iter().map(|r| r.user).collect();
        users.sort();
        assert_eq!(users, vec![2, 4, 6, 8, 9, 10]);
    }

    #[test]
    fn unknown_filter_names_fail_resolution() {
        let factory = create_filter_factory("ratings", (0.5, 5.0));
        let passes = vec![FilterPassConfig {
            filters: vec![filter("country", &[])],
        }];

        assert!(apply_filter_passes(&factory, &table(), &passes).is_err());
    }

    #[test]
    fn timestamp_filter_drops_rows_without_timestamps() {
        let factory = create_filter_factory("ratings", (0.5, 5.0));
        let mut rows = table();
        rows.push(RatingRow {
            user: 11,
            item: 111,
            rating: 3.0,
            timestamp: None,
        });

        let passes = vec![FilterPassConfig {
            filters: vec![filter(
                "timestamp_range",
                &[("min", ParamValue::Int(0)), ("max", ParamValue::Int(1000))],
            )],
        }];
        let filtered = apply_filter_passes(&factory, &rows, &passes).unwrap();

        assert!(filtered.rows().iter().all(|row| row.user != 11));
    }
}
