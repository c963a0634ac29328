//! Rating conversion applied to a matrix before splitting.
//!
//! Converters transform the `rating` column (e.g. thresholding explicit
//! ratings into implicit feedback) and declare the rating type and scale
//! of their output, which the data pipeline records in the resulting
//! transition.

use crate::data::{DatasetRegistry, RatingTable, RatingType};
use crate::errors::CoreError;
use crate::factory::{Factory, FactoryNode, GroupFactory};
use crate::params::{ParamSchema, ParamValue, Params};

/// Construction context for rating converters.
#[derive(Clone, Copy, Debug)]
pub struct ConverterContext {
    /// Rating range of the input matrix.
    pub rating_scale: (f64, f64),
}

/// A transform of the rating column.
pub trait RatingConverter: Send {
    /// Converts every rating, preserving row order.
    fn convert(&self, table: RatingTable) -> RatingTable;
    /// Rating range of the converted table.
    fn output_scale(&self) -> (f64, f64);
    /// Feedback type of the converted table.
    fn output_type(&self) -> RatingType;
}

/// Factory of converters for one matrix.
pub type ConverterFactory = Factory<Box<dyn RatingConverter>, ConverterContext>;
/// Converter factories nested by dataset then matrix.
pub type ConverterFactories = GroupFactory<Box<dyn RatingConverter>, ConverterContext>;

/// Linearly rescales ratings from the input range to `[0, upper]`.
struct RangeConverter {
    input_scale: (f64, f64),
    upper: f64,
}

impl RatingConverter for RangeConverter {
    fn convert(&self, table: RatingTable) -> RatingTable {
        let (min, max) = self.input_scale;
        let span = if max > min { max - min } else { 1.0 };

        table
            .into_iter()
            .map(|mut row| {
                row.rating = (row.rating - min) / span * self.upper;
                row
            })
            .collect::<Vec<_>>()
            .into()
    }

    fn output_scale(&self) -> (f64, f64) {
        (0.0, self.upper)
    }

    fn output_type(&self) -> RatingType {
        RatingType::Explicit
    }
}

/// Binarizes ratings: at or above the threshold becomes 1, below 0.
struct ImplicitConverter {
    threshold: f64,
}

impl RatingConverter for ImplicitConverter {
    fn convert(&self, table: RatingTable) -> RatingTable {
        table
            .into_iter()
            .map(|mut row| {
                row.rating = if row.rating >= self.threshold { 1.0 } else { 0.0 };
                row
            })
            .collect::<Vec<_>>()
            .into()
    }

    fn output_scale(&self) -> (f64, f64) {
        (0.0, 1.0)
    }

    fn output_type(&self) -> RatingType {
        RatingType::Implicit
    }
}

/// Builds the built-in converter factory for one matrix.
pub fn create_converter_factory(matrix: &str, rating_scale: (f64, f64)) -> ConverterFactory {
    let mut factory = ConverterFactory::new(matrix);
    let (min, max) = rating_scale;

    factory
        .add(
            "range",
            Box::new(|_, params, context: &ConverterContext| {
                let upper = params
                    .get("upper")
                    .and_then(ParamValue::as_f64)
                    .ok_or_else(|| CoreError::Logic("missing parameter 'upper'".to_owned()))?;
                if upper <= 0.0 {
                    return Err(CoreError::Logic("'upper' must be positive".to_owned()));
                }
                Ok(Box::new(RangeConverter {
                    input_scale: context.rating_scale,
                    upper,
                }) as Box<dyn RatingConverter>)
            }),
            Some(Box::new(|| {
                ParamSchema::new().with_range("upper", 1.0, 0.001, 1_000.0)
            })),
        )
        .expect("fresh factory");
    factory
        .add(
            "implicit",
            Box::new(|_, params, _| {
                let threshold = params
                    .get("threshold")
                    .and_then(ParamValue::as_f64)
                    .ok_or_else(|| CoreError::Logic("missing parameter 'threshold'".to_owned()))?;
                Ok(Box::new(ImplicitConverter { threshold }) as Box<dyn RatingConverter>)
            }),
            Some(Box::new(move || {
                ParamSchema::new().with_range("threshold", (min + max) / 2.0, min, max)
            })),
        )
        .expect("fresh factory");

    factory
}

/// Builds the dataset -> matrix nested converter factories for every
/// matrix in the registry.
pub fn create_converter_factories(registry: &DatasetRegistry) -> ConverterFactories {
    let mut root = ConverterFactories::new("converters");

    for dataset_name in registry.dataset_names() {
        let dataset = registry.dataset(dataset_name).expect("listed name");
        let mut group = GroupFactory::new(dataset_name);
        for matrix_name in dataset.matrix_names() {
            let meta = dataset.matrix(matrix_name).expect("listed name");
            group
                .add(FactoryNode::Leaf(create_converter_factory(
                    matrix_name,
                    meta.rating_scale,
                )))
                .expect("unique matrix names");
        }
        root.add(FactoryNode::Group(group)).expect("unique dataset names");
    }

    root
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::RatingRow;

    fn table() -> RatingTable {
        vec![
            RatingRow {
                user: 1,
                item: 1,
                rating: 1.0,
                timestamp: None,
            },
            RatingRow {
                user: 1,
                item: 2,
                rating: 5.0,
                timestamp: None,
            },
            RatingRow {
                user: 2,
                item: 1,
                rating: 3.0,
                timestamp: None,
            },
        ]
        .into()
    }

    fn context() -> ConverterContext {
        ConverterContext {
            rating_scale: (1.0, 5.0),
        }
    }

    #[test]
    fn range_converter_rescales_to_zero_upper() {
        let factory = create_converter_factory("ratings", (1.0, 5.0));
        let mut params = Params::new();
        params.insert("upper".to_owned(), ParamValue::Float(2.0));

        let converter = factory.create("range", Some(&params), &context()).unwrap().unwrap();
        let converted = converter.convert(table());

        let ratings: Vec<f64> = converted.rows().iter().map(|r| r.rating).collect();
        assert_eq!(ratings, vec![0.0, 2.0, 1.0]);
        assert_eq!(converter.output_scale(), (0.0, 2.0));
        assert_eq!(converter.output_type(), RatingType::Explicit);
    }

    #[test]
    fn implicit_converter_binarizes_at_the_threshold() {
        let factory = create_converter_factory("ratings", (1.0, 5.0));
        let converter = factory.create("implicit", None, &context()).unwrap().unwrap();

        let converted = converter.convert(table());
        let ratings: Vec<f64> = converted.rows().iter().map(|r| r.rating).collect();

        // Default threshold is the scale midpoint, 3.0.
        assert_eq!(ratings, vec![0.0, 1.0, 1.0]);
        assert_eq!(converter.output_type(), RatingType::Implicit);
    }
}
