//! Parameter schemas for factory-constructed components.
//!
//! Each registered component publishes an ordered schema of its parameters
//! (named options, bounded numeric values, or a random seed whose default
//! is legitimately null) so that configuration and UI layers can enumerate
//! and validate choices without constructing anything.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single configured parameter value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Absent value; only valid as the default of a seed parameter.
    Null,
    /// Boolean flag.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// String option.
    Str(String),
}

impl ParamValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(value) => Some(*value as f64),
            ParamValue::Float(value) => Some(*value),
            _ => None,
        }
    }

    /// Integer view of the value, if it has one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(value) => Some(*value),
            ParamValue::Float(value) => Some(*value as i64),
            _ => None,
        }
    }

    /// Unsigned view of the value, if it is a non-negative integer.
    pub fn as_u64(&self) -> Option<u64> {
        self.as_i64().and_then(|value| {
            if value >= 0 {
                Some(value as u64)
            } else {
                None
            }
        })
    }

    /// String view of the value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(value) => Some(value),
            _ => None,
        }
    }

    /// Boolean view of the value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Whether the value is null.
    pub fn is_null(&self) -> bool {
        *self == ParamValue::Null
    }
}

/// Ordered name-to-value mapping passed to component constructors.
pub type Params = BTreeMap<String, ParamValue>;

/// The kind of a schema parameter.
#[derive(Clone, Debug)]
pub enum ParamKind {
    /// A parameter with an enumerated value set.
    Options {
        /// The valid values.
        options: Vec<ParamValue>,
    },
    /// A numeric parameter bounded by an inclusive range.
    Range {
        /// Smallest valid value.
        min: f64,
        /// Largest valid value.
        max: f64,
    },
    /// A random seed; its default may be null.
    Seed,
}

/// One named parameter of a schema.
#[derive(Clone, Debug)]
pub struct ParamDescriptor {
    /// Unique name within the schema.
    pub name: String,
    /// Default value; a valid value of the kind, or null for seeds only.
    pub default: ParamValue,
    /// The descriptor kind.
    pub kind: ParamKind,
}

/// Ordered collection of parameter descriptors.
#[derive(Clone, Debug, Default)]
pub struct ParamSchema {
    descriptors: Vec<ParamDescriptor>,
}

impl ParamSchema {
    /// Creates an empty schema.
    pub fn new() -> ParamSchema {
        ParamSchema {
            descriptors: Vec::new(),
        }
    }

    fn push(&mut self, descriptor: ParamDescriptor) {
        assert!(
            self.get(&descriptor.name).is_none(),
            "duplicate parameter '{}'",
            descriptor.name
        );
        self.descriptors.push(descriptor);
    }

    /// Adds a bounded numeric parameter.
    pub fn with_range(mut self, name: &str, default: f64, min: f64, max: f64) -> ParamSchema {
        self.push(ParamDescriptor {
            name: name.to_owned(),
            default: ParamValue::Float(default),
            kind: ParamKind::Range { min, max },
        });
        self
    }

    /// Adds a bounded integer parameter.
    pub fn with_int_range(mut self, name: &str, default: i64, min: i64, max: i64) -> ParamSchema {
        self.push(ParamDescriptor {
            name: name.to_owned(),
            default: ParamValue::Int(default),
            kind: ParamKind::Range {
                min: min as f64,
                max: max as f64,
            },
        });
        self
    }

    /// Adds a parameter with an enumerated value set.
    pub fn with_options(
        mut self,
        name: &str,
        default: ParamValue,
        options: Vec<ParamValue>,
    ) -> ParamSchema {
        assert!(options.contains(&default), "default not among options");
        self.push(ParamDescriptor {
            name: name.to_owned(),
            default,
            kind: ParamKind::Options { options },
        });
        self
    }

    /// Adds a random-seed parameter defaulting to null.
    pub fn with_seed(mut self, name: &str) -> ParamSchema {
        self.push(ParamDescriptor {
            name: name.to_owned(),
            default: ParamValue::Null,
            kind: ParamKind::Seed,
        });
        self
    }

    /// Looks a descriptor up by name.
    pub fn get(&self, name: &str) -> Option<&ParamDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    /// The descriptors in declaration order.
    pub fn descriptors(&self) -> &[ParamDescriptor] {
        &self.descriptors
    }

    /// Whether the schema declares no parameters.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// The default value of every parameter.
    pub fn defaults(&self) -> Params {
        self.descriptors
            .iter()
            .map(|d| (d.name.clone(), d.default.clone()))
            .collect()
    }

    /// Defaults overlaid with the supplied values.
    pub fn resolved(&self, overrides: Option<&Params>) -> Params {
        let mut params = self.defaults();
        if let Some(overrides) = overrides {
            for (name, value) in overrides {
                params.insert(name.clone(), value.clone());
            }
        }
        params
    }
}
