//! Error types shared by the pipeline core.
//!
//! Algorithm and metric libraries signal failures in three broad ways, and
//! the per-unit skip logic in the pipelines matches on exactly these
//! variants: numeric breakdowns during training or evaluation, missing
//! input files, and failed component resolution or construction.

use std::io;

use failure::Fail;

/// The three-way error taxonomy of the pipeline core.
#[derive(Debug, Fail)]
pub enum CoreError {
    /// A numeric or memory failure inside algorithm/metric code.
    #[fail(display = "numeric failure: {}", _0)]
    Numeric(String),
    /// A missing input file or other unavailable resource.
    #[fail(display = "resource not found: {}", _0)]
    Resource(String),
    /// A component that could not be resolved or constructed, or a broken
    /// invariant.
    #[fail(display = "logic failure: {}", _0)]
    Logic(String),
}

impl CoreError {
    /// Whether this error denotes a missing resource. Resource errors abort
    /// the smallest enclosing unit of work instead of being skipped.
    pub fn is_resource(&self) -> bool {
        match self {
            CoreError::Resource(_) => true,
            _ => false,
        }
    }
}

impl From<io::Error> for CoreError {
    fn from(error: io::Error) -> CoreError {
        CoreError::Resource(error.to_string())
    }
}

impl From<csv::Error> for CoreError {
    fn from(error: csv::Error) -> CoreError {
        if error.is_io_error() {
            CoreError::Resource(error.to_string())
        } else {
            CoreError::Logic(error.to_string())
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(error: serde_json::Error) -> CoreError {
        CoreError::Logic(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_resource() {
        let error = io::Error::new(io::ErrorKind::NotFound, "train_set.tsv");
        assert!(CoreError::from(error).is_resource());
    }

    #[test]
    fn json_errors_map_to_logic() {
        let error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(!CoreError::from(error).is_resource());
    }
}
