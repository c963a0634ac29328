//! # reclab
//!
//! `reclab` orchestrates recommender-system experiments: it loads rating
//! datasets, splits them into train/test sets, trains and tests batches of
//! prediction or recommendation models, and evaluates the results with
//! configurable metrics, optionally restricted to data subgroups.
//!
//! The crate is organised as a three-stage pipeline (data, model,
//! evaluation) composed by [`pipeline::experiment::ExperimentPipeline`].
//! Every swappable component (splitter, algorithm, metric, row filter,
//! rating converter) is registered in a [`factory::Factory`] and resolved
//! by name at run time, so external configuration and UI layers can
//! enumerate the valid choices together with their parameter schemas.
//!
//! Progress is reported through a synchronous [`events::EventDispatcher`];
//! cancellation is cooperative, via a polled
//! [`threading::CancellationToken`] checked between units of work.
//!
//! A typical run looks like:
//!
//! ```text
//! config -> DataPipeline -> DataTransition -> ModelPipeline -> model dirs
//!        -> EvaluationPipeline -> evaluations.json -> overview.json
//! ```

pub mod algorithms;
pub mod config;
pub mod converters;
pub mod data;
pub mod errors;
pub mod events;
pub mod factory;
pub mod filters;
pub mod metrics;
pub mod params;
pub mod pipeline;
pub mod splitters;
pub mod threading;

/// Alias for user identifiers.
pub type UserId = u64;
/// Alias for item identifiers.
pub type ItemId = u64;
/// Alias for interaction timestamps.
pub type Timestamp = i64;
/// Alias for rating values.
pub type Rating = f64;
