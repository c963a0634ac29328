//! Synchronous event dispatching for pipeline progress reporting.
//!
//! Dispatching is a direct function call in registration order, used for
//! observability only: no pipeline correctness depends on listener side
//! effects. Every `End*` event carries the elapsed time of the step it
//! closes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::error;

use crate::errors::CoreError;

/// Identifiers for every event the pipelines emit.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum EventId {
    /// Start of a data pipeline run.
    BeginDataPipeline,
    /// End of a data pipeline run.
    EndDataPipeline,
    /// Start of loading a dataset matrix.
    BeginLoadDataset,
    /// End of loading a dataset matrix.
    EndLoadDataset,
    /// Start of the row-filtering step.
    BeginFilterRows,
    /// End of the row-filtering step.
    EndFilterRows,
    /// Start of the rating-conversion step.
    BeginConvertRatings,
    /// End of the rating-conversion step.
    EndConvertRatings,
    /// Start of the train/test split.
    BeginSplit,
    /// End of the train/test split.
    EndSplit,
    /// Start of persisting the train/test sets.
    BeginSaveSets,
    /// End of persisting the train/test sets.
    EndSaveSets,
    /// Start of a model pipeline run.
    BeginModelPipeline,
    /// End of a model pipeline run.
    EndModelPipeline,
    /// Start of loading the shared train set.
    BeginLoadTrainSet,
    /// End of loading the shared train set.
    EndLoadTrainSet,
    /// Start of loading the shared test set.
    BeginLoadTestSet,
    /// End of loading the shared test set.
    EndLoadTestSet,
    /// Start of one model's train+test unit.
    BeginModel,
    /// End of one model's train+test unit.
    EndModel,
    /// Start of training one model.
    BeginTrainModel,
    /// End of training one model.
    EndTrainModel,
    /// Start of batch-testing one model.
    BeginTestModel,
    /// End of batch-testing one model.
    EndTestModel,
    /// Start of merging original ratings into model output files.
    BeginReconstructRatings,
    /// End of merging original ratings into model output files.
    EndReconstructRatings,
    /// Start of an evaluation pipeline run.
    BeginEvalPipeline,
    /// End of an evaluation pipeline run.
    EndEvalPipeline,
    /// Start of one metric's evaluation unit.
    BeginMetric,
    /// End of one metric's evaluation unit.
    EndMetric,
    /// Start of loading the evaluation sets a metric requires.
    BeginLoadEvalSets,
    /// End of loading the evaluation sets a metric requires.
    EndLoadEvalSets,
    /// Start of subgroup-filtering the loaded evaluation sets.
    BeginFilterEvalSets,
    /// End of subgroup-filtering the loaded evaluation sets.
    EndFilterEvalSets,
    /// An error reported by a pipeline; the failed unit is skipped.
    Failure,
}

/// The payload delivered to listeners.
#[derive(Clone, Debug)]
pub struct PipelineEvent {
    /// The event kind.
    pub id: EventId,
    /// A human-readable description of the unit of work.
    pub detail: String,
    /// Elapsed time, present on `End*` events.
    pub elapsed: Option<Duration>,
}

impl PipelineEvent {
    /// Creates a begin event.
    pub fn begin(id: EventId, detail: &str) -> PipelineEvent {
        PipelineEvent {
            id,
            detail: detail.to_owned(),
            elapsed: None,
        }
    }

    /// Creates an end event carrying the elapsed time of the step.
    pub fn end(id: EventId, detail: &str, elapsed: Duration) -> PipelineEvent {
        PipelineEvent {
            id,
            detail: detail.to_owned(),
            elapsed: Some(elapsed),
        }
    }

    /// Creates a failure event.
    pub fn failure(detail: &str) -> PipelineEvent {
        PipelineEvent {
            id: EventId::Failure,
            detail: detail.to_owned(),
            elapsed: None,
        }
    }
}

/// A callback invoked with the listener name and the event payload.
pub type EventCallback = Arc<dyn Fn(&str, &PipelineEvent) + Send + Sync>;

/// The (internal, optional external) callbacks of one registration.
#[derive(Clone)]
pub struct CallbackPair {
    /// Always invoked first.
    pub internal: EventCallback,
    /// Invoked after the internal callback when present.
    pub external: Option<EventCallback>,
}

impl CallbackPair {
    /// A pair with only an internal callback.
    pub fn internal_only(callback: EventCallback) -> CallbackPair {
        CallbackPair {
            internal: callback,
            external: None,
        }
    }
}

/// Registry mapping event kinds to ordered listener callbacks.
#[derive(Default)]
pub struct EventDispatcher {
    listeners: HashMap<EventId, Vec<(String, CallbackPair)>>,
}

impl EventDispatcher {
    /// Creates an empty dispatcher.
    pub fn new() -> EventDispatcher {
        EventDispatcher {
            listeners: HashMap::new(),
        }
    }

    /// Registers a callback pair for an event kind. Listener names must be
    /// unique per event kind.
    pub fn add_listener(
        &mut self,
        id: EventId,
        listener: &str,
        callbacks: CallbackPair,
    ) -> Result<(), CoreError> {
        let registrations = self.listeners.entry(id).or_insert_with(Vec::new);
        if registrations.iter().any(|(name, _)| name == listener) {
            return Err(CoreError::Logic(format!(
                "listener '{}' is already registered for {:?}",
                listener, id
            )));
        }

        registrations.push((listener.to_owned(), callbacks));
        Ok(())
    }

    /// Removes a previously registered listener.
    pub fn remove_listener(&mut self, id: EventId, listener: &str) -> Result<(), CoreError> {
        let registrations = self.listeners.get_mut(&id).ok_or_else(|| {
            CoreError::Logic(format!("no listeners registered for {:?}", id))
        })?;

        let position = registrations
            .iter()
            .position(|(name, _)| name == listener)
            .ok_or_else(|| {
                CoreError::Logic(format!(
                    "listener '{}' is not registered for {:?}",
                    listener, id
                ))
            })?;

        registrations.remove(position);
        Ok(())
    }

    /// Synchronously invokes every registered callback for the event's
    /// kind, in registration order. Returns whether any listener existed.
    pub fn dispatch(&self, event: &PipelineEvent) -> bool {
        let registrations = match self.listeners.get(&event.id) {
            Some(registrations) if !registrations.is_empty() => registrations,
            _ => return false,
        };

        for (listener, callbacks) in registrations {
            (callbacks.internal)(listener, event);
            if let Some(external) = &callbacks.external {
                external(listener, event);
            }
        }

        true
    }

    /// Logs and dispatches a failure event.
    pub fn report_failure(&self, detail: &str) {
        error!("{}", detail);
        self.dispatch(&PipelineEvent::failure(detail));
    }
}

/// Runs `step` between a begin and an end event; the end event carries the
/// measured elapsed time and is only dispatched when the step succeeds.
pub fn timed<T>(
    dispatcher: &EventDispatcher,
    begin: EventId,
    end: EventId,
    detail: &str,
    step: impl FnOnce() -> Result<T, CoreError>,
) -> Result<T, CoreError> {
    dispatcher.dispatch(&PipelineEvent::begin(begin, detail));
    let start = Instant::now();

    let result = step();
    if result.is_ok() {
        dispatcher.dispatch(&PipelineEvent::end(end, detail, start.elapsed()));
    }

    result
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn recording_callback(log: Arc<Mutex<Vec<String>>>, tag: &str) -> EventCallback {
        let tag = tag.to_owned();
        Arc::new(move |listener, event| {
            log.lock()
                .unwrap()
                .push(format!("{}:{}:{:?}", tag, listener, event.id));
        })
    }

    #[test]
    fn dispatch_runs_internal_then_external_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new();

        dispatcher
            .add_listener(
                EventId::BeginSplit,
                "first",
                CallbackPair {
                    internal: recording_callback(log.clone(), "int"),
                    external: Some(recording_callback(log.clone(), "ext")),
                },
            )
            .unwrap();
        dispatcher
            .add_listener(
                EventId::BeginSplit,
                "second",
                CallbackPair::internal_only(recording_callback(log.clone(), "int")),
            )
            .unwrap();

        assert!(dispatcher.dispatch(&PipelineEvent::begin(EventId::BeginSplit, "split")));

        let entries = log.lock().unwrap();
        assert_eq!(
            *entries,
            vec![
                "int:first:BeginSplit".to_owned(),
                "ext:first:BeginSplit".to_owned(),
                "int:second:BeginSplit".to_owned(),
            ]
        );
    }

    #[test]
    fn dispatch_without_listeners_returns_false() {
        let dispatcher = EventDispatcher::new();
        assert!(!dispatcher.dispatch(&PipelineEvent::failure("nobody listens")));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new();

        let pair = CallbackPair::internal_only(recording_callback(log.clone(), "int"));
        dispatcher
            .add_listener(EventId::Failure, "console", pair.clone())
            .unwrap();
        assert!(dispatcher
            .add_listener(EventId::Failure, "console", pair)
            .is_err());
    }

    #[test]
    fn removing_unknown_listener_fails() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new();

        assert!(dispatcher.remove_listener(EventId::Failure, "console").is_err());

        dispatcher
            .add_listener(
                EventId::Failure,
                "console",
                CallbackPair::internal_only(recording_callback(log.clone(), "int")),
            )
            .unwrap();
        assert!(dispatcher.remove_listener(EventId::Failure, "file").is_err());
        dispatcher.remove_listener(EventId::Failure, "console").unwrap();

        assert!(!dispatcher.dispatch(&PipelineEvent::failure("gone")));
    }

    #[test]
    fn timed_attaches_elapsed_to_end_events() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let elapsed_seen = Arc::new(Mutex::new(None));
        let mut dispatcher = EventDispatcher::new();

        let elapsed = elapsed_seen.clone();
        dispatcher
            .add_listener(
                EventId::EndSplit,
                "timer",
                CallbackPair::internal_only(Arc::new(move |_, event| {
                    *elapsed.lock().unwrap() = event.elapsed;
                })),
            )
            .unwrap();
        dispatcher
            .add_listener(
                EventId::BeginSplit,
                "timer",
                CallbackPair::internal_only(recording_callback(log.clone(), "int")),
            )
            .unwrap();

        let value = timed(&dispatcher, EventId::BeginSplit, EventId::EndSplit, "split", || {
            Ok(21)
        })
        .unwrap();

        assert_eq!(value, 21);
        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(elapsed_seen.lock().unwrap().is_some());
    }

    #[test]
    fn timed_suppresses_the_end_event_on_failure() {
        let elapsed_seen = Arc::new(Mutex::new(None));
        let mut dispatcher = EventDispatcher::new();

        let elapsed = elapsed_seen.clone();
        dispatcher
            .add_listener(
                EventId::EndSplit,
                "timer",
                CallbackPair::internal_only(Arc::new(move |_, event| {
                    *elapsed.lock().unwrap() = event.elapsed;
                })),
            )
            .unwrap();

        let result: Result<(), CoreError> =
            timed(&dispatcher, EventId::BeginSplit, EventId::EndSplit, "split", || {
                Err(CoreError::Logic("splitter exploded".to_owned()))
            });

        assert!(result.is_err());
        assert!(elapsed_seen.lock().unwrap().is_none());
    }
}
