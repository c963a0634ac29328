//! Cooperative cancellation and the background experiment worker.
//!
//! Cancellation is polling-based: pipelines check the token between units
//! of work (datasets, models, metrics, test batches), so a long-running
//! training call cannot be interrupted mid-flight.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::info;

use crate::config::ExperimentConfig;
use crate::errors::CoreError;
use crate::pipeline::experiment::{ExperimentOverview, ExperimentPipeline};

/// Shared flag polled by the pipelines between units of work.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    running: Arc<AtomicBool>,
}

impl CancellationToken {
    /// A token in the running state.
    pub fn new() -> CancellationToken {
        CancellationToken {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// An already-cancelled token.
    pub fn cancelled() -> CancellationToken {
        let token = CancellationToken::new();
        token.cancel();
        token
    }

    /// Whether work may continue.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Requests cooperative cancellation.
    pub fn cancel(&self) {
        self.running.store(false, Ordering::Release);
    }
}

impl Default for CancellationToken {
    fn default() -> CancellationToken {
        CancellationToken::new()
    }
}

/// Runs an experiment pipeline (possibly repeated) on a worker thread so
/// the caller is not blocked. Listeners must be registered on the
/// pipeline's dispatcher before spawning.
pub struct ThreadExperiment {
    handle: JoinHandle<Result<Vec<ExperimentOverview>, CoreError>>,
    token: CancellationToken,
}

impl ThreadExperiment {
    /// Spawns `num_runs` repetitions of the experiment, each writing into
    /// its own `run_<i>` subdirectory of `output_dir`.
    pub fn spawn(
        pipeline: ExperimentPipeline,
        output_dir: PathBuf,
        config: ExperimentConfig,
        num_runs: usize,
    ) -> ThreadExperiment {
        let token = CancellationToken::new();
        let worker_token = token.clone();

        let handle = thread::spawn(move || {
            let mut overviews = Vec::with_capacity(num_runs);
            for run in 0..num_runs {
                if !worker_token.is_running() {
                    info!("experiment '{}' cancelled before run {}", config.name, run);
                    break;
                }

                let run_dir = output_dir.join(format!("run_{}", run));
                let overview = pipeline.run(&run_dir, &config, &worker_token)?;
                overviews.push(overview);
            }
            Ok(overviews)
        });

        ThreadExperiment { handle, token }
    }

    /// A clone of the worker's cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Requests cooperative cancellation; the worker stops at the next
    /// unit-of-work boundary.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Waits for the worker and returns the overview of every completed
    /// run.
    pub fn join(self) -> Result<Vec<ExperimentOverview>, CoreError> {
        self.handle
            .join()
            .map_err(|_| CoreError::Logic("experiment worker panicked".to_owned()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_start_running_and_stay_cancelled() {
        let token = CancellationToken::new();
        assert!(token.is_running());

        let observer = token.clone();
        token.cancel();
        assert!(!observer.is_running());

        assert!(!CancellationToken::cancelled().is_running());
    }
}
