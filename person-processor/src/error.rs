use std::time;

use thiserror::Error;
use uuid::Uuid;

use crate::resolver::ResolveError;

/// Enumeration of errors returned by pre-transform and post-commit hooks.
#[derive(Error, Debug)]
pub enum HookError {
    #[error("hook {hook} failed: {message}")]
    Failed { hook: &'static str, message: String },
    #[error("hook {0} timed out")]
    Timeout(&'static str),
}

impl HookError {
    /// Label used on the hook failure counter.
    pub fn reason(&self) -> &'static str {
        match self {
            HookError::Failed { .. } => "error",
            HookError::Timeout(_) => "timeout",
        }
    }
}

/// Enumeration of errors that can occur as events are written to a sink.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to write event: {0}")]
    Io(#[from] std::io::Error),
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: String,
        #[source]
        error: sqlx::Error,
    },
}

impl SinkError {
    /// Serialization failures repeat deterministically, everything else may clear up.
    pub fn is_transient(&self) -> bool {
        !matches!(self, SinkError::Serialization(_))
    }
}

/// A failed attempt of a single pipeline step.
#[derive(Error, Debug)]
pub enum StepError {
    #[error("step timed out after {0:?}")]
    Timeout(time::Duration),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

impl StepError {
    pub fn is_transient(&self) -> bool {
        match self {
            StepError::Timeout(_) => true,
            StepError::Resolve(error) => error.is_transient(),
            StepError::Sink(error) => error.is_transient(),
        }
    }
}

/// Errors surfaced by the pipeline to its caller.
///
/// Step failures are never surfaced directly: they end in the overflow sink. Only a
/// failure to hand the event to the overflow sink reaches the worker.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to overflow event {uuid} after step {step} failed: {source}")]
    OverflowFailed {
        uuid: Uuid,
        step: &'static str,
        #[source]
        source: SinkError,
    },
}

/// Enumeration of errors related to submitting events to the `Worker`.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WorkerError {
    #[error("lane {0} is at capacity")]
    LaneFull(usize),
    #[error("worker is shutting down")]
    Closed,
}
