//! Error types for durableflow.

use thiserror::Error;

use crate::engine::types::ErrorInfo;
use crate::storage::VersionConflict;

/// A `Result` alias with [`FlowError`] as the error type.
pub type FlowResult<T> = std::result::Result<T, FlowError>;

/// Errors surfaced by the flow engine and by the step primitives of
/// [`ExecutionContext`](crate::engine::context::ExecutionContext).
#[derive(Debug, Error)]
pub enum FlowError {
    /// Input, output, interrupt payload or action input did not match its schema.
    /// Never retried.
    #[error("validation failed for {target}: {}", errors.join("; "))]
    Validation { target: String, errors: Vec<String> },

    /// No persisted state exists for the flow id.
    #[error("flow '{flow_id}' not found")]
    NotFound { flow_id: String },

    /// A result was requested before the flow finished.
    #[error("flow '{flow_id}' is still running")]
    StillRunning { flow_id: String },

    /// `resume` was called on a flow that is not blocked on an interrupt.
    #[error("flow '{flow_id}' is not blocked (status: {status})")]
    NotBlocked { flow_id: String, status: String },

    /// The flow body failed. Carries the message and stacktrace captured by
    /// the process that ran it.
    #[error("flow execution failed: {message}")]
    Execution {
        message: String,
        stacktrace: Option<String>,
    },

    /// The flow's auth policy rejected the ambient auth context.
    #[error("unauthorized: {0}")]
    Authorization(String),

    /// A step suspended the run. This is a control signal consumed by the
    /// engine; flow bodies propagate it with `?`.
    #[error("flow interrupted at step '{step}'")]
    Interrupted { step: String },

    /// A memoized step failed, either now or in an earlier execution.
    #[error("{}", error.message)]
    Step { step: String, error: ErrorInfo },

    /// A `waitFor` poll budget was exhausted.
    #[error("step '{step}' timed out after {attempts} polls")]
    Timeout { step: String, attempts: u32 },

    /// Another execution saved the same flow first.
    #[error("flow '{flow_id}' was modified concurrently")]
    Conflict { flow_id: String },

    /// The operation needs a state store but this flow is not persisted.
    #[error("flow '{0}' is not durable in this environment")]
    NotDurable(String),

    #[error("unknown flow: {0}")]
    UnknownFlow(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("flow '{0}' is already registered")]
    DuplicateFlow(String),

    /// The invoker could not hand a scheduled run off.
    #[error("failed to dispatch scheduled run: {0:#}")]
    Dispatch(anyhow::Error),

    /// A remote engine answered with an error that has no local counterpart.
    #[error("remote error ({status}): {message}")]
    Remote { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The state store failed for a reason other than a version conflict.
    #[error("state store error: {0:#}")]
    Store(anyhow::Error),
}

impl FlowError {
    pub fn validation(target: impl Into<String>, errors: Vec<String>) -> Self {
        FlowError::Validation {
            target: target.into(),
            errors,
        }
    }

    pub fn not_found(flow_id: impl Into<String>) -> Self {
        FlowError::NotFound {
            flow_id: flow_id.into(),
        }
    }

    /// Whether this error is the engine's suspension signal rather than a failure.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, FlowError::Interrupted { .. })
    }

    /// Map a state store failure, recognising lost optimistic-concurrency races.
    pub(crate) fn from_store(flow_id: &str, err: anyhow::Error) -> Self {
        if err.downcast_ref::<VersionConflict>().is_some() {
            FlowError::Conflict {
                flow_id: flow_id.to_string(),
            }
        } else {
            FlowError::Store(err)
        }
    }

    /// Errors that abort a run instead of being recorded as a step outcome.
    pub(crate) fn aborts_run(&self) -> bool {
        matches!(
            self,
            FlowError::Interrupted { .. }
                | FlowError::Conflict { .. }
                | FlowError::Store(_)
                | FlowError::NotDurable(_)
        )
    }
}

/// Find the [`FlowError`] carried by an `anyhow::Error`, if any.
pub(crate) fn find_flow_error(err: &anyhow::Error) -> Option<&FlowError> {
    err.chain().find_map(|cause| cause.downcast_ref::<FlowError>())
}
