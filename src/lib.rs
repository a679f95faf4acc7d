//! Durable, resumable flow execution.
//!
//! A flow is an async body built from memoized steps. Step outcomes are
//! persisted as they resolve, so a run that blocks on an interrupt, a timer
//! or another flow can be resumed later (even in another process) and
//! replays its finished steps instead of re-running them.

pub mod actions;
pub mod api;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod schema;
pub mod storage;

pub use engine::types::{FlowState, FlowStatus, Operation, OperationResult};
pub use engine::{ExecutionContext, FlowDefinition, FlowEngine, Registry, RunOptions, StepConfig};
pub use error::{FlowError, FlowResult};
