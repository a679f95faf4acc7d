pub mod context;
pub mod executor;
pub mod flow;
pub mod registry;
pub mod scheduler;
pub mod streaming;
pub mod types;

pub use context::ExecutionContext;
pub use executor::FlowEngine;
pub use flow::{FlowDefinition, PollingConfig, RetryConfig, RunOptions, StepConfig, WaitOptions};
pub use registry::Registry;
pub use scheduler::{Invoker, QueueInvoker, ScheduledKind, ScheduledRun, TokioInvoker};
pub use streaming::FlowStream;
