//! Strategies deciding where and when scheduled runs execute.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error};

use crate::engine::executor::FlowEngine;

/// Why a run was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledKind {
    /// First execution of a flow created by `schedule_flow`.
    Start,
    /// Timer-driven re-invocation of a flow blocked on `sleep` or `wait_for`.
    Wake,
}

/// A unit of deferred work handed to an [`Invoker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledRun {
    pub flow_id: String,
    pub flow_name: String,
    pub kind: ScheduledKind,
    pub delay: Duration,
}

/// Decides how scheduled runs are executed.
///
/// Implementations either execute the run themselves (on a timer) or hand it
/// to an external dispatcher that later calls
/// [`FlowEngine::run_scheduled`].
pub trait Invoker: Send + Sync {
    fn dispatch(&self, engine: FlowEngine, run: ScheduledRun) -> Result<()>;
}

/// Default invoker: runs the job on the tokio runtime after its delay.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioInvoker;

impl Invoker for TokioInvoker {
    fn dispatch(&self, engine: FlowEngine, run: ScheduledRun) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| anyhow::anyhow!("TokioInvoker requires a tokio runtime: {}", e))?;

        handle.spawn(async move {
            if !run.delay.is_zero() {
                tokio::time::sleep(run.delay).await;
            }
            debug!(flow_id = %run.flow_id, kind = ?run.kind, "Running scheduled flow");
            if let Err(e) = engine.run_scheduled(&run).await {
                error!(flow_id = %run.flow_id, error = %e, "Scheduled run failed");
            }
        });
        Ok(())
    }
}

/// Invoker that only records jobs, for an external dispatcher (or a test)
/// to drain and execute.
#[derive(Debug, Default)]
pub struct QueueInvoker {
    queue: Mutex<Vec<ScheduledRun>>,
}

impl QueueInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every queued job, oldest first.
    pub fn drain(&self) -> Vec<ScheduledRun> {
        match self.queue.lock() {
            Ok(mut queue) => std::mem::take(&mut *queue),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Invoker for QueueInvoker {
    fn dispatch(&self, _engine: FlowEngine, run: ScheduledRun) -> Result<()> {
        self.queue
            .lock()
            .map_err(|_| anyhow::anyhow!("invoker queue lock poisoned"))?
            .push(run);
        Ok(())
    }
}
