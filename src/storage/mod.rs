pub mod json_store;
pub mod memory_store;
pub mod sql_store;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::engine::types::{FlowState, FlowStateList, ListQuery};

/// Trait for flow state persistence.
///
/// `save` must be atomic per flow id and must reject stale writes: a state
/// with `version = n` is accepted only when the stored version is `n - 1`
/// (or when nothing is stored and `n == 1`). Rejections are reported as a
/// [`VersionConflict`] error.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the state for a flow id, `None` if absent.
    async fn load(&self, flow_id: &str) -> Result<Option<FlowState>>;

    /// Persist the state for a flow id.
    async fn save(&self, flow_id: &str, state: &FlowState) -> Result<()>;

    /// List states matching a query, newest first.
    async fn list(&self, query: &ListQuery) -> Result<FlowStateList>;
}

/// A save lost an optimistic concurrency race.
#[derive(Debug, Error)]
#[error("version conflict for flow '{flow_id}': expected stored version {expected}, found {found:?}")]
pub struct VersionConflict {
    pub flow_id: String,
    pub expected: u64,
    pub found: Option<u64>,
}

/// Check an incoming save against the currently stored version.
pub(crate) fn check_version(flow_id: &str, stored: Option<u64>, incoming: u64) -> Result<()> {
    let expected = incoming.saturating_sub(1);
    let ok = match stored {
        Some(v) => incoming > 0 && v == expected,
        None => incoming == 1,
    };
    if ok {
        Ok(())
    } else {
        Err(VersionConflict {
            flow_id: flow_id.to_string(),
            expected,
            found: stored,
        }
        .into())
    }
}
