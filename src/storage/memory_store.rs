use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use crate::engine::types::*;
use crate::storage::{StateStore, check_version};

/// In-memory state store.
/// Holds flow state only for the lifetime of the store instance.
#[derive(Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<String, FlowState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, FlowState>>> {
        self.states
            .lock()
            .map_err(|_| anyhow::anyhow!("memory state store lock poisoned"))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, flow_id: &str) -> Result<Option<FlowState>> {
        Ok(self.lock()?.get(flow_id).cloned())
    }

    async fn save(&self, flow_id: &str, state: &FlowState) -> Result<()> {
        let mut states = self.lock()?;
        check_version(flow_id, states.get(flow_id).map(|s| s.version), state.version)?;
        states.insert(flow_id.to_string(), state.clone());
        Ok(())
    }

    async fn list(&self, query: &ListQuery) -> Result<FlowStateList> {
        let states: Vec<FlowState> = self.lock()?.values().cloned().collect();
        FlowStateList::paginate(states, query)
    }
}
