use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use crate::engine::types::*;
use crate::storage::{StateStore, check_version};

/// File-based JSON state store. Each flow is stored as a separate JSON file
/// named after its flow id.
pub struct JsonStateStore {
    base_dir: PathBuf,
    lock: RwLock<()>,
}

impl JsonStateStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            lock: RwLock::new(()),
        }
    }

    /// Ids that cannot name a file inside `base_dir`.
    fn is_storable(flow_id: &str) -> bool {
        !(flow_id.is_empty() || flow_id.contains(['/', '\\']) || flow_id.starts_with('.'))
    }

    fn state_path(&self, flow_id: &str) -> Result<PathBuf> {
        if !Self::is_storable(flow_id) {
            anyhow::bail!("Invalid flow id for file store: {:?}", flow_id);
        }
        Ok(self.base_dir.join(format!("{}.json", flow_id)))
    }

    async fn read_state(&self, flow_id: &str) -> Result<Option<FlowState>> {
        // Never written, so never stored.
        if !Self::is_storable(flow_id) {
            return Ok(None);
        }
        let path = self.state_path(flow_id)?;
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read state file: {}", path.display()));
            }
        };
        let state: FlowState = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse flow state: {}", flow_id))?;
        Ok(Some(state))
    }

    async fn write_state(&self, flow_id: &str, state: &FlowState) -> Result<()> {
        let path = self.state_path(flow_id)?;
        let tmp_path = path.with_extension("json.tmp");

        let data = serde_json::to_string_pretty(state)?;
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn load(&self, flow_id: &str) -> Result<Option<FlowState>> {
        let _lock = self.lock.read().await;
        self.read_state(flow_id).await
    }

    async fn save(&self, flow_id: &str, state: &FlowState) -> Result<()> {
        let _lock = self.lock.write().await;

        // Ensure the directory exists
        tokio::fs::create_dir_all(&self.base_dir).await?;

        let stored = self.read_state(flow_id).await?;
        check_version(flow_id, stored.map(|s| s.version), state.version)?;
        self.write_state(flow_id, state).await
    }

    async fn list(&self, query: &ListQuery) -> Result<FlowStateList> {
        let _lock = self.lock.read().await;

        if !self.base_dir.exists() {
            return Ok(FlowStateList::default());
        }

        let mut states = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<FlowState>(&data) {
                Ok(state) => states.push(state),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable state file"),
            }
        }

        FlowStateList::paginate(states, query)
    }
}
