use anyhow::{Context as _, Result};
use async_trait::async_trait;
use sqlx::{AnyPool, Row};

use crate::engine::types::*;
use crate::storage::{StateStore, VersionConflict, check_version};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS flow_states (
    flow_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    version BIGINT NOT NULL,
    start_time TEXT NOT NULL,
    state TEXT NOT NULL
)";

/// SQL-backed state store. The full state is kept as a JSON document next
/// to the columns used for filtering and optimistic concurrency.
pub struct SqlStateStore {
    pool: AnyPool,
}

impl SqlStateStore {
    /// Connect to a database URL (e.g. `sqlite://flows.db?mode=rwc`) and
    /// create the table if needed.
    pub async fn connect(url: &str) -> Result<Self> {
        // Install any drivers that are compiled in
        sqlx::any::install_default_drivers();

        let pool = AnyPool::connect(url)
            .await
            .with_context(|| format!("Failed to connect to database '{}'", url))?;

        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: AnyPool) -> Result<Self> {
        sqlx::query(CREATE_TABLE)
            .execute(&pool)
            .await
            .context("Failed to create flow_states table")?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl StateStore for SqlStateStore {
    async fn load(&self, flow_id: &str) -> Result<Option<FlowState>> {
        let row = sqlx::query("SELECT state FROM flow_states WHERE flow_id = ?")
            .bind(flow_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let data: String = row.try_get("state")?;
                let state = serde_json::from_str(&data)
                    .with_context(|| format!("Failed to parse flow state: {}", flow_id))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, flow_id: &str, state: &FlowState) -> Result<()> {
        let data = serde_json::to_string(state)?;
        let version = i64::try_from(state.version)?;

        if state.version <= 1 {
            check_version(flow_id, None, state.version)?;
            let inserted = sqlx::query(
                "INSERT INTO flow_states (flow_id, name, status, version, start_time, state) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(flow_id)
            .bind(state.name.as_str())
            .bind(state.status.to_string())
            .bind(version)
            .bind(state.start_time.to_rfc3339())
            .bind(data)
            .execute(&self.pool)
            .await;

            return match inserted {
                Ok(_) => Ok(()),
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                    Err(VersionConflict {
                        flow_id: flow_id.to_string(),
                        expected: 0,
                        found: None,
                    }
                    .into())
                }
                Err(e) => Err(e.into()),
            };
        }

        let updated = sqlx::query(
            "UPDATE flow_states SET status = ?, version = ?, state = ? WHERE flow_id = ? AND version = ?",
        )
        .bind(state.status.to_string())
        .bind(version)
        .bind(data)
        .bind(flow_id)
        .bind(version - 1)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            let found = sqlx::query("SELECT version FROM flow_states WHERE flow_id = ?")
                .bind(flow_id)
                .fetch_optional(&self.pool)
                .await?
                .map(|row| row.try_get::<i64, _>("version"))
                .transpose()?
                .map(|v| v as u64);
            return Err(VersionConflict {
                flow_id: flow_id.to_string(),
                expected: state.version - 1,
                found,
            }
            .into());
        }

        Ok(())
    }

    async fn list(&self, query: &ListQuery) -> Result<FlowStateList> {
        let rows = sqlx::query("SELECT state FROM flow_states")
            .fetch_all(&self.pool)
            .await?;

        let mut states = Vec::with_capacity(rows.len());
        for row in rows {
            let data: String = row.try_get("state")?;
            states.push(serde_json::from_str::<FlowState>(&data)?);
        }

        FlowStateList::paginate(states, query)
    }
}
