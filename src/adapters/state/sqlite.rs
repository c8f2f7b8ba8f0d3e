//! SQLite state backend.
//!
//! Three tables: `states` holds one row per resource, `state_history`
//! and `snapshots` are append-only with autoincrement ids. Enum states
//! are stored by name, mappings and metadata as JSON columns. The pool
//! validates connections on checkout and runs with WAL journaling and
//! foreign keys on.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::state::{
    InterfaceState, ResourceState, ResourceType, StateEntry, StateSnapshot, StateValue,
};
use crate::domain::ports::state_backend::StateBackend;

const HISTORY_CAP: i64 = 1_000;
const SNAPSHOT_CAP: i64 = 10;
const VACUUM_THRESHOLD_BYTES: i64 = 10 * 1024 * 1024;

/// SQLite-backed persistence.
pub struct SqliteStateBackend {
    pool: SqlitePool,
}

impl SqliteStateBackend {
    pub async fn new(db_path: impl AsRef<Path>) -> DomainResult<Self> {
        let url = format!("sqlite:{}", db_path.as_ref().display());
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| DomainError::Storage(format!("invalid database path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .test_before_acquire(true)
            .connect_with(options)
            .await?;

        let backend = Self { pool };
        backend.init_schema().await?;
        Ok(backend)
    }

    async fn init_schema(&self) -> DomainResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS states (
                resource_id TEXT PRIMARY KEY,
                state_kind TEXT NOT NULL,
                state_value TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                metadata TEXT NOT NULL,
                version INTEGER NOT NULL,
                previous_state TEXT,
                transition_reason TEXT,
                failure_info TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS state_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                resource_id TEXT NOT NULL,
                state_kind TEXT NOT NULL,
                state_value TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                metadata TEXT NOT NULL,
                version INTEGER NOT NULL,
                previous_state TEXT,
                transition_reason TEXT,
                failure_info TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                resource_id TEXT NOT NULL,
                state TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                metadata TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                version INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_history_resource_id
             ON state_history(resource_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_snapshots_resource_id
             ON snapshots(resource_id)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn encode_state(state: &StateValue) -> DomainResult<(&'static str, String)> {
        Ok(match state {
            StateValue::Resource(s) => ("ResourceState", s.as_str().to_string()),
            StateValue::Interface(s) => ("InterfaceState", s.as_str().to_string()),
            StateValue::Mapping(v) => ("Mapping", serde_json::to_string(v)?),
        })
    }

    fn decode_state(kind: &str, value: &str) -> DomainResult<StateValue> {
        match kind {
            "ResourceState" => {
                let state: ResourceState = serde_json::from_value(json!(value))?;
                Ok(StateValue::Resource(state))
            }
            "InterfaceState" => {
                let state: InterfaceState = serde_json::from_value(json!(value))?;
                Ok(StateValue::Interface(state))
            }
            "Mapping" => Ok(StateValue::Mapping(serde_json::from_str(value)?)),
            other => Err(DomainError::Serialization(format!(
                "unknown state kind: {other}"
            ))),
        }
    }

    fn decode_resource_type(name: &str) -> DomainResult<ResourceType> {
        serde_json::from_value(json!(name)).map_err(Into::into)
    }

    fn decode_timestamp(raw: &str) -> DomainResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| DomainError::Serialization(format!("bad timestamp {raw}: {e}")))
    }

    fn row_to_entry(row: &SqliteRow) -> DomainResult<StateEntry> {
        let state_kind: String = row.try_get("state_kind")?;
        let state_value: String = row.try_get("state_value")?;
        let resource_type: String = row.try_get("resource_type")?;
        let timestamp: String = row.try_get("timestamp")?;
        let metadata: String = row.try_get("metadata")?;
        let version: i64 = row.try_get("version")?;
        let previous_state: Option<String> = row.try_get("previous_state")?;
        let transition_reason: Option<String> = row.try_get("transition_reason")?;
        let failure_info: Option<String> = row.try_get("failure_info")?;

        Ok(StateEntry {
            state: Self::decode_state(&state_kind, &state_value)?,
            resource_type: Self::decode_resource_type(&resource_type)?,
            timestamp: Self::decode_timestamp(&timestamp)?,
            metadata: serde_json::from_str(&metadata)?,
            version: version as u64,
            previous_state,
            transition_reason,
            failure_info: failure_info
                .map(|raw| serde_json::from_str(&raw))
                .transpose()?,
        })
    }

    fn row_to_snapshot(row: &SqliteRow) -> DomainResult<StateSnapshot> {
        let state: String = row.try_get("state")?;
        let timestamp: String = row.try_get("timestamp")?;
        let metadata: String = row.try_get("metadata")?;
        let resource_type: String = row.try_get("resource_type")?;
        let version: i64 = row.try_get("version")?;
        Ok(StateSnapshot {
            state: serde_json::from_str(&state)?,
            timestamp: Self::decode_timestamp(&timestamp)?,
            metadata: serde_json::from_str(&metadata)?,
            resource_type: Self::decode_resource_type(&resource_type)?,
            version: version as u64,
        })
    }

    /// VACUUM plus ANALYZE. Expensive; intended for maintenance windows.
    pub async fn optimize_database(&self) -> DomainResult<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        sqlx::query("ANALYZE").execute(&self.pool).await?;
        tracing::info!("database optimization completed");
        Ok(())
    }

    /// Row counts, file size, and a per-state histogram.
    pub async fn get_database_stats(&self) -> DomainResult<HashMap<String, Value>> {
        let mut stats = HashMap::new();

        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await?;
        stats.insert(
            "database_size_bytes".to_string(),
            json!(page_count * page_size),
        );

        let resources: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM states")
            .fetch_one(&self.pool)
            .await?;
        stats.insert("resources_count".to_string(), json!(resources));

        let history: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM state_history")
            .fetch_one(&self.pool)
            .await?;
        stats.insert("history_entries_count".to_string(), json!(history));

        let snapshots: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM snapshots")
            .fetch_one(&self.pool)
            .await?;
        stats.insert("snapshots_count".to_string(), json!(snapshots));

        let rows = sqlx::query(
            "SELECT state_kind, state_value, COUNT(*) as count
             FROM states GROUP BY state_kind, state_value",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut histogram = serde_json::Map::new();
        for row in rows {
            let kind: String = row.try_get("state_kind")?;
            let value: String = row.try_get("state_value")?;
            let count: i64 = row.try_get("count")?;
            histogram.insert(format!("{kind}:{value}"), json!(count));
        }
        stats.insert("resource_states".to_string(), Value::Object(histogram));

        Ok(stats)
    }
}

#[async_trait]
impl StateBackend for SqliteStateBackend {
    async fn save_state(&self, resource_id: &str, entry: &StateEntry) -> DomainResult<()> {
        let (state_kind, state_value) = Self::encode_state(&entry.state)?;
        let resource_type = entry.resource_type.to_string();
        let timestamp = entry.timestamp.to_rfc3339();
        let metadata = serde_json::to_string(&entry.metadata)?;
        let failure_info = entry
            .failure_info
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT OR REPLACE INTO states
             (resource_id, state_kind, state_value, resource_type, timestamp,
              metadata, version, previous_state, transition_reason, failure_info)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(resource_id)
        .bind(state_kind)
        .bind(&state_value)
        .bind(&resource_type)
        .bind(&timestamp)
        .bind(&metadata)
        .bind(entry.version as i64)
        .bind(&entry.previous_state)
        .bind(&entry.transition_reason)
        .bind(&failure_info)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO state_history
             (resource_id, state_kind, state_value, resource_type, timestamp,
              metadata, version, previous_state, transition_reason, failure_info)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(resource_id)
        .bind(state_kind)
        .bind(&state_value)
        .bind(&resource_type)
        .bind(&timestamp)
        .bind(&metadata)
        .bind(entry.version as i64)
        .bind(&entry.previous_state)
        .bind(&entry.transition_reason)
        .bind(&failure_info)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn save_snapshot(&self, resource_id: &str, snapshot: &StateSnapshot) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO snapshots
             (resource_id, state, timestamp, metadata, resource_type, version)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(resource_id)
        .bind(serde_json::to_string(&snapshot.state)?)
        .bind(snapshot.timestamp.to_rfc3339())
        .bind(serde_json::to_string(&snapshot.metadata)?)
        .bind(snapshot.resource_type.to_string())
        .bind(snapshot.version as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_state(&self, resource_id: &str) -> DomainResult<Option<StateEntry>> {
        let row = sqlx::query("SELECT * FROM states WHERE resource_id = ?")
            .bind(resource_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| Self::row_to_entry(&row)).transpose()
    }

    async fn load_history(
        &self,
        resource_id: &str,
        limit: Option<usize>,
    ) -> DomainResult<Vec<StateEntry>> {
        let rows = match limit {
            Some(limit) => {
                let mut rows = sqlx::query(
                    "SELECT * FROM state_history WHERE resource_id = ?
                     ORDER BY id DESC LIMIT ?",
                )
                .bind(resource_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?;
                rows.reverse();
                rows
            }
            None => {
                sqlx::query(
                    "SELECT * FROM state_history WHERE resource_id = ? ORDER BY id",
                )
                .bind(resource_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn load_snapshots(
        &self,
        resource_id: &str,
        limit: Option<usize>,
    ) -> DomainResult<Vec<StateSnapshot>> {
        let rows = match limit {
            Some(limit) => {
                let mut rows = sqlx::query(
                    "SELECT * FROM snapshots WHERE resource_id = ?
                     ORDER BY id DESC LIMIT ?",
                )
                .bind(resource_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?;
                rows.reverse();
                rows
            }
            None => {
                sqlx::query("SELECT * FROM snapshots WHERE resource_id = ? ORDER BY id")
                    .bind(resource_id)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(Self::row_to_snapshot).collect()
    }

    async fn get_all_resource_ids(&self) -> DomainResult<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT resource_id FROM states")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("resource_id").map_err(Into::into))
            .collect()
    }

    async fn cleanup(&self, older_than: Option<DateTime<Utc>>) -> DomainResult<u64> {
        let cutoff = older_than
            .unwrap_or_else(|| Utc::now() - chrono::Duration::days(30))
            .to_rfc3339();
        let mut removed: u64 = 0;

        // 1. Terminated and expired resources lose all their rows.
        let terminated: Vec<String> = sqlx::query(
            "SELECT resource_id FROM states
             WHERE state_kind = 'ResourceState'
               AND state_value = 'TERMINATED'
               AND timestamp < ?",
        )
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| row.try_get::<String, _>("resource_id"))
        .collect::<Result<_, _>>()?;

        for resource_id in &terminated {
            sqlx::query("DELETE FROM states WHERE resource_id = ?")
                .bind(resource_id)
                .execute(&self.pool)
                .await?;
            sqlx::query("DELETE FROM state_history WHERE resource_id = ?")
                .bind(resource_id)
                .execute(&self.pool)
                .await?;
            sqlx::query("DELETE FROM snapshots WHERE resource_id = ?")
                .bind(resource_id)
                .execute(&self.pool)
                .await?;
            removed += 1;
            tracing::info!("cleaned up terminated resource: {resource_id}");
        }

        // 2. Cap history and snapshots per remaining resource.
        for resource_id in self.get_all_resource_ids().await? {
            let trimmed = sqlx::query(
                "DELETE FROM state_history WHERE resource_id = ? AND id NOT IN (
                     SELECT id FROM state_history WHERE resource_id = ?
                     ORDER BY id DESC LIMIT ?
                 )",
            )
            .bind(&resource_id)
            .bind(&resource_id)
            .bind(HISTORY_CAP)
            .execute(&self.pool)
            .await?
            .rows_affected();
            if trimmed > 0 {
                removed += trimmed;
                tracing::info!(resource_id, trimmed, "trimmed history rows");
            }

            let trimmed = sqlx::query(
                "DELETE FROM snapshots WHERE resource_id = ? AND id NOT IN (
                     SELECT id FROM snapshots WHERE resource_id = ?
                     ORDER BY id DESC LIMIT ?
                 )",
            )
            .bind(&resource_id)
            .bind(&resource_id)
            .bind(SNAPSHOT_CAP)
            .execute(&self.pool)
            .await?
            .rows_affected();
            if trimmed > 0 {
                removed += trimmed;
                tracing::info!(resource_id, trimmed, "trimmed snapshot rows");
            }
        }

        // 3. Reclaim space once the file outgrows the threshold and
        //    auto-vacuum is off.
        let auto_vacuum: i64 = sqlx::query_scalar("PRAGMA auto_vacuum")
            .fetch_one(&self.pool)
            .await?;
        if auto_vacuum == 0 {
            let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
                .fetch_one(&self.pool)
                .await?;
            let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
                .fetch_one(&self.pool)
                .await?;
            if page_count * page_size > VACUUM_THRESHOLD_BYTES {
                sqlx::query("VACUUM").execute(&self.pool).await?;
                tracing::info!("vacuumed sqlite database to reclaim space");
            }
        }

        Ok(removed)
    }

    async fn delete_state(&self, resource_id: &str) -> DomainResult<bool> {
        let existed = sqlx::query("DELETE FROM states WHERE resource_id = ?")
            .bind(resource_id)
            .execute(&self.pool)
            .await?
            .rows_affected()
            > 0;
        sqlx::query("DELETE FROM state_history WHERE resource_id = ?")
            .bind(resource_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM snapshots WHERE resource_id = ?")
            .bind(resource_id)
            .execute(&self.pool)
            .await?;
        Ok(existed)
    }

    async fn clear_all_states(&self) -> DomainResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM states")
            .fetch_one(&self.pool)
            .await?;
        sqlx::query("DELETE FROM states").execute(&self.pool).await?;
        sqlx::query("DELETE FROM state_history")
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM snapshots")
            .execute(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn compact(&self) -> DomainResult<HashMap<String, u64>> {
        self.optimize_database().await?;
        let mut results = HashMap::new();
        results.insert("database_optimized".to_string(), 1);
        Ok(results)
    }

    async fn stats(&self) -> DomainResult<HashMap<String, Value>> {
        self.get_database_stats().await
    }
}
