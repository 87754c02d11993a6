//! SQLite-backed state store.
//!
//! One row per run in `checkpoints` and one in `project_snapshots`. Payloads
//! are stored as JSON text; a few columns are duplicated out of the payload
//! so listing and filtering do not need to parse every row.

use std::str::FromStr;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::debug;

use crate::engine::types::{Checkpoint, FlowStatus, ProjectSnapshot};
use crate::storage::StateStore;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS checkpoints (
        run_key     TEXT PRIMARY KEY,
        flow_status TEXT NOT NULL,
        sequence    INTEGER NOT NULL,
        saved_at    TEXT NOT NULL,
        payload     TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS project_snapshots (
        run_key  TEXT PRIMARY KEY,
        saved_at TEXT NOT NULL,
        payload  TEXT NOT NULL
    )",
];

pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Open (creating if needed) the database at `database_url`, e.g.
    /// `sqlite://campaignflow.db` or `sqlite::memory:`.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL: {}", database_url))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);

        // A single connection serialises writers and keeps `sqlite::memory:` coherent.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database: {}", database_url))?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        debug!(url = %database_url, "SQLite state store ready");
        Ok(Self { pool })
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load_checkpoint(&self, run_key: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query("SELECT payload FROM checkpoints WHERE run_key = ?")
            .bind(run_key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| -> Result<Checkpoint> {
            let payload: String = r.try_get("payload")?;
            serde_json::from_str(&payload)
                .with_context(|| format!("Corrupt checkpoint for run '{}'", run_key))
        })
        .transpose()
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let payload = serde_json::to_string(checkpoint)?;
        sqlx::query(
            "INSERT INTO checkpoints (run_key, flow_status, sequence, saved_at, payload)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(run_key) DO UPDATE SET
                flow_status = excluded.flow_status,
                sequence = excluded.sequence,
                saved_at = excluded.saved_at,
                payload = excluded.payload",
        )
        .bind(&checkpoint.run_key)
        .bind(checkpoint.flow_status.to_string())
        .bind(checkpoint.sequence as i64)
        .bind(checkpoint.saved_at.to_rfc3339())
        .bind(payload)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save checkpoint for run '{}'", checkpoint.run_key))?;
        Ok(())
    }

    async fn save_snapshot(&self, snapshot: &ProjectSnapshot) -> Result<()> {
        let payload = serde_json::to_string(snapshot)?;
        sqlx::query(
            "INSERT INTO project_snapshots (run_key, saved_at, payload)
             VALUES (?, ?, ?)
             ON CONFLICT(run_key) DO UPDATE SET
                saved_at = excluded.saved_at,
                payload = excluded.payload",
        )
        .bind(&snapshot.run_key)
        .bind(snapshot.saved_at.to_rfc3339())
        .bind(payload)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save snapshot for run '{}'", snapshot.run_key))?;
        Ok(())
    }

    async fn load_snapshot(&self, run_key: &str) -> Result<Option<ProjectSnapshot>> {
        let row = sqlx::query("SELECT payload FROM project_snapshots WHERE run_key = ?")
            .bind(run_key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| -> Result<ProjectSnapshot> {
            let payload: String = r.try_get("payload")?;
            serde_json::from_str(&payload)
                .with_context(|| format!("Corrupt snapshot for run '{}'", run_key))
        })
        .transpose()
    }

    async fn list_checkpoints(&self, status: Option<FlowStatus>) -> Result<Vec<Checkpoint>> {
        let rows = match status {
            Some(s) => {
                sqlx::query(
                    "SELECT payload FROM checkpoints WHERE flow_status = ? ORDER BY run_key",
                )
                .bind(s.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT payload FROM checkpoints ORDER BY run_key")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter()
            .map(|r| -> Result<Checkpoint> {
                let payload: String = r.try_get("payload")?;
                Ok(serde_json::from_str(&payload)?)
            })
            .collect()
    }

    async fn delete_run(&self, run_key: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM checkpoints WHERE run_key = ?")
            .bind(run_key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM project_snapshots WHERE run_key = ?")
            .bind(run_key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
