pub mod json_store;
pub mod memory_store;
pub mod sqlite_store;

use anyhow::{Result, bail};
use async_trait::async_trait;

use crate::engine::types::{Checkpoint, FlowStatus, ProjectSnapshot};

pub use json_store::JsonStateStore;
pub use memory_store::MemoryStateStore;
pub use sqlite_store::SqliteStateStore;

/// Durable home of checkpoints and project snapshots.
///
/// `save_checkpoint` must replace the previous checkpoint of the run
/// atomically: a concurrent or later `load_checkpoint` sees either the old or
/// the new value, never a mix.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Latest checkpoint of a run, or `None` if the run was never persisted.
    async fn load_checkpoint(&self, run_key: &str) -> Result<Option<Checkpoint>>;

    /// Replace the run's checkpoint.
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Write the long-term project record.
    async fn save_snapshot(&self, snapshot: &ProjectSnapshot) -> Result<()>;

    async fn load_snapshot(&self, run_key: &str) -> Result<Option<ProjectSnapshot>>;

    /// Latest checkpoints of all runs, optionally filtered by status,
    /// sorted by run key.
    async fn list_checkpoints(&self, status: Option<FlowStatus>) -> Result<Vec<Checkpoint>>;

    /// Remove every record of a run. Deleting an unknown run is not an error.
    async fn delete_run(&self, run_key: &str) -> Result<()>;
}

/// Run keys end up in file names and URLs, so keep them to a safe alphabet.
pub fn validate_run_key(run_key: &str) -> Result<()> {
    if run_key.is_empty() || run_key.len() > 128 {
        bail!("run key must be between 1 and 128 characters");
    }
    if let Some(c) = run_key
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_')))
    {
        bail!("run key contains invalid character '{}'", c);
    }
    Ok(())
}
