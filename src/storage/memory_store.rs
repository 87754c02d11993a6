use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use crate::engine::types::{Checkpoint, FlowStatus, ProjectSnapshot};
use crate::storage::StateStore;

/// In-memory state store. Holds runs only for the lifetime of the instance;
/// used by tests and by `store: memory` for throwaway runs.
#[derive(Default)]
pub struct MemoryStateStore {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
    snapshots: Mutex<HashMap<String, ProjectSnapshot>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoints currently held.
    pub fn len(&self) -> usize {
        self.checkpoints.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_checkpoint(&self, run_key: &str) -> Result<Option<Checkpoint>> {
        let checkpoints = self
            .checkpoints
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?;
        Ok(checkpoints.get(run_key).cloned())
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut checkpoints = self
            .checkpoints
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?;
        checkpoints.insert(checkpoint.run_key.clone(), checkpoint.clone());
        Ok(())
    }

    async fn save_snapshot(&self, snapshot: &ProjectSnapshot) -> Result<()> {
        let mut snapshots = self
            .snapshots
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?;
        snapshots.insert(snapshot.run_key.clone(), snapshot.clone());
        Ok(())
    }

    async fn load_snapshot(&self, run_key: &str) -> Result<Option<ProjectSnapshot>> {
        let snapshots = self
            .snapshots
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?;
        Ok(snapshots.get(run_key).cloned())
    }

    async fn list_checkpoints(&self, status: Option<FlowStatus>) -> Result<Vec<Checkpoint>> {
        let checkpoints = self
            .checkpoints
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?;
        let mut list: Vec<Checkpoint> = checkpoints
            .values()
            .filter(|cp| status.is_none_or(|s| s == cp.flow_status))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.run_key.cmp(&b.run_key));
        Ok(list)
    }

    async fn delete_run(&self, run_key: &str) -> Result<()> {
        self.checkpoints
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?
            .remove(run_key);
        self.snapshots
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?
            .remove(run_key);
        Ok(())
    }
}
