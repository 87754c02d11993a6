use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::engine::types::{Checkpoint, FlowStatus, ProjectSnapshot};
use crate::storage::{StateStore, validate_run_key};

const CHECKPOINT_SUFFIX: &str = ".json";
const SNAPSHOT_SUFFIX: &str = ".project.json";

/// File-based JSON state store.
///
/// Each run has `<key>.json` (latest checkpoint) and, once the terminal node
/// has run, `<key>.project.json` (project snapshot). Writes go to a `.tmp`
/// sibling that is fsynced and renamed over the target, so readers only ever
/// see a complete file. Runs on different keys touch disjoint files and never
/// wait on each other; writes to one key are serialised by the engine.
pub struct JsonStateStore {
    base_dir: PathBuf,
}

impl JsonStateStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn checkpoint_path(&self, run_key: &str) -> PathBuf {
        self.base_dir.join(format!("{}{}", run_key, CHECKPOINT_SUFFIX))
    }

    pub fn snapshot_path(&self, run_key: &str) -> PathBuf {
        self.base_dir.join(format!("{}{}", run_key, SNAPSHOT_SUFFIX))
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        let data = match tokio::fs::read_to_string(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        let value = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(value))
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.base_dir.display()))?;

        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let data = serde_json::to_vec_pretty(value)?;
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, path)
            .await
            .with_context(|| format!("Failed to move checkpoint into {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn load_checkpoint(&self, run_key: &str) -> Result<Option<Checkpoint>> {
        validate_run_key(run_key)?;
        Self::read_json(&self.checkpoint_path(run_key)).await
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        validate_run_key(&checkpoint.run_key)?;
        self.write_json(&self.checkpoint_path(&checkpoint.run_key), checkpoint)
            .await
    }

    async fn save_snapshot(&self, snapshot: &ProjectSnapshot) -> Result<()> {
        validate_run_key(&snapshot.run_key)?;
        self.write_json(&self.snapshot_path(&snapshot.run_key), snapshot)
            .await
    }

    async fn load_snapshot(&self, run_key: &str) -> Result<Option<ProjectSnapshot>> {
        validate_run_key(run_key)?;
        Self::read_json(&self.snapshot_path(run_key)).await
    }

    async fn list_checkpoints(&self, status: Option<FlowStatus>) -> Result<Vec<Checkpoint>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut checkpoints = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(CHECKPOINT_SUFFIX) || name.ends_with(SNAPSHOT_SUFFIX) {
                continue;
            }
            match Self::read_json::<Checkpoint>(&path).await {
                Ok(Some(cp)) => {
                    if status.is_none_or(|s| s == cp.flow_status) {
                        checkpoints.push(cp);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint"),
            }
        }

        checkpoints.sort_by(|a, b| a.run_key.cmp(&b.run_key));
        Ok(checkpoints)
    }

    async fn delete_run(&self, run_key: &str) -> Result<()> {
        validate_run_key(run_key)?;
        for path in [self.checkpoint_path(run_key), self.snapshot_path(run_key)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to delete {}", path.display()));
                }
            }
        }
        Ok(())
    }
}
