use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use serde::Deserialize;

use crate::decision::llm::LlmSettings;
use crate::decision::{DecisionProvider, HeuristicDecisionProvider, LlmDecisionProvider};
use crate::engine::{EngineConfig, WorkflowEngine, campaign_graph, time_budget};
use crate::nodes::NodeRegistry;
use crate::storage::{JsonStateStore, MemoryStateStore, SqliteStateStore, StateStore};

pub const DEFAULT_CONFIG_FILE: &str = "campaignflow.yaml";
pub const DEFAULT_STORE_DIR: &str = "data/projects";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/campaignflow.db";

/// Storage backend for checkpoints and project snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Json,
    Sqlite,
    Memory,
}

/// Which decision provider the router node consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Heuristic,
    Llm,
}

/// Configuration loaded from `campaignflow.yaml`.
/// All fields are optional; CLI flags and env vars override them.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CampaignFlowConfig {
    pub store: Option<StoreKind>,
    pub store_dir: Option<String>,
    pub database_url: Option<String>,
    pub decision_provider: Option<ProviderKind>,
    pub llm: LlmSettings,
    /// Per-node handler timeout in seconds.
    pub node_timeout_s: Option<f64>,
    pub checkpoint_on_start: Option<bool>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_concurrent_runs: Option<usize>,
}

impl CampaignFlowConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `campaignflow.yaml` in cwd; return defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yml::from_str(contents)?)
    }

    pub fn store_kind(&self) -> StoreKind {
        self.store.unwrap_or(StoreKind::Json)
    }

    pub fn store_dir(&self) -> PathBuf {
        PathBuf::from(self.store_dir.as_deref().unwrap_or(DEFAULT_STORE_DIR))
    }

    pub fn database_url(&self) -> &str {
        self.database_url.as_deref().unwrap_or(DEFAULT_DATABASE_URL)
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("0.0.0.0")
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(3000)
    }

    pub fn max_concurrent_runs(&self) -> usize {
        self.max_concurrent_runs.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn engine_config(&self) -> Result<EngineConfig> {
        Ok(EngineConfig {
            node_timeout: time_budget(self.node_timeout_s).context("Invalid node_timeout_s")?,
            checkpoint_on_start: self.checkpoint_on_start.unwrap_or(false),
            ..EngineConfig::default()
        })
    }

    pub async fn open_store(&self) -> Result<Arc<dyn StateStore>> {
        Ok(match self.store_kind() {
            StoreKind::Json => Arc::new(JsonStateStore::new(self.store_dir())),
            StoreKind::Memory => Arc::new(MemoryStateStore::new()),
            StoreKind::Sqlite => {
                let url = self.database_url();
                if let Some(parent) = url
                    .strip_prefix("sqlite://")
                    .map(Path::new)
                    .and_then(Path::parent)
                    .filter(|p| !p.as_os_str().is_empty())
                {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create database directory {}", parent.display())
                    })?;
                }
                Arc::new(SqliteStateStore::connect(url).await?)
            }
        })
    }

    pub fn decision_provider(&self) -> Result<Arc<dyn DecisionProvider>> {
        Ok(match self.decision_provider.unwrap_or(ProviderKind::Heuristic) {
            ProviderKind::Heuristic => Arc::new(HeuristicDecisionProvider::new()),
            ProviderKind::Llm => Arc::new(LlmDecisionProvider::new(self.llm.clone())?),
        })
    }

    /// Engine over the campaign graph with the configured store and provider.
    pub async fn build_engine(&self) -> Result<WorkflowEngine> {
        let store = self.open_store().await?;
        let registry = Arc::new(NodeRegistry::campaign(self.decision_provider()?));
        let engine = WorkflowEngine::new(campaign_graph(), registry, store, self.engine_config()?)?;
        Ok(engine)
    }
}
