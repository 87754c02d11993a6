pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::decision::DecisionProvider;
use crate::engine::progress::{EventBus, ProgressEvent};
use crate::engine::types::ExecutionState;
use crate::storage::StateStore;

/// Everything a handler may need besides the state itself.
pub struct NodeContext {
    pub run_key: String,
    pub node_id: String,
    /// Long-term record store; only the terminal node writes snapshots.
    pub store: Arc<dyn StateStore>,
    /// Caller cancellation. Handlers doing long external calls can watch it;
    /// the executor also races the handler against it.
    pub cancel: CancellationToken,
    pub events: Arc<EventBus>,
}

impl NodeContext {
    /// Forward a progress line to whoever is watching the run.
    pub fn report(&self, text: impl Into<String>) {
        self.events.publish(ProgressEvent::Message {
            run_key: self.run_key.clone(),
            text: text.into(),
        });
    }
}

/// A unit of work transforming the execution state.
///
/// Handlers get the state by value and return the updated state, or an error
/// that fails the run at this node. The engine may re-invoke a handler whose
/// previous attempt was aborted before its checkpoint was written.
#[async_trait]
pub trait Node: Send + Sync {
    /// Graph node id this handler is registered under.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    async fn execute(&self, state: ExecutionState, ctx: &NodeContext) -> Result<ExecutionState>;
}

/// Handlers by node id.
pub struct NodeRegistry {
    nodes: HashMap<String, Arc<dyn Node>>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    /// Registry with every campaign node, routing through `provider`.
    pub fn campaign(provider: Arc<dyn DecisionProvider>) -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry, provider);
        registry
    }

    /// Register a handler, replacing any previous one with the same name.
    pub fn register(&mut self, node: Arc<dyn Node>) {
        self.nodes.insert(node.name().to_string(), node);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Node>> {
        self.nodes.get(name).cloned()
    }

    /// All registered handlers with descriptions, sorted by name.
    pub fn list(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<(&str, &str)> = self
            .nodes
            .values()
            .map(|n| (n.name(), n.description()))
            .collect();
        entries.sort_by_key(|(name, _)| *name);
        entries
    }
}
