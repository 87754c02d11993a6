use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, TryFromFloatSecsError};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::error::EngineError;
use crate::engine::executor::NodeExecutor;
use crate::engine::graph::GraphDefinition;
use crate::engine::progress::{EventBus, ProgressEvent};
use crate::engine::resume::ResumeController;
use crate::engine::types::{ExecutionState, FlowStatus, RunInputs};
use crate::nodes::{NodeContext, NodeRegistry};
use crate::storage::StateStore;

/// Engine-wide knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fail a node whose handler runs longer than this.
    pub node_timeout: Option<Duration>,
    /// Write a marker checkpoint before each handler call.
    pub checkpoint_on_start: bool,
    /// Upper bound on node executions per start call.
    pub max_steps: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_timeout: None,
            checkpoint_on_start: false,
            max_steps: 100,
        }
    }
}

/// Per-call options for [`WorkflowEngine::start`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Clear flow-control fields and start at the entry node.
    pub force_restart: bool,
    pub cancel: Option<CancellationToken>,
    /// Wall-clock budget for this call, measured from the start.
    pub deadline: Option<Duration>,
}

/// Turn a user-supplied number of seconds into a time budget.
///
/// Zero, negative and NaN mean no limit. Values a `Duration` cannot hold
/// are rejected.
pub fn time_budget(secs: Option<f64>) -> Result<Option<Duration>, TryFromFloatSecsError> {
    secs.filter(|s| *s > 0.0)
        .map(Duration::try_from_secs_f64)
        .transpose()
}

/// Drives a run from its resume point to the terminal node.
pub struct WorkflowEngine {
    graph: GraphDefinition,
    registry: Arc<NodeRegistry>,
    store: Arc<dyn StateStore>,
    executor: NodeExecutor,
    events: Arc<EventBus>,
    max_steps: usize,
    active: Mutex<HashSet<String>>,
}

/// Holds a run key in the active set until dropped.
struct ActiveRun<'a> {
    active: &'a Mutex<HashSet<String>>,
    run_key: String,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        active.remove(&self.run_key);
    }
}

impl WorkflowEngine {
    /// Build an engine, refusing graphs that are malformed or have nodes
    /// without a registered handler.
    pub fn new(
        graph: GraphDefinition,
        registry: Arc<NodeRegistry>,
        store: Arc<dyn StateStore>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let mut problems = graph.validate();
        for node in graph.nodes() {
            if registry.get(node).is_none() {
                problems.push(format!("No handler registered for node '{}'", node));
            }
        }
        if !problems.is_empty() {
            return Err(EngineError::Graph(problems.join("; ")));
        }

        let executor = NodeExecutor::new(store.clone(), graph.branch(), graph.terminal())
            .with_node_timeout(config.node_timeout)
            .with_start_marker(config.checkpoint_on_start);

        Ok(Self {
            graph,
            registry,
            store,
            executor,
            events: Arc::new(EventBus::default()),
            max_steps: config.max_steps,
            active: Mutex::new(HashSet::new()),
        })
    }

    pub fn graph(&self) -> &GraphDefinition {
        &self.graph
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Whether a start call for `run_key` is executing right now.
    pub fn is_active(&self, run_key: &str) -> bool {
        let active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        active.contains(run_key)
    }

    /// Mark `run_key` active in this engine. Other processes sharing the
    /// store are not excluded.
    fn claim(&self, run_key: &str) -> Result<ActiveRun<'_>, EngineError> {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if !active.insert(run_key.to_string()) {
            return Err(EngineError::RunActive(run_key.to_string()));
        }
        Ok(ActiveRun {
            active: &self.active,
            run_key: run_key.to_string(),
        })
    }

    /// Run `run_key` until the terminal node completes or a node stops it.
    ///
    /// Resumes from the latest checkpoint, starts a new session on a
    /// completed project, or starts fresh when nothing was persisted.
    pub async fn start(
        &self,
        run_key: &str,
        inputs: RunInputs,
        options: StartOptions,
    ) -> Result<ExecutionState, EngineError> {
        let _claim = self.claim(run_key)?;
        let cancel = options.cancel.unwrap_or_default();
        // A budget past the clock's range is no limit at all.
        let deadline = options
            .deadline
            .and_then(|budget| tokio::time::Instant::now().checked_add(budget));

        let loaded = self
            .store
            .load_checkpoint(run_key)
            .await
            .map_err(|e| EngineError::persistence(e, None))?;

        let plan = ResumeController::new(&self.graph).plan(
            run_key,
            loaded,
            &inputs,
            options.force_restart,
        );

        info!(
            run_key = %run_key,
            session = plan.state.session_num,
            entry = %plan.entry,
            mode = %plan.mode,
            "Starting run"
        );
        self.events.publish(ProgressEvent::RunStarted {
            run_key: run_key.to_string(),
            session_num: plan.state.session_num,
            entry: plan.entry.clone(),
            mode: plan.mode.to_string(),
        });

        let result = self
            .drive(run_key, plan.state, plan.entry, &cancel, deadline)
            .await;

        let status = match &result {
            Ok(state) => state.flow_status,
            Err(e) => e.state().map(|s| s.flow_status).unwrap_or(FlowStatus::Failed),
        };
        match &result {
            Ok(state) => info!(
                run_key = %run_key,
                status = %status,
                nodes = state.completed_nodes.len(),
                "Run finished"
            ),
            Err(e) => warn!(run_key = %run_key, error = %e, "Run stopped"),
        }
        self.events.publish(ProgressEvent::RunFinished {
            run_key: run_key.to_string(),
            status,
        });

        result
    }

    /// Execute nodes from `entry` until the terminal node completes.
    async fn drive(
        &self,
        run_key: &str,
        mut state: ExecutionState,
        entry: String,
        cancel: &CancellationToken,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<ExecutionState, EngineError> {
        let mut current = Some(entry);
        let mut steps = 0;

        while let Some(node_id) = current {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled {
                    node: node_id,
                    state: Box::new(state),
                });
            }
            if steps >= self.max_steps {
                return Err(EngineError::Graph(format!(
                    "run '{}' exceeded {} node executions",
                    run_key, self.max_steps
                )));
            }
            steps += 1;

            let node = self
                .registry
                .get(&node_id)
                .ok_or_else(|| EngineError::Graph(format!("No handler for node '{}'", node_id)))?;

            let ctx = NodeContext {
                run_key: run_key.to_string(),
                node_id: node_id.clone(),
                store: self.store.clone(),
                cancel: cancel.clone(),
                events: self.events.clone(),
            };

            state = self
                .executor
                .execute(node.as_ref(), state, &ctx, deadline)
                .await?;
            current = self.next_node(&node_id, &mut state)?;
        }

        Ok(state)
    }

    fn next_node(
        &self,
        node_id: &str,
        state: &mut ExecutionState,
    ) -> Result<Option<String>, EngineError> {
        if self.graph.is_terminal(node_id) {
            return Ok(None);
        }

        if self.graph.is_branch(node_id) {
            let resolution = self.graph.resolve_branch(state);
            if let Some(warning) = &resolution.warning {
                warn!(run_key = %state.run_key, warning = %warning, "Routing fallback");
                state.push_message(format!("Routing warning: {}", warning));
            }
            self.events.publish(ProgressEvent::Routed {
                run_key: state.run_key.clone(),
                decision: state
                    .decision
                    .as_ref()
                    .map(|d| d.to_string())
                    .unwrap_or_default(),
                next: resolution.next.clone(),
            });
            return Ok(Some(resolution.next));
        }

        match self.graph.successor(node_id) {
            Some(next) => Ok(Some(next.to_string())),
            None => Err(EngineError::Graph(format!(
                "Node '{}' has no outgoing edge",
                node_id
            ))),
        }
    }
}
