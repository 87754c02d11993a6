use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::Instant as Deadline;
use tracing::{debug, error, info, warn};

use crate::engine::error::EngineError;
use crate::engine::progress::ProgressEvent;
use crate::engine::types::{ExecutionState, FlowStatus};
use crate::nodes::{Node, NodeContext};
use crate::storage::StateStore;

/// Runs one node with the bookkeeping and checkpointing around it.
///
/// Every path that changes durable progress goes through [`commit`], so a
/// checkpoint is written exactly once per completed or failed node (plus the
/// optional start marker).
///
/// [`commit`]: NodeExecutor::commit
pub struct NodeExecutor {
    store: Arc<dyn StateStore>,
    branch: String,
    terminal: String,
    node_timeout: Option<Duration>,
    checkpoint_on_start: bool,
}

enum Outcome {
    Finished(anyhow::Result<ExecutionState>),
    Cancelled,
    DeadlineExceeded,
}

impl NodeExecutor {
    pub fn new(store: Arc<dyn StateStore>, branch: &str, terminal: &str) -> Self {
        Self {
            store,
            branch: branch.to_string(),
            terminal: terminal.to_string(),
            node_timeout: None,
            checkpoint_on_start: false,
        }
    }

    /// Fail a node whose handler runs longer than `timeout`.
    pub fn with_node_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.node_timeout = timeout;
        self
    }

    /// Write a marker checkpoint naming the in-flight node before each handler call.
    pub fn with_start_marker(mut self, enabled: bool) -> Self {
        self.checkpoint_on_start = enabled;
        self
    }

    /// Execute `node` against `state`.
    ///
    /// On success the returned state has the node appended to
    /// `completed_nodes` and has already been checkpointed. Scratch written by
    /// the handler stays in the returned value but never reaches the store.
    pub async fn execute(
        &self,
        node: &dyn Node,
        mut state: ExecutionState,
        ctx: &NodeContext,
        deadline: Option<Deadline>,
    ) -> Result<ExecutionState, EngineError> {
        let node_id = node.name().to_string();

        if state.flow_status != FlowStatus::InProgress {
            if let Err(message) = state.transition(FlowStatus::InProgress) {
                return Err(EngineError::Validation {
                    node: node_id,
                    message,
                    state: Box::new(state),
                });
            }
        }
        state.current_executing_node = Some(node_id.clone());

        if self.checkpoint_on_start {
            self.commit(&mut state).await?;
        }

        info!(run_key = %state.run_key, node = %node_id, "Running node");
        ctx.events.publish(ProgressEvent::NodeStarted {
            run_key: state.run_key.clone(),
            node: node_id.clone(),
            index: state.completed_nodes.len(),
        });

        let started = Instant::now();
        let outcome = self.run_handler(node, state.clone(), ctx, deadline).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let returned = match outcome {
            Outcome::Cancelled => {
                warn!(run_key = %state.run_key, node = %node_id, "Run cancelled mid-node");
                return Err(EngineError::Cancelled {
                    node: node_id,
                    state: Box::new(state),
                });
            }
            Outcome::DeadlineExceeded => {
                warn!(run_key = %state.run_key, node = %node_id, "Run deadline exceeded mid-node");
                return Err(EngineError::DeadlineExceeded {
                    node: node_id,
                    state: Box::new(state),
                });
            }
            Outcome::Finished(Err(e)) => {
                let message = format!("{:#}", e);
                let failed = self.fail(state, &node_id, &message, ctx).await?;
                return Err(EngineError::NodeExecution {
                    node: node_id,
                    message,
                    state: Box::new(failed),
                });
            }
            Outcome::Finished(Ok(returned)) => returned,
        };

        if let Err(message) = self.check_invariants(&node_id, &state, &returned) {
            let failed = self.fail(state, &node_id, &message, ctx).await?;
            return Err(EngineError::Validation {
                node: node_id,
                message,
                state: Box::new(failed),
            });
        }

        let mut next = returned;
        next.completed_nodes.push(node_id.clone());
        next.last_completed_node = Some(node_id.clone());
        next.current_executing_node = None;
        if node_id == self.terminal {
            next.flow_status = FlowStatus::Completed;
        }
        self.commit(&mut next).await?;

        info!(
            run_key = %next.run_key,
            node = %node_id,
            elapsed_ms = elapsed_ms,
            "Node completed"
        );
        ctx.events.publish(ProgressEvent::NodeCompleted {
            run_key: next.run_key.clone(),
            node: node_id,
            elapsed_ms,
            last_message: next.messages.last().cloned(),
        });

        Ok(next)
    }

    async fn run_handler(
        &self,
        node: &dyn Node,
        state: ExecutionState,
        ctx: &NodeContext,
        deadline: Option<Deadline>,
    ) -> Outcome {
        let handler = async {
            match self.node_timeout {
                Some(limit) => match tokio::time::timeout(limit, node.execute(state, ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!(
                        "timed out after {}s",
                        limit.as_secs_f64()
                    )),
                },
                None => node.execute(state, ctx).await,
            }
        };

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Outcome::Cancelled,
            _ = wait_until(deadline) => Outcome::DeadlineExceeded,
            result = handler => Outcome::Finished(result),
        }
    }

    /// Record the failure on the pre-call state and checkpoint it.
    async fn fail(
        &self,
        mut state: ExecutionState,
        node_id: &str,
        message: &str,
        ctx: &NodeContext,
    ) -> Result<ExecutionState, EngineError> {
        error!(run_key = %state.run_key, node = %node_id, error = %message, "Node failed");

        state.errors.push(format!("{} failed: {}", node_id, message));
        state.flow_status = FlowStatus::Failed;
        state.current_executing_node = None;
        self.commit(&mut state).await?;

        ctx.events.publish(ProgressEvent::NodeFailed {
            run_key: state.run_key.clone(),
            node: node_id.to_string(),
            error: message.to_string(),
        });
        Ok(state)
    }

    /// Persist the durable part of `state` and stamp it with the written sequence.
    pub async fn commit(&self, state: &mut ExecutionState) -> Result<(), EngineError> {
        let cp = state.to_checkpoint();
        self.store
            .save_checkpoint(&cp)
            .await
            .map_err(|e| EngineError::persistence(e, Some(state)))?;
        state.checkpoint_seq = cp.sequence;
        state.updated_at = cp.saved_at;
        debug!(run_key = %state.run_key, sequence = cp.sequence, "Checkpoint written");
        Ok(())
    }

    /// Compare the state a handler returned with the one it was given.
    pub fn check_invariants(
        &self,
        node_id: &str,
        before: &ExecutionState,
        after: &ExecutionState,
    ) -> Result<(), String> {
        if after.run_key != before.run_key {
            return Err(format!(
                "run_key changed from '{}' to '{}'",
                before.run_key, after.run_key
            ));
        }
        if after.session_id != before.session_id || after.session_num != before.session_num {
            return Err("session identity changed".to_string());
        }
        if after.flow_status != before.flow_status {
            if !before.flow_status.can_transition_to(after.flow_status) {
                return Err(format!(
                    "illegal flow status transition {} -> {}",
                    before.flow_status, after.flow_status
                ));
            }
            return Err("flow_status is managed by the engine".to_string());
        }
        if after.completed_nodes != before.completed_nodes
            || after.last_completed_node != before.last_completed_node
            || after.current_executing_node != before.current_executing_node
        {
            return Err("node bookkeeping fields were modified".to_string());
        }
        if after.started_at != before.started_at || after.checkpoint_seq != before.checkpoint_seq {
            return Err("run timestamps or checkpoint sequence were modified".to_string());
        }
        if !after.messages.starts_with(&before.messages) {
            return Err("messages must only be appended to".to_string());
        }
        if !after.errors.starts_with(&before.errors) {
            return Err("errors must only be appended to".to_string());
        }
        if let Some(key) = before
            .business_fields
            .keys()
            .find(|k| !after.business_fields.contains_key(*k))
        {
            return Err(format!("business field '{}' was removed", key));
        }
        if node_id != self.branch
            && (after.decision != before.decision
                || after.decision_reasoning != before.decision_reasoning)
        {
            return Err("only the branch node may set the decision".to_string());
        }
        Ok(())
    }
}

async fn wait_until(deadline: Option<Deadline>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
