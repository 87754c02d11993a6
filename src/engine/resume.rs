use std::fmt;

use serde_json::Value;
use tracing::{info, warn};

use crate::engine::graph::GraphDefinition;
use crate::engine::types::{Checkpoint, ExecutionState, FlowStatus, RunInputs};

/// Business field holding the files uploaded for the current session.
pub const UPLOADED_FILES_FIELD: &str = "uploaded_files";
/// Business field holding caller-supplied context, merged across sessions.
pub const USER_INPUTS_FIELD: &str = "user_inputs";

/// How a start call relates to what was already persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeMode {
    /// No usable progress existed.
    Fresh,
    /// Flow-control fields and logs were cleared on request.
    ForcedRestart,
    /// The engine restarted the flow itself: new inputs arrived before
    /// routing, or the checkpoint named a node the graph lacks.
    AutoRestart,
    /// Continue an interrupted run after `after`.
    Resume { after: Option<String> },
    /// Re-enter a failed run after `after`, re-attempting the failed node.
    RetryAfterFailure { after: Option<String> },
    /// The previous session completed; a new one starts on the same project.
    NewSession,
}

impl fmt::Display for ResumeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeMode::Fresh => write!(f, "fresh"),
            ResumeMode::ForcedRestart => write!(f, "forced_restart"),
            ResumeMode::AutoRestart => write!(f, "auto_restart"),
            ResumeMode::Resume { .. } => write!(f, "resume"),
            ResumeMode::RetryAfterFailure { .. } => write!(f, "retry_after_failure"),
            ResumeMode::NewSession => write!(f, "new_session"),
        }
    }
}

/// State to run with and the node to start at.
#[derive(Debug, Clone)]
pub struct ResumePlan {
    pub state: ExecutionState,
    pub entry: String,
    pub mode: ResumeMode,
}

/// Decides where a run starts from its latest checkpoint.
pub struct ResumeController<'a> {
    graph: &'a GraphDefinition,
}

impl<'a> ResumeController<'a> {
    pub fn new(graph: &'a GraphDefinition) -> Self {
        Self { graph }
    }

    pub fn plan(
        &self,
        run_key: &str,
        loaded: Option<Checkpoint>,
        inputs: &RunInputs,
        force_restart: bool,
    ) -> ResumePlan {
        let Some(cp) = loaded else {
            let mut state = ExecutionState::new(run_key);
            apply_session_inputs(&mut state, inputs);
            return self.from_entry(state, ResumeMode::Fresh);
        };

        let mut state = ExecutionState::from_checkpoint(cp);

        if force_restart {
            info!(run_key = %run_key, "Force restart requested, clearing flow state");
            state.reset_flow();
            state.clear_logs();
            apply_session_inputs(&mut state, inputs);
            state.push_message("Workflow restarted from the entry node");
            return self.from_entry(state, ResumeMode::ForcedRestart);
        }

        match state.flow_status {
            FlowStatus::Completed => {
                state.begin_session();
                apply_session_inputs(&mut state, inputs);
                state.push_message(format!("Starting session {}", state.session_num));
                self.from_entry(state, ResumeMode::NewSession)
            }
            FlowStatus::NotStarted => {
                state.reset_flow();
                apply_session_inputs(&mut state, inputs);
                self.from_entry(state, ResumeMode::Fresh)
            }
            FlowStatus::InProgress | FlowStatus::Failed => self.continue_run(state, inputs),
        }
    }

    fn from_entry(&self, state: ExecutionState, mode: ResumeMode) -> ResumePlan {
        ResumePlan {
            state,
            entry: self.graph.entry().to_string(),
            mode,
        }
    }

    fn continue_run(&self, mut state: ExecutionState, inputs: &RunInputs) -> ResumePlan {
        let after = state.last_completed_node.clone();
        let mode = if state.flow_status == FlowStatus::Failed {
            ResumeMode::RetryAfterFailure {
                after: after.clone(),
            }
        } else {
            ResumeMode::Resume {
                after: after.clone(),
            }
        };

        // A start marker may name the node that was in flight; it re-runs.
        state.current_executing_node = None;

        if !inputs.is_empty() {
            if state.decision.is_some() {
                state.push_message(
                    "New inputs ignored: this session has already been routed. \
                     Restart the run to route with them.",
                );
            } else {
                info!(run_key = %state.run_key, "New inputs before routing, restarting session flow");
                state.reset_flow();
                apply_session_inputs(&mut state, inputs);
                state.push_message("New inputs received before routing; restarting from the entry node");
                return self.from_entry(state, ResumeMode::AutoRestart);
            }
        }

        let entry = match after.as_deref() {
            None => self.graph.entry().to_string(),
            Some(node) if !self.graph.contains(node) => {
                warn!(
                    run_key = %state.run_key,
                    node = %node,
                    "Checkpoint names a node this graph does not have, restarting flow"
                );
                state.reset_flow();
                state.push_message(format!(
                    "Unknown last completed node '{}'; restarting from the entry node",
                    node
                ));
                return self.from_entry(state, ResumeMode::AutoRestart);
            }
            Some(node) if self.graph.is_terminal(node) => {
                state.begin_session();
                return self.from_entry(state, ResumeMode::NewSession);
            }
            Some(node) if self.graph.is_branch(node) => {
                if state.decision.is_none() {
                    node.to_string()
                } else {
                    let resolution = self.graph.resolve_branch(&state);
                    if let Some(w) = resolution.warning {
                        warn!(run_key = %state.run_key, warning = %w, "Routing fallback on resume");
                        state.push_message(format!("Routing warning: {}", w));
                    }
                    resolution.next
                }
            }
            Some(node) => match self.graph.successor(node) {
                Some(next) => next.to_string(),
                None => self.graph.entry().to_string(),
            },
        };

        info!(
            run_key = %state.run_key,
            after = ?after,
            entry = %entry,
            "Resuming run"
        );

        ResumePlan { state, entry, mode }
    }
}

/// Record this session's inputs in the durable business fields.
fn apply_session_inputs(state: &mut ExecutionState, inputs: &RunInputs) {
    let files: Vec<Value> = inputs
        .files
        .iter()
        .map(|p| Value::String(p.display().to_string()))
        .collect();
    state.set_field(UPLOADED_FILES_FIELD, Value::Array(files));

    if inputs.context.is_empty() {
        return;
    }
    let mut merged = match state.field(USER_INPUTS_FIELD) {
        Some(Value::Object(existing)) => existing.clone(),
        _ => serde_json::Map::new(),
    };
    for (k, v) in &inputs.context {
        merged.insert(k.clone(), v.clone());
    }
    state.set_field(USER_INPUTS_FIELD, Value::Object(merged));
}
