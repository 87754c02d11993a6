use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::fields;
use crate::engine::graph::phase;
use crate::engine::types::ExecutionState;
use crate::nodes::{Node, NodeContext};

/// Entry node. Pulls in the long-term project record and seeds the
/// bookkeeping fields every later node relies on.
pub struct LoadContextNode;

#[async_trait]
impl Node for LoadContextNode {
    fn name(&self) -> &str {
        "load_context"
    }

    fn description(&self) -> &str {
        "Load the saved project record and initialise project fields"
    }

    async fn execute(&self, mut state: ExecutionState, ctx: &NodeContext) -> Result<ExecutionState> {
        let snapshot = ctx
            .store
            .load_snapshot(&state.run_key)
            .await
            .context("load_context: failed to read project snapshot")?;

        match snapshot {
            Some(snapshot) => {
                let mut restored = 0;
                for (key, value) in snapshot.business_fields {
                    if !state.business_fields.contains_key(&key) {
                        state.business_fields.insert(key, value);
                        restored += 1;
                    }
                }
                info!(run_key = %state.run_key, restored = restored, "Loaded existing project");
                state.push_message(format!(
                    "Loaded existing project: {} (session {})",
                    state.run_key, state.session_num
                ));
            }
            None if state.field(fields::CURRENT_PHASE).is_some() => {
                state.push_message(format!(
                    "Continuing project: {} (session {})",
                    state.run_key, state.session_num
                ));
            }
            None => {
                state.push_message(format!("New project: {}", state.run_key));
            }
        }

        if state.field(fields::CURRENT_PHASE).is_none() {
            state.set_field(fields::CURRENT_PHASE, Value::String(phase::INITIALIZED.into()));
        }
        if state.field(fields::ITERATION).is_none() {
            state.set_field(fields::ITERATION, Value::from(0));
        }
        for key in [
            fields::CONFIG_HISTORY,
            fields::EXPERIMENT_RESULTS,
            fields::PATCH_HISTORY,
            fields::METRICS_TIMELINE,
        ] {
            if state.field(key).is_none() {
                state.set_field(key, Value::Array(Vec::new()));
            }
        }

        Ok(state)
    }
}
