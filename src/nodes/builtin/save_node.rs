use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tracing::info;

use crate::engine::types::{ExecutionState, ProjectSnapshot};
use crate::nodes::{Node, NodeContext};

/// Terminal node. Writes the long-term project record.
pub struct SaveNode;

#[async_trait]
impl Node for SaveNode {
    fn name(&self) -> &str {
        "save"
    }

    fn description(&self) -> &str {
        "Save the project record"
    }

    async fn execute(&self, mut state: ExecutionState, ctx: &NodeContext) -> Result<ExecutionState> {
        state.push_message("Project state saved");
        let snapshot = ProjectSnapshot::from_state(&state);
        ctx.store
            .save_snapshot(&snapshot)
            .await
            .context("save: failed to write project snapshot")?;

        info!(
            run_key = %state.run_key,
            session = state.session_num,
            fields = snapshot.business_fields.len(),
            "Project snapshot written"
        );
        Ok(state)
    }
}
