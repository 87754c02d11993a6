use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::decision::{Decision, DecisionOutcome, DecisionProvider};
use crate::engine::types::ExecutionState;
use crate::nodes::{Node, NodeContext};

pub const FALLBACK_REASONING: &str = "Fallback decision due to error";

/// The graph's branch node. Asks the decision provider once and records the
/// answer; the engine maps it to the next node.
pub struct RouterNode {
    provider: Arc<dyn DecisionProvider>,
}

impl RouterNode {
    pub fn new(provider: Arc<dyn DecisionProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Node for RouterNode {
    fn name(&self) -> &str {
        "router"
    }

    fn description(&self) -> &str {
        "Decide whether to initialize, reflect, enrich or continue the project"
    }

    async fn execute(&self, mut state: ExecutionState, ctx: &NodeContext) -> Result<ExecutionState> {
        let outcome = match self.provider.decide(&state).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    run_key = %state.run_key,
                    provider = %self.provider.name(),
                    error = %e,
                    "Decision provider failed, falling back to initialize"
                );
                ctx.report(format!(
                    "{} provider failed, routing to initialize",
                    self.provider.name()
                ));
                state.errors.push(format!("Router error: {:#}", e));
                DecisionOutcome {
                    decision: Decision::Initialize,
                    reasoning: FALLBACK_REASONING.to_string(),
                }
            }
        };

        info!(
            run_key = %state.run_key,
            decision = %outcome.decision,
            "Routing decision made"
        );
        state.push_message(format!("Router decision: {}", outcome.decision));
        state.push_message(format!("Reasoning: {}", outcome.reasoning));
        state.decision = Some(outcome.decision);
        state.decision_reasoning = Some(outcome.reasoning);

        Ok(state)
    }
}
