use anyhow::Result;
use async_trait::async_trait;

use super::{Decision, DecisionOutcome, DecisionProvider};
use crate::engine::types::ExecutionState;

/// Deterministic provider that looks at the same signals the LLM router is
/// prompted with: whether a strategy/config exists and which kinds of files
/// were uploaded this session.
#[derive(Debug, Default, Clone)]
pub struct HeuristicDecisionProvider;

impl HeuristicDecisionProvider {
    pub fn new() -> Self {
        Self
    }
}

/// File types recorded by the `analyze_files` node in `file_analyses`.
fn uploaded_types(state: &ExecutionState) -> Vec<String> {
    state
        .field("file_analyses")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|fa| fa.get("type").and_then(|t| t.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn has_object(state: &ExecutionState, key: &str) -> bool {
    state
        .field(key)
        .and_then(|v| v.as_object())
        .is_some_and(|m| !m.is_empty())
}

#[async_trait]
impl DecisionProvider for HeuristicDecisionProvider {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn decide(&self, state: &ExecutionState) -> Result<DecisionOutcome> {
        let has_strategy = has_object(state, "current_strategy");
        let has_config = has_object(state, "current_config");
        let types = uploaded_types(state);

        let (decision, reasoning) = if !has_strategy && !has_config {
            (
                Decision::Initialize,
                "No strategy or campaign configuration exists yet".to_string(),
            )
        } else if has_config && types.iter().any(|t| t == "experiment_results") {
            (
                Decision::Reflect,
                "Experiment results were uploaded against an existing configuration".to_string(),
            )
        } else if types.iter().any(|t| t == "enrichment" || t == "historical") {
            (
                Decision::Enrich,
                format!("Additional context uploaded ({})", types.join(", ")),
            )
        } else {
            let phase = state.field_str("current_phase").unwrap_or("unknown");
            (
                Decision::Continue,
                format!("Nothing new uploaded; continuing from phase '{}'", phase),
            )
        };

        Ok(DecisionOutcome {
            decision,
            reasoning,
        })
    }
}
