use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};

use super::{array_field, as_f64, fields, iteration, number};
use crate::engine::graph::phase;
use crate::engine::types::ExecutionState;
use crate::nodes::{Node, NodeContext};

/// Split of the daily budget between the two test variants.
const VARIANT_SPLIT: [(&str, f64); 2] = [("A", 0.5), ("B", 0.5)];

/// Campaign configuration derived from a strategy.
pub fn build_config(strategy: &Value, version: u64) -> Value {
    let budget = strategy
        .get("daily_budget")
        .and_then(as_f64)
        .unwrap_or(0.0);

    let variants: Vec<Value> = VARIANT_SPLIT
        .iter()
        .map(|(name, share)| {
            json!({
                "name": name,
                "budget_share": share,
                "daily_budget": number(budget * share),
                "status": "active",
            })
        })
        .collect();

    let bid_strategy = if strategy.get("target_cpa").is_some_and(|v| !v.is_null()) {
        "cost_cap"
    } else {
        "lowest_cost"
    };

    json!({
        "version": version,
        "objective": strategy.get("objective").cloned().unwrap_or(Value::Null),
        "daily_budget": number(budget),
        "bid_strategy": bid_strategy,
        "target_cpa": strategy.get("target_cpa").cloned().unwrap_or(Value::Null),
        "variants": variants,
    })
}

/// Produces the ad configuration for the current strategy.
pub struct CampaignSetupNode;

#[async_trait]
impl Node for CampaignSetupNode {
    fn name(&self) -> &str {
        "campaign_setup"
    }

    fn description(&self) -> &str {
        "Generate the campaign configuration from the strategy"
    }

    async fn execute(&self, mut state: ExecutionState, _ctx: &NodeContext) -> Result<ExecutionState> {
        let Some(strategy) = state.field(fields::CURRENT_STRATEGY).cloned() else {
            bail!("campaign_setup: no strategy to configure");
        };

        let iter = iteration(&state);
        let config = build_config(&strategy, iter);

        let mut history = array_field(&state, fields::CONFIG_HISTORY);
        history.push(json!({ "iteration": iter, "config": config }));

        state.set_field(fields::CURRENT_CONFIG, config);
        state.set_field(fields::CONFIG_HISTORY, Value::Array(history));
        state.set_field(fields::CURRENT_PHASE, Value::String(phase::AWAITING_RESULTS.into()));
        state.push_message("Campaign configuration generated");
        Ok(state)
    }
}
