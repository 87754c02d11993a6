use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{array_field, as_f64, fields, iteration, number, scratch};
use crate::engine::graph::phase;
use crate::engine::types::ExecutionState;
use crate::nodes::{Node, NodeContext};

/// Share of the budget moved to winning variants.
const WINNER_SHARE: f64 = 0.7;

/// Budget reallocation toward the winners of an analysis.
pub fn build_patch(analysis: &Value) -> Value {
    let winners: Vec<String> = analysis
        .get("winners")
        .and_then(|w| w.as_object())
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default();
    let losers: Vec<String> = analysis
        .get("losers")
        .and_then(|l| l.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str()).map(str::to_string).collect())
        .unwrap_or_default();

    if winners.is_empty() {
        return json!({
            "budget_shares": {},
            "reasoning": "No winning variant identified; configuration unchanged",
        });
    }

    let winner_pool = if losers.is_empty() { 1.0 } else { WINNER_SHARE };
    let mut shares = Map::new();
    for w in &winners {
        shares.insert(w.clone(), number(winner_pool / winners.len() as f64));
    }
    for l in &losers {
        shares.insert(l.clone(), number((1.0 - winner_pool) / losers.len() as f64));
    }

    json!({
        "budget_shares": shares,
        "reasoning": format!(
            "Shift {:.0}% of budget to {}",
            winner_pool * 100.0,
            winners.join(", ")
        ),
    })
}

/// Apply a patch to a campaign configuration, producing version `version`.
pub fn apply_patch(config: &Value, patch: &Value, version: u64) -> Value {
    let mut next = config.clone();
    let budget = config.get("daily_budget").and_then(as_f64).unwrap_or(0.0);

    if let Some(shares) = patch
        .get("budget_shares")
        .and_then(|s| s.as_object())
        .filter(|s| !s.is_empty())
    {
        let variants: Vec<Value> = shares
            .iter()
            .map(|(name, share)| {
                let share = as_f64(share).unwrap_or(0.0);
                let status = if share > 0.0 { "active" } else { "paused" };
                json!({
                    "name": name,
                    "budget_share": number(share),
                    "daily_budget": number(budget * share),
                    "status": status,
                })
            })
            .collect();
        next["variants"] = Value::Array(variants);
    }
    next["version"] = json!(version);
    next
}

/// Rewrites the campaign configuration using the reflection analysis.
///
/// The analysis is taken from scratch when reflection ran in this run, and
/// from the durable metrics timeline otherwise.
pub struct AdjustmentNode;

#[async_trait]
impl Node for AdjustmentNode {
    fn name(&self) -> &str {
        "adjustment"
    }

    fn description(&self) -> &str {
        "Patch the campaign configuration toward winning variants"
    }

    async fn execute(&self, mut state: ExecutionState, _ctx: &NodeContext) -> Result<ExecutionState> {
        let Some(config) = state
            .field(fields::CURRENT_CONFIG)
            .filter(|c| c.is_object())
            .cloned()
        else {
            bail!("adjustment: no campaign configuration to adjust");
        };

        let analysis = state
            .scratch
            .get(scratch::REFLECTION_ANALYSIS)
            .cloned()
            .or_else(|| {
                array_field(&state, fields::METRICS_TIMELINE)
                    .last()
                    .and_then(|entry| entry.get("analysis").cloned())
            })
            .unwrap_or_else(|| json!({}));

        let next_iteration = iteration(&state) + 1;
        let patch = build_patch(&analysis);
        let new_config = apply_patch(&config, &patch, next_iteration);

        let mut patches = array_field(&state, fields::PATCH_HISTORY);
        patches.push(json!({
            "iteration": next_iteration,
            "patch": patch,
            "reasoning": patch.get("reasoning").cloned().unwrap_or(Value::Null),
        }));
        let mut history = array_field(&state, fields::CONFIG_HISTORY);
        history.push(json!({ "iteration": next_iteration, "config": new_config }));

        state.set_field(fields::PATCH_HISTORY, Value::Array(patches));
        state.set_field(fields::CONFIG_HISTORY, Value::Array(history));
        state.set_field(fields::CURRENT_CONFIG, new_config);
        state.set_field(fields::ITERATION, json!(next_iteration));
        state.set_field(fields::CURRENT_PHASE, json!(phase::AWAITING_RESULTS));
        state.push_message(format!("Configuration updated to v{}", next_iteration));
        Ok(state)
    }
}
