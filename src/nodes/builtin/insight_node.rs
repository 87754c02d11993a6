use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{as_f64, fields, number, object_field, scratch, target_value};
use crate::engine::graph::phase;
use crate::engine::types::ExecutionState;
use crate::nodes::{Node, NodeContext};

const DEFAULT_DAILY_BUDGET: f64 = 100.0;
const TOP_CAMPAIGNS: usize = 3;

/// Best campaigns by ROAS across the raw rows kept in scratch.
fn top_campaigns(rows_by_file: &Map<String, Value>) -> Vec<Value> {
    let mut ranked: Vec<(String, f64)> = rows_by_file
        .values()
        .filter_map(|rows| rows.as_array())
        .flatten()
        .filter_map(|row| {
            let name = row
                .get("campaign_name")
                .or_else(|| row.get("campaign_id"))
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })?;
            let roas = row.get("roas").and_then(as_f64).or_else(|| {
                let spend = row.get("spend").and_then(as_f64)?;
                let revenue = row.get("revenue").and_then(as_f64)?;
                (spend > 0.0).then(|| revenue / spend)
            })?;
            Some((name, roas))
        })
        .collect();

    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
        .into_iter()
        .take(TOP_CAMPAIGNS)
        .map(|(name, roas)| json!({ "campaign": name, "roas": number(roas) }))
        .collect()
}

/// Turns the collected knowledge into a campaign strategy.
///
/// Uses the raw rows from `analyze_files` when this run still has them and
/// falls back to the durable aggregate metrics otherwise (e.g. after a resume).
pub struct InsightNode;

#[async_trait]
impl Node for InsightNode {
    fn name(&self) -> &str {
        "insight"
    }

    fn description(&self) -> &str {
        "Build a campaign strategy from collected facts and data"
    }

    async fn execute(&self, mut state: ExecutionState, _ctx: &NodeContext) -> Result<ExecutionState> {
        let historical = object_field(&state, fields::HISTORICAL_DATA);
        let latest = historical
            .get("latest_metrics")
            .cloned()
            .unwrap_or_else(|| json!({}));
        let metric = |key: &str| latest.get(key).and_then(as_f64);

        let daily_budget = target_value(&state, "target_budget")
            .or_else(|| metric("avg_daily_spend"))
            .unwrap_or(DEFAULT_DAILY_BUDGET);
        let target_cpa = target_value(&state, "target_cpa").or_else(|| metric("avg_cpa"));
        let target_roas = target_value(&state, "target_roas").or_else(|| metric("avg_roas"));

        let (top, basis) = match state.scratch.get(scratch::FILE_ROWS) {
            Some(Value::Object(rows)) if !rows.is_empty() => (top_campaigns(rows), "campaign rows"),
            _ => (Vec::new(), "aggregate metrics"),
        };

        let product = object_field(&state, fields::KNOWLEDGE_FACTS)
            .get("product_description")
            .and_then(|f| f.get("value"))
            .cloned()
            .unwrap_or(Value::Null);

        let strategy = json!({
            "objective": "conversions",
            "product": product,
            "daily_budget": number(daily_budget),
            "target_cpa": target_cpa.map(number),
            "target_roas": target_roas.map(number),
            "top_campaigns": top,
            "basis": basis,
            "execution_timeline": {
                "test_days": 7,
                "variants": 2,
                "scale_after": "threshold_met",
            },
        });

        state.set_field(
            fields::EXPERIMENT_PLAN,
            strategy["execution_timeline"].clone(),
        );
        state.set_field(fields::CURRENT_STRATEGY, strategy);
        state.set_field(fields::CURRENT_PHASE, Value::String(phase::STRATEGY_BUILT.into()));
        state.push_message(format!("Generated strategy from {}", basis));

        state.scratch.remove(scratch::FILE_ROWS);
        Ok(state)
    }
}
