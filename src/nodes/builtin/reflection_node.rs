use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::info;

use super::{analyses_of_type, array_field, as_f64, fields, file_type, iteration, number, scratch, target_value};
use crate::engine::graph::phase;
use crate::engine::types::ExecutionState;
use crate::nodes::{Node, NodeContext};

pub const DEFAULT_TARGET_CPA: f64 = 25.0;
pub const DEFAULT_TARGET_ROAS: f64 = 3.0;

/// Phase set when the latest results meet both targets.
pub const THRESHOLD_MET: &str = "completed";

/// Judge per-variant results against the project's CPA and ROAS targets.
pub fn analyze_variants(
    summary: &Map<String, Value>,
    target_cpa: f64,
    target_roas: f64,
) -> Value {
    let metric = |v: &Value, key: &str| v.get(key).and_then(as_f64);

    let mut ranked: Vec<(&String, &Value)> = summary.iter().collect();
    ranked.sort_by(|a, b| {
        let roas = |v: &Value| metric(v, "roas").unwrap_or(f64::MIN);
        let cpa = |v: &Value| metric(v, "cpa").unwrap_or(f64::MAX);
        roas(b.1)
            .total_cmp(&roas(a.1))
            .then(cpa(a.1).total_cmp(&cpa(b.1)))
    });

    let Some((best_name, best)) = ranked.first().copied() else {
        return json!({ "threshold_met": false, "winners": {}, "losers": [] });
    };

    let best_cpa = metric(best, "cpa");
    let best_roas = metric(best, "roas");
    let threshold_met = (best_cpa.is_some() || best_roas.is_some())
        && best_cpa.is_none_or(|c| c <= target_cpa)
        && best_roas.is_none_or(|r| r >= target_roas);

    let mut winners = Map::new();
    winners.insert(best_name.clone(), best.clone());
    let losers: Vec<Value> = ranked
        .iter()
        .skip(1)
        .map(|(name, _)| Value::String((*name).clone()))
        .collect();

    json!({
        "best_variant": best_name,
        "winners": winners,
        "losers": losers,
        "threshold_met": threshold_met,
        "threshold_gap": {
            "cpa": best_cpa.map(|c| number(c - target_cpa)),
            "roas": best_roas.map(|r| number(target_roas - r)),
        },
        "targets": { "cpa": target_cpa, "roas": target_roas },
    })
}

/// Analyses the latest experiment results and decides whether the campaign
/// has reached its targets.
pub struct ReflectionNode;

#[async_trait]
impl Node for ReflectionNode {
    fn name(&self) -> &str {
        "reflection"
    }

    fn description(&self) -> &str {
        "Analyse experiment results against performance targets"
    }

    async fn execute(&self, mut state: ExecutionState, _ctx: &NodeContext) -> Result<ExecutionState> {
        let next_iteration = iteration(&state) + 1;
        let mut experiments = array_field(&state, fields::EXPERIMENT_RESULTS);

        for analysis in analyses_of_type(&state, file_type::EXPERIMENT_RESULTS) {
            experiments.push(json!({
                "iteration": next_iteration,
                "file_name": analysis.get("file_name").cloned().unwrap_or(Value::Null),
                "metrics": analysis.get("metrics").cloned().unwrap_or_else(|| json!({})),
            }));
        }

        let Some(latest) = experiments.last().cloned() else {
            state.push_message("No experiment results to analyze");
            return Ok(state);
        };

        let summary = match latest.pointer("/metrics/variant_summary") {
            Some(Value::Object(summary)) => summary.clone(),
            _ => Map::new(),
        };
        let target_cpa = target_value(&state, "target_cpa").unwrap_or(DEFAULT_TARGET_CPA);
        let target_roas = target_value(&state, "target_roas").unwrap_or(DEFAULT_TARGET_ROAS);
        let analysis = analyze_variants(&summary, target_cpa, target_roas);
        let met = analysis["threshold_met"].as_bool().unwrap_or(false);

        info!(run_key = %state.run_key, threshold_met = met, "Experiment results analysed");

        let mut timeline = array_field(&state, fields::METRICS_TIMELINE);
        timeline.push(json!({ "iteration": next_iteration, "analysis": analysis }));

        state.set_field(fields::EXPERIMENT_RESULTS, Value::Array(experiments));
        state.set_field(fields::METRICS_TIMELINE, Value::Array(timeline));
        if let Some(winners) = analysis.get("winners").filter(|w| w.as_object().is_some_and(|m| !m.is_empty())) {
            state.set_field(fields::BEST_PERFORMERS, winners.clone());
        }

        if met {
            state.set_field(fields::THRESHOLD_STATUS, json!("met"));
            state.set_field(fields::CURRENT_PHASE, json!(THRESHOLD_MET));
            state.push_message("Performance threshold met!");
        } else {
            state.set_field(fields::THRESHOLD_STATUS, json!("not_met"));
            state.set_field(fields::CURRENT_PHASE, json!(phase::OPTIMIZING));
            state.push_message("Performance below threshold, optimizing...");
        }

        state
            .scratch
            .insert(scratch::REFLECTION_ANALYSIS.into(), analysis);
        Ok(state)
    }
}
