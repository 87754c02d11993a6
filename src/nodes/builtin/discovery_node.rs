use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{analyses_of_type, as_f64, fields, file_type, object_field};
use crate::engine::types::ExecutionState;
use crate::nodes::{Node, NodeContext};

/// Facts the later nodes need; reported when still unknown.
const CRITICAL_FACTS: &[&str] = &["product_description", "target_budget", "target_cpa"];

/// Confidence below which a fact counts as unknown.
const CONFIDENCE_THRESHOLD: f64 = 0.6;

/// Builds the project's knowledge graph from user context and historical
/// metrics. A fact is only replaced by one with equal or higher confidence.
pub struct DiscoveryNode;

fn fact(value: Value, source: &str, confidence: f64) -> Value {
    json!({ "value": value, "source": source, "confidence": confidence })
}

fn confidence(fact: &Value) -> f64 {
    fact.get("confidence").and_then(as_f64).unwrap_or(0.0)
}

fn merge(knowledge: &mut Map<String, Value>, key: &str, candidate: Value) -> bool {
    let replace = knowledge
        .get(key)
        .is_none_or(|existing| confidence(&candidate) >= confidence(existing));
    if replace {
        knowledge.insert(key.to_string(), candidate);
    }
    replace
}

/// Facts inferred from the aggregate metrics of historical files.
fn inferred_facts(state: &ExecutionState) -> Vec<(&'static str, Value)> {
    let mut facts = Vec::new();
    for analysis in analyses_of_type(state, file_type::HISTORICAL) {
        let metrics = analysis.get("metrics").cloned().unwrap_or(Value::Null);
        let pick = |key: &str| metrics.get(key).and_then(as_f64);

        if let Some(cpa) = pick("avg_cpa") {
            facts.push(("target_cpa", fact(json!(cpa), "inferred", 0.7)));
        }
        if let Some(roas) = pick("avg_roas") {
            facts.push(("target_roas", fact(json!(roas), "inferred", 0.7)));
        }
        if let Some(spend) = pick("avg_daily_spend") {
            facts.push(("target_budget", fact(json!(spend), "inferred", 0.5)));
        }
    }
    facts
}

#[async_trait]
impl Node for DiscoveryNode {
    fn name(&self) -> &str {
        "discovery"
    }

    fn description(&self) -> &str {
        "Collect known facts about the product and targets"
    }

    async fn execute(&self, mut state: ExecutionState, _ctx: &NodeContext) -> Result<ExecutionState> {
        let mut knowledge = object_field(&state, fields::KNOWLEDGE_FACTS);

        let inferred = inferred_facts(&state);
        let inferred_count = inferred
            .into_iter()
            .filter(|(key, candidate)| merge(&mut knowledge, key, candidate.clone()))
            .count();
        if inferred_count > 0 {
            state.push_message(format!(
                "Inferred {} facts from historical data",
                inferred_count
            ));
        } else {
            state.push_message("No facts inferred from historical data");
        }

        let user_inputs = object_field(&state, fields::USER_INPUTS);
        for (key, value) in &user_inputs {
            merge(&mut knowledge, key, fact(value.clone(), "user", 1.0));
        }

        let missing: Vec<&str> = CRITICAL_FACTS
            .iter()
            .copied()
            .filter(|k| {
                knowledge
                    .get(*k)
                    .is_none_or(|f| confidence(f) < CONFIDENCE_THRESHOLD)
            })
            .collect();
        if missing.is_empty() {
            state.push_message("All critical facts known");
        } else {
            state.push_message(format!("Missing critical facts: {}", missing.join(", ")));
        }

        state.push_message(format!("Total facts discovered: {}", knowledge.len()));
        state.set_field(fields::KNOWLEDGE_FACTS, Value::Object(knowledge));
        Ok(state)
    }
}
