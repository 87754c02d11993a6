use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use super::{array_field, as_f64, fields, file_type, iteration, object_field};
use crate::engine::types::ExecutionState;
use crate::nodes::{Node, NodeContext};

/// Phase recorded once data collection has run.
pub const DATA_COLLECTED: &str = "data_collected";

/// Folds this session's analysed files into the durable project data:
/// historical metadata, experiment results and enrichment sources.
pub struct DataCollectionNode;

#[async_trait]
impl Node for DataCollectionNode {
    fn name(&self) -> &str {
        "data_collection"
    }

    fn description(&self) -> &str {
        "Merge analysed files into historical, experiment and market data"
    }

    async fn execute(&self, mut state: ExecutionState, _ctx: &NodeContext) -> Result<ExecutionState> {
        let mut historical = object_field(&state, fields::HISTORICAL_DATA);
        let mut market = object_field(&state, fields::MARKET_DATA);
        let mut experiments = array_field(&state, fields::EXPERIMENT_RESULTS);
        let next_iteration = iteration(&state) + 1;

        for analysis in array_field(&state, fields::FILE_ANALYSES) {
            let name = analysis.get("file_name").cloned().unwrap_or(Value::Null);
            let rows = analysis.get("row_count").and_then(as_f64).unwrap_or(0.0) as u64;
            let metrics = analysis.get("metrics").cloned().unwrap_or_else(|| json!({}));

            match analysis.get("type").and_then(|t| t.as_str()) {
                Some(file_type::HISTORICAL) => {
                    let meta = historical.entry("metadata").or_insert(Value::Null);
                    if !meta.is_object() {
                        *meta = json!({ "file_count": 0, "total_rows": 0, "files": [] });
                    }
                    let file_count = meta["file_count"].as_u64().unwrap_or(0) + 1;
                    let total_rows = meta["total_rows"].as_u64().unwrap_or(0) + rows;
                    meta["file_count"] = json!(file_count);
                    meta["total_rows"] = json!(total_rows);
                    if let Some(files) = meta["files"].as_array_mut() {
                        files.push(json!({ "file_name": name, "rows": rows }));
                    }
                    historical.insert("latest_metrics".into(), metrics);
                }
                Some(file_type::EXPERIMENT_RESULTS) => {
                    experiments.push(json!({
                        "iteration": next_iteration,
                        "file_name": name,
                        "metrics": metrics,
                    }));
                }
                Some(file_type::ENRICHMENT) => {
                    let sources = market
                        .entry("enrichment_metadata")
                        .or_insert_with(|| json!([]));
                    if let Some(list) = sources.as_array_mut() {
                        list.push(json!({
                            "file_name": name,
                            "rows": rows,
                            "columns": analysis.get("columns").cloned().unwrap_or(Value::Null),
                        }));
                    }
                }
                _ => {}
            }
        }

        let user_inputs = object_field(&state, fields::USER_INPUTS);
        if !user_inputs.contains_key("product_description") {
            state.push_message("Note: Product description not provided");
        }
        if !user_inputs.contains_key("target_budget") {
            state.push_message("Note: Target budget not provided");
        }

        state.set_field(fields::HISTORICAL_DATA, Value::Object(historical));
        state.set_field(fields::MARKET_DATA, Value::Object(market));
        state.set_field(fields::EXPERIMENT_RESULTS, Value::Array(experiments));
        state.set_field(fields::CURRENT_PHASE, Value::String(DATA_COLLECTED.into()));
        state.push_message("Data collection complete");
        Ok(state)
    }
}
