pub mod adjustment_node;
pub mod analyze_node;
pub mod campaign_node;
pub mod collection_node;
pub mod context_node;
pub mod discovery_node;
pub mod insight_node;
pub mod reflection_node;
pub mod router_node;
pub mod save_node;

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::decision::DecisionProvider;
use crate::engine::types::ExecutionState;
use crate::nodes::NodeRegistry;

/// Business field names shared by the campaign nodes.
pub mod fields {
    pub use crate::engine::graph::PHASE_FIELD as CURRENT_PHASE;
    pub use crate::engine::resume::{
        UPLOADED_FILES_FIELD as UPLOADED_FILES, USER_INPUTS_FIELD as USER_INPUTS,
    };

    pub const ITERATION: &str = "iteration";
    pub const FILE_ANALYSES: &str = "file_analyses";
    pub const KNOWLEDGE_FACTS: &str = "knowledge_facts";
    pub const HISTORICAL_DATA: &str = "historical_data";
    pub const MARKET_DATA: &str = "market_data";
    pub const CURRENT_STRATEGY: &str = "current_strategy";
    pub const EXPERIMENT_PLAN: &str = "experiment_plan";
    pub const CURRENT_CONFIG: &str = "current_config";
    pub const CONFIG_HISTORY: &str = "config_history";
    pub const EXPERIMENT_RESULTS: &str = "experiment_results";
    pub const BEST_PERFORMERS: &str = "best_performers";
    pub const PATCH_HISTORY: &str = "patch_history";
    pub const METRICS_TIMELINE: &str = "metrics_timeline";
    pub const THRESHOLD_STATUS: &str = "threshold_status";
}

/// Scratch keys. Only meaningful within a single run.
pub mod scratch {
    /// Raw CSV rows by file name.
    pub const FILE_ROWS: &str = "file_rows";
    pub const REFLECTION_ANALYSIS: &str = "reflection_analysis";
}

/// File types assigned by `analyze_files`.
pub mod file_type {
    pub const HISTORICAL: &str = "historical";
    pub const EXPERIMENT_RESULTS: &str = "experiment_results";
    pub const ENRICHMENT: &str = "enrichment";
    pub const UNKNOWN: &str = "unknown";
}

/// Register every campaign node into the registry.
pub fn register_all(registry: &mut NodeRegistry, provider: Arc<dyn DecisionProvider>) {
    registry.register(Arc::new(context_node::LoadContextNode));
    registry.register(Arc::new(analyze_node::AnalyzeFilesNode));
    registry.register(Arc::new(router_node::RouterNode::new(provider)));
    registry.register(Arc::new(discovery_node::DiscoveryNode));
    registry.register(Arc::new(collection_node::DataCollectionNode));
    registry.register(Arc::new(insight_node::InsightNode));
    registry.register(Arc::new(campaign_node::CampaignSetupNode));
    registry.register(Arc::new(reflection_node::ReflectionNode));
    registry.register(Arc::new(adjustment_node::AdjustmentNode));
    registry.register(Arc::new(save_node::SaveNode));
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Copy of an object-valued business field, empty when missing.
pub(crate) fn object_field(state: &ExecutionState, key: &str) -> Map<String, Value> {
    match state.field(key) {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}

/// Copy of an array-valued business field, empty when missing.
pub(crate) fn array_field(state: &ExecutionState, key: &str) -> Vec<Value> {
    match state.field(key) {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    }
}

pub(crate) fn iteration(state: &ExecutionState) -> u64 {
    state
        .field(fields::ITERATION)
        .and_then(|v| v.as_u64())
        .unwrap_or(0)
}

/// File analyses of one type recorded this session.
pub(crate) fn analyses_of_type(state: &ExecutionState, kind: &str) -> Vec<Value> {
    array_field(state, fields::FILE_ANALYSES)
        .into_iter()
        .filter(|fa| fa.get("type").and_then(|t| t.as_str()) == Some(kind))
        .collect()
}

/// Numeric reading of a JSON value, accepting numeric strings.
pub(crate) fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_start_matches('$').parse().ok(),
        _ => None,
    }
}

/// JSON number rounded to four decimals; non-finite values become null.
pub(crate) fn number(value: f64) -> Value {
    let rounded = (value * 10_000.0).round() / 10_000.0;
    serde_json::Number::from_f64(rounded)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// A user-supplied number from `user_inputs`, falling back to a discovered fact.
pub(crate) fn target_value(state: &ExecutionState, key: &str) -> Option<f64> {
    object_field(state, fields::USER_INPUTS)
        .get(key)
        .and_then(as_f64)
        .or_else(|| {
            object_field(state, fields::KNOWLEDGE_FACTS)
                .get(key)
                .and_then(|fact| fact.get("value"))
                .and_then(as_f64)
        })
}
