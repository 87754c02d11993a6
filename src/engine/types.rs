use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decision::Decision;

/// Durable domain data accumulated by node handlers. Opaque to the engine.
pub type BusinessFields = BTreeMap<String, serde_json::Value>;

/// Ephemeral data handed from one node to a later node of the same run.
/// Never part of a checkpoint.
pub type Scratch = BTreeMap<String, serde_json::Value>;

/// Coarse lifecycle stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl FlowStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    /// Staying `in_progress` between nodes is allowed.
    pub fn can_transition_to(self, next: FlowStatus) -> bool {
        use FlowStatus::*;
        matches!(
            (self, next),
            (NotStarted, InProgress)
                | (InProgress, InProgress)
                | (InProgress, Failed)
                | (InProgress, Completed)
                | (Failed, InProgress)
                | (Completed, InProgress)
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(FlowStatus::NotStarted),
            "in_progress" => Some(FlowStatus::InProgress),
            "completed" => Some(FlowStatus::Completed),
            "failed" => Some(FlowStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowStatus::NotStarted => write!(f, "not_started"),
            FlowStatus::InProgress => write!(f, "in_progress"),
            FlowStatus::Completed => write!(f, "completed"),
            FlowStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Inputs supplied by the caller when starting a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunInputs {
    /// Data files uploaded for this session.
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// Free-form user context (budget, product description, ...).
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl RunInputs {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.context.is_empty()
    }
}

/// The single value threaded through the graph.
///
/// Handlers receive it by value and hand back the updated state. It is
/// deliberately not `Serialize`: the only durable form is [`Checkpoint`],
/// which has no room for `scratch`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionState {
    pub run_key: String,
    pub session_id: String,
    pub session_num: u32,
    pub flow_status: FlowStatus,
    pub completed_nodes: Vec<String>,
    pub last_completed_node: Option<String>,
    pub current_executing_node: Option<String>,
    pub decision: Option<Decision>,
    pub decision_reasoning: Option<String>,
    pub business_fields: BusinessFields,
    pub messages: Vec<String>,
    pub errors: Vec<String>,
    pub scratch: Scratch,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Sequence number of the last checkpoint this state was written as.
    pub checkpoint_seq: u64,
}

impl ExecutionState {
    /// Fresh state for the first session of a run key.
    pub fn new(run_key: &str) -> Self {
        let now = Utc::now();
        Self {
            run_key: run_key.to_string(),
            session_id: Uuid::new_v4().to_string(),
            session_num: 1,
            flow_status: FlowStatus::NotStarted,
            completed_nodes: Vec::new(),
            last_completed_node: None,
            current_executing_node: None,
            decision: None,
            decision_reasoning: None,
            business_fields: BusinessFields::new(),
            messages: Vec::new(),
            errors: Vec::new(),
            scratch: Scratch::new(),
            started_at: now,
            updated_at: now,
            checkpoint_seq: 0,
        }
    }

    /// Rebuild a state from its latest checkpoint. Scratch starts empty.
    pub fn from_checkpoint(cp: Checkpoint) -> Self {
        Self {
            run_key: cp.run_key,
            session_id: cp.session_id,
            session_num: cp.session_num,
            flow_status: cp.flow_status,
            completed_nodes: cp.completed_nodes,
            last_completed_node: cp.last_completed_node,
            current_executing_node: cp.current_executing_node,
            decision: cp.decision,
            decision_reasoning: cp.decision_reasoning,
            business_fields: cp.business_fields,
            messages: cp.messages,
            errors: cp.errors,
            scratch: Scratch::new(),
            started_at: cp.started_at,
            updated_at: cp.saved_at,
            checkpoint_seq: cp.sequence,
        }
    }

    /// The durable subset of this state, stamped with the next sequence number.
    pub fn to_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            run_key: self.run_key.clone(),
            session_id: self.session_id.clone(),
            session_num: self.session_num,
            flow_status: self.flow_status,
            completed_nodes: self.completed_nodes.clone(),
            last_completed_node: self.last_completed_node.clone(),
            current_executing_node: self.current_executing_node.clone(),
            decision: self.decision.clone(),
            decision_reasoning: self.decision_reasoning.clone(),
            business_fields: self.business_fields.clone(),
            messages: self.messages.clone(),
            errors: self.errors.clone(),
            started_at: self.started_at,
            saved_at: Utc::now(),
            sequence: self.checkpoint_seq + 1,
        }
    }

    /// Clear every flow-control field while keeping business data.
    /// Used for force-restarts and for new sessions on a completed project.
    pub fn reset_flow(&mut self) {
        self.flow_status = FlowStatus::NotStarted;
        self.completed_nodes.clear();
        self.last_completed_node = None;
        self.current_executing_node = None;
        self.decision = None;
        self.decision_reasoning = None;
        self.scratch.clear();
    }

    /// Drop the messages and errors of earlier sessions.
    pub fn clear_logs(&mut self) {
        self.messages.clear();
        self.errors.clear();
    }

    /// Start a new session against the same run key. Logs start empty.
    pub fn begin_session(&mut self) {
        self.reset_flow();
        self.clear_logs();
        self.session_id = Uuid::new_v4().to_string();
        self.session_num += 1;
        self.started_at = Utc::now();
    }

    /// Move `flow_status`, refusing transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: FlowStatus) -> Result<(), String> {
        if !self.flow_status.can_transition_to(next) {
            return Err(format!(
                "illegal flow status transition {} -> {}",
                self.flow_status, next
            ));
        }
        self.flow_status = next;
        Ok(())
    }

    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.business_fields.get(key)
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.business_fields.get(key).and_then(|v| v.as_str())
    }

    pub fn set_field(&mut self, key: &str, value: serde_json::Value) {
        self.business_fields.insert(key.to_string(), value);
    }

    pub fn push_message(&mut self, msg: impl Into<String>) {
        self.messages.push(msg.into());
    }
}

/// Durable snapshot written after every node transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_key: String,
    pub session_id: String,
    pub session_num: u32,
    pub flow_status: FlowStatus,
    pub completed_nodes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_completed_node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_executing_node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_reasoning: Option<String>,
    #[serde(default)]
    pub business_fields: BusinessFields,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
    pub sequence: u64,
}

/// Long-term project record, written by the terminal node only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub run_key: String,
    pub session_id: String,
    pub session_num: u32,
    pub business_fields: BusinessFields,
    pub saved_at: DateTime<Utc>,
}

impl ProjectSnapshot {
    pub fn from_state(state: &ExecutionState) -> Self {
        Self {
            run_key: state.run_key.clone(),
            session_id: state.session_id.clone(),
            session_num: state.session_num,
            business_fields: state.business_fields.clone(),
            saved_at: Utc::now(),
        }
    }
}
