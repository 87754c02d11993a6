pub mod heuristic;
pub mod llm;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::types::ExecutionState;

pub use heuristic::HeuristicDecisionProvider;
pub use llm::LlmDecisionProvider;

/// What the branch node decided to do with this session.
///
/// Persisted as its plain label, so a label outside the known set survives a
/// checkpoint round trip as `Unrecognized` and keeps routing to the fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Decision {
    /// No usable project yet: collect context, build strategy and campaign.
    Initialize,
    /// Experiment results arrived: analyse performance and optimise.
    Reflect,
    /// Additional context data arrived: fold it into the strategy.
    Enrich,
    /// Pick up the current phase where it left off.
    Continue,
    Unrecognized(String),
}

impl Decision {
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "initialize" => Decision::Initialize,
            "reflect" => Decision::Reflect,
            "enrich" => Decision::Enrich,
            "continue" => Decision::Continue,
            _ => Decision::Unrecognized(label.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Decision::Initialize => "initialize",
            Decision::Reflect => "reflect",
            Decision::Enrich => "enrich",
            Decision::Continue => "continue",
            Decision::Unrecognized(label) => label,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, Decision::Unrecognized(_))
    }
}

impl From<String> for Decision {
    fn from(label: String) -> Self {
        Decision::parse(&label)
    }
}

impl From<Decision> for String {
    fn from(decision: Decision) -> Self {
        decision.as_str().to_string()
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decision plus the provider's rationale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub decision: Decision,
    pub reasoning: String,
}

/// A decision label outside the closed set. Recorded as a warning and routed
/// to the fallback node; never propagated as a failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("decision '{label}' has no route; falling back to '{fallback}'")]
pub struct RoutingError {
    pub label: String,
    pub fallback: String,
}

/// Pluggable capability consulted only by the graph's branch node.
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    /// Short identifier used in logs and audit messages.
    fn name(&self) -> &str;

    async fn decide(&self, state: &ExecutionState) -> Result<DecisionOutcome>;
}
