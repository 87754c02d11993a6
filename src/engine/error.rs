use thiserror::Error;

use crate::engine::types::ExecutionState;

/// Why a call to [`crate::engine::WorkflowEngine::start`] did not reach the
/// terminal node.
///
/// Every variant raised mid-run carries the state as it stood when the run
/// stopped, so drivers can report `messages`/`errors` without reloading.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A handler failed or exceeded its node timeout. The run is marked
    /// `failed` and resumes at this node on the next start.
    #[error("node '{node}' failed: {message}")]
    NodeExecution {
        node: String,
        message: String,
        state: Box<ExecutionState>,
    },

    /// A handler returned a state that breaks an engine invariant.
    #[error("node '{node}' returned an invalid state: {message}")]
    Validation {
        node: String,
        message: String,
        state: Box<ExecutionState>,
    },

    /// Loading or writing a checkpoint failed. Nothing partial is visible to
    /// later reads; `state` is the in-memory state when one exists.
    #[error("persistence failure: {message}")]
    Persistence {
        message: String,
        state: Option<Box<ExecutionState>>,
    },

    /// The caller cancelled while `node` was running. Nothing was committed.
    #[error("run cancelled while node '{node}' was running")]
    Cancelled {
        node: String,
        state: Box<ExecutionState>,
    },

    /// The caller's deadline elapsed while `node` was running.
    #[error("deadline exceeded while node '{node}' was running")]
    DeadlineExceeded {
        node: String,
        state: Box<ExecutionState>,
    },

    #[error("run '{0}' is already executing")]
    RunActive(String),

    #[error("invalid graph: {0}")]
    Graph(String),
}

impl EngineError {
    pub fn persistence(err: anyhow::Error, state: Option<&ExecutionState>) -> Self {
        EngineError::Persistence {
            message: format!("{:#}", err),
            state: state.map(|s| Box::new(s.clone())),
        }
    }

    /// Node that was running when the run stopped, if any.
    pub fn failed_node(&self) -> Option<&str> {
        match self {
            EngineError::NodeExecution { node, .. }
            | EngineError::Validation { node, .. }
            | EngineError::Cancelled { node, .. }
            | EngineError::DeadlineExceeded { node, .. } => Some(node),
            _ => None,
        }
    }

    pub fn state(&self) -> Option<&ExecutionState> {
        match self {
            EngineError::NodeExecution { state, .. }
            | EngineError::Validation { state, .. }
            | EngineError::Cancelled { state, .. }
            | EngineError::DeadlineExceeded { state, .. } => Some(state),
            EngineError::Persistence { state, .. } => state.as_deref(),
            _ => None,
        }
    }

    /// Whether starting the same run key again picks up from the last good
    /// checkpoint.
    pub fn is_resumable(&self) -> bool {
        !matches!(self, EngineError::Graph(_) | EngineError::RunActive(_))
    }
}
