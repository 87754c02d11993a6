use serde::Serialize;

use crate::engine::types::FlowStatus;

/// Human-readable progress of a run, in execution order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted {
        run_key: String,
        session_num: u32,
        entry: String,
        mode: String,
    },
    NodeStarted {
        run_key: String,
        node: String,
        index: usize,
    },
    NodeCompleted {
        run_key: String,
        node: String,
        elapsed_ms: u64,
        last_message: Option<String>,
    },
    NodeFailed {
        run_key: String,
        node: String,
        error: String,
    },
    Routed {
        run_key: String,
        decision: String,
        next: String,
    },
    Message {
        run_key: String,
        text: String,
    },
    RunFinished {
        run_key: String,
        status: FlowStatus,
    },
}

/// Event bus using a tokio broadcast channel. Every subscriber sees every
/// event; publishing with no subscribers is a no-op.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<ProgressEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
