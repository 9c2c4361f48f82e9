use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// What a task event carries to the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Progress,
    CheckpointQuestion,
    FinalResult,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Progress => "progress",
            EventKind::CheckpointQuestion => "checkpoint_question",
            EventKind::FinalResult => "final_result",
            EventKind::Error => "error",
        }
    }
}

/// Event emitted from the core to whatever transport is listening.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    pub kind: EventKind,
    pub payload: String,
}

/// Broadcast fan-out from task loops to transport subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// Send fails only when no subscriber exists, which is fine.
    pub fn emit(&self, task_id: &str, kind: EventKind, payload: impl Into<String>) {
        let event = TaskEvent {
            task_id: task_id.to_string(),
            kind,
            payload: payload.into(),
        };
        tracing::debug!("emit [{}] {}: {}", event.task_id, kind.as_str(), event.payload);
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
