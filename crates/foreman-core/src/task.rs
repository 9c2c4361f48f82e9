use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Model capability class. Fast is the cheap/classification-oriented tier,
/// Deep the capable/execution-oriented one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Fast,
    Deep,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Fast => "fast",
            Tier::Deep => "deep",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "fast" => Some(Self::Fast),
            "deep" => Some(Self::Deep),
            _ => None,
        }
    }
}

/// Lifecycle state of a task. Every terminal and non-terminal state is
/// reachable only through a transition listed in `can_transition_to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    CheckpointWait,
    Completed,
    AbortedBudget,
    AbortedSteps,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::CheckpointWait => "checkpoint_wait",
            TaskStatus::Completed => "completed",
            TaskStatus::AbortedBudget => "aborted_budget",
            TaskStatus::AbortedSteps => "aborted_steps",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "checkpoint_wait" => Some(Self::CheckpointWait),
            "completed" => Some(Self::Completed),
            "aborted_budget" => Some(Self::AbortedBudget),
            "aborted_steps" => Some(Self::AbortedSteps),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::AbortedBudget
                | TaskStatus::AbortedSteps
                | TaskStatus::Failed
                | TaskStatus::Cancelled
        )
    }

    /// Allowed state-machine edges. Cancellation is reachable from any
    /// non-terminal state.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match self {
            Pending => matches!(next, Running | Failed | Cancelled),
            Running => matches!(
                next,
                CheckpointWait | Completed | AbortedBudget | AbortedSteps | Failed | Cancelled
            ),
            CheckpointWait => matches!(next, Running | Cancelled | Failed),
            Completed | AbortedBudget | AbortedSteps | Failed | Cancelled => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid task transition: {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// One user-submitted job, owned exclusively by the orchestrator for its
/// lifetime and persisted to the record store for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub origin: String,
    pub description: String,
    pub status: TaskStatus,
    pub tier: Option<Tier>,
    /// Completed model-call steps.
    pub step: u32,
    /// Accumulated USD cost, mirrored from the ledger after each call.
    pub cost_usd: f64,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub outcome: Option<String>,
}

impl Task {
    pub fn new(description: &str, origin: &str) -> Self {
        Self {
            id: new_task_id(),
            origin: origin.to_string(),
            description: description.to_string(),
            status: TaskStatus::Pending,
            tier: None,
            step: 0,
            cost_usd: 0.0,
            created_at: Utc::now().to_rfc3339(),
            completed_at: None,
            outcome: None,
        }
    }

    /// Move to `next`, enforcing the transition table.
    pub fn advance(&mut self, next: TaskStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now().to_rfc3339());
        }
        Ok(())
    }
}

/// Time-derived unique task id: `t_YYYYMMDD_HHMMSS_xxxx`. The uuid suffix
/// keeps ids unique when tasks arrive within the same second.
pub fn new_task_id() -> String {
    let now = Utc::now();
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..4];
    format!("t_{}_{}", now.format("%Y%m%d_%H%M%S"), suffix)
}
