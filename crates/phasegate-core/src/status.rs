use serde::{Deserialize, Serialize};

/// Overall status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkItemStatus {
    /// Submitted, scheduler not started yet.
    Pending,
    /// A phase is executing or about to.
    Running,
    /// Halted by a gate or by retry exhaustion; awaits an explicit restart.
    Blocked,
    /// Every phase passed.
    Completed,
    /// Cancelled by an operator.
    Cancelled,
}

impl WorkItemStatus {
    /// `Completed` and `Cancelled` never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkItemStatus::Completed | WorkItemStatus::Cancelled)
    }

    /// Terminal, or blocked waiting for an operator.
    pub fn is_settled(self) -> bool {
        self.is_terminal() || self == WorkItemStatus::Blocked
    }
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkItemStatus::Pending => write!(f, "PENDING"),
            WorkItemStatus::Running => write!(f, "RUNNING"),
            WorkItemStatus::Blocked => write!(f, "BLOCKED"),
            WorkItemStatus::Completed => write!(f, "COMPLETED"),
            WorkItemStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}
