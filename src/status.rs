use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a persisted download task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Connected,
    Progress,
    Retry,
    Error,
    Paused,
    Completed,
}

impl TaskStatus {
    /// Completed 是终态，记录随之删除
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed)
    }

    /// States a stored record may hold; `Completed` is never persisted.
    pub fn is_storable(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Connected => "Connected",
            TaskStatus::Progress => "Progress",
            TaskStatus::Retry => "Retry",
            TaskStatus::Error => "Error",
            TaskStatus::Paused => "Paused",
            TaskStatus::Completed => "Completed",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for TaskStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(TaskStatus::Pending),
            "Connected" => Ok(TaskStatus::Connected),
            "Progress" => Ok(TaskStatus::Progress),
            "Retry" => Ok(TaskStatus::Retry),
            "Error" => Ok(TaskStatus::Error),
            "Paused" => Ok(TaskStatus::Paused),
            "Completed" => Ok(TaskStatus::Completed),
            _ => Err(()),
        }
    }
}
