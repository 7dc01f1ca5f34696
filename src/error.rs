use crate::config::LedgerConfigError;
use crate::status::TaskStatus;
use std::io;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LedgerError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Store operation {operation} timed out after {after_ms}ms")]
    Timeout {
        operation: &'static str,
        after_ms: u64,
    },

    #[error("Task {0} not found")]
    MissingTask(u32),

    #[error("Connection {index} of task {task_id} not found")]
    MissingConnection { task_id: u32, index: u32 },

    #[error("Consistency violation: {0}")]
    Consistency(String),

    #[error("Task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: u32,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    /// 底层存储失败（含超时），调用方可据此将任务视为本次会话不可续传
    pub fn is_store_failure(&self) -> bool {
        matches!(self, LedgerError::Store(_) | LedgerError::Timeout { .. })
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Store(err.to_string())
    }
}

impl From<io::Error> for LedgerError {
    fn from(err: io::Error) -> Self {
        LedgerError::Store(err.to_string())
    }
}

impl From<LedgerConfigError> for LedgerError {
    fn from(err: LedgerConfigError) -> Self {
        LedgerError::Config(err.to_string())
    }
}
