pub mod config;
pub mod controller;
pub mod error;
pub mod failure;
pub mod identity;
pub mod ledger;
pub mod maintenance;
pub mod persistence;
pub mod progress;
pub mod ranges;
pub mod resume;
pub mod status;

pub use config::{LedgerConfig, LedgerConfigBuilder, ProgressThrottleConfig};
pub use controller::TransitionController;
pub use error::LedgerError;
pub use failure::{ErrorDescription, FailureKind};
pub use identity::generate_id;
pub use ledger::{
    ConnectionRecord, Ledger, MemoryLedger, ProgressWrite, SqliteLedger, TaskPatch, TaskRecord,
};
pub use persistence::{BreakpointStore, PersistenceType};
pub use progress::ProgressBuffer;
pub use resume::{ResumeDecision, RestartReason, decide_resume, restart_task};
pub use status::TaskStatus;
