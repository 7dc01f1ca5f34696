//! Decides, at task start, whether a stored breakpoint can be resumed.

use crate::controller::TransitionController;
use crate::error::LedgerError;
use crate::ledger::{ConnectionRecord, Ledger, TaskRecord};
use crate::ranges;
use log::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartReason {
    /// The remote resource is no longer the version the offsets belong to.
    EtagChanged {
        stored: Option<String>,
        remote: String,
    },
    /// The stored range set does not partition the file.
    BrokenRanges(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeDecision {
    /// No breakpoint: start from byte 0.
    Fresh,
    /// Continue from the stored `so_far` (single stream) or ranges (split).
    Resume {
        task: TaskRecord,
        connections: Vec<ConnectionRecord>,
    },
    /// A breakpoint exists but must not be used.
    Restart {
        task: TaskRecord,
        reason: RestartReason,
    },
}

/// `remote_etag` is the identity the server reports now, when known.
pub async fn decide_resume(
    ledger: &dyn Ledger,
    id: u32,
    remote_etag: Option<&str>,
) -> Result<ResumeDecision, LedgerError> {
    let Some(task) = ledger.find(id).await? else {
        debug!("[Resume] task {} has no breakpoint", id);
        return Ok(ResumeDecision::Fresh);
    };

    if let Some(remote) = remote_etag {
        if task.etag.as_deref() != Some(remote) {
            warn!(
                "[Resume] task {} etag changed {:?} -> {}",
                id, task.etag, remote
            );
            let reason = RestartReason::EtagChanged {
                stored: task.etag.clone(),
                remote: remote.to_string(),
            };
            return Ok(ResumeDecision::Restart { task, reason });
        }
    }

    let connections = ledger.find_connections(id).await?;
    let ranges_ok = if task.is_split() {
        if connections.len() != task.connection_count as usize {
            Err(format!(
                "expected {} ranges, found {}",
                task.connection_count,
                connections.len()
            ))
        } else {
            ranges::check_partition(&connections, task.total).map_err(|e| e.to_string())
        }
    } else if !connections.is_empty() {
        Err(format!(
            "single-stream task carries {} ranges",
            connections.len()
        ))
    } else {
        Ok(())
    };

    match ranges_ok {
        Ok(()) => {
            debug!(
                "[Resume] task {} resumes at {} with {} ranges",
                id,
                task.so_far,
                connections.len()
            );
            Ok(ResumeDecision::Resume { task, connections })
        }
        Err(msg) => {
            warn!("[Resume] task {} ranges unusable: {}", id, msg);
            Ok(ResumeDecision::Restart {
                task,
                reason: RestartReason::BrokenRanges(msg),
            })
        }
    }
}

/// Clears a breakpoint that cannot be resumed so the task restarts at 0
/// against `new_etag`.
pub async fn restart_task(
    ledger: &dyn Ledger,
    task: &mut TaskRecord,
    new_etag: &str,
) -> Result<(), LedgerError> {
    ledger.update_old_etag_overdue(task, new_etag).await?;
    ledger.remove_connections(task.id).await
}
