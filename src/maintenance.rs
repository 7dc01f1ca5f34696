use crate::error::LedgerError;
use crate::ledger::Ledger;
use crate::ranges;
use log::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    /// Tasks whose breakpoint was dropped entirely.
    pub removed: Vec<u32>,
    /// Single-stream tasks that still carried range rows.
    pub pruned_connections: Vec<u32>,
}

/// 启动时清理无法续传的断点记录
pub async fn sweep(ledger: &dyn Ledger) -> Result<SweepReport, LedgerError> {
    let tasks = ledger.find_all().await?;
    let mut report = SweepReport {
        scanned: tasks.len(),
        ..Default::default()
    };

    for task in tasks {
        let connections = ledger.find_connections(task.id).await?;

        let problem = if task.status.is_terminal() {
            Some(format!("persisted as {}", task.status))
        } else if let Err(msg) = task.check_progress() {
            Some(msg)
        } else if task.is_split() {
            if connections.len() != task.connection_count as usize {
                Some(format!(
                    "expected {} ranges, found {}",
                    task.connection_count,
                    connections.len()
                ))
            } else {
                ranges::check_partition(&connections, task.total)
                    .err()
                    .map(|e| e.to_string())
            }
        } else {
            None
        };

        if let Some(problem) = problem {
            warn!("[Sweep] dropping task {}: {}", task.id, problem);
            ledger.remove(task.id).await?;
            report.removed.push(task.id);
        } else if !task.is_split() && !connections.is_empty() {
            warn!(
                "[Sweep] task {} is single-stream, dropping {} stale ranges",
                task.id,
                connections.len()
            );
            ledger.remove_connections(task.id).await?;
            report.pruned_connections.push(task.id);
        }
    }

    info!(
        "[Sweep] scanned {}, removed {}, pruned {}",
        report.scanned,
        report.removed.len(),
        report.pruned_connections.len()
    );
    Ok(report)
}
