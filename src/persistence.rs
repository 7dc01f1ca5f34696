use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::ledger::{Ledger, MemoryLedger, SqliteLedger, TaskRecord};
use crate::maintenance::{self, SweepReport};
use crate::progress::ProgressBuffer;
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PersistenceType {
    Memory,
    Sqlite(String),
}

/// Explicitly owned breakpoint store: one ledger backend plus the progress
/// buffer that batches hot-path writes into it.
pub struct BreakpointStore {
    ledger: Arc<dyn Ledger>,
    progress: Arc<ProgressBuffer>,
    config: Arc<LedgerConfig>,
}

impl BreakpointStore {
    pub async fn open(config: LedgerConfig) -> Result<Self, LedgerError> {
        config.validate()?;
        let ledger: Arc<dyn Ledger> = match &config.persistence_type {
            PersistenceType::Memory => Arc::new(MemoryLedger::new()),
            PersistenceType::Sqlite(path) => Arc::new(SqliteLedger::open(path, &config).await?),
        };
        info!(
            "[Store] opened {:?} breakpoint store",
            config.persistence_type
        );
        Ok(Self::with_ledger(ledger, config))
    }

    /// Wraps an already constructed backend.
    pub fn with_ledger(ledger: Arc<dyn Ledger>, config: LedgerConfig) -> Self {
        let progress = Arc::new(ProgressBuffer::new(config.progress_throttle.clone()));
        Self {
            ledger,
            progress,
            config: Arc::new(config),
        }
    }

    pub fn ledger(&self) -> Arc<dyn Ledger> {
        Arc::clone(&self.ledger)
    }

    pub fn progress(&self) -> Arc<ProgressBuffer> {
        Arc::clone(&self.progress)
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// 缓存进度，达到节流阈值时批量落盘
    pub async fn record_progress(&self, snapshot: &TaskRecord) -> Result<(), LedgerError> {
        if self.progress.record(snapshot) {
            self.progress.flush(self.ledger.as_ref()).await?;
        }
        Ok(())
    }

    pub async fn flush_progress(&self) -> Result<usize, LedgerError> {
        self.progress.flush(self.ledger.as_ref()).await
    }

    /// 启动时调用，清理无法续传的记录
    pub async fn sweep(&self) -> Result<SweepReport, LedgerError> {
        maintenance::sweep(self.ledger.as_ref()).await
    }

    /// Flushes buffered progress and releases the backend.
    pub async fn close(self) -> Result<(), LedgerError> {
        let flushed = self.flush_progress().await;
        self.ledger.close().await;
        info!("[Store] closed");
        flushed.map(|_| ())
    }
}

impl Clone for BreakpointStore {
    fn clone(&self) -> Self {
        Self {
            ledger: Arc::clone(&self.ledger),
            progress: Arc::clone(&self.progress),
            config: Arc::clone(&self.config),
        }
    }
}
