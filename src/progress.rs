use crate::config::ProgressThrottleConfig;
use crate::error::LedgerError;
use crate::ledger::{Ledger, ProgressWrite, TaskRecord};
use dashmap::DashMap;
use log::{debug, error, info};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::broadcast;

/// 缓存高频进度，按节流配置批量落盘
///
/// Only `so_far` is ever flushed. Status and every other column belong to the
/// transitions, so a late flush cannot undo a pause or an etag reset.
pub struct ProgressBuffer {
    throttle: ProgressThrottleConfig,
    pending: DashMap<u32, ProgressWrite>,
    /// Last `so_far` that reached the ledger, per task.
    flushed: DashMap<u32, u64>,
    /// Bytes of progress buffered since the last flush, across all tasks.
    buffered_bytes: AtomicU64,
    last_flush: Mutex<Instant>,
}

impl ProgressBuffer {
    pub fn new(throttle: ProgressThrottleConfig) -> Self {
        Self {
            throttle,
            pending: DashMap::new(),
            flushed: DashMap::new(),
            buffered_bytes: AtomicU64::new(0),
            last_flush: Mutex::new(Instant::now()),
        }
    }

    /// Buffers the latest snapshot of a task. Returns `true` when a flush is
    /// due, either by elapsed interval or by buffered byte volume.
    pub fn record(&self, snapshot: &TaskRecord) -> bool {
        let previous = self
            .pending
            .insert(snapshot.id, ProgressWrite::from(snapshot))
            .map(|w| w.so_far)
            .or_else(|| self.flushed.get(&snapshot.id).map(|v| *v))
            .unwrap_or(0);
        let delta = snapshot.so_far.saturating_sub(previous);
        let buffered = self.buffered_bytes.fetch_add(delta, Ordering::Relaxed) + delta;

        buffered >= self.throttle.threshold_bytes || self.interval_elapsed()
    }

    /// Forgets a buffered snapshot, e.g. once the task completed.
    pub fn discard(&self, id: u32) {
        self.pending.remove(&id);
        self.flushed.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn interval_elapsed(&self) -> bool {
        self.last_flush
            .lock()
            .map(|t| t.elapsed() >= self.throttle.interval())
            .unwrap_or(true)
    }

    /// Commits every buffered offset with one progress batch. Offsets of
    /// tasks that were removed, reset or moved ahead meanwhile are dropped.
    pub async fn flush(&self, ledger: &dyn Ledger) -> Result<usize, LedgerError> {
        let ids: Vec<u32> = self.pending.iter().map(|e| *e.key()).collect();
        let writes: Vec<ProgressWrite> = ids
            .iter()
            .filter_map(|id| self.pending.remove(id).map(|(_, r)| r))
            .collect();

        if let Ok(mut last) = self.last_flush.lock() {
            *last = Instant::now();
        }
        self.buffered_bytes.store(0, Ordering::Relaxed);

        if writes.is_empty() {
            return Ok(0);
        }

        match ledger.write_progress_batch(&writes).await {
            Ok(written) => {
                for write in &writes {
                    self.flushed.insert(write.id, write.so_far);
                }
                debug!(
                    "[Progress] flushed {} of {} buffered offsets",
                    written,
                    writes.len()
                );
                Ok(written)
            }
            Err(e) => {
                // 写入失败时放回缓冲，新快照优先
                for write in writes {
                    self.pending.entry(write.id).or_insert(write);
                }
                Err(e)
            }
        }
    }

    /// Periodic flusher; runs until `shutdown` fires, then flushes once more.
    pub async fn run_flusher(
        self: Arc<Self>,
        ledger: Arc<dyn Ledger>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(self.throttle.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush(ledger.as_ref()).await {
                        error!("[Progress] periodic flush failed: {}", e);
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        if let Err(e) = self.flush(ledger.as_ref()).await {
            error!("[Progress] final flush failed: {}", e);
        }
        info!("[Progress] flusher stopped");
    }
}
