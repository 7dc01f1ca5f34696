use crate::error::LedgerError;
use crate::ledger::models::{ConnectionRecord, ProgressWrite, TaskPatch, TaskRecord};
use async_trait::async_trait;

/// Durable record set for resumable tasks and their byte ranges.
///
/// Every call touching one task id is atomic with respect to other calls on
/// that id. Absence is reported as `None` / an empty `Vec`, never as an error.
#[async_trait]
pub trait Ledger: Send + Sync {
    // ---------------- Task ----------------
    async fn find(&self, id: u32) -> Result<Option<TaskRecord>, LedgerError>;
    async fn find_all(&self) -> Result<Vec<TaskRecord>, LedgerError>;

    /// Creates or overwrites the full record.
    async fn insert(&self, record: &TaskRecord) -> Result<(), LedgerError>;

    /// Overwrites an existing record; returns `false` when there was none to
    /// overwrite (the task completed or was removed meanwhile).
    async fn update(&self, record: &TaskRecord) -> Result<bool, LedgerError>;

    /// Same as calling [`Ledger::update`] for each record in order, committed
    /// as one durable operation. Returns how many records were overwritten.
    async fn update_batch(&self, records: &[TaskRecord]) -> Result<usize, LedgerError>;

    /// Deletes the record together with its connection ranges.
    async fn remove(&self, id: u32) -> Result<bool, LedgerError>;
    async fn clear(&self) -> Result<(), LedgerError>;

    /// Writes the patched columns of one record in a single atomic step.
    /// Returns `false` when no record exists for `id`.
    async fn apply(&self, id: u32, patch: &TaskPatch) -> Result<bool, LedgerError>;

    /// Hot path: writes `so_far` only. Fails if it would exceed a known total.
    async fn write_progress(&self, id: u32, so_far: u64) -> Result<bool, LedgerError>;

    /// Commits buffered progress as one durable operation, touching `so_far`
    /// only. A write is skipped when its task is gone, its etag or total no
    /// longer match the stored record, or the stored `so_far` is already
    /// ahead. Returns how many writes landed.
    async fn write_progress_batch(&self, writes: &[ProgressWrite]) -> Result<usize, LedgerError>;

    /// Sets `connection_count` after checking it against the stored ranges in
    /// the same atomic step. Returns `false` when no record exists for `id`.
    async fn set_connection_count(&self, id: u32, count: u32) -> Result<bool, LedgerError>;

    // ---------------- Connection ----------------
    async fn find_connections(&self, task_id: u32) -> Result<Vec<ConnectionRecord>, LedgerError>;
    async fn remove_connections(&self, task_id: u32) -> Result<(), LedgerError>;
    async fn insert_connection(&self, record: &ConnectionRecord) -> Result<(), LedgerError>;

    /// Stores a complete range set for an unsplit task and sets its
    /// `connection_count` to `ranges.len()`, all or nothing.
    async fn insert_connections(
        &self,
        task_id: u32,
        ranges: &[ConnectionRecord],
    ) -> Result<(), LedgerError>;

    /// Hot path: advances one range's progress pointer.
    async fn update_connection(
        &self,
        task_id: u32,
        index: u32,
        current_offset: u64,
    ) -> Result<(), LedgerError>;

    /// Releases the backing store. The ledger must not be used afterwards.
    async fn close(&self) {}
}

/// Rejects records that must never be persisted.
pub(crate) fn check_record(record: &TaskRecord) -> Result<(), LedgerError> {
    if !record.status.is_storable() {
        return Err(LedgerError::Consistency(format!(
            "task {} cannot be stored with status {}",
            record.id, record.status
        )));
    }
    record.check_progress().map_err(LedgerError::Consistency)
}

pub(crate) fn check_patch(id: u32, patch: &TaskPatch) -> Result<(), LedgerError> {
    if let Some(status) = patch.status {
        if !status.is_storable() {
            return Err(LedgerError::Consistency(format!(
                "task {} cannot be stored with status {}",
                id, status
            )));
        }
    }
    Ok(())
}

pub(crate) fn check_connection(record: &ConnectionRecord) -> Result<(), LedgerError> {
    record.check_offsets().map_err(LedgerError::Consistency)
}

/// A count of 0 or 1 needs no stored ranges. A larger count needs none yet
/// or exactly `count`.
pub(crate) fn check_connection_count(
    id: u32,
    count: u32,
    stored: usize,
) -> Result<(), LedgerError> {
    let consistent = if count <= 1 {
        stored == 0
    } else {
        stored == 0 || stored == count as usize
    };
    if consistent {
        Ok(())
    } else {
        Err(LedgerError::Consistency(format!(
            "task {} connection count {} disagrees with {} stored ranges",
            id, count, stored
        )))
    }
}

/// Per-row checks for a range set handed to `insert_connections`. The
/// partition itself is checked against the stored total by the backend.
pub(crate) fn check_range_set(task_id: u32, ranges: &[ConnectionRecord]) -> Result<(), LedgerError> {
    if ranges.len() < 2 {
        return Err(LedgerError::Consistency(format!(
            "task {} split needs at least two ranges, got {}",
            task_id,
            ranges.len()
        )));
    }
    for range in ranges {
        if range.task_id != task_id {
            return Err(LedgerError::Consistency(format!(
                "range {}/{} handed to task {}",
                range.task_id, range.index, task_id
            )));
        }
        check_connection(range)?;
    }
    Ok(())
}
