//! Named lifecycle transitions over a [`Ledger`].
//!
//! Each transition writes only the columns it owns, as one atomic step, and
//! updates the caller's snapshot once the write succeeded. The caller keeps
//! owning the snapshot; nothing here holds on to it.

use crate::error::LedgerError;
use crate::failure::ErrorDescription;
use crate::ledger::{Ledger, TaskPatch, TaskRecord};
use crate::ranges;
use crate::status::TaskStatus;
use async_trait::async_trait;
use log::{debug, info};

#[async_trait]
pub trait TransitionController: Ledger {
    /// Remote handshake confirmed length and identity.
    async fn update_connected(
        &self,
        model: &mut TaskRecord,
        total: Option<u64>,
        etag: Option<&str>,
        file_name: Option<&str>,
    ) -> Result<(), LedgerError>;

    /// 同步内存中的进度，只写 so_far，不改变状态
    async fn sync_progress_from_cache(&self, model: &TaskRecord) -> Result<(), LedgerError>;

    async fn update_error(
        &self,
        model: &mut TaskRecord,
        error: &ErrorDescription,
        so_far: u64,
    ) -> Result<(), LedgerError>;

    async fn update_retry(
        &self,
        model: &mut TaskRecord,
        error: &ErrorDescription,
    ) -> Result<(), LedgerError>;

    /// Terminal: the task record and its ranges are gone afterwards.
    async fn update_complete(&self, model: &mut TaskRecord, total: u64)
    -> Result<(), LedgerError>;

    async fn update_pause(&self, model: &mut TaskRecord, so_far: u64) -> Result<(), LedgerError>;

    async fn update_pending(&self, model: &mut TaskRecord) -> Result<(), LedgerError>;

    /// The remote resource changed: stored offsets are void. Persists the new
    /// etag, rewinds `so_far` to 0, forgets the total and drops every range of
    /// the task in the same step.
    async fn update_old_etag_overdue(
        &self,
        model: &mut TaskRecord,
        new_etag: &str,
    ) -> Result<(), LedgerError>;

    /// Records the number of parallel ranges. A count above 1 must match the
    /// stored ranges (or precede their insertion); 0 or 1 requires none. The
    /// check and the write are one atomic step in the backend.
    async fn update_connection_count(
        &self,
        model: &mut TaskRecord,
        count: u32,
    ) -> Result<(), LedgerError>;

    /// Splits a connected task into `count` ranges over `[0, total)` and
    /// records the count. Either every range and the count are stored, or
    /// nothing is.
    async fn split_connections(&self, model: &mut TaskRecord, count: u32)
    -> Result<(), LedgerError>;
}

fn ensure_live(model: &TaskRecord, to: TaskStatus) -> Result<(), LedgerError> {
    if model.status.is_terminal() {
        return Err(LedgerError::InvalidTransition {
            id: model.id,
            from: model.status,
            to,
        });
    }
    Ok(())
}

async fn commit<L: Ledger + ?Sized>(
    ledger: &L,
    model: &mut TaskRecord,
    patch: TaskPatch,
) -> Result<(), LedgerError> {
    ensure_live(model, patch.status.unwrap_or(model.status))?;

    let mut next = model.clone();
    patch.apply_to(&mut next);
    next.check_progress().map_err(LedgerError::Consistency)?;

    if !ledger.apply(model.id, &patch).await? {
        return Err(LedgerError::MissingTask(model.id));
    }
    debug!(
        "[Ledger] task {} {} -> {}",
        model.id, model.status, next.status
    );
    *model = next;
    Ok(())
}

#[async_trait]
impl<L: Ledger + ?Sized> TransitionController for L {
    async fn update_connected(
        &self,
        model: &mut TaskRecord,
        total: Option<u64>,
        etag: Option<&str>,
        file_name: Option<&str>,
    ) -> Result<(), LedgerError> {
        let patch = TaskPatch {
            status: Some(TaskStatus::Connected),
            total: Some(total),
            etag: Some(etag.map(str::to_string)),
            file_name: Some(file_name.map(str::to_string)),
            ..Default::default()
        };
        commit(self, model, patch).await
    }

    async fn sync_progress_from_cache(&self, model: &TaskRecord) -> Result<(), LedgerError> {
        model.check_progress().map_err(LedgerError::Consistency)?;
        if self.write_progress(model.id, model.so_far).await? {
            Ok(())
        } else {
            Err(LedgerError::MissingTask(model.id))
        }
    }

    async fn update_error(
        &self,
        model: &mut TaskRecord,
        error: &ErrorDescription,
        so_far: u64,
    ) -> Result<(), LedgerError> {
        let patch = TaskPatch {
            status: Some(TaskStatus::Error),
            so_far: Some(so_far),
            error_message: Some(Some(error.to_string())),
            ..Default::default()
        };
        commit(self, model, patch).await
    }

    async fn update_retry(
        &self,
        model: &mut TaskRecord,
        error: &ErrorDescription,
    ) -> Result<(), LedgerError> {
        let patch = TaskPatch {
            status: Some(TaskStatus::Retry),
            error_message: Some(Some(error.to_string())),
            ..Default::default()
        };
        commit(self, model, patch).await
    }

    async fn update_complete(
        &self,
        model: &mut TaskRecord,
        total: u64,
    ) -> Result<(), LedgerError> {
        let existed = self.remove(model.id).await?;
        model.total = Some(total);
        model.so_far = total;
        model.status = TaskStatus::Completed;
        info!(
            "[Ledger] task {} completed ({} bytes), breakpoint removed: {}",
            model.id, total, existed
        );
        Ok(())
    }

    async fn update_pause(&self, model: &mut TaskRecord, so_far: u64) -> Result<(), LedgerError> {
        let patch = TaskPatch {
            status: Some(TaskStatus::Paused),
            so_far: Some(so_far),
            ..Default::default()
        };
        commit(self, model, patch).await
    }

    async fn update_pending(&self, model: &mut TaskRecord) -> Result<(), LedgerError> {
        let patch = TaskPatch {
            status: Some(TaskStatus::Pending),
            ..Default::default()
        };
        commit(self, model, patch).await
    }

    async fn update_old_etag_overdue(
        &self,
        model: &mut TaskRecord,
        new_etag: &str,
    ) -> Result<(), LedgerError> {
        info!(
            "[Ledger] task {} etag {:?} overdue, restarting with {}",
            model.id, model.etag, new_etag
        );
        let patch = TaskPatch {
            so_far: Some(0),
            total: Some(None),
            etag: Some(Some(new_etag.to_string())),
            connection_count: Some(1),
            drop_connections: true,
            ..Default::default()
        };
        commit(self, model, patch).await
    }

    async fn update_connection_count(
        &self,
        model: &mut TaskRecord,
        count: u32,
    ) -> Result<(), LedgerError> {
        ensure_live(model, model.status)?;
        if !self.set_connection_count(model.id, count).await? {
            return Err(LedgerError::MissingTask(model.id));
        }
        debug!("[Ledger] task {} connection count {}", model.id, count);
        model.connection_count = count;
        Ok(())
    }

    async fn split_connections(
        &self,
        model: &mut TaskRecord,
        count: u32,
    ) -> Result<(), LedgerError> {
        ensure_live(model, model.status)?;
        let Some(total) = model.total else {
            return Err(LedgerError::Consistency(format!(
                "task {} cannot be split before its total is known",
                model.id
            )));
        };
        if count <= 1 {
            return self.update_connection_count(model, 1).await;
        }

        let planned = ranges::split_ranges(model.id, total, count)?;
        self.insert_connections(model.id, &planned).await?;
        model.connection_count = count;
        Ok(())
    }
}
