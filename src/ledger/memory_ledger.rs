use super::ledger::{
    Ledger, check_connection, check_connection_count, check_patch, check_range_set, check_record,
};
use crate::error::LedgerError;
use crate::ledger::models::{ConnectionRecord, ProgressWrite, TaskPatch, TaskRecord};
use crate::ranges;
use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;

/// Task record plus its ranges, kept sorted by index.
#[derive(Debug, Default)]
struct Slot {
    task: Option<TaskRecord>,
    connections: Vec<ConnectionRecord>,
}

/// In-process ledger. Each task id lives in one map entry, so all writes for
/// an id are serialized by that entry's shard lock while other ids proceed.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    slots: DashMap<u32, Slot>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    // ---------------- Task ----------------
    async fn find(&self, id: u32) -> Result<Option<TaskRecord>, LedgerError> {
        Ok(self.slots.get(&id).and_then(|slot| slot.task.clone()))
    }

    async fn find_all(&self) -> Result<Vec<TaskRecord>, LedgerError> {
        let mut tasks: Vec<TaskRecord> = self
            .slots
            .iter()
            .filter_map(|slot| slot.task.clone())
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn insert(&self, record: &TaskRecord) -> Result<(), LedgerError> {
        check_record(record)?;
        debug!("[MemoryLedger] insert task {}", record.id);
        self.slots.entry(record.id).or_default().task = Some(record.clone());
        Ok(())
    }

    async fn update(&self, record: &TaskRecord) -> Result<bool, LedgerError> {
        check_record(record)?;
        match self.slots.get_mut(&record.id) {
            Some(mut slot) if slot.task.is_some() => {
                slot.task = Some(record.clone());
                Ok(true)
            }
            _ => {
                debug!("[MemoryLedger] update skipped, task {} absent", record.id);
                Ok(false)
            }
        }
    }

    async fn update_batch(&self, records: &[TaskRecord]) -> Result<usize, LedgerError> {
        for record in records {
            check_record(record)?;
        }
        let mut updated = 0;
        for record in records {
            if self.update(record).await? {
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn remove(&self, id: u32) -> Result<bool, LedgerError> {
        let existed = self
            .slots
            .remove(&id)
            .is_some_and(|(_, slot)| slot.task.is_some());
        debug!("[MemoryLedger] remove task {} -> {}", id, existed);
        Ok(existed)
    }

    async fn clear(&self) -> Result<(), LedgerError> {
        self.slots.clear();
        Ok(())
    }

    async fn apply(&self, id: u32, patch: &TaskPatch) -> Result<bool, LedgerError> {
        check_patch(id, patch)?;
        let Some(mut slot) = self.slots.get_mut(&id) else {
            return Ok(false);
        };
        let Some(current) = slot.task.as_ref() else {
            return Ok(false);
        };

        let mut next = current.clone();
        patch.apply_to(&mut next);
        next.check_progress().map_err(LedgerError::Consistency)?;

        slot.task = Some(next);
        if patch.drop_connections {
            slot.connections.clear();
        }
        Ok(true)
    }

    async fn write_progress(&self, id: u32, so_far: u64) -> Result<bool, LedgerError> {
        let Some(mut slot) = self.slots.get_mut(&id) else {
            return Ok(false);
        };
        let Some(task) = slot.task.as_mut() else {
            return Ok(false);
        };
        if let Some(total) = task.total {
            if so_far > total {
                return Err(LedgerError::Consistency(format!(
                    "task {} so_far {} exceeds total {}",
                    id, so_far, total
                )));
            }
        }
        task.so_far = so_far;
        Ok(true)
    }

    async fn write_progress_batch(&self, writes: &[ProgressWrite]) -> Result<usize, LedgerError> {
        for write in writes {
            write.check_progress().map_err(LedgerError::Consistency)?;
        }

        let mut written = 0;
        for write in writes {
            let Some(mut slot) = self.slots.get_mut(&write.id) else {
                continue;
            };
            match slot.task.as_mut() {
                Some(task) if write.applies_to(task) => {
                    task.so_far = write.so_far;
                    written += 1;
                }
                _ => debug!("[MemoryLedger] stale progress for task {} skipped", write.id),
            }
        }
        Ok(written)
    }

    async fn set_connection_count(&self, id: u32, count: u32) -> Result<bool, LedgerError> {
        let Some(mut slot) = self.slots.get_mut(&id) else {
            return Ok(false);
        };
        check_connection_count(id, count, slot.connections.len())?;
        match slot.task.as_mut() {
            Some(task) => {
                task.connection_count = count;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ---------------- Connection ----------------
    async fn find_connections(&self, task_id: u32) -> Result<Vec<ConnectionRecord>, LedgerError> {
        Ok(self
            .slots
            .get(&task_id)
            .map(|slot| slot.connections.clone())
            .unwrap_or_default())
    }

    async fn remove_connections(&self, task_id: u32) -> Result<(), LedgerError> {
        if let Some(mut slot) = self.slots.get_mut(&task_id) {
            slot.connections.clear();
        }
        Ok(())
    }

    async fn insert_connection(&self, record: &ConnectionRecord) -> Result<(), LedgerError> {
        check_connection(record)?;
        let mut slot = match self.slots.get_mut(&record.task_id) {
            Some(slot) if slot.task.is_some() => slot,
            _ => return Err(LedgerError::MissingTask(record.task_id)),
        };

        match slot
            .connections
            .binary_search_by_key(&record.index, |c| c.index)
        {
            Ok(_) => Err(LedgerError::Consistency(format!(
                "connection {}/{} already exists",
                record.task_id, record.index
            ))),
            Err(pos) => {
                slot.connections.insert(pos, record.clone());
                Ok(())
            }
        }
    }

    async fn insert_connections(
        &self,
        task_id: u32,
        ranges: &[ConnectionRecord],
    ) -> Result<(), LedgerError> {
        check_range_set(task_id, ranges)?;
        let mut slot = match self.slots.get_mut(&task_id) {
            Some(slot) if slot.task.is_some() => slot,
            _ => return Err(LedgerError::MissingTask(task_id)),
        };
        if !slot.connections.is_empty() {
            return Err(LedgerError::Consistency(format!(
                "task {} is already split",
                task_id
            )));
        }
        let total = slot.task.as_ref().and_then(|t| t.total);
        ranges::check_partition(ranges, total)?;

        slot.connections = ranges.to_vec();
        if let Some(task) = slot.task.as_mut() {
            task.connection_count = ranges.len() as u32;
        }
        debug!(
            "[MemoryLedger] task {} split into {} ranges",
            task_id,
            ranges.len()
        );
        Ok(())
    }

    async fn update_connection(
        &self,
        task_id: u32,
        index: u32,
        current_offset: u64,
    ) -> Result<(), LedgerError> {
        let missing = LedgerError::MissingConnection { task_id, index };
        let Some(mut slot) = self.slots.get_mut(&task_id) else {
            return Err(missing);
        };
        let total = slot.task.as_ref().and_then(|t| t.total);
        let Ok(pos) = slot.connections.binary_search_by_key(&index, |c| c.index) else {
            return Err(missing);
        };

        let conn = &mut slot.connections[pos];
        let limit = conn.end_offset.or(total);
        if current_offset < conn.start_offset || limit.is_some_and(|end| current_offset > end) {
            return Err(LedgerError::Consistency(format!(
                "connection {}/{} offset {} outside [{}, {:?}]",
                task_id, index, current_offset, conn.start_offset, limit
            )));
        }
        conn.current_offset = current_offset;
        Ok(())
    }
}
