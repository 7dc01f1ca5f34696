use crate::identity;
use crate::status::TaskStatus;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 一个未完成下载任务的断点记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: u32,
    pub url: String,
    pub path: String,
    pub path_as_directory: bool,
    pub file_name: Option<String>,
    pub so_far: u64,
    pub total: Option<u64>,
    pub etag: Option<String>,
    pub status: TaskStatus,
    pub connection_count: u32,
    pub error_message: Option<String>,
}

impl TaskRecord {
    /// New pending record whose id is derived from `url` and `path`.
    pub fn new(url: impl Into<String>, path: impl Into<String>) -> Self {
        let url = url.into();
        let path = path.into();
        Self::with_id(identity::generate_id(&url, &path), url, path)
    }

    pub fn with_id(id: u32, url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            path: path.into(),
            path_as_directory: false,
            file_name: None,
            so_far: 0,
            total: None,
            etag: None,
            status: TaskStatus::Pending,
            connection_count: 1,
            error_message: None,
        }
    }

    pub fn path_as_directory(mut self, enable: bool) -> Self {
        self.path_as_directory = enable;
        self
    }

    pub fn is_split(&self) -> bool {
        self.connection_count > 1
    }

    /// Final on-disk location. `None` while a directory target still waits
    /// for the server to name the file.
    pub fn target_file_path(&self) -> Option<PathBuf> {
        if !self.path_as_directory {
            return Some(PathBuf::from(&self.path));
        }
        self.file_name
            .as_ref()
            .map(|name| Path::new(&self.path).join(name))
    }

    /// 下载过程中写入的临时文件
    pub fn temp_file_path(&self) -> Option<PathBuf> {
        self.target_file_path().map(|p| {
            let mut s = p.into_os_string();
            s.push(".temp");
            PathBuf::from(s)
        })
    }

    pub(crate) fn check_progress(&self) -> Result<(), String> {
        match self.total {
            Some(total) if self.so_far > total => Err(format!(
                "task {} so_far {} exceeds total {}",
                self.id, self.so_far, total
            )),
            _ => Ok(()),
        }
    }
}

/// One byte range `[start_offset, end_offset)` of a split task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub task_id: u32,
    pub index: u32,
    pub start_offset: u64,
    pub current_offset: u64,
    /// `None` 表示开放区间，读到服务器结束为止
    pub end_offset: Option<u64>,
}

impl ConnectionRecord {
    pub fn new(task_id: u32, index: u32, start_offset: u64, end_offset: Option<u64>) -> Self {
        Self {
            task_id,
            index,
            start_offset,
            current_offset: start_offset,
            end_offset,
        }
    }

    pub fn downloaded(&self) -> u64 {
        self.current_offset.saturating_sub(self.start_offset)
    }

    pub fn remaining(&self) -> Option<u64> {
        self.end_offset
            .map(|end| end.saturating_sub(self.current_offset))
    }

    pub fn is_finished(&self) -> bool {
        self.remaining() == Some(0)
    }

    /// Cheap per-row check of `start <= current <= end`.
    pub(crate) fn check_offsets(&self) -> Result<(), String> {
        if self.current_offset < self.start_offset {
            return Err(format!(
                "connection {}/{} current {} before start {}",
                self.task_id, self.index, self.current_offset, self.start_offset
            ));
        }
        if let Some(end) = self.end_offset {
            if self.start_offset > end || self.current_offset > end {
                return Err(format!(
                    "connection {}/{} offsets {}..{} exceed end {}",
                    self.task_id, self.index, self.start_offset, self.current_offset, end
                ));
            }
        }
        Ok(())
    }
}

/// 缓冲的进度写入，只携带 so_far 与其所属的资源版本
///
/// `total` and `etag` are the values the progress was measured against. A
/// write whose version no longer matches the stored record is skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressWrite {
    pub id: u32,
    pub so_far: u64,
    pub total: Option<u64>,
    pub etag: Option<String>,
}

impl From<&TaskRecord> for ProgressWrite {
    fn from(record: &TaskRecord) -> Self {
        Self {
            id: record.id,
            so_far: record.so_far,
            total: record.total,
            etag: record.etag.clone(),
        }
    }
}

impl ProgressWrite {
    pub(crate) fn check_progress(&self) -> Result<(), String> {
        match self.total {
            Some(total) if self.so_far > total => Err(format!(
                "task {} so_far {} exceeds total {}",
                self.id, self.so_far, total
            )),
            _ => Ok(()),
        }
    }

    /// Whether this write may land on `stored`: same resource version and
    /// not behind what is already persisted.
    pub(crate) fn applies_to(&self, stored: &TaskRecord) -> bool {
        stored.etag == self.etag && stored.total == self.total && stored.so_far <= self.so_far
    }
}

/// Columns written by a single transition. `None` leaves a column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub so_far: Option<u64>,
    pub total: Option<Option<u64>>,
    pub etag: Option<Option<String>>,
    pub file_name: Option<Option<String>>,
    pub error_message: Option<Option<String>>,
    pub connection_count: Option<u32>,
    /// 同一事务内删除该任务的全部分段
    pub drop_connections: bool,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        *self == TaskPatch::default()
    }

    /// Applies the patch to an in-memory record.
    pub fn apply_to(&self, record: &mut TaskRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(so_far) = self.so_far {
            record.so_far = so_far;
        }
        if let Some(total) = self.total {
            record.total = total;
        }
        if let Some(etag) = &self.etag {
            record.etag = etag.clone();
        }
        if let Some(file_name) = &self.file_name {
            record.file_name = file_name.clone();
        }
        if let Some(error_message) = &self.error_message {
            record.error_message = error_message.clone();
        }
        if let Some(count) = self.connection_count {
            record.connection_count = count;
        }
    }
}
