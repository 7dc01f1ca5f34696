use super::ledger::{
    Ledger, check_connection, check_connection_count, check_patch, check_range_set, check_record,
};
use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::ledger::models::{ConnectionRecord, ProgressWrite, TaskPatch, TaskRecord};
use crate::ranges;
use crate::status::TaskStatus;
use async_trait::async_trait;
use log::{debug, info, warn};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::fs;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

const TASK_COLUMNS: &str = "id, url, path, path_as_directory, file_name, so_far, total, etag, \
     status, connection_count, error_message";

const CONNECTION_COLUMNS: &str = r#"task_id, "index", start_offset, current_offset, end_offset"#;

pub struct SqliteLedger {
    pool: SqlitePool,
    operation_timeout: Duration,
}

impl SqliteLedger {
    /// 打开（必要时创建）数据库文件并建表
    pub async fn open(db_path: impl AsRef<Path>, config: &LedgerConfig) -> Result<Self, LedgerError> {
        let db_path = db_path.as_ref();
        let cwd = std::env::current_dir()?;
        let db_abs = if db_path.is_absolute() {
            db_path.to_path_buf()
        } else {
            cwd.join(db_path)
        };

        if let Some(parent) = db_abs.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    LedgerError::Store(format!("Failed to create directory {:?}: {}", parent, e))
                })?;
            }
        }

        let journal_mode = if config.wal {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };
        let options = SqliteConnectOptions::new()
            .filename(&db_abs)
            .create_if_missing(true)
            .journal_mode(journal_mode)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout());

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.operation_timeout())
            .connect_with(options)
            .await?;

        info!("[SqliteLedger] opened {}", db_abs.display());
        Self::with_pool(pool, config.operation_timeout()).await
    }

    /// In-memory database, gone once the ledger is closed.
    pub async fn in_memory() -> Result<Self, LedgerError> {
        let config = LedgerConfig::default();
        let options = "sqlite::memory:"
            .parse::<SqliteConnectOptions>()?
            .busy_timeout(config.busy_timeout());

        // 内存库只存在于单个连接上
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(config.operation_timeout())
            .connect_with(options)
            .await?;

        Self::with_pool(pool, config.operation_timeout()).await
    }

    async fn with_pool(pool: SqlitePool, operation_timeout: Duration) -> Result<Self, LedgerError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS breakpoint_tasks (
                id INTEGER PRIMARY KEY,
                url TEXT NOT NULL,
                path TEXT NOT NULL,
                path_as_directory INTEGER NOT NULL DEFAULT 0,
                file_name TEXT,
                so_far INTEGER NOT NULL DEFAULT 0,
                total INTEGER,
                etag TEXT,
                status TEXT NOT NULL,
                connection_count INTEGER NOT NULL DEFAULT 1,
                error_message TEXT,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS breakpoint_connections (
                task_id INTEGER NOT NULL,
                "index" INTEGER NOT NULL,
                start_offset INTEGER NOT NULL,
                current_offset INTEGER NOT NULL,
                end_offset INTEGER,                         -- NULL 表示开放区间
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (task_id, "index")
            );
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            operation_timeout,
        })
    }

    /// Runs one store call under the configured time bound.
    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, LedgerError>
    where
        F: Future<Output = Result<T, LedgerError>>,
    {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                let after_ms = self.operation_timeout.as_millis() as u64;
                warn!("[SqliteLedger] {} timed out after {}ms", operation, after_ms);
                Err(LedgerError::Timeout {
                    operation,
                    after_ms,
                })
            }
        }
    }

    async fn task_exists(&self, id: u32) -> Result<bool, LedgerError> {
        let row = sqlx::query("SELECT 1 FROM breakpoint_tasks WHERE id = ?1")
            .bind(i64::from(id))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

/// SQLite integers are signed: offsets above `i64::MAX` cannot be stored.
fn to_sql(value: u64) -> Result<i64, LedgerError> {
    i64::try_from(value).map_err(|_| {
        LedgerError::Consistency(format!("offset {} exceeds the store's integer range", value))
    })
}

fn opt_to_sql(value: Option<u64>) -> Result<Option<i64>, LedgerError> {
    value.map(to_sql).transpose()
}

fn from_sql(value: i64, column: &str) -> Result<u64, LedgerError> {
    u64::try_from(value)
        .map_err(|_| LedgerError::Store(format!("negative {} {} in ledger", column, value)))
}

fn id_from_sql(value: i64, column: &str) -> Result<u32, LedgerError> {
    u32::try_from(value)
        .map_err(|_| LedgerError::Store(format!("{} {} out of range in ledger", column, value)))
}

fn task_from_row(row: &SqliteRow) -> Result<TaskRecord, LedgerError> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<TaskStatus>()
        .map_err(|_| LedgerError::Store(format!("unknown status '{}' in ledger", status)))?;

    Ok(TaskRecord {
        id: id_from_sql(row.try_get("id")?, "id")?,
        url: row.try_get("url")?,
        path: row.try_get("path")?,
        path_as_directory: row.try_get::<i64, _>("path_as_directory")? != 0,
        file_name: row.try_get("file_name")?,
        so_far: from_sql(row.try_get("so_far")?, "so_far")?,
        total: row
            .try_get::<Option<i64>, _>("total")?
            .map(|v| from_sql(v, "total"))
            .transpose()?,
        etag: row.try_get("etag")?,
        status,
        connection_count: id_from_sql(row.try_get("connection_count")?, "connection_count")?,
        error_message: row.try_get("error_message")?,
    })
}

fn connection_from_row(row: &SqliteRow) -> Result<ConnectionRecord, LedgerError> {
    Ok(ConnectionRecord {
        task_id: id_from_sql(row.try_get("task_id")?, "task_id")?,
        index: id_from_sql(row.try_get("index")?, "index")?,
        start_offset: from_sql(row.try_get("start_offset")?, "start_offset")?,
        current_offset: from_sql(row.try_get("current_offset")?, "current_offset")?,
        end_offset: row
            .try_get::<Option<i64>, _>("end_offset")?
            .map(|v| from_sql(v, "end_offset"))
            .transpose()?,
    })
}

/// Value `total` will have after the patch: a bind or the stored column.
fn push_next_total(qb: &mut QueryBuilder<'_, Sqlite>, total: Option<Option<i64>>) {
    match total {
        Some(total) => {
            qb.push_bind(total);
        }
        None => {
            qb.push("total");
        }
    }
}

fn push_next_so_far(qb: &mut QueryBuilder<'_, Sqlite>, so_far: Option<i64>) {
    match so_far {
        Some(so_far) => {
            qb.push_bind(so_far);
        }
        None => {
            qb.push("so_far");
        }
    }
}

fn build_patch_query(id: u32, patch: &TaskPatch) -> Result<QueryBuilder<'static, Sqlite>, LedgerError> {
    let so_far = patch.so_far.map(to_sql).transpose()?;
    let total = patch.total.map(opt_to_sql).transpose()?;

    let mut qb: QueryBuilder<'static, Sqlite> = QueryBuilder::new("UPDATE breakpoint_tasks SET ");
    {
        let mut set = qb.separated(", ");
        if let Some(status) = patch.status {
            set.push("status = ").push_bind_unseparated(status.to_string());
        }
        if let Some(so_far) = so_far {
            set.push("so_far = ").push_bind_unseparated(so_far);
        }
        if let Some(total) = total {
            set.push("total = ").push_bind_unseparated(total);
        }
        if let Some(etag) = &patch.etag {
            set.push("etag = ").push_bind_unseparated(etag.clone());
        }
        if let Some(file_name) = &patch.file_name {
            set.push("file_name = ")
                .push_bind_unseparated(file_name.clone());
        }
        if let Some(error_message) = &patch.error_message {
            set.push("error_message = ")
                .push_bind_unseparated(error_message.clone());
        }
        if let Some(count) = patch.connection_count {
            set.push("connection_count = ")
                .push_bind_unseparated(i64::from(count));
        }
        set.push("updated_at = CURRENT_TIMESTAMP");
    }

    // so_far <= total 以写入后的值判断
    qb.push(" WHERE id = ").push_bind(i64::from(id));
    qb.push(" AND (");
    push_next_total(&mut qb, total);
    qb.push(" IS NULL OR ");
    push_next_so_far(&mut qb, so_far);
    qb.push(" <= ");
    push_next_total(&mut qb, total);
    qb.push(")");
    Ok(qb)
}

#[async_trait]
impl Ledger for SqliteLedger {
    // ---------------- Task ----------------
    async fn find(&self, id: u32) -> Result<Option<TaskRecord>, LedgerError> {
        self.bounded("find", async {
            let row = sqlx::query(&format!(
                "SELECT {} FROM breakpoint_tasks WHERE id = ?1",
                TASK_COLUMNS
            ))
            .bind(i64::from(id))
            .fetch_optional(&self.pool)
            .await?;

            row.as_ref().map(task_from_row).transpose()
        })
        .await
    }

    async fn find_all(&self) -> Result<Vec<TaskRecord>, LedgerError> {
        self.bounded("find_all", async {
            let rows = sqlx::query(&format!(
                "SELECT {} FROM breakpoint_tasks ORDER BY id",
                TASK_COLUMNS
            ))
            .fetch_all(&self.pool)
            .await?;

            rows.iter().map(task_from_row).collect::<Result<Vec<_>, LedgerError>>()
        })
        .await
    }

    async fn insert(&self, record: &TaskRecord) -> Result<(), LedgerError> {
        check_record(record)?;
        let so_far = to_sql(record.so_far)?;
        let total = opt_to_sql(record.total)?;
        self.bounded("insert", async {
            debug!("[SqliteLedger] insert task {}", record.id);
            sqlx::query(
                r#"
                INSERT INTO breakpoint_tasks
                    (id, url, path, path_as_directory, file_name, so_far, total, etag,
                     status, connection_count, error_message, updated_at)
                VALUES
                    (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, CURRENT_TIMESTAMP)
                ON CONFLICT(id) DO UPDATE SET
                    url=excluded.url,
                    path=excluded.path,
                    path_as_directory=excluded.path_as_directory,
                    file_name=excluded.file_name,
                    so_far=excluded.so_far,
                    total=excluded.total,
                    etag=excluded.etag,
                    status=excluded.status,
                    connection_count=excluded.connection_count,
                    error_message=excluded.error_message,
                    updated_at=CURRENT_TIMESTAMP
                "#,
            )
            .bind(i64::from(record.id))
            .bind(&record.url)
            .bind(&record.path)
            .bind(record.path_as_directory)
            .bind(&record.file_name)
            .bind(so_far)
            .bind(total)
            .bind(&record.etag)
            .bind(record.status.to_string())
            .bind(i64::from(record.connection_count))
            .bind(&record.error_message)
            .execute(&self.pool)
            .await?;
            Ok::<_, LedgerError>(())
        })
        .await
    }

    async fn update(&self, record: &TaskRecord) -> Result<bool, LedgerError> {
        self.update_batch(std::slice::from_ref(record))
            .await
            .map(|n| n > 0)
    }

    async fn update_batch(&self, records: &[TaskRecord]) -> Result<usize, LedgerError> {
        let mut offsets = Vec::with_capacity(records.len());
        for record in records {
            check_record(record)?;
            offsets.push((to_sql(record.so_far)?, opt_to_sql(record.total)?));
        }
        if records.is_empty() {
            return Ok(0);
        }

        self.bounded("update_batch", async {
            let mut tx = self.pool.begin().await?;
            let mut updated = 0;
            for (record, (so_far, total)) in records.iter().zip(offsets) {
                let result = sqlx::query(
                    r#"
                    UPDATE breakpoint_tasks SET
                        url=?2, path=?3, path_as_directory=?4, file_name=?5, so_far=?6,
                        total=?7, etag=?8, status=?9, connection_count=?10,
                        error_message=?11, updated_at=CURRENT_TIMESTAMP
                    WHERE id = ?1
                    "#,
                )
                .bind(i64::from(record.id))
                .bind(&record.url)
                .bind(&record.path)
                .bind(record.path_as_directory)
                .bind(&record.file_name)
                .bind(so_far)
                .bind(total)
                .bind(&record.etag)
                .bind(record.status.to_string())
                .bind(i64::from(record.connection_count))
                .bind(&record.error_message)
                .execute(&mut *tx)
                .await?;
                updated += result.rows_affected() as usize;
            }
            tx.commit().await?;
            debug!(
                "[SqliteLedger] batch update {} of {} tasks",
                updated,
                records.len()
            );
            Ok::<_, LedgerError>(updated)
        })
        .await
    }

    async fn remove(&self, id: u32) -> Result<bool, LedgerError> {
        self.bounded("remove", async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM breakpoint_connections WHERE task_id = ?1")
                .bind(i64::from(id))
                .execute(&mut *tx)
                .await?;
            let result = sqlx::query("DELETE FROM breakpoint_tasks WHERE id = ?1")
                .bind(i64::from(id))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            let existed = result.rows_affected() > 0;
            debug!("[SqliteLedger] remove task {} -> {}", id, existed);
            Ok::<_, LedgerError>(existed)
        })
        .await
    }

    async fn clear(&self) -> Result<(), LedgerError> {
        self.bounded("clear", async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM breakpoint_connections")
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM breakpoint_tasks")
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            info!("[SqliteLedger] cleared all records");
            Ok::<_, LedgerError>(())
        })
        .await
    }

    async fn apply(&self, id: u32, patch: &TaskPatch) -> Result<bool, LedgerError> {
        check_patch(id, patch)?;
        let mut query = build_patch_query(id, patch)?;
        self.bounded("apply", async {
            let mut tx = self.pool.begin().await?;
            let result = query
                .build()
                .execute(&mut *tx)
                .await?;

            if result.rows_affected() == 0 {
                tx.rollback().await?;
                return if self.task_exists(id).await? {
                    Err(LedgerError::Consistency(format!(
                        "patch on task {} would move so_far past total",
                        id
                    )))
                } else {
                    Ok(false)
                };
            }

            if patch.drop_connections {
                sqlx::query("DELETE FROM breakpoint_connections WHERE task_id = ?1")
                    .bind(i64::from(id))
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok::<_, LedgerError>(true)
        })
        .await
    }

    async fn write_progress(&self, id: u32, so_far: u64) -> Result<bool, LedgerError> {
        let offset = to_sql(so_far)?;
        self.bounded("write_progress", async {
            let result = sqlx::query(
                "UPDATE breakpoint_tasks SET so_far = ?2, updated_at = CURRENT_TIMESTAMP \
                 WHERE id = ?1 AND (total IS NULL OR ?2 <= total)",
            )
            .bind(i64::from(id))
            .bind(offset)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() > 0 {
                return Ok(true);
            }
            if self.task_exists(id).await? {
                Err(LedgerError::Consistency(format!(
                    "task {} so_far {} exceeds total",
                    id, so_far
                )))
            } else {
                Ok(false)
            }
        })
        .await
    }

    async fn write_progress_batch(&self, writes: &[ProgressWrite]) -> Result<usize, LedgerError> {
        let mut binds = Vec::with_capacity(writes.len());
        for write in writes {
            write.check_progress().map_err(LedgerError::Consistency)?;
            binds.push((i64::from(write.id), to_sql(write.so_far)?, opt_to_sql(write.total)?));
        }
        if writes.is_empty() {
            return Ok(0);
        }

        self.bounded("write_progress_batch", async {
            let mut tx = self.pool.begin().await?;
            let mut written = 0;
            // 版本不符或已有更新进度的写入直接跳过
            for (write, (id, so_far, total)) in writes.iter().zip(binds) {
                let result = sqlx::query(
                    r#"
                    UPDATE breakpoint_tasks
                    SET so_far = ?2, updated_at = CURRENT_TIMESTAMP
                    WHERE id = ?1 AND etag IS ?3 AND total IS ?4 AND so_far <= ?2
                    "#,
                )
                .bind(id)
                .bind(so_far)
                .bind(&write.etag)
                .bind(total)
                .execute(&mut *tx)
                .await?;
                written += result.rows_affected() as usize;
            }
            tx.commit().await?;
            debug!(
                "[SqliteLedger] progress batch wrote {} of {}",
                written,
                writes.len()
            );
            Ok::<_, LedgerError>(written)
        })
        .await
    }

    async fn set_connection_count(&self, id: u32, count: u32) -> Result<bool, LedgerError> {
        self.bounded("set_connection_count", async {
            let result = sqlx::query(
                r#"
                UPDATE breakpoint_tasks
                SET connection_count = ?2, updated_at = CURRENT_TIMESTAMP
                WHERE id = ?1
                  AND (SELECT COUNT(*) FROM breakpoint_connections WHERE task_id = ?1)
                      IN (0, CASE WHEN ?2 > 1 THEN ?2 ELSE 0 END)
                "#,
            )
            .bind(i64::from(id))
            .bind(i64::from(count))
            .execute(&self.pool)
            .await?;

            if result.rows_affected() > 0 {
                return Ok(true);
            }
            if !self.task_exists(id).await? {
                return Ok(false);
            }
            let stored: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM breakpoint_connections WHERE task_id = ?1",
            )
            .bind(i64::from(id))
            .fetch_one(&self.pool)
            .await?;
            check_connection_count(id, count, stored as usize)?;
            // ranges changed between the two statements
            Err(LedgerError::Consistency(format!(
                "task {} ranges changed while setting count {}",
                id, count
            )))
        })
        .await
    }

    // ---------------- Connection ----------------
    async fn find_connections(&self, task_id: u32) -> Result<Vec<ConnectionRecord>, LedgerError> {
        self.bounded("find_connections", async {
            let rows = sqlx::query(&format!(
                r#"SELECT {} FROM breakpoint_connections WHERE task_id = ?1 ORDER BY "index""#,
                CONNECTION_COLUMNS
            ))
            .bind(i64::from(task_id))
            .fetch_all(&self.pool)
            .await?;

            rows.iter().map(connection_from_row).collect::<Result<Vec<_>, LedgerError>>()
        })
        .await
    }

    async fn remove_connections(&self, task_id: u32) -> Result<(), LedgerError> {
        self.bounded("remove_connections", async {
            let result = sqlx::query("DELETE FROM breakpoint_connections WHERE task_id = ?1")
                .bind(i64::from(task_id))
                .execute(&self.pool)
                .await?;
            debug!(
                "[SqliteLedger] removed {} connections of task {}",
                result.rows_affected(),
                task_id
            );
            Ok::<_, LedgerError>(())
        })
        .await
    }

    async fn insert_connection(&self, record: &ConnectionRecord) -> Result<(), LedgerError> {
        check_connection(record)?;
        let start = to_sql(record.start_offset)?;
        let current = to_sql(record.current_offset)?;
        let end = opt_to_sql(record.end_offset)?;
        self.bounded("insert_connection", async {
            let result = sqlx::query(
                r#"
                INSERT INTO breakpoint_connections
                    (task_id, "index", start_offset, current_offset, end_offset, updated_at)
                SELECT ?1, ?2, ?3, ?4, ?5, CURRENT_TIMESTAMP
                WHERE EXISTS (SELECT 1 FROM breakpoint_tasks WHERE id = ?1)
                "#,
            )
            .bind(i64::from(record.task_id))
            .bind(i64::from(record.index))
            .bind(start)
            .bind(current)
            .bind(end)
            .execute(&self.pool)
            .await;

            match result {
                Ok(r) if r.rows_affected() == 0 => Err(LedgerError::MissingTask(record.task_id)),
                Ok(_) => Ok(()),
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                    Err(LedgerError::Consistency(format!(
                        "connection {}/{} already exists",
                        record.task_id, record.index
                    )))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn insert_connections(
        &self,
        task_id: u32,
        ranges: &[ConnectionRecord],
    ) -> Result<(), LedgerError> {
        check_range_set(task_id, ranges)?;
        let mut binds = Vec::with_capacity(ranges.len());
        for range in ranges {
            binds.push((
                i64::from(range.index),
                to_sql(range.start_offset)?,
                to_sql(range.current_offset)?,
                opt_to_sql(range.end_offset)?,
            ));
        }

        self.bounded("insert_connections", async {
            let mut tx = self.pool.begin().await?;
            // 先写任务行以取得写锁，同时确认尚未分段
            let row = sqlx::query(
                r#"
                UPDATE breakpoint_tasks
                SET connection_count = ?2, updated_at = CURRENT_TIMESTAMP
                WHERE id = ?1
                  AND NOT EXISTS (SELECT 1 FROM breakpoint_connections WHERE task_id = ?1)
                RETURNING total
                "#,
            )
            .bind(i64::from(task_id))
            .bind(binds.len() as i64)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = row else {
                tx.rollback().await?;
                return if self.task_exists(task_id).await? {
                    Err(LedgerError::Consistency(format!(
                        "task {} is already split",
                        task_id
                    )))
                } else {
                    Err(LedgerError::MissingTask(task_id))
                };
            };
            let total = row
                .try_get::<Option<i64>, _>("total")?
                .map(|v| from_sql(v, "total"))
                .transpose()?;
            if let Err(e) = ranges::check_partition(ranges, total) {
                tx.rollback().await?;
                return Err(e);
            }

            for (index, start, current, end) in binds {
                sqlx::query(
                    r#"
                    INSERT INTO breakpoint_connections
                        (task_id, "index", start_offset, current_offset, end_offset, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, CURRENT_TIMESTAMP)
                    "#,
                )
                .bind(i64::from(task_id))
                .bind(index)
                .bind(start)
                .bind(current)
                .bind(end)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            debug!(
                "[SqliteLedger] task {} split into {} ranges",
                task_id,
                ranges.len()
            );
            Ok::<_, LedgerError>(())
        })
        .await
    }

    async fn update_connection(
        &self,
        task_id: u32,
        index: u32,
        current_offset: u64,
    ) -> Result<(), LedgerError> {
        let offset = to_sql(current_offset)?;
        self.bounded("update_connection", async {
            let result = sqlx::query(
                r#"
                UPDATE breakpoint_connections
                SET current_offset = ?3, updated_at = CURRENT_TIMESTAMP
                WHERE task_id = ?1 AND "index" = ?2
                  AND ?3 >= start_offset
                  AND ?3 <= COALESCE(
                        end_offset,
                        (SELECT total FROM breakpoint_tasks WHERE id = ?1),
                        ?3)
                "#,
            )
            .bind(i64::from(task_id))
            .bind(i64::from(index))
            .bind(offset)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() > 0 {
                return Ok(());
            }

            let exists = sqlx::query(
                r#"SELECT 1 FROM breakpoint_connections WHERE task_id = ?1 AND "index" = ?2"#,
            )
            .bind(i64::from(task_id))
            .bind(i64::from(index))
            .fetch_optional(&self.pool)
            .await?
            .is_some();

            if exists {
                Err(LedgerError::Consistency(format!(
                    "connection {}/{} offset {} outside its range",
                    task_id, index, current_offset
                )))
            } else {
                Err(LedgerError::MissingConnection { task_id, index })
            }
        })
        .await
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("[SqliteLedger] closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfigBuilder;
    use crate::persistence::PersistenceType;
    use std::time::Instant;

    async fn file_ledger(dir: &Path, pool: u32) -> SqliteLedger {
        let path = dir.join("locked.db");
        let config = LedgerConfigBuilder::new()
            .persistence_type(PersistenceType::Sqlite(path.to_string_lossy().to_string()))
            .max_connections(pool)
            .busy_timeout_ms(50)
            .operation_timeout_ms(200)
            .build()
            .unwrap();
        SqliteLedger::open(&path, &config).await.unwrap()
    }

    #[tokio::test]
    async fn held_write_lock_fails_within_bounded_time() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = file_ledger(dir.path(), 2).await;
        ledger
            .insert(&TaskRecord::with_id(1, "https://x/1.bin", "/tmp/1.bin"))
            .await
            .unwrap();

        let mut writer = ledger.pool.begin().await.unwrap();
        sqlx::query("UPDATE breakpoint_tasks SET so_far = 1 WHERE id = 1")
            .execute(&mut *writer)
            .await
            .unwrap();

        let started = Instant::now();
        let err = ledger.write_progress(1, 5).await.unwrap_err();
        assert!(err.is_store_failure(), "unexpected error {:?}", err);
        assert!(started.elapsed() < Duration::from_secs(2));

        writer.rollback().await.unwrap();
        assert!(ledger.write_progress(1, 5).await.unwrap());
        ledger.close().await;
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = file_ledger(dir.path(), 1).await;
        let held = ledger.pool.acquire().await.unwrap();

        let started = Instant::now();
        let err = ledger.find(1).await.unwrap_err();
        assert!(
            matches!(err, LedgerError::Timeout { .. } | LedgerError::Store(_)),
            "unexpected error {:?}",
            err
        );
        assert!(err.is_store_failure());
        assert!(started.elapsed() < Duration::from_secs(2));

        drop(held);
        assert_eq!(ledger.find(1).await.unwrap(), None);
        ledger.close().await;
    }

    #[tokio::test]
    async fn offsets_beyond_integer_range_are_rejected() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        let mut huge = TaskRecord::with_id(3, "https://x/3.bin", "/tmp/3.bin");
        huge.so_far = u64::MAX;
        assert!(matches!(
            ledger.insert(&huge).await,
            Err(LedgerError::Consistency(_))
        ));
        assert_eq!(ledger.find(3).await.unwrap(), None);

        ledger
            .insert(&TaskRecord::with_id(3, "https://x/3.bin", "/tmp/3.bin"))
            .await
            .unwrap();
        ledger
            .insert_connection(&ConnectionRecord::new(3, 0, 0, None))
            .await
            .unwrap();
        let past = i64::MAX as u64 + 1;
        assert!(matches!(
            ledger.update_connection(3, 0, past).await,
            Err(LedgerError::Consistency(_))
        ));
        assert!(matches!(
            ledger.write_progress(3, past).await,
            Err(LedgerError::Consistency(_))
        ));
        assert_eq!(ledger.find(3).await.unwrap().unwrap().so_far, 0);
        assert_eq!(ledger.find_connections(3).await.unwrap()[0].current_offset, 0);
    }

    #[tokio::test]
    async fn patch_query_guards_merged_progress() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        let mut task = TaskRecord::with_id(9, "https://x/9.bin", "/tmp/9.bin");
        task.so_far = 800;
        ledger.insert(&task).await.unwrap();

        // total below the stored so_far is rejected, the row is untouched
        let patch = TaskPatch {
            total: Some(Some(500)),
            ..Default::default()
        };
        assert!(matches!(
            ledger.apply(9, &patch).await,
            Err(LedgerError::Consistency(_))
        ));
        assert_eq!(ledger.find(9).await.unwrap().unwrap().total, None);

        let patch = TaskPatch {
            total: Some(Some(1000)),
            etag: Some(Some("v1".into())),
            ..Default::default()
        };
        assert!(ledger.apply(9, &patch).await.unwrap());
        let stored = ledger.find(9).await.unwrap().unwrap();
        assert_eq!(stored.total, Some(1000));
        assert_eq!(stored.etag.as_deref(), Some("v1"));
        assert_eq!(stored.so_far, 800);
    }

    #[tokio::test]
    async fn apply_on_missing_task_reports_absence() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        let patch = TaskPatch {
            status: Some(TaskStatus::Paused),
            ..Default::default()
        };
        assert!(!ledger.apply(404, &patch).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_connection_is_a_consistency_error() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        ledger
            .insert(&TaskRecord::with_id(5, "https://x/5.bin", "/tmp/5.bin"))
            .await
            .unwrap();
        let conn = ConnectionRecord::new(5, 0, 0, Some(10));
        ledger.insert_connection(&conn).await.unwrap();

        assert!(matches!(
            ledger.insert_connection(&conn).await,
            Err(LedgerError::Consistency(_))
        ));
        assert!(matches!(
            ledger
                .insert_connection(&ConnectionRecord::new(6, 0, 0, Some(10)))
                .await,
            Err(LedgerError::MissingTask(6))
        ));
    }

    #[tokio::test]
    async fn reopening_file_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.db");
        let config = LedgerConfig::default();

        let ledger = SqliteLedger::open(&path, &config).await.unwrap();
        let mut task = TaskRecord::with_id(1, "https://x/1.bin", "/tmp/1.bin");
        task.total = Some(10);
        task.so_far = 4;
        ledger.insert(&task).await.unwrap();
        ledger.close().await;

        let reopened = SqliteLedger::open(&path, &config).await.unwrap();
        assert_eq!(reopened.find(1).await.unwrap(), Some(task));
        reopened.close().await;
    }
}
