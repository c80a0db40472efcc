//! SQLite store - 共有 DB ファイルを正本とする実装
//!
//! - 複数プロセスが同じファイルを開き、書き込みは SQLite のファイルロックで直列化される
//! - 単一行の判定は条件付き `UPDATE`（影響行数で判定）
//! - 複数行の操作は `IMMEDIATE` トランザクション（読む前に書き込みロックを取る）

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::config::{ConfigError, StoreConfig, is_token};
use crate::domain::{RowId, TaskId, WorkPackageRow, WpNumber, WpStatus};
use crate::error::{Result, SchedulerError};
use crate::ports::{
    COLUMNS, CreatedTask, FinishReport, RowFilter, WorkPackageStore, plan_dependency_changes,
};

/// How long one statement waits on a locked database before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type RawRow = (i64, i64, i64, i64, bool, i64);

/// SQLite-backed store holding one connection for its whole lifetime.
///
/// Blocking calls run on `spawn_blocking`. Busy or unopenable databases are
/// retried forever with `retry_interval` between attempts.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    /// Quoted table identifier, safe to splice into SQL.
    table: Arc<str>,
    retry_interval: Duration,
}

impl SqliteStore {
    /// Open the database file named by `config.database`.
    ///
    /// Retries until the file can be opened. Credential fields have no meaning
    /// for SQLite and are ignored.
    pub async fn connect(config: &StoreConfig, retry_interval: Duration) -> Result<Self> {
        if !is_token(&config.table) {
            return Err(ConfigError::InvalidTable(config.table.clone()).into());
        }
        tracing::debug!(
            server = %config.server,
            user = %config.user,
            "sqlite store ignores server and credentials"
        );

        let path = config.database.clone();
        let conn = loop {
            let open_path = path.clone();
            let opened = tokio::task::spawn_blocking(move || -> Result<Connection> {
                let conn = Connection::open(&open_path)?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                Ok(conn)
            })
            .await
            .map_err(|e| SchedulerError::Store(format!("open: blocking task failed: {e}")))?;

            match opened {
                Ok(conn) => break conn,
                Err(err) => {
                    tracing::warn!(
                        database = %path,
                        error = %err,
                        retry_in = ?retry_interval,
                        "cannot open store, retrying"
                    );
                    tokio::time::sleep(retry_interval).await;
                }
            }
        };

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table: format!("\"{}\"", config.table).into(),
            retry_interval,
        })
    }

    /// Run `f` against the connection on the blocking pool, retrying
    /// transient failures. Each call of `f` must be one atomic unit.
    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnMut(&mut Connection, &str) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let table = Arc::clone(&self.table);
        let retry_interval = self.retry_interval;

        tokio::task::spawn_blocking(move || {
            let mut f = f;
            loop {
                let outcome = {
                    let mut guard = conn
                        .lock()
                        .map_err(|_| SchedulerError::Store("connection mutex poisoned".into()))?;
                    f(&mut *guard, &*table)
                };
                match outcome {
                    Err(err) if err.is_transient() => {
                        tracing::warn!(op, error = %err, retry_in = ?retry_interval, "store busy, retrying");
                        std::thread::sleep(retry_interval);
                    }
                    other => return other,
                }
            }
        })
        .await
        .map_err(|e| SchedulerError::Store(format!("{op}: blocking task failed: {e}")))?
    }
}

/// SQLite integers are signed; ids past `i64::MAX` have no key.
fn task_key(task: TaskId) -> Result<i64> {
    i64::try_from(task.get()).map_err(|_| SchedulerError::TaskIdOutOfRange(task))
}

fn select_rows(conn: &Connection, table: &str, key: i64) -> Result<Vec<WorkPackageRow>> {
    let raw: Vec<RawRow> = conn
        .prepare(&format!(
            "SELECT row_id, task_id, wp_number, status, lock_owner, depend
             FROM {table} WHERE task_id = ?1 ORDER BY wp_number"
        ))?
        .query_map(params![key], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        })?
        .collect::<rusqlite::Result<_>>()?;
    raw.into_iter().map(decode_row).collect()
}

fn decode_row((row_id, task_id, wp_number, status, lock_owner, depend): RawRow) -> Result<WorkPackageRow> {
    let corrupt = |what: &str| SchedulerError::Store(format!("row {row_id}: invalid {what}"));
    let wp_number = u32::try_from(wp_number)
        .ok()
        .and_then(WpNumber::new)
        .ok_or_else(|| corrupt("wp_number"))?;
    let status = WpStatus::from_code(status).ok_or_else(|| corrupt("status"))?;
    let depend = match depend {
        0 => None,
        n => Some(
            u32::try_from(n)
                .ok()
                .and_then(WpNumber::new)
                .ok_or_else(|| corrupt("depend"))?,
        ),
    };
    let row_value = u64::try_from(row_id).map_err(|_| corrupt("row_id"))?;
    let task_value = u64::try_from(task_id).map_err(|_| corrupt("task_id"))?;
    Ok(WorkPackageRow {
        row_id: RowId::new(row_value),
        task_id: TaskId::new(task_value),
        wp_number,
        status,
        lock_owner,
        depend,
    })
}

#[async_trait]
impl WorkPackageStore for SqliteStore {
    async fn ensure_schema(&self) -> Result<()> {
        self.run("ensure_schema", |conn, table| {
            let mut found: Vec<String> = conn
                .prepare(&format!("PRAGMA table_info({table})"))?
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<rusqlite::Result<_>>()?;

            if found.is_empty() {
                conn.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS {table} (
                        row_id     INTEGER PRIMARY KEY AUTOINCREMENT,
                        task_id    INTEGER NOT NULL,
                        wp_number  INTEGER NOT NULL,
                        status     INTEGER NOT NULL DEFAULT 0 CHECK (status BETWEEN 0 AND 4),
                        lock_owner INTEGER NOT NULL DEFAULT 0,
                        depend     INTEGER NOT NULL DEFAULT 0,
                        UNIQUE (task_id, wp_number)
                    );"
                ))?;
                tracing::info!(table, "created work-package table");
                return Ok(());
            }

            let mut expected: Vec<&str> = COLUMNS.to_vec();
            expected.sort_unstable();
            found.sort_unstable();
            if found != expected {
                return Err(SchedulerError::SchemaMismatch {
                    table: table.trim_matches('"').to_string(),
                    found: found.join(", "),
                });
            }
            Ok(())
        })
        .await
    }

    async fn create_task(&self, wp_total: u32, desired: Option<TaskId>) -> Result<CreatedTask> {
        self.run("create_task", move |conn, table| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let task_id = match desired {
                Some(id) => id,
                None => {
                    let max: i64 = tx.query_row(
                        &format!("SELECT COALESCE(MAX(task_id), 0) FROM {table}"),
                        [],
                        |row| row.get(0),
                    )?;
                    let max = u64::try_from(max)
                        .map_err(|_| SchedulerError::Store(format!("negative task id {max}")))?;
                    TaskId::new(max).next()
                }
            };
            let key = task_key(task_id)?;

            let replaced_rows = tx.execute(
                &format!("DELETE FROM {table} WHERE task_id = ?1"),
                params![key],
            )? as u64;

            {
                let mut insert = tx.prepare(&format!(
                    "INSERT INTO {table} (task_id, wp_number, status, lock_owner, depend)
                     VALUES (?1, ?2, 0, 0, 0)"
                ))?;
                for wp in 1..=wp_total {
                    insert.execute(params![key, wp])?;
                }
            }

            tx.commit()?;
            Ok(CreatedTask {
                task_id,
                wp_total,
                replaced_rows,
            })
        })
        .await
    }

    async fn delete_task(&self, task: TaskId) -> Result<u64> {
        let key = task_key(task)?;
        self.run("delete_task", move |conn, table| {
            let deleted = conn.execute(
                &format!("DELETE FROM {table} WHERE task_id = ?1"),
                params![key],
            )?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn load_rows(&self, task: TaskId) -> Result<Vec<WorkPackageRow>> {
        let key = task_key(task)?;
        self.run("load_rows", move |conn, table| select_rows(conn, table, key))
            .await
    }

    async fn try_claim(&self, task: TaskId, wp: WpNumber) -> Result<bool> {
        let key = task_key(task)?;
        self.run("try_claim", move |conn, table| {
            let changed = conn.execute(
                &format!(
                    "UPDATE {table} SET status = 1
                     WHERE task_id = ?1 AND wp_number = ?2 AND status = 0 AND depend = 0"
                ),
                params![key, wp.get()],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn finish(&self, task: TaskId, wp: WpNumber) -> Result<Option<FinishReport>> {
        let key = task_key(task)?;
        self.run("finish", move |conn, table| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let previous: Option<i64> = tx
                .query_row(
                    &format!("SELECT status FROM {table} WHERE task_id = ?1 AND wp_number = ?2"),
                    params![key, wp.get()],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(previous) = previous else {
                return Ok(None);
            };
            let previous = WpStatus::from_code(previous)
                .ok_or_else(|| SchedulerError::Store(format!("{wp}: invalid status {previous}")))?;

            tx.execute(
                &format!(
                    "UPDATE {table} SET status = 2, lock_owner = 0
                     WHERE task_id = ?1 AND wp_number = ?2"
                ),
                params![key, wp.get()],
            )?;

            let released: Vec<u32> = tx
                .prepare(&format!(
                    "SELECT wp_number FROM {table}
                     WHERE task_id = ?1 AND depend = ?2 ORDER BY wp_number"
                ))?
                .query_map(params![key, wp.get()], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            tx.execute(
                &format!("UPDATE {table} SET depend = 0 WHERE task_id = ?1 AND depend = ?2"),
                params![key, wp.get()],
            )?;

            tx.commit()?;
            Ok(Some(FinishReport {
                wp,
                previous,
                released: released.into_iter().filter_map(WpNumber::new).collect(),
            }))
        })
        .await
    }

    async fn complete_task(&self, task: TaskId) -> Result<bool> {
        let key = task_key(task)?;
        self.run("complete_task", move |conn, table| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let (total, finished): (i64, i64) = tx.query_row(
                &format!(
                    "SELECT COUNT(*), COALESCE(SUM(status = 2), 0)
                     FROM {table} WHERE task_id = ?1"
                ),
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            if total == 0 || total != finished {
                return Ok(false);
            }
            tx.execute(
                &format!("UPDATE {table} SET status = 3 WHERE task_id = ?1 AND status = 2"),
                params![key],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn update_status(
        &self,
        task: TaskId,
        filter: &RowFilter,
        to: WpStatus,
        clear_lock: bool,
    ) -> Result<u64> {
        let filter = filter.clone();
        let key = task_key(task)?;
        self.run("update_status", move |conn, table| {
            let set = if clear_lock {
                "status = ?2, lock_owner = 0"
            } else {
                "status = ?2"
            };
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let changed = match &filter {
                RowFilter::Status(from) => tx.execute(
                    &format!("UPDATE {table} SET {set} WHERE task_id = ?1 AND status = ?3"),
                    params![key, to.code(), from.code()],
                )?,
                RowFilter::All => tx.execute(
                    &format!("UPDATE {table} SET {set} WHERE task_id = ?1"),
                    params![key, to.code()],
                )?,
                RowFilter::Numbers(wps) => {
                    let mut stmt = tx.prepare(&format!(
                        "UPDATE {table} SET {set} WHERE task_id = ?1 AND wp_number = ?3"
                    ))?;
                    let mut changed = 0;
                    for wp in wps {
                        changed += stmt.execute(params![key, to.code(), wp.get()])?;
                    }
                    changed
                }
            };
            tx.commit()?;
            Ok(changed as u64)
        })
        .await
    }

    async fn try_lock(&self, task: TaskId, wp: WpNumber) -> Result<bool> {
        let key = task_key(task)?;
        self.run("try_lock", move |conn, table| {
            let changed = conn.execute(
                &format!(
                    "UPDATE {table} SET lock_owner = 1
                     WHERE task_id = ?1 AND wp_number = ?2
                       AND NOT EXISTS (
                         SELECT 1 FROM {table}
                         WHERE task_id = ?1 AND lock_owner = 1 AND wp_number != ?2
                       )"
                ),
                params![key, wp.get()],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn release_lock(&self, task: TaskId, wp: WpNumber) -> Result<bool> {
        let key = task_key(task)?;
        self.run("release_lock", move |conn, table| {
            let changed = conn.execute(
                &format!(
                    "UPDATE {table} SET lock_owner = 0
                     WHERE task_id = ?1 AND wp_number = ?2 AND lock_owner = 1"
                ),
                params![key, wp.get()],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn clear_locks(&self, task: TaskId) -> Result<u64> {
        let key = task_key(task)?;
        self.run("clear_locks", move |conn, table| {
            let changed = conn.execute(
                &format!("UPDATE {table} SET lock_owner = 0 WHERE task_id = ?1 AND lock_owner = 1"),
                params![key],
            )?;
            Ok(changed as u64)
        })
        .await
    }

    async fn update_dependencies(&self, task: TaskId, requested: &[Option<WpNumber>]) -> Result<usize> {
        let key = task_key(task)?;
        let requested = requested.to_vec();
        self.run("update_dependencies", move |conn, table| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let rows = select_rows(&tx, table, key)?;
            // A length mismatch returns early; dropping `tx` rolls back.
            let changes = plan_dependency_changes(&rows, &requested)?;
            {
                let mut stmt = tx.prepare(&format!(
                    "UPDATE {table} SET depend = ?3 WHERE task_id = ?1 AND wp_number = ?2"
                ))?;
                for change in &changes {
                    stmt.execute(params![key, change.wp.get(), WpNumber::encode(change.depend)])?;
                }
            }
            tx.commit()?;
            Ok(changes.len())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::app::{BackoffPolicy, Scheduler, SchedulerOptions};
    use crate::domain::ClaimMode;
    use tempfile::TempDir;

    fn wp(n: u32) -> WpNumber {
        WpNumber::new(n).unwrap()
    }

    fn deps(raw: &[u32]) -> Vec<Option<WpNumber>> {
        raw.iter().map(|&n| WpNumber::new(n)).collect()
    }

    fn options() -> SchedulerOptions {
        SchedulerOptions {
            backoff: BackoffPolicy::fast(),
            cancel: None,
        }
    }

    async fn open(dir: &TempDir) -> SqliteStore {
        let path = dir.path().join("workpack.db");
        let config = StoreConfig::sqlite(path.to_string_lossy(), "wp");
        let store = SqliteStore::connect(&config, Duration::from_millis(10))
            .await
            .unwrap();
        store.ensure_schema().await.unwrap();
        store
    }

    /// Scheduler bound to `task` through its own connection.
    async fn handle(dir: &TempDir, task: TaskId) -> Scheduler {
        Scheduler::connect(Arc::new(open(dir).await), task, options())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn creates_schema_once() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        store.ensure_schema().await.unwrap();
    }

    #[tokio::test]
    async fn rejects_foreign_schema() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("workpack.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE wp (id INTEGER PRIMARY KEY, name TEXT);")
                .unwrap();
        }
        let config = StoreConfig::sqlite(path.to_string_lossy(), "wp");
        let store = SqliteStore::connect(&config, Duration::from_millis(10))
            .await
            .unwrap();
        let err = store.ensure_schema().await.unwrap_err();
        assert!(matches!(err, SchedulerError::SchemaMismatch { ref table, .. } if table == "wp"));
    }

    #[tokio::test]
    async fn rejects_bad_table_name() {
        let config = StoreConfig::sqlite(":memory:", "wp\"; DROP TABLE x");
        let err = SqliteStore::connect(&config, Duration::from_millis(10))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SchedulerError::Config(ConfigError::InvalidTable(_))));
    }

    #[tokio::test]
    async fn create_and_replace_task() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        let first = store.create_task(5, None).await.unwrap();
        assert_eq!(first.task_id, TaskId::new(1));
        let second = store.create_task(2, None).await.unwrap();
        assert_eq!(second.task_id, TaskId::new(2));

        store.try_claim(first.task_id, wp(1)).await.unwrap();
        let replaced = store.create_task(3, Some(first.task_id)).await.unwrap();
        assert_eq!(replaced.replaced_rows, 5);

        let rows = store.load_rows(first.task_id).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.status == WpStatus::Ready && r.depend.is_none()));
        let numbers: Vec<u32> = rows.iter().map(|r| r.wp_number.get()).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn finish_releases_dependents_in_one_step() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let task = store.create_task(3, None).await.unwrap().task_id;
        store.update_dependencies(task, &deps(&[0, 0, 1])).await.unwrap();

        assert!(!store.try_claim(task, wp(3)).await.unwrap());
        assert!(store.try_claim(task, wp(1)).await.unwrap());
        store.try_lock(task, wp(1)).await.unwrap();

        let report = store.finish(task, wp(1)).await.unwrap().unwrap();
        assert_eq!(report.previous, WpStatus::Running);
        assert_eq!(report.released, vec![wp(3)]);

        let rows = store.load_rows(task).await.unwrap();
        assert_eq!(rows[0].status, WpStatus::Finished);
        assert!(!rows[0].lock_owner);
        assert_eq!(rows[2].depend, None);
        assert!(store.try_claim(task, wp(3)).await.unwrap());
    }

    #[tokio::test]
    async fn lock_flag_excludes_other_rows() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let task = store.create_task(2, None).await.unwrap().task_id;

        assert!(store.try_lock(task, wp(1)).await.unwrap());
        assert!(!store.try_lock(task, wp(2)).await.unwrap());
        assert!(!store.release_lock(task, wp(2)).await.unwrap());
        assert_eq!(store.clear_locks(task).await.unwrap(), 1);
        assert!(store.try_lock(task, wp(2)).await.unwrap());
    }

    #[tokio::test]
    async fn update_dependencies_rejects_other_length() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let task = store.create_task(2, None).await.unwrap().task_id;
        let err = store
            .update_dependencies(task, &deps(&[0, 1, 0]))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidDependencies(_)));
        let rows = store.load_rows(task).await.unwrap();
        assert!(rows.iter().all(|r| r.depend.is_none()));
    }

    #[tokio::test]
    async fn update_dependencies_sees_finish_from_other_connection() {
        let dir = TempDir::new().unwrap();
        let a = open(&dir).await;
        let b = open(&dir).await;
        let task = a.create_task(3, None).await.unwrap().task_id;
        b.finish(task, wp(1)).await.unwrap();

        assert_eq!(a.update_dependencies(task, &deps(&[0, 1, 2])).await.unwrap(), 1);
        let depends: Vec<Option<WpNumber>> =
            b.load_rows(task).await.unwrap().iter().map(|r| r.depend).collect();
        assert_eq!(depends, deps(&[0, 0, 2]));
        assert!(b.try_claim(task, wp(2)).await.unwrap());
    }

    #[tokio::test]
    async fn task_id_beyond_integer_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let huge = TaskId::new(u64::MAX);
        let err = store.load_rows(huge).await.unwrap_err();
        assert!(matches!(err, SchedulerError::TaskIdOutOfRange(t) if t == huge));
        let err = store.create_task(1, Some(huge)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::TaskIdOutOfRange(_)));
    }

    #[tokio::test]
    async fn update_status_by_filter() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let task = store.create_task(4, None).await.unwrap().task_id;
        store.try_claim(task, wp(1)).await.unwrap();
        store.try_lock(task, wp(1)).await.unwrap();

        let suspended = store
            .update_status(task, &RowFilter::Status(WpStatus::Ready), WpStatus::Suspended, false)
            .await
            .unwrap();
        assert_eq!(suspended, 3);

        let reset = store
            .update_status(task, &RowFilter::Numbers(vec![wp(1), wp(2)]), WpStatus::Ready, true)
            .await
            .unwrap();
        assert_eq!(reset, 2);

        let rows = store.load_rows(task).await.unwrap();
        let statuses: Vec<WpStatus> = rows.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![WpStatus::Ready, WpStatus::Ready, WpStatus::Suspended, WpStatus::Suspended]
        );
        assert!(rows.iter().all(|r| !r.lock_owner));
    }

    #[tokio::test]
    async fn complete_task_fires_once() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let task = store.create_task(2, None).await.unwrap().task_id;
        store.finish(task, wp(1)).await.unwrap();
        assert!(!store.complete_task(task).await.unwrap());
        store.finish(task, wp(2)).await.unwrap();
        assert!(store.complete_task(task).await.unwrap());
        assert!(!store.complete_task(task).await.unwrap());

        let rows = store.load_rows(task).await.unwrap();
        assert!(rows.iter().all(|r| r.status == WpStatus::TaskDone));
    }

    #[tokio::test]
    async fn separate_connections_share_rows() {
        let dir = TempDir::new().unwrap();
        let a = open(&dir).await;
        let b = open(&dir).await;
        let task = a.create_task(1, None).await.unwrap().task_id;

        assert!(b.try_claim(task, wp(1)).await.unwrap());
        assert!(!a.try_claim(task, wp(1)).await.unwrap());
        assert_eq!(b.delete_task(task).await.unwrap(), 1);
        assert!(a.load_rows(task).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn handles_on_separate_connections_claim_distinct_packages() {
        let dir = TempDir::new().unwrap();
        let (creator, _) = Scheduler::create(Arc::new(open(&dir).await), 20, None, options())
            .await
            .unwrap();
        let task = creator.task_id();

        let mut joins = Vec::new();
        for i in 0..8 {
            let mut h = handle(&dir, task).await;
            let mode = if i % 2 == 0 {
                ClaimMode::Sequential
            } else {
                ClaimMode::Random
            };
            joins.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(wp) = h.claim(mode).await.unwrap() {
                    mine.push(wp);
                }
                mine
            }));
        }

        let mut claimed = Vec::new();
        for j in joins {
            claimed.extend(j.await.unwrap());
        }
        let distinct: HashSet<WpNumber> = claimed.iter().copied().collect();
        assert_eq!(claimed.len(), 20);
        assert_eq!(distinct.len(), 20);
    }

    #[tokio::test]
    async fn sequential_claims_start_at_one() {
        let dir = TempDir::new().unwrap();
        let (mut s, created) = Scheduler::create(Arc::new(open(&dir).await), 5, None, options())
            .await
            .unwrap();
        assert_eq!(created.task_id, TaskId::new(1));
        assert_eq!(s.wp_todo().await.unwrap(), 5);

        for n in 1..=5 {
            assert_eq!(s.claim(ClaimMode::Sequential).await.unwrap(), Some(wp(n)));
        }
        assert_eq!(s.claim(ClaimMode::Sequential).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dependent_waits_for_finish_on_other_connection() {
        let dir = TempDir::new().unwrap();
        let (mut a, _) = Scheduler::create(Arc::new(open(&dir).await), 5, None, options())
            .await
            .unwrap();
        let task = a.task_id();
        a.set_dependencies(&deps(&[0, 0, 1, 0, 0])).await.unwrap();

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(a.claim(ClaimMode::Sequential).await.unwrap().unwrap());
        }
        assert_eq!(order, vec![wp(1), wp(2), wp(4), wp(5)]);

        let mut b = handle(&dir, task).await;
        let pending = tokio::spawn(async move { b.claim(ClaimMode::Sequential).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        a.finish(Some(wp(1))).await.unwrap();
        assert_eq!(a.get_dependencies().await.unwrap()[2], None);
        let claimed = tokio::time::timeout(Duration::from_secs(10), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(claimed, Some(wp(3)));
    }

    #[tokio::test]
    async fn create_with_existing_id_replaces_rows_for_every_connection() {
        let dir = TempDir::new().unwrap();
        let (mut first, _) =
            Scheduler::create(Arc::new(open(&dir).await), 4, Some(TaskId::new(7)), options())
                .await
                .unwrap();
        first.claim(ClaimMode::Sequential).await.unwrap();

        let (_, created) =
            Scheduler::create(Arc::new(open(&dir).await), 2, Some(TaskId::new(7)), options())
                .await
                .unwrap();
        assert_eq!(created.replaced_rows, 4);

        assert_eq!(
            first.status().await.unwrap(),
            vec![WpStatus::Ready, WpStatus::Ready]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn is_finished_is_true_for_exactly_one_connection() {
        let dir = TempDir::new().unwrap();
        let (mut s, _) = Scheduler::create(Arc::new(open(&dir).await), 3, None, options())
            .await
            .unwrap();
        let task = s.task_id();
        for _ in 0..3 {
            s.claim(ClaimMode::Sequential).await.unwrap();
            s.finish(None).await.unwrap();
        }

        let mut joins = Vec::new();
        for _ in 0..6 {
            let mut h = handle(&dir, task).await;
            joins.push(tokio::spawn(async move { h.is_finished().await.unwrap() }));
        }
        let mut winners = 0;
        for j in joins {
            if j.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(s.status().await.unwrap(), vec![WpStatus::TaskDone; 3]);
    }
}
