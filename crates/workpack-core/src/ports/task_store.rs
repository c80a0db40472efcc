//! WorkPackageStore port - 共有テーブルが正本（source of truth）
//!
//! 各メソッドは共有テーブルに対する 1 つのアトミック操作：
//! - 条件付き UPDATE 1 文（影響行数で結果を判定）
//! - もしくは短いトランザクション
//!
//! 実装は操作の途中で sleep しない。待機とリトライは呼び出し側（`app::Scheduler`）の責務。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::app::dependency::DependencyError;
use crate::domain::{TaskId, TaskView, WorkPackageRow, WpNumber, WpStatus};
use crate::error::Result;

/// Column set of the backing table, in declaration order.
pub const COLUMNS: [&str; 6] = [
    "row_id",
    "task_id",
    "wp_number",
    "status",
    "lock_owner",
    "depend",
];

/// Result of `create_task`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedTask {
    pub task_id: TaskId,
    pub wp_total: u32,
    /// Rows of a previous task with the same id that were deleted first.
    pub replaced_rows: u64,
}

/// Result of `finish`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishReport {
    pub wp: WpNumber,
    /// Status the row had before it became Finished.
    pub previous: WpStatus,
    /// Dependents whose `depend` was cleared by this finish.
    pub released: Vec<WpNumber>,
}

/// Row selection for bulk status updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    /// Rows currently in the given status.
    Status(WpStatus),
    /// Every row of the task.
    All,
    /// The listed work packages.
    Numbers(Vec<WpNumber>),
}

impl RowFilter {
    pub fn matches(&self, row: &WorkPackageRow) -> bool {
        match self {
            RowFilter::Status(status) => row.status == *status,
            RowFilter::All => true,
            RowFilter::Numbers(wps) => wps.contains(&row.wp_number),
        }
    }
}

/// New `depend` value for one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyChange {
    pub wp: WpNumber,
    pub depend: Option<WpNumber>,
}

/// Rows whose stored `depend` must change to reach `requested`, judged
/// against `rows` as they are right now.
///
/// Stores call this inside the same critical section that applies the
/// changes. A predecessor that is already Finished or TaskDone is recorded
/// as `None`, since no future finish would release it.
pub fn plan_dependency_changes(
    rows: &[WorkPackageRow],
    requested: &[Option<WpNumber>],
) -> Result<Vec<DependencyChange>> {
    if requested.len() != rows.len() {
        return Err(DependencyError::WrongLength {
            expected: rows.len(),
            got: requested.len(),
        }
        .into());
    }

    let view = TaskView::from_rows(rows);
    Ok(rows
        .iter()
        .zip(requested)
        .filter_map(|(row, target)| {
            let effective = target.filter(|t| !view.status_of(*t).is_some_and(|s| s.is_done()));
            (effective != row.depend).then_some(DependencyChange {
                wp: row.wp_number,
                depend: effective,
            })
        })
        .collect())
}

/// The shared work-package table.
///
/// # 設計原則
/// - claim は楽観的：`load_rows` から候補を選び、`try_claim` は行がまだ Ready かつ依存なしの時だけ成功
/// - finish・依存解放・ロック解放は同一の操作内
/// - ロックフラグの check-and-set は条件付き UPDATE 1 文
/// - 依存ベクタの読み取り・判定・書き込みは同一のクリティカルセクション内
#[async_trait]
pub trait WorkPackageStore: Send + Sync {
    /// Create the backing table if missing; validate its columns otherwise.
    async fn ensure_schema(&self) -> Result<()>;

    /// Insert `wp_total` Ready rows under `desired` (replacing any rows it
    /// already has) or under `max(task_id) + 1`.
    async fn create_task(&self, wp_total: u32, desired: Option<TaskId>) -> Result<CreatedTask>;

    /// Delete every row of the task; returns the number removed.
    async fn delete_task(&self, task: TaskId) -> Result<u64>;

    /// All rows of the task ordered by `wp_number`.
    async fn load_rows(&self, task: TaskId) -> Result<Vec<WorkPackageRow>>;

    /// Ready -> Running for `wp` iff it is still Ready with no dependency.
    async fn try_claim(&self, task: TaskId, wp: WpNumber) -> Result<bool>;

    /// Mark `wp` Finished, drop its lock flag and release its dependents.
    /// `None` when the row does not exist.
    async fn finish(&self, task: TaskId, wp: WpNumber) -> Result<Option<FinishReport>>;

    /// Finished -> TaskDone for every row iff all rows are Finished.
    async fn complete_task(&self, task: TaskId) -> Result<bool>;

    /// Set `to` on the rows matched by `filter`; returns the number changed.
    async fn update_status(
        &self,
        task: TaskId,
        filter: &RowFilter,
        to: WpStatus,
        clear_lock: bool,
    ) -> Result<u64>;

    /// Set the lock flag on `wp` iff no other row of the task holds it.
    async fn try_lock(&self, task: TaskId, wp: WpNumber) -> Result<bool>;

    /// Clear the lock flag on `wp` iff it is set there.
    async fn release_lock(&self, task: TaskId, wp: WpNumber) -> Result<bool>;

    /// Clear every lock flag of the task; returns the number cleared.
    async fn clear_locks(&self, task: TaskId) -> Result<u64>;

    /// Replace the dependency vector (`requested[i]` belongs to work package
    /// `i + 1`) in one atomic step; returns the number of rows written.
    ///
    /// The rows are read, planned with `plan_dependency_changes` and written
    /// under one lock, so a predecessor finishing concurrently is never
    /// recorded as pending.
    async fn update_dependencies(&self, task: TaskId, requested: &[Option<WpNumber>]) -> Result<usize>;
}
