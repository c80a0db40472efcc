//! In-memory store implementation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{RowId, TaskId, WorkPackageRow, WpNumber, WpStatus};
use crate::error::{Result, SchedulerError};
use crate::ports::{
    CreatedTask, FinishReport, RowFilter, WorkPackageStore, plan_dependency_changes,
};

/// In-memory table state.
struct InMemoryStoreState {
    /// Rows per task, each vector ordered by `wp_number`.
    tasks: BTreeMap<TaskId, Vec<WorkPackageRow>>,

    /// Next row id to assign.
    next_row_id: u64,
}

impl InMemoryStoreState {
    fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            next_row_id: 1,
        }
    }

    fn allocate_row_id(&mut self) -> RowId {
        let id = RowId::new(self.next_row_id);
        self.next_row_id += 1;
        id
    }

    fn next_task_id(&self) -> TaskId {
        self.tasks
            .keys()
            .next_back()
            .map_or(TaskId::new(1), |max| max.next())
    }

    fn rows_mut(&mut self, task: TaskId) -> &mut [WorkPackageRow] {
        match self.tasks.get_mut(&task) {
            Some(rows) => rows.as_mut_slice(),
            None => &mut [],
        }
    }

    fn row_mut(&mut self, task: TaskId, wp: WpNumber) -> Option<&mut WorkPackageRow> {
        self.rows_mut(task).iter_mut().find(|r| r.wp_number == wp)
    }
}

/// Process-local store.
///
/// Clones share the same table, so several `Scheduler` handles built on clones
/// behave like independent workers sharing one database. The table mutex is
/// the critical section of every operation.
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<InMemoryStoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryStoreState::new())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkPackageStore for InMemoryStore {
    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn create_task(&self, wp_total: u32, desired: Option<TaskId>) -> Result<CreatedTask> {
        let mut state = self.state.lock().await;
        let task_id = desired.unwrap_or_else(|| state.next_task_id());

        let replaced_rows = state
            .tasks
            .remove(&task_id)
            .map_or(0, |rows| rows.len() as u64);

        let mut rows = Vec::with_capacity(wp_total as usize);
        for n in 1..=wp_total {
            let wp = WpNumber::new(n).ok_or(SchedulerError::InvalidWpTotal(wp_total))?;
            let row_id = state.allocate_row_id();
            rows.push(WorkPackageRow::new(row_id, task_id, wp));
        }
        state.tasks.insert(task_id, rows);

        Ok(CreatedTask {
            task_id,
            wp_total,
            replaced_rows,
        })
    }

    async fn delete_task(&self, task: TaskId) -> Result<u64> {
        let mut state = self.state.lock().await;
        Ok(state.tasks.remove(&task).map_or(0, |rows| rows.len() as u64))
    }

    async fn load_rows(&self, task: TaskId) -> Result<Vec<WorkPackageRow>> {
        let state = self.state.lock().await;
        Ok(state.tasks.get(&task).cloned().unwrap_or_default())
    }

    async fn try_claim(&self, task: TaskId, wp: WpNumber) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.row_mut(task, wp) {
            Some(row) if row.is_eligible() => {
                row.start();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish(&self, task: TaskId, wp: WpNumber) -> Result<Option<FinishReport>> {
        let mut state = self.state.lock().await;
        let Some(row) = state.row_mut(task, wp) else {
            return Ok(None);
        };
        let previous = row.status;
        row.finish();

        let mut released = Vec::new();
        for dependent in state.rows_mut(task) {
            if dependent.depend == Some(wp) {
                dependent.depend = None;
                released.push(dependent.wp_number);
            }
        }

        Ok(Some(FinishReport {
            wp,
            previous,
            released,
        }))
    }

    async fn complete_task(&self, task: TaskId) -> Result<bool> {
        let mut state = self.state.lock().await;
        let rows = state.rows_mut(task);
        if rows.is_empty() || rows.iter().any(|r| r.status != WpStatus::Finished) {
            return Ok(false);
        }
        for row in rows {
            row.status = WpStatus::TaskDone;
        }
        Ok(true)
    }

    async fn update_status(
        &self,
        task: TaskId,
        filter: &RowFilter,
        to: WpStatus,
        clear_lock: bool,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut changed = 0;
        for row in state.rows_mut(task).iter_mut().filter(|r| filter.matches(r)) {
            row.set_status(to, clear_lock);
            changed += 1;
        }
        Ok(changed)
    }

    async fn try_lock(&self, task: TaskId, wp: WpNumber) -> Result<bool> {
        let mut state = self.state.lock().await;
        let rows = state.rows_mut(task);
        if rows.iter().any(|r| r.lock_owner && r.wp_number != wp) {
            return Ok(false);
        }
        match rows.iter_mut().find(|r| r.wp_number == wp) {
            Some(row) => {
                row.lock_owner = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release_lock(&self, task: TaskId, wp: WpNumber) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.row_mut(task, wp) {
            Some(row) if row.lock_owner => {
                row.lock_owner = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear_locks(&self, task: TaskId) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut cleared = 0;
        for row in state.rows_mut(task).iter_mut().filter(|r| r.lock_owner) {
            row.lock_owner = false;
            cleared += 1;
        }
        Ok(cleared)
    }

    async fn update_dependencies(&self, task: TaskId, requested: &[Option<WpNumber>]) -> Result<usize> {
        let mut state = self.state.lock().await;
        let rows = state.rows_mut(task);
        let changes = plan_dependency_changes(rows, requested)?;
        for change in &changes {
            if let Some(row) = rows.iter_mut().find(|r| r.wp_number == change.wp) {
                row.depend = change.depend;
            }
        }
        Ok(changes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wp(n: u32) -> WpNumber {
        WpNumber::new(n).unwrap()
    }

    fn deps(raw: &[u32]) -> Vec<Option<WpNumber>> {
        raw.iter().map(|&n| WpNumber::new(n)).collect()
    }

    #[tokio::test]
    async fn create_allocates_sequential_task_ids() {
        let store = InMemoryStore::new();
        let first = store.create_task(3, None).await.unwrap();
        let second = store.create_task(2, None).await.unwrap();
        assert_eq!(first.task_id, TaskId::new(1));
        assert_eq!(second.task_id, TaskId::new(2));
        assert_eq!(first.replaced_rows, 0);
    }

    #[tokio::test]
    async fn row_ids_are_monotonic_across_tasks() {
        let store = InMemoryStore::new();
        let a = store.create_task(2, None).await.unwrap();
        let b = store.create_task(2, None).await.unwrap();
        let mut ids: Vec<u64> = store
            .load_rows(a.task_id)
            .await
            .unwrap()
            .into_iter()
            .chain(store.load_rows(b.task_id).await.unwrap())
            .map(|r| r.row_id.get())
            .collect();
        let sorted = {
            let mut s = ids.clone();
            s.sort_unstable();
            s
        };
        assert_eq!(ids, sorted);
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[tokio::test]
    async fn create_with_existing_id_replaces_rows() {
        let store = InMemoryStore::new();
        store.create_task(4, Some(TaskId::new(9))).await.unwrap();
        store.try_claim(TaskId::new(9), wp(1)).await.unwrap();

        let created = store.create_task(2, Some(TaskId::new(9))).await.unwrap();
        assert_eq!(created.replaced_rows, 4);

        let rows = store.load_rows(TaskId::new(9)).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.status == WpStatus::Ready));
    }

    #[tokio::test]
    async fn try_claim_is_conditional() {
        let store = InMemoryStore::new();
        let task = store.create_task(2, None).await.unwrap().task_id;
        assert!(store.try_claim(task, wp(1)).await.unwrap());
        assert!(!store.try_claim(task, wp(1)).await.unwrap());
        assert!(!store.try_claim(task, wp(3)).await.unwrap());
    }

    #[tokio::test]
    async fn finish_releases_dependents() {
        let store = InMemoryStore::new();
        let task = store.create_task(3, None).await.unwrap().task_id;
        assert_eq!(store.update_dependencies(task, &deps(&[0, 1, 1])).await.unwrap(), 2);
        assert!(!store.try_claim(task, wp(2)).await.unwrap());

        store.try_claim(task, wp(1)).await.unwrap();
        let report = store.finish(task, wp(1)).await.unwrap().unwrap();
        assert_eq!(report.previous, WpStatus::Running);
        assert_eq!(report.released, vec![wp(2), wp(3)]);
        assert!(store.try_claim(task, wp(2)).await.unwrap());
    }

    #[tokio::test]
    async fn finish_unknown_row_is_none() {
        let store = InMemoryStore::new();
        let task = store.create_task(1, None).await.unwrap().task_id;
        assert!(store.finish(task, wp(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_flag_is_exclusive_per_task() {
        let store = InMemoryStore::new();
        let task = store.create_task(2, None).await.unwrap().task_id;
        assert!(store.try_lock(task, wp(1)).await.unwrap());
        assert!(store.try_lock(task, wp(1)).await.unwrap());
        assert!(!store.try_lock(task, wp(2)).await.unwrap());
        assert!(!store.release_lock(task, wp(2)).await.unwrap());
        assert!(store.release_lock(task, wp(1)).await.unwrap());
        assert!(store.try_lock(task, wp(2)).await.unwrap());
    }

    #[tokio::test]
    async fn update_dependencies_rejects_other_length() {
        let store = InMemoryStore::new();
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
    async fn update_dependencies_reads_current_status() {
        let store = InMemoryStore::new();
        let task = store.create_task(3, None).await.unwrap().task_id;
        store.finish(task, wp(1)).await.unwrap();

        let written = store.update_dependencies(task, &deps(&[0, 1, 2])).await.unwrap();
        assert_eq!(written, 1);
        let depends: Vec<Option<WpNumber>> =
            store.load_rows(task).await.unwrap().iter().map(|r| r.depend).collect();
        assert_eq!(depends, deps(&[0, 0, 2]));
        assert_eq!(store.update_dependencies(task, &deps(&[0, 1, 2])).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn complete_task_needs_every_row_finished() {
        let store = InMemoryStore::new();
        let task = store.create_task(2, None).await.unwrap().task_id;
        store.finish(task, wp(1)).await.unwrap();
        assert!(!store.complete_task(task).await.unwrap());
        store.finish(task, wp(2)).await.unwrap();
        assert!(store.complete_task(task).await.unwrap());
        assert!(!store.complete_task(task).await.unwrap());
        assert!(!store.complete_task(TaskId::new(77)).await.unwrap());
    }
}
