//! Scheduler handle - 1 ワーカーから見た 1 タスク
//!
//! - ハンドルが保持する claim 済み work package は常に高々 1 つ
//! - タスクの advisory lock はその work package を通して保持する
//! - それ以外の状態はすべて共有ストアにあり、ハンドルは最後に読んだ集計（`TaskView`）をキャッシュするだけ

use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::instrument;

use crate::app::backoff::BackoffPolicy;
use crate::app::cancel::{CancelSignal, sleep_or_cancel};
use crate::app::dependency;
use crate::domain::{ClaimMode, HandleId, ResetScope, TaskId, TaskView, WpNumber, WpStatus};
use crate::error::{Result, SchedulerError};
use crate::ports::{CreatedTask, FinishReport, RowFilter, WorkPackageStore};

/// Knobs shared by every handle a process opens.
#[derive(Debug, Clone, Default)]
pub struct SchedulerOptions {
    pub backoff: BackoffPolicy,

    /// Aborts the claim and lock retry loops when fired.
    pub cancel: Option<CancelSignal>,
}

/// Per-process handle bound to one task.
pub struct Scheduler {
    store: Arc<dyn WorkPackageStore>,
    task_id: TaskId,
    handle_id: HandleId,
    backoff: BackoffPolicy,
    cancel: Option<CancelSignal>,

    /// Work package claimed by this handle and not yet finished.
    active_wp: Option<WpNumber>,

    /// Whether this handle set the lock flag on `active_wp`.
    holds_lock: bool,

    view: TaskView,
}

impl Scheduler {
    fn bind(store: Arc<dyn WorkPackageStore>, task_id: TaskId, options: SchedulerOptions) -> Self {
        Self {
            store,
            task_id,
            handle_id: HandleId::generate(),
            backoff: options.backoff,
            cancel: options.cancel,
            active_wp: None,
            holds_lock: false,
            view: TaskView::default(),
        }
    }

    /// Create a task of `wp_total` Ready work packages and bind a handle to it.
    ///
    /// With `desired` naming a task that already has rows, those rows are
    /// replaced.
    pub async fn create(
        store: Arc<dyn WorkPackageStore>,
        wp_total: u32,
        desired: Option<TaskId>,
        options: SchedulerOptions,
    ) -> Result<(Self, CreatedTask)> {
        if wp_total == 0 {
            return Err(SchedulerError::InvalidWpTotal(wp_total));
        }
        store.ensure_schema().await?;

        let created = store.create_task(wp_total, desired).await?;
        if created.replaced_rows > 0 {
            tracing::warn!(
                task = %created.task_id,
                replaced = created.replaced_rows,
                "task already existed, previous rows deleted"
            );
        }
        tracing::info!(task = %created.task_id, wp_total, "task created");

        let mut scheduler = Self::bind(store, created.task_id, options);
        scheduler.refresh().await?;
        Ok((scheduler, created))
    }

    /// Bind a handle to an existing task.
    pub async fn connect(
        store: Arc<dyn WorkPackageStore>,
        task_id: TaskId,
        options: SchedulerOptions,
    ) -> Result<Self> {
        store.ensure_schema().await?;
        let mut scheduler = Self::bind(store, task_id, options);
        if scheduler.refresh().await?.wp_total == 0 {
            return Err(SchedulerError::TaskNotFound(task_id));
        }
        tracing::debug!(task = %task_id, handle = %scheduler.handle_id, "connected");
        Ok(scheduler)
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn handle_id(&self) -> HandleId {
        self.handle_id
    }

    pub fn active_wp(&self) -> Option<WpNumber> {
        self.active_wp
    }

    pub fn holds_lock(&self) -> bool {
        self.holds_lock
    }

    /// Whether the cancel signal given at bind time has fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelSignal::is_cancelled)
    }

    /// Last view read from the store; possibly stale.
    pub fn view(&self) -> &TaskView {
        &self.view
    }

    /// Re-read the task's rows and cache the aggregate view.
    pub async fn refresh(&mut self) -> Result<&TaskView> {
        let rows = self.store.load_rows(self.task_id).await?;
        self.view = TaskView::from_rows(&rows);
        Ok(&self.view)
    }

    /// Per-package status, indexed by `wp_number - 1`.
    pub async fn status(&mut self) -> Result<Vec<WpStatus>> {
        Ok(self.refresh().await?.statuses.clone())
    }

    pub async fn wp_total(&mut self) -> Result<usize> {
        Ok(self.refresh().await?.wp_total)
    }

    pub async fn wp_todo(&mut self) -> Result<usize> {
        Ok(self.refresh().await?.wp_todo)
    }

    pub async fn wp_running(&mut self) -> Result<usize> {
        Ok(self.refresh().await?.wp_running)
    }

    pub async fn wp_finished(&mut self) -> Result<usize> {
        Ok(self.refresh().await?.wp_finished)
    }

    /// Claim the next eligible work package and make it this handle's active one.
    ///
    /// Returns `None` once no Ready package is left. While Ready packages exist
    /// but all wait on a predecessor, sleeps a random claim delay and retries.
    /// A candidate taken by another worker in the meantime is retried at once.
    #[instrument(skip_all, fields(handle = %self.handle_id, task = %self.task_id, mode = ?mode))]
    pub async fn claim(&mut self, mode: ClaimMode) -> Result<Option<WpNumber>> {
        loop {
            if self.is_cancelled() {
                return Err(SchedulerError::Cancelled);
            }
            let rows = self.store.load_rows(self.task_id).await?;
            let eligible: Vec<WpNumber> = rows
                .iter()
                .filter(|r| r.is_eligible())
                .map(|r| r.wp_number)
                .collect();
            let candidate = pick(&eligible, mode);

            if let Some(wp) = candidate {
                if self.store.try_claim(self.task_id, wp).await? {
                    self.take_active(wp).await?;
                    self.view = TaskView::from_rows(&rows);
                    tracing::debug!(%wp, "claimed");
                    return Ok(Some(wp));
                }
                tracing::debug!(%wp, "claim lost to another worker, re-reading");
                continue;
            }

            self.view = TaskView::from_rows(&rows);
            let blocked = rows.iter().filter(|r| r.is_blocked()).count();
            if blocked == 0 {
                tracing::debug!("no ready work packages left");
                return Ok(None);
            }

            let delay = self.backoff.claim_delay();
            tracing::debug!(blocked, retry_in = ?delay, "ready work packages all wait on a predecessor");
            sleep_or_cancel(delay, self.cancel.as_mut()).await?;
        }
    }

    /// Record a fresh claim, releasing a lock still held through the previous
    /// package.
    async fn take_active(&mut self, wp: WpNumber) -> Result<()> {
        if let (true, Some(previous)) = (self.holds_lock, self.active_wp) {
            tracing::warn!(%previous, "claiming while holding the task lock, releasing it");
            self.store.release_lock(self.task_id, previous).await?;
        }
        self.active_wp = Some(wp);
        self.holds_lock = false;
        Ok(())
    }

    /// Mark `wp` (or the active package) Finished and release its dependents.
    ///
    /// Any lock this handle holds is released and the active package cleared.
    #[instrument(skip_all, fields(handle = %self.handle_id, task = %self.task_id))]
    pub async fn finish(&mut self, wp: Option<WpNumber>) -> Result<FinishReport> {
        let wp = wp
            .or(self.active_wp)
            .ok_or(SchedulerError::NoActiveWorkPackage)?;

        let report = self
            .store
            .finish(self.task_id, wp)
            .await?
            .ok_or(SchedulerError::UnknownWorkPackage {
                task: self.task_id,
                wp: wp.get(),
            })?;

        if report.previous != WpStatus::Running {
            tracing::warn!(%wp, previous = %report.previous, "finished a work package that was not running");
        }
        if !report.released.is_empty() {
            tracing::debug!(%wp, released = ?report.released, "dependents released");
        }

        if let (true, Some(active)) = (self.holds_lock, self.active_wp) {
            if active != wp {
                self.store.release_lock(self.task_id, active).await?;
            }
        }
        self.active_wp = None;
        self.holds_lock = false;

        tracing::debug!(%wp, "finished");
        Ok(report)
    }

    /// Promote the task to TaskDone if every package is Finished.
    ///
    /// True exactly once per reset cycle, for whichever caller gets there first.
    #[instrument(skip_all, fields(handle = %self.handle_id, task = %self.task_id))]
    pub async fn is_finished(&mut self) -> Result<bool> {
        let done = self.store.complete_task(self.task_id).await?;
        if done {
            tracing::info!("all work packages finished, task done");
        }
        Ok(done)
    }

    /// Park every Ready package; returns how many were suspended.
    #[instrument(skip_all, fields(handle = %self.handle_id, task = %self.task_id))]
    pub async fn suspend(&mut self) -> Result<u64> {
        let suspended = self
            .store
            .update_status(
                self.task_id,
                &RowFilter::Status(WpStatus::Ready),
                WpStatus::Suspended,
                false,
            )
            .await?;
        tracing::info!(suspended, "suspended ready work packages");
        Ok(suspended)
    }

    /// Drive the rows selected by `scope` back to Ready; returns how many changed.
    #[instrument(skip_all, fields(handle = %self.handle_id, task = %self.task_id, scope = ?scope))]
    pub async fn reset(&mut self, scope: ResetScope) -> Result<u64> {
        let filter = match &scope {
            ResetScope::Suspended => RowFilter::Status(WpStatus::Suspended),
            ResetScope::Running => RowFilter::Status(WpStatus::Running),
            ResetScope::All => RowFilter::All,
            ResetScope::Specific(wps) => {
                let wp_total = self.refresh().await?.wp_total;
                if let Some(bad) = wps.iter().find(|wp| wp.index() >= wp_total) {
                    return Err(SchedulerError::UnknownWorkPackage {
                        task: self.task_id,
                        wp: bad.get(),
                    });
                }
                RowFilter::Numbers(wps.clone())
            }
        };

        let changed = self
            .store
            .update_status(self.task_id, &filter, WpStatus::Ready, scope.clears_lock())
            .await?;

        if self.active_wp.is_some_and(|wp| scope.may_touch(wp)) {
            self.active_wp = None;
            self.holds_lock = false;
        }
        tracing::info!(changed, "reset work packages to ready");
        Ok(changed)
    }

    /// Take the task's advisory lock through the active package.
    ///
    /// Always asks the store, so a lock this handle lost to a forced unlock is
    /// waited for like any other. Waits the fixed lock interval between
    /// attempts, without limit, until the lock is free or the cancel signal
    /// fires.
    #[instrument(skip_all, fields(handle = %self.handle_id, task = %self.task_id))]
    pub async fn lock(&mut self) -> Result<()> {
        let wp = self.active_wp.ok_or(SchedulerError::NoActiveWorkPackage)?;

        loop {
            if self.is_cancelled() {
                return Err(SchedulerError::Cancelled);
            }
            if self.store.try_lock(self.task_id, wp).await? {
                self.holds_lock = true;
                tracing::debug!(%wp, "lock acquired");
                return Ok(());
            }
            if self.holds_lock {
                tracing::warn!(%wp, "lock was cleared and taken by another holder");
                self.holds_lock = false;
            }
            tracing::debug!(%wp, retry_in = ?self.backoff.lock_interval, "lock held elsewhere");
            sleep_or_cancel(self.backoff.lock_interval, self.cancel.as_mut()).await?;
        }
    }

    /// Give the lock back. `force` clears every lock flag of the task
    /// regardless of who set it.
    #[instrument(skip_all, fields(handle = %self.handle_id, task = %self.task_id, force = force))]
    pub async fn unlock(&mut self, force: bool) -> Result<()> {
        if force {
            let cleared = self.store.clear_locks(self.task_id).await?;
            tracing::warn!(cleared, "lock flags force-cleared");
            self.holds_lock = false;
            return Ok(());
        }

        let released = match self.active_wp {
            Some(wp) => self.store.release_lock(self.task_id, wp).await?,
            None => false,
        };
        if !released {
            return Err(SchedulerError::NotLockOwner(self.active_wp));
        }
        self.holds_lock = false;
        tracing::debug!("lock released");
        Ok(())
    }

    /// Current predecessor of every package, indexed by `wp_number - 1`.
    pub async fn get_dependencies(&mut self) -> Result<Vec<Option<WpNumber>>> {
        Ok(self.refresh().await?.depends.clone())
    }

    /// Replace the whole dependency vector; returns the number of rows written.
    ///
    /// Nothing is written unless the whole vector is valid. The store decides
    /// which rows change against its own current state.
    #[instrument(skip_all, fields(handle = %self.handle_id, task = %self.task_id))]
    pub async fn set_dependencies(&mut self, depends: &[Option<WpNumber>]) -> Result<usize> {
        let wp_total = self.refresh().await?.wp_total;
        dependency::validate(depends, wp_total)?;

        let written = self.store.update_dependencies(self.task_id, depends).await?;
        tracing::debug!(written, "dependencies updated");
        self.refresh().await?;
        Ok(written)
    }

    /// Delete every row of the task; returns the number removed.
    #[instrument(skip_all, fields(handle = %self.handle_id, task = %self.task_id))]
    pub async fn delete_task(self) -> Result<u64> {
        let deleted = self.store.delete_task(self.task_id).await?;
        tracing::info!(deleted, "task deleted");
        Ok(deleted)
    }
}

fn pick(eligible: &[WpNumber], mode: ClaimMode) -> Option<WpNumber> {
    match mode {
        ClaimMode::Sequential => eligible.first().copied(),
        ClaimMode::Random => eligible.choose(&mut rand::thread_rng()).copied(),
    }
}
