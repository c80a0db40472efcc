use std::process::ExitStatus;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::task::JoinHandle;

use workpack_core::{
    ClaimMode, Scheduler, SchedulerError, SchedulerOptions, TaskId, WorkPackageStore, WpNumber,
};

/// What every worker runs for each claimed work package.
#[derive(Debug, Clone)]
pub struct WorkPlan {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub mode: ClaimMode,
    /// Hold the task lock while the command runs.
    pub serialize: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub finished: u64,
    pub failed: u64,
}

/// Worker group handle.
/// - 各ワーカーは同じタスクに bind した自分専用の `Scheduler` を持つ
/// - `options` の cancel signal を発火すると次の claim の前に止まる
/// - `join()` で全ワーカーの終了を待てる
pub struct WorkerGroup {
    joins: Vec<JoinHandle<Result<WorkerStats>>>,
}

impl WorkerGroup {
    /// Spawn `n` workers on `task`.
    pub async fn spawn(
        n: usize,
        store: Arc<dyn WorkPackageStore>,
        task: TaskId,
        options: SchedulerOptions,
        plan: Arc<WorkPlan>,
    ) -> Result<Self> {
        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let scheduler = Scheduler::connect(Arc::clone(&store), task, options.clone())
                .await
                .with_context(|| format!("worker {worker_id}: cannot bind to {task}"))?;
            let plan = Arc::clone(&plan);
            joins.push(tokio::spawn(worker_loop(worker_id, scheduler, plan)));
        }
        Ok(Self { joins })
    }

    /// Wait for every worker and add up their results.
    pub async fn join(self) -> Result<WorkerStats> {
        let mut total = WorkerStats::default();
        for join in self.joins {
            let stats = join.await.context("worker panicked")??;
            total.finished += stats.finished;
            total.failed += stats.failed;
        }
        Ok(total)
    }
}

async fn worker_loop(worker_id: usize, mut scheduler: Scheduler, plan: Arc<WorkPlan>) -> Result<WorkerStats> {
    let mut stats = WorkerStats::default();
    tracing::debug!(worker_id, handle = %scheduler.handle_id(), "worker started");

    loop {
        let wp = match scheduler.claim(plan.mode).await {
            Ok(Some(wp)) => wp,
            Ok(None) => {
                tracing::debug!(worker_id, "nothing left to claim");
                break;
            }
            Err(SchedulerError::Cancelled) => break,
            Err(err) => return Err(err.into()),
        };

        if plan.serialize {
            match scheduler.lock().await {
                Ok(()) => {}
                Err(SchedulerError::Cancelled) => {
                    tracing::warn!(worker_id, %wp, "cancelled while waiting for the lock, leaving it running");
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        tracing::info!(worker_id, %wp, "running");
        match run_command(&plan.command, scheduler.task_id(), wp).await {
            Ok(status) if status.success() => {
                scheduler.finish(None).await?;
                stats.finished += 1;
            }
            outcome => {
                match outcome {
                    Ok(status) => tracing::warn!(worker_id, %wp, %status, "command failed, leaving it running"),
                    Err(err) => tracing::error!(worker_id, %wp, error = %err, "cannot start command, leaving it running"),
                }
                stats.failed += 1;
                if scheduler.holds_lock() {
                    scheduler.unlock(false).await?;
                }
            }
        }
    }

    Ok(stats)
}

async fn run_command(command: &[String], task: TaskId, wp: WpNumber) -> std::io::Result<ExitStatus> {
    let Some((program, args)) = command.split_first() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty command",
        ));
    };
    Command::new(program)
        .args(args)
        .env("WORKPACK_TASK", task.get().to_string())
        .env("WORKPACK_WP", wp.get().to_string())
        .status()
        .await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use workpack_core::{BackoffPolicy, CancelSignal, InMemoryStore, WpStatus};

    fn options() -> SchedulerOptions {
        SchedulerOptions {
            backoff: BackoffPolicy::fast(),
            cancel: None,
        }
    }

    fn shell(script: &str, serialize: bool) -> Arc<WorkPlan> {
        Arc::new(WorkPlan {
            command: vec!["sh".into(), "-c".into(), script.into()],
            mode: ClaimMode::Sequential,
            serialize,
        })
    }

    async fn task(store: &InMemoryStore, wp_total: u32) -> TaskId {
        let (scheduler, _) = Scheduler::create(Arc::new(store.clone()), wp_total, None, options())
            .await
            .unwrap();
        scheduler.task_id()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn workers_finish_every_package() {
        let store = InMemoryStore::new();
        let task = task(&store, 6).await;

        let group = WorkerGroup::spawn(3, Arc::new(store.clone()), task, options(), shell("true", true))
            .await
            .unwrap();
        let stats = group.join().await.unwrap();
        assert_eq!(stats, WorkerStats { finished: 6, failed: 0 });

        let rows = store.load_rows(task).await.unwrap();
        assert!(rows.iter().all(|r| r.status == WpStatus::Finished && !r.lock_owner));
    }

    #[tokio::test]
    async fn failed_command_leaves_package_running() {
        let store = InMemoryStore::new();
        let task = task(&store, 3).await;

        let plan = shell("test \"$WORKPACK_WP\" != 2", false);
        let group = WorkerGroup::spawn(1, Arc::new(store.clone()), task, options(), plan)
            .await
            .unwrap();
        let stats = group.join().await.unwrap();
        assert_eq!(stats, WorkerStats { finished: 2, failed: 1 });

        let statuses: Vec<WpStatus> = store
            .load_rows(task)
            .await
            .unwrap()
            .iter()
            .map(|r| r.status)
            .collect();
        assert_eq!(
            statuses,
            vec![WpStatus::Finished, WpStatus::Running, WpStatus::Finished]
        );
    }

    #[tokio::test]
    async fn cancelled_group_claims_nothing() {
        let store = InMemoryStore::new();
        let task = task(&store, 2).await;
        let (tx, cancel) = CancelSignal::channel();
        tx.send(true).unwrap();

        let opts = SchedulerOptions {
            cancel: Some(cancel),
            ..options()
        };
        let group = WorkerGroup::spawn(2, Arc::new(store.clone()), task, opts, shell("true", false))
            .await
            .unwrap();
        assert_eq!(group.join().await.unwrap(), WorkerStats::default());
        assert!(store
            .load_rows(task)
            .await
            .unwrap()
            .iter()
            .all(|r| r.status == WpStatus::Ready));
    }
}
