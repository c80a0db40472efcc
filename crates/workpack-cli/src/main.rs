//! workpack - claim and manage work packages in a shared store.

mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use workpack_core::{
    BackoffPolicy, CancelSignal, ClaimMode, ResetScope, Scheduler, SchedulerOptions, SqliteStore,
    StoreConfig, TaskId, TaskView, WorkPackageStore, WpNumber,
};

use crate::worker::{WorkPlan, WorkerGroup};

#[derive(Parser)]
#[command(
    name = "workpack",
    version,
    about = "Cooperative work-package scheduling over a shared store"
)]
struct Cli {
    /// Store credentials file
    #[arg(long, short, global = true, default_value = "workpack.conf")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Copy)]
struct TaskArg {
    /// Task id
    #[arg(long)]
    task: u64,
}

impl TaskArg {
    fn id(self) -> TaskId {
        TaskId::new(self.task)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a task of Ready work packages and print its id
    Create {
        wp_total: u32,

        /// Reuse this id, replacing any rows it already has
        #[arg(long)]
        task_id: Option<u64>,
    },
    /// Claim one work package and print its number (0 when none is left)
    Claim {
        #[command(flatten)]
        task: TaskArg,

        /// Pick randomly among eligible packages
        #[arg(long)]
        random: bool,
    },
    /// Mark a work package finished
    Finish {
        #[command(flatten)]
        task: TaskArg,

        #[arg(long)]
        wp: u32,
    },
    /// Show counts and per-package status
    Status {
        #[command(flatten)]
        task: TaskArg,

        #[arg(long)]
        json: bool,
    },
    /// Mark the task done if every package is finished; prints true or false
    Done {
        #[command(flatten)]
        task: TaskArg,
    },
    /// Suspend every Ready package
    Suspend {
        #[command(flatten)]
        task: TaskArg,
    },
    /// Move packages back to Ready (suspended, running, all or specific)
    Reset {
        #[command(flatten)]
        task: TaskArg,

        #[arg(default_value = "suspended")]
        mode: String,

        /// Packages for the `specific` mode
        #[arg(long = "wp")]
        wps: Vec<u32>,
    },
    /// Clear the task lock regardless of its holder
    Unlock {
        #[command(flatten)]
        task: TaskArg,

        #[arg(long, required = true)]
        force: bool,
    },
    /// Inspect or replace the dependency vector
    Deps {
        #[command(subcommand)]
        command: DepsCommand,
    },
    /// Delete every row of the task
    Delete {
        #[command(flatten)]
        task: TaskArg,
    },
    /// Run a command once per work package until none is left
    Work {
        #[command(flatten)]
        task: TaskArg,

        /// Number of concurrent workers
        #[arg(long, default_value_t = 1)]
        workers: usize,

        #[arg(long)]
        random: bool,

        /// Hold the task lock while the command runs
        #[arg(long)]
        serialize: bool,

        /// Command and arguments; WORKPACK_TASK and WORKPACK_WP are set
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[derive(Subcommand)]
enum DepsCommand {
    /// Print the predecessor of every package (0 for none)
    Get {
        #[command(flatten)]
        task: TaskArg,
    },
    /// Set the predecessor of every package, in order (0 for none)
    Set {
        #[command(flatten)]
        task: TaskArg,

        #[arg(required = true)]
        depends: Vec<u32>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("workpack=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Cancel signal fired by Ctrl-C.
fn cancel_on_ctrl_c() -> CancelSignal {
    let (tx, signal) = CancelSignal::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::warn!("interrupted, stopping");
                let _ = tx.send(true);
            }
            Err(err) => {
                tracing::error!(error = %err, "cannot listen for Ctrl-C");
                // keep the sender alive; dropping it would cancel
                std::future::pending::<()>().await;
            }
        }
    });
    signal
}

fn claim_mode(random: bool) -> ClaimMode {
    if random {
        ClaimMode::Random
    } else {
        ClaimMode::Sequential
    }
}

fn wp_number(n: u32) -> Result<WpNumber> {
    WpNumber::new(n).ok_or_else(|| anyhow!("work package numbers start at 1"))
}

fn print_view(task: TaskId, view: &TaskView) {
    println!(
        "{task}: total {}, ready {}, running {}, finished {}, suspended {}",
        view.wp_total, view.wp_todo, view.wp_running, view.wp_finished, view.wp_suspended
    );
    for (index, (status, depend)) in view.statuses.iter().zip(&view.depends).enumerate() {
        let Some(wp) = WpNumber::from_index(index) else {
            continue;
        };
        match depend {
            Some(pred) => println!("  {wp}\t{status}\tafter {pred}"),
            None => println!("  {wp}\t{status}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = StoreConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let backoff = BackoffPolicy::default();
    let store: Arc<dyn WorkPackageStore> =
        Arc::new(SqliteStore::connect(&config, backoff.connect_interval).await?);
    let options = SchedulerOptions {
        backoff,
        cancel: Some(cancel_on_ctrl_c()),
    };

    match cli.command {
        Commands::Create { wp_total, task_id } => {
            let (_, created) =
                Scheduler::create(store, wp_total, task_id.map(TaskId::new), options).await?;
            println!("{}", created.task_id.get());
        }

        Commands::Claim { task, random } => {
            let mut scheduler = Scheduler::connect(store, task.id(), options).await?;
            let claimed = scheduler.claim(claim_mode(random)).await?;
            println!("{}", WpNumber::encode(claimed));
        }

        Commands::Finish { task, wp } => {
            let mut scheduler = Scheduler::connect(store, task.id(), options).await?;
            scheduler.finish(Some(wp_number(wp)?)).await?;
        }

        Commands::Status { task, json } => {
            let mut scheduler = Scheduler::connect(store, task.id(), options).await?;
            let view = scheduler.refresh().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(view)?);
            } else {
                print_view(task.id(), view);
            }
        }

        Commands::Done { task } => {
            let mut scheduler = Scheduler::connect(store, task.id(), options).await?;
            println!("{}", scheduler.is_finished().await?);
        }

        Commands::Suspend { task } => {
            let mut scheduler = Scheduler::connect(store, task.id(), options).await?;
            println!("{}", scheduler.suspend().await?);
        }

        Commands::Reset { task, mode, wps } => {
            let wps = wps.into_iter().map(wp_number).collect::<Result<Vec<_>>>()?;
            let scope = ResetScope::parse(&mode, wps)?;
            let mut scheduler = Scheduler::connect(store, task.id(), options).await?;
            println!("{}", scheduler.reset(scope).await?);
        }

        Commands::Unlock { task, force } => {
            let mut scheduler = Scheduler::connect(store, task.id(), options).await?;
            scheduler.unlock(force).await?;
        }

        Commands::Deps { command } => match command {
            DepsCommand::Get { task } => {
                let mut scheduler = Scheduler::connect(store, task.id(), options).await?;
                let depends = scheduler.get_dependencies().await?;
                let line: Vec<String> = depends
                    .into_iter()
                    .map(|d| WpNumber::encode(d).to_string())
                    .collect();
                println!("{}", line.join(" "));
            }
            DepsCommand::Set { task, depends } => {
                let depends: Vec<Option<WpNumber>> = depends.into_iter().map(WpNumber::new).collect();
                let mut scheduler = Scheduler::connect(store, task.id(), options).await?;
                let written = scheduler.set_dependencies(&depends).await?;
                tracing::info!(written, "dependencies stored");
            }
        },

        Commands::Delete { task } => {
            let scheduler = Scheduler::connect(store, task.id(), options).await?;
            println!("{}", scheduler.delete_task().await?);
        }

        Commands::Work {
            task,
            workers,
            random,
            serialize,
            command,
        } => {
            let plan = Arc::new(WorkPlan {
                command,
                mode: claim_mode(random),
                serialize,
            });
            let group = WorkerGroup::spawn(
                workers.max(1),
                Arc::clone(&store),
                task.id(),
                options.clone(),
                plan,
            )
            .await?;
            let stats = group.join().await?;
            tracing::info!(finished = stats.finished, failed = stats.failed, "workers stopped");

            let mut scheduler = Scheduler::connect(store, task.id(), options).await?;
            if scheduler.is_finished().await? {
                println!("{} done", task.id());
            } else {
                let view = scheduler.refresh().await?;
                println!(
                    "{}: {} of {} finished, {} running",
                    task.id(),
                    view.wp_finished,
                    view.wp_total,
                    view.wp_running
                );
            }
        }
    }

    Ok(())
}
