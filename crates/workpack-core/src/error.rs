use thiserror::Error;

use crate::app::dependency::DependencyError;
use crate::config::ConfigError;
use crate::domain::{TaskId, WpNumber};

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("table {table} exists with an unexpected column set: [{found}]")]
    SchemaMismatch { table: String, found: String },

    #[error("no work package is held by this handle")]
    NoActiveWorkPackage,

    #[error("task lock is not owned by work package {0:?}")]
    NotLockOwner(Option<WpNumber>),

    #[error("invalid reset mode {0:?} (expected suspended, running, all or specific)")]
    InvalidResetMode(String),

    #[error("invalid dependencies: {0}")]
    InvalidDependencies(#[from] DependencyError),

    #[error("a task needs at least one work package (got {0})")]
    InvalidWpTotal(u32),

    #[error("work package {wp} does not exist in {task}")]
    UnknownWorkPackage { task: TaskId, wp: u32 },

    #[error("{0} has no work packages")]
    TaskNotFound(TaskId),

    #[error("{0} does not fit the store's integer key")]
    TaskIdOutOfRange(TaskId),

    #[error("operation cancelled")]
    Cancelled,

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store: {0}")]
    Store(String),
}

impl SchedulerError {
    /// Contention or connectivity trouble that a retry can clear.
    pub fn is_transient(&self) -> bool {
        match self {
            SchedulerError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::CannotOpen
            ),
            _ => false,
        }
    }
}
