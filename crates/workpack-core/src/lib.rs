//! workpack-core
//!
//! Cooperative scheduling of work packages through a shared store.
//!
//! Workers in any number of processes bind a `Scheduler` handle to the same
//! task and claim, finish and lock work packages. The store is the only
//! channel between them; there is no coordinating daemon.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, status, row, task view, claim/reset mode）
//! - **ports**: 抽象化レイヤー（`WorkPackageStore`）
//! - **impls**: 実装（in-memory と SQLite）
//! - **app**: アプリケーションロジック（`Scheduler`, backoff, cancel）
//! - **config**: ストア接続情報ファイル
//! - **error**: エラー型（`SchedulerError`）

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;

pub use app::{BackoffPolicy, CancelSignal, Scheduler, SchedulerOptions};
pub use config::StoreConfig;
pub use domain::{ClaimMode, ResetScope, TaskId, TaskView, WpNumber, WpStatus};
pub use error::{Result, SchedulerError};
pub use impls::{InMemoryStore, SqliteStore};
pub use ports::WorkPackageStore;
