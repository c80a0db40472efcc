//! App - ストア port の上に載るスケジューリングロジック
//!
//! # コンポーネント
//! - **Scheduler**: プロセスごとのハンドル（claim, finish, lock, reset, など）
//! - **BackoffPolicy**: claim / lock / connect ループのリトライ間隔
//! - **CancelSignal**: リトライループの中断
//! - **dependency**: 依存ベクタの検証

pub mod backoff;
pub mod cancel;
pub mod dependency;
pub mod scheduler;

pub use self::backoff::BackoffPolicy;
pub use self::cancel::CancelSignal;
pub use self::dependency::DependencyError;
pub use self::scheduler::{Scheduler, SchedulerOptions};
