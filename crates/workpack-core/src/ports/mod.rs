//! Ports - 共有ストアの抽象化レイヤー
//!
//! ワーカー間の唯一の通信路はストア。実装は `impls` にある：
//! - テスト・単一プロセス用の in-memory テーブル
//! - 複数プロセスが 1 ファイルを共有する SQLite テーブル

pub mod task_store;

pub use self::task_store::{
    COLUMNS, CreatedTask, DependencyChange, FinishReport, RowFilter, WorkPackageStore,
    plan_dependency_changes,
};
