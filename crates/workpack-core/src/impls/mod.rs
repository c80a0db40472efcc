//! Impls - ストア実装
//!
//! - **InMemoryStore**: プロセス内テーブル（clone 間で共有）
//! - **SqliteStore**: プロセス間で共有する SQLite ファイル

pub mod memory;
pub mod sqlite;

pub use self::memory::InMemoryStore;
pub use self::sqlite::SqliteStore;
