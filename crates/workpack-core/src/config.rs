//! Store credentials file.
//!
//! Format: one `name = value` pair per line, `%` starts a comment that runs to
//! the end of the line, blank lines are ignored. All five keys are required.
//!
//! ```text
//! % shared work-package store
//! server   = localhost
//! database = /srv/workpack/tasks.db
//! user     = worker
//! password = secret
//! table    = workpackages
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

pub const KEYS: [&str; 5] = ["server", "database", "user", "password", "table"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: expected `name = value`, got {content:?}")]
    Malformed { line: usize, content: String },

    #[error("line {line}: unknown key {key:?}")]
    UnknownKey { line: usize, key: String },

    #[error("line {line}: key {key:?} given twice")]
    DuplicateKey { line: usize, key: String },

    #[error("line {line}: invalid value for {key:?}")]
    InvalidValue { line: usize, key: String },

    #[error("missing key {0:?}")]
    MissingKey(&'static str),

    #[error("invalid table name {0:?}")]
    InvalidTable(String),
}

/// A value that prints as `<redacted>` in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Redacted<T>(T);

impl<T> Redacted<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Connection settings for the shared store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub server: String,
    /// For the SQLite store, the path of the shared database file.
    pub database: String,
    pub user: String,
    pub password: Redacted<String>,
    /// Name of the backing table.
    pub table: String,
}

impl StoreConfig {
    /// Settings for a SQLite file with the given table name.
    pub fn sqlite(path: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            server: "localhost".to_string(),
            database: path.into(),
            user: String::new(),
            password: Redacted::new(String::new()),
            table: table.into(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        text.parse()
    }
}

impl FromStr for StoreConfig {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut values: [Option<String>; 5] = Default::default();

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let content = raw.split('%').next().unwrap_or_default().trim();
            if content.is_empty() {
                continue;
            }

            let Some((name, value)) = content.split_once('=') else {
                return Err(ConfigError::Malformed {
                    line,
                    content: content.to_string(),
                });
            };
            let (name, value) = (name.trim(), value.trim());
            if name.is_empty() {
                return Err(ConfigError::Malformed {
                    line,
                    content: content.to_string(),
                });
            }

            let Some(slot) = KEYS.iter().position(|k| *k == name) else {
                return Err(ConfigError::UnknownKey {
                    line,
                    key: name.to_string(),
                });
            };
            if !is_token(value) {
                return Err(ConfigError::InvalidValue {
                    line,
                    key: name.to_string(),
                });
            }
            if values[slot].replace(value.to_string()).is_some() {
                return Err(ConfigError::DuplicateKey {
                    line,
                    key: name.to_string(),
                });
            }
        }

        let [server, database, user, password, table] = values;
        Ok(StoreConfig {
            server: server.ok_or(ConfigError::MissingKey("server"))?,
            database: database.ok_or(ConfigError::MissingKey("database"))?,
            user: user.ok_or(ConfigError::MissingKey("user"))?,
            password: Redacted::new(password.ok_or(ConfigError::MissingKey("password"))?),
            table: table.ok_or(ConfigError::MissingKey("table"))?,
        })
    }
}

/// Values are alphanumeric plus `-`, `_`, `.` and `/`.
pub fn is_token(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}
