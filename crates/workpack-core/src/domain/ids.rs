//! Domain identifiers (strongly-typed IDs).
//!
//! Task ids and work-package numbers are small integers because they are
//! shared with every worker through the store; handle ids only live inside one
//! process and use ULIDs so log lines from many workers can be told apart.

use std::fmt;
use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Identifier of a task (the group of rows sharing one `task_id`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Next id after this one, as used when allocating `max(task_id) + 1`.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Number of a work package inside its task, always in `[1, wp_total]`.
///
/// `0` is reserved on the wire for "no work package" (claim exhausted, no
/// dependency), so it can never be a valid `WpNumber`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WpNumber(NonZeroU32);

impl WpNumber {
    pub fn new(value: u32) -> Option<Self> {
        NonZeroU32::new(value).map(Self)
    }

    pub const fn get(self) -> u32 {
        self.0.get()
    }

    /// Zero-based position in per-task vectors (`statuses[]`, `depends[]`).
    pub fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }

    /// Inverse of [`WpNumber::index`].
    pub fn from_index(index: usize) -> Option<Self> {
        u32::try_from(index + 1).ok().and_then(Self::new)
    }

    /// Wire form of an optional number: `0` for none.
    pub fn encode(wp: Option<WpNumber>) -> u32 {
        wp.map_or(0, WpNumber::get)
    }
}

impl fmt::Display for WpNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wp-{}", self.0)
    }
}

/// Store-allocated primary key of a row. 64-bit, never reused or wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(u64);

impl RowId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Identity of one scheduler handle, used only for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(Ulid);

impl HandleId {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle-{}", self.0)
    }
}
