//! Work-package state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of one work package.
///
/// State transitions:
/// - Ready -> Running (claim, only without a pending dependency)
/// - Running -> Finished (finish)
/// - Finished -> TaskDone (completion check, only when every row is Finished)
/// - Ready -> Suspended (suspend)
/// - any -> Ready (reset, per selected subset)
///
/// The discriminants are the codes persisted in the `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WpStatus {
    /// Waiting to be claimed.
    Ready = 0,

    /// Claimed by a worker.
    Running = 1,

    /// Reported done by its worker.
    Finished = 2,

    /// Every package of the task finished and the completion check fired.
    TaskDone = 3,

    /// Withheld from claiming until reset.
    Suspended = 4,
}

impl WpStatus {
    pub const ALL: [WpStatus; 5] = [
        WpStatus::Ready,
        WpStatus::Running,
        WpStatus::Finished,
        WpStatus::TaskDone,
        WpStatus::Suspended,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| i64::from(s.code()) == code)
    }

    /// Is this package eligible for claim (ignoring dependencies)?
    pub fn is_claimable(self) -> bool {
        matches!(self, WpStatus::Ready)
    }

    /// Has the work of this package been done?
    pub fn is_done(self) -> bool {
        matches!(self, WpStatus::Finished | WpStatus::TaskDone)
    }
}

impl fmt::Display for WpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WpStatus::Ready => "ready",
            WpStatus::Running => "running",
            WpStatus::Finished => "finished",
            WpStatus::TaskDone => "task_done",
            WpStatus::Suspended => "suspended",
        };
        f.write_str(name)
    }
}
