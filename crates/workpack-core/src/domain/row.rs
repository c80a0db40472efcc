//! Work-package row: the persisted unit of state.

use serde::{Deserialize, Serialize};

use super::{RowId, TaskId, WpNumber, WpStatus};

/// One persisted record per work package.
///
/// The store owns these; handles only ever see copies read back from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkPackageRow {
    pub row_id: RowId,
    pub task_id: TaskId,
    pub wp_number: WpNumber,
    pub status: WpStatus,

    /// Set on the row whose holder owns the task's advisory lock.
    pub lock_owner: bool,

    /// Single predecessor this row waits for.
    pub depend: Option<WpNumber>,
}

impl WorkPackageRow {
    /// Fresh row as inserted at task creation.
    pub fn new(row_id: RowId, task_id: TaskId, wp_number: WpNumber) -> Self {
        Self {
            row_id,
            task_id,
            wp_number,
            status: WpStatus::Ready,
            lock_owner: false,
            depend: None,
        }
    }

    /// Ready and not waiting for a predecessor.
    pub fn is_eligible(&self) -> bool {
        self.status.is_claimable() && self.depend.is_none()
    }

    /// Ready but gated on a predecessor.
    pub fn is_blocked(&self) -> bool {
        self.status.is_claimable() && self.depend.is_some()
    }

    pub fn start(&mut self) {
        self.status = WpStatus::Running;
    }

    pub fn finish(&mut self) {
        self.status = WpStatus::Finished;
        self.lock_owner = false;
    }

    /// Bulk transition used by suspend and reset, optionally dropping the
    /// lock flag.
    pub fn set_status(&mut self, to: WpStatus, clear_lock: bool) {
        self.status = to;
        if clear_lock {
            self.lock_owner = false;
        }
    }
}
