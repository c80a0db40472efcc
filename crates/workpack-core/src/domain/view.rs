use serde::{Deserialize, Serialize};

use super::{WorkPackageRow, WpNumber, WpStatus};

/// Locally cached view of a task, rebuilt from a store read.
///
/// Never authoritative: other workers may have changed the rows since.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    pub wp_total: usize,
    pub wp_todo: usize,
    pub wp_running: usize,
    /// Finished or TaskDone.
    pub wp_finished: usize,
    pub wp_suspended: usize,
    /// Indexed by `wp_number - 1`.
    pub statuses: Vec<WpStatus>,
    /// Indexed by `wp_number - 1`.
    pub depends: Vec<Option<WpNumber>>,
}

impl TaskView {
    /// Build from the rows of one task, in any order.
    pub fn from_rows(rows: &[WorkPackageRow]) -> Self {
        let mut sorted: Vec<&WorkPackageRow> = rows.iter().collect();
        sorted.sort_by_key(|r| r.wp_number);

        let mut view = TaskView {
            wp_total: sorted.len(),
            statuses: Vec::with_capacity(sorted.len()),
            depends: Vec::with_capacity(sorted.len()),
            ..TaskView::default()
        };
        for row in sorted {
            match row.status {
                WpStatus::Ready => view.wp_todo += 1,
                WpStatus::Running => view.wp_running += 1,
                WpStatus::Finished | WpStatus::TaskDone => view.wp_finished += 1,
                WpStatus::Suspended => view.wp_suspended += 1,
            }
            view.statuses.push(row.status);
            view.depends.push(row.depend);
        }
        view
    }

    pub fn status_of(&self, wp: WpNumber) -> Option<WpStatus> {
        self.statuses.get(wp.index()).copied()
    }
}
