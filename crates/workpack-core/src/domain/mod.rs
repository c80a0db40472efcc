//! Domain model (ids, status, rows, views, modes).

pub mod ids;
pub mod modes;
pub mod row;
pub mod state;
pub mod view;

pub use ids::{HandleId, RowId, TaskId, WpNumber};
pub use modes::{ClaimMode, ResetScope};
pub use row::WorkPackageRow;
pub use state::WpStatus;
pub use view::TaskView;
