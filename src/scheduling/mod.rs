pub mod api;
pub mod dispatch;
pub mod posts;
pub mod recurrence;

pub use dispatch::{spawn_post_sweep, spawn_recurring_sweep, PostDispatcher, RecurringSweep};
pub use recurrence::{is_due, RecurrenceRule};
