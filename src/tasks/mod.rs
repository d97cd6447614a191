//! Tasks: the unit of work claimed and executed by orchestrators.

pub mod model;

pub use model::{NewTask, Task, TaskStatus, TaskUpdate, short_id};
