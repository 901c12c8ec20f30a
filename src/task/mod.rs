//! Task module - the audit task record and its store.
//!
//! Tasks are only mutated through [`TaskStore::update`]; everything else
//! works with cloned snapshots.

pub mod task;
mod store;

pub use store::{TaskStore, TaskStoreError};
pub use task::{ServiceName, Task, TaskFailure, TaskId, TaskStatus};
