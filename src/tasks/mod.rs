//! Asynchronous task lifecycle: records, storage, and the manager that
//! drives creation, dispatch, cancellation and expiry.

pub mod manager;
pub mod store;
pub mod task;

pub use manager::{CancelOutcome, TaskManager};
pub use store::{InMemoryTaskStore, TaskStore};
pub use task::{TaskPriority, TaskRecord, TaskStatus};
