//! Dispatcher of the distributed data service.
//!
//! The dispatcher owns all authoritative state: registered datasets, workers,
//! jobs, job clients and tasks. It hands tasks to workers, serves splits to
//! distributed-epoch jobs and garbage collects jobs whose clients are gone.

pub mod dispatcher;
pub mod service;
pub mod state;

pub use dispatcher::DispatcherImpl;
pub use service::DispatcherServiceImpl;
pub use state::{DispatcherState, NamedJobKey, Update};
