//! Worker of the distributed data service.
//!
//! Workers register with the dispatcher through heartbeats, run the tasks it
//! assigns them and serve the resulting elements to clients.

pub mod service;
pub mod split_provider;
pub mod worker;

pub use service::WorkerServiceImpl;
pub use split_provider::RemoteSplitProvider;
pub use worker::WorkerImpl;
