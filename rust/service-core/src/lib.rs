// rust/service-core/src/lib.rs

//! Distributed Data Service - Core Library
//!
//! Shared building blocks for the dispatcher and worker processes: error
//! handling, configuration, the state journal, dataset storage, the dataset
//! abstraction with its split providers, RPC types and clients, and the
//! client-side iterator over a job's elements.

pub mod client;
pub mod clock;
pub mod config;
pub mod dataset;
pub mod error;
pub mod journal;
pub mod rpc;
pub mod storage;

// Re-export commonly used types for convenience
pub use client::{DataServiceClient, JobName};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DispatcherConfig, WorkerConfig};
pub use error::{ErrorCode, Result, ServiceError};
pub use journal::{JournalReader, JournalWriter};
pub use rpc::{DispatcherClient, ProcessingMode, WorkerClient, WorkerClientFactory};
pub use storage::{DatasetStore, FileSystemDatasetStore, MemoryDatasetStore};
