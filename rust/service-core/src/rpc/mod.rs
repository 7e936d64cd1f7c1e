//! RPC plumbing between clients, the dispatcher and workers.
//!
//! This module provides:
//!
//! - Generated protobuf and gRPC code for both services
//! - Domain wrapper types with conversions to and from the wire messages
//! - The `DispatcherClient` and `WorkerClient` seams with gRPC implementations
//! - A factory creating worker clients by address
//! - Retry policy with exponential backoff

mod dispatcher_client;
pub mod protocol;
mod retry;
mod worker_client;

// Generated protobuf code
pub mod proto {
    tonic::include_proto!("dataservice");
}

pub use dispatcher_client::{DispatcherClient, GrpcDispatcherClient};
pub use protocol::{
    GetElementResult, HeartbeatResponse, ProcessingMode, TaskDataset, TaskDef, TaskInfo,
    TaskProgress, TasksResponse,
};
pub use retry::{retry_async, RetryPolicy, RetryResult};
pub use worker_client::{
    GrpcWorkerClient, GrpcWorkerClientFactory, WorkerClient, WorkerClientFactory,
};

use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

use crate::error::{Result, ServiceError};

/// Builds a lazily connecting channel to `address` (`host:port`).
///
/// `timeout` bounds both connection setup and each request.
pub fn lazy_channel(address: &str, timeout: Duration) -> Result<Channel> {
    let uri = if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    };
    let endpoint = Endpoint::from_shared(uri).map_err(|e| {
        ServiceError::invalid_argument(format!("invalid address '{address}': {e}"))
    })?;
    Ok(endpoint
        .connect_timeout(timeout)
        .timeout(timeout)
        .connect_lazy())
}
