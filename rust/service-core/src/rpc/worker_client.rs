//! Client side of the worker service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::Channel;
use tonic::Request;

use super::proto::worker_service_client::WorkerServiceClient;
use super::proto::{GetElementRequest, GetWorkerTasksRequest, ProcessTaskRequest};
use super::protocol::{GetElementResult, TaskDef, TaskInfo};
use crate::error::Result;

/// Operations a worker exposes to the dispatcher and to clients.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Hands a task to the worker. Idempotent.
    async fn process_task(&self, task: TaskDef) -> Result<()>;

    /// Produces the next element of a task.
    async fn get_element(&self, task_id: i64) -> Result<GetElementResult>;

    /// Tasks the worker currently holds.
    async fn get_worker_tasks(&self) -> Result<Vec<TaskInfo>>;
}

/// Creates worker clients by address.
///
/// Callers that cache clients keep the first one created for an address.
pub trait WorkerClientFactory: Send + Sync {
    fn create(&self, address: &str) -> Result<Arc<dyn WorkerClient>>;
}

#[derive(Clone)]
pub struct GrpcWorkerClient {
    client: WorkerServiceClient<Channel>,
}

impl GrpcWorkerClient {
    pub fn new(address: &str, timeout: Duration) -> Result<Self> {
        let channel = super::lazy_channel(address, timeout)?;
        Ok(Self {
            client: WorkerServiceClient::new(channel),
        })
    }
}

#[async_trait]
impl WorkerClient for GrpcWorkerClient {
    async fn process_task(&self, task: TaskDef) -> Result<()> {
        let mut client = self.client.clone();
        client
            .process_task(Request::new(ProcessTaskRequest {
                task: Some(task.into()),
            }))
            .await?;
        Ok(())
    }

    async fn get_element(&self, task_id: i64) -> Result<GetElementResult> {
        let mut client = self.client.clone();
        let response = client
            .get_element(Request::new(GetElementRequest { task_id }))
            .await?;
        GetElementResult::try_from(response.into_inner())
    }

    async fn get_worker_tasks(&self) -> Result<Vec<TaskInfo>> {
        let mut client = self.client.clone();
        let response = client
            .get_worker_tasks(Request::new(GetWorkerTasksRequest {}))
            .await?;
        Ok(response.into_inner().tasks.into_iter().map(Into::into).collect())
    }
}

/// Builds `GrpcWorkerClient`s with a fixed per-call deadline.
#[derive(Debug, Clone)]
pub struct GrpcWorkerClientFactory {
    timeout: Duration,
}

impl GrpcWorkerClientFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl WorkerClientFactory for GrpcWorkerClientFactory {
    fn create(&self, address: &str) -> Result<Arc<dyn WorkerClient>> {
        Ok(Arc::new(GrpcWorkerClient::new(address, self.timeout)?))
    }
}
