//! Client side of the dispatcher service.

use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::Channel;
use tonic::Request;

use super::proto::dispatcher_service_client::DispatcherServiceClient;
use super::proto::{
    CreateJobRequest, GetDatasetDefRequest, GetOrCreateJobRequest, GetSplitRequest,
    GetTasksRequest, GetWorkersRequest, RegisterDatasetRequest, ReleaseJobClientRequest,
    WorkerHeartbeatRequest, WorkerUpdateRequest,
};
use super::protocol::{HeartbeatResponse, ProcessingMode, TaskProgress, TasksResponse};
use crate::dataset::{DatasetDef, Split};
use crate::error::{Result, ServiceError};

/// Operations the dispatcher exposes to clients and workers.
#[async_trait]
pub trait DispatcherClient: Send + Sync {
    /// Registers a dataset, returning the id of an identical one if present.
    async fn register_dataset(&self, dataset: DatasetDef) -> Result<i64>;

    /// Creates an anonymous job, returning a new job client id.
    async fn create_job(&self, dataset_id: i64, processing_mode: ProcessingMode) -> Result<i64>;

    /// Attaches to the live job named `(job_name, job_name_index)`, creating it
    /// if needed. Returns a new job client id.
    async fn get_or_create_job(
        &self,
        dataset_id: i64,
        processing_mode: ProcessingMode,
        job_name: &str,
        job_name_index: i64,
    ) -> Result<i64>;

    async fn release_job_client(&self, job_client_id: i64) -> Result<()>;

    async fn get_tasks(&self, job_client_id: i64) -> Result<TasksResponse>;

    /// Returns the next split of `(job_id, repetition)`, or `None` at the end.
    async fn get_split(&self, job_id: i64, repetition: i64) -> Result<Option<Split>>;

    async fn get_dataset_def(&self, dataset_id: i64) -> Result<DatasetDef>;

    async fn worker_heartbeat(
        &self,
        worker_address: &str,
        current_tasks: Vec<i64>,
    ) -> Result<HeartbeatResponse>;

    async fn worker_update(&self, worker_address: &str, updates: Vec<TaskProgress>)
        -> Result<()>;

    /// Addresses of all registered workers.
    async fn get_workers(&self) -> Result<Vec<String>>;
}

/// gRPC-based dispatcher client.
#[derive(Clone)]
pub struct GrpcDispatcherClient {
    address: String,
    client: DispatcherServiceClient<Channel>,
}

impl GrpcDispatcherClient {
    /// Creates a client for the dispatcher at `address`. The connection is
    /// established on first use; `timeout` bounds connecting and each call.
    pub fn new(address: &str, timeout: Duration) -> Result<Self> {
        let channel = super::lazy_channel(address, timeout)?;
        Ok(Self {
            address: address.to_string(),
            client: DispatcherServiceClient::new(channel),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl DispatcherClient for GrpcDispatcherClient {
    async fn register_dataset(&self, dataset: DatasetDef) -> Result<i64> {
        let mut client = self.client.clone();
        let request = Request::new(RegisterDatasetRequest {
            dataset: Some(dataset.into()),
        });
        let response = client.register_dataset(request).await?;
        Ok(response.into_inner().dataset_id)
    }

    async fn create_job(&self, dataset_id: i64, processing_mode: ProcessingMode) -> Result<i64> {
        let mut client = self.client.clone();
        let request = Request::new(CreateJobRequest {
            dataset_id,
            processing_mode: processing_mode.to_proto(),
        });
        let response = client.create_job(request).await?;
        Ok(response.into_inner().job_client_id)
    }

    async fn get_or_create_job(
        &self,
        dataset_id: i64,
        processing_mode: ProcessingMode,
        job_name: &str,
        job_name_index: i64,
    ) -> Result<i64> {
        let mut client = self.client.clone();
        let request = Request::new(GetOrCreateJobRequest {
            dataset_id,
            processing_mode: processing_mode.to_proto(),
            job_name: job_name.to_string(),
            job_name_index,
        });
        let response = client.get_or_create_job(request).await?;
        Ok(response.into_inner().job_client_id)
    }

    async fn release_job_client(&self, job_client_id: i64) -> Result<()> {
        let mut client = self.client.clone();
        client
            .release_job_client(Request::new(ReleaseJobClientRequest { job_client_id }))
            .await?;
        Ok(())
    }

    async fn get_tasks(&self, job_client_id: i64) -> Result<TasksResponse> {
        let mut client = self.client.clone();
        let response = client
            .get_tasks(Request::new(GetTasksRequest { job_client_id }))
            .await?
            .into_inner();
        Ok(TasksResponse {
            tasks: response.task_info.into_iter().map(Into::into).collect(),
            job_finished: response.job_finished,
        })
    }

    async fn get_split(&self, job_id: i64, repetition: i64) -> Result<Option<Split>> {
        let mut client = self.client.clone();
        let response = client
            .get_split(Request::new(GetSplitRequest { job_id, repetition }))
            .await?
            .into_inner();
        if response.end_of_splits {
            Ok(None)
        } else {
            Ok(Some(response.split))
        }
    }

    async fn get_dataset_def(&self, dataset_id: i64) -> Result<DatasetDef> {
        let mut client = self.client.clone();
        let response = client
            .get_dataset_def(Request::new(GetDatasetDefRequest { dataset_id }))
            .await?
            .into_inner();
        response.dataset_def.map(Into::into).ok_or_else(|| {
            ServiceError::internal(format!(
                "dispatcher returned no definition for dataset {dataset_id}"
            ))
        })
    }

    async fn worker_heartbeat(
        &self,
        worker_address: &str,
        current_tasks: Vec<i64>,
    ) -> Result<HeartbeatResponse> {
        let mut client = self.client.clone();
        let request = Request::new(WorkerHeartbeatRequest {
            worker_address: worker_address.to_string(),
            current_tasks,
        });
        let response = client.worker_heartbeat(request).await?;
        HeartbeatResponse::try_from(response.into_inner())
    }

    async fn worker_update(
        &self,
        worker_address: &str,
        updates: Vec<TaskProgress>,
    ) -> Result<()> {
        let mut client = self.client.clone();
        let request = Request::new(WorkerUpdateRequest {
            worker_address: worker_address.to_string(),
            updates: updates.into_iter().map(Into::into).collect(),
        });
        client.worker_update(request).await?;
        Ok(())
    }

    async fn get_workers(&self) -> Result<Vec<String>> {
        let mut client = self.client.clone();
        let response = client
            .get_workers(Request::new(GetWorkersRequest {}))
            .await?
            .into_inner();
        Ok(response.workers.into_iter().map(|w| w.address).collect())
    }
}
