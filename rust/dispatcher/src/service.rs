//! gRPC service implementation for the dispatcher.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use dataservice_core::rpc::proto::dispatcher_service_server::DispatcherService;
use dataservice_core::rpc::proto::{
    CreateJobRequest, CreateJobResponse, GetDatasetDefRequest, GetDatasetDefResponse,
    GetOrCreateJobRequest, GetOrCreateJobResponse, GetSplitRequest, GetSplitResponse,
    GetTasksRequest, GetTasksResponse, GetWorkersRequest, GetWorkersResponse,
    RegisterDatasetRequest, RegisterDatasetResponse, ReleaseJobClientRequest,
    ReleaseJobClientResponse, WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerInfo,
    WorkerUpdateRequest, WorkerUpdateResponse,
};
use dataservice_core::rpc::TaskProgress;
use dataservice_core::ProcessingMode;

use crate::dispatcher::DispatcherImpl;

pub struct DispatcherServiceImpl {
    dispatcher: Arc<DispatcherImpl>,
}

impl DispatcherServiceImpl {
    pub fn new(dispatcher: Arc<DispatcherImpl>) -> Self {
        Self { dispatcher }
    }
}

#[tonic::async_trait]
impl DispatcherService for DispatcherServiceImpl {
    async fn register_dataset(
        &self,
        request: Request<RegisterDatasetRequest>,
    ) -> Result<Response<RegisterDatasetResponse>, Status> {
        let dataset = request
            .into_inner()
            .dataset
            .ok_or_else(|| Status::invalid_argument("dataset is required"))?;
        let dataset_id = self.dispatcher.register_dataset(dataset.into()).await?;
        Ok(Response::new(RegisterDatasetResponse { dataset_id }))
    }

    async fn create_job(
        &self,
        request: Request<CreateJobRequest>,
    ) -> Result<Response<CreateJobResponse>, Status> {
        let req = request.into_inner();
        let processing_mode = ProcessingMode::from_proto(req.processing_mode)?;
        let job_client_id = self
            .dispatcher
            .create_job(req.dataset_id, processing_mode)
            .await?;
        Ok(Response::new(CreateJobResponse { job_client_id }))
    }

    async fn get_or_create_job(
        &self,
        request: Request<GetOrCreateJobRequest>,
    ) -> Result<Response<GetOrCreateJobResponse>, Status> {
        let req = request.into_inner();
        let processing_mode = ProcessingMode::from_proto(req.processing_mode)?;
        let job_client_id = self
            .dispatcher
            .get_or_create_job(
                req.dataset_id,
                processing_mode,
                &req.job_name,
                req.job_name_index,
            )
            .await?;
        Ok(Response::new(GetOrCreateJobResponse { job_client_id }))
    }

    async fn release_job_client(
        &self,
        request: Request<ReleaseJobClientRequest>,
    ) -> Result<Response<ReleaseJobClientResponse>, Status> {
        self.dispatcher
            .release_job_client(request.into_inner().job_client_id)
            .await?;
        Ok(Response::new(ReleaseJobClientResponse {}))
    }

    async fn get_tasks(
        &self,
        request: Request<GetTasksRequest>,
    ) -> Result<Response<GetTasksResponse>, Status> {
        let tasks = self
            .dispatcher
            .get_tasks(request.into_inner().job_client_id)
            .await?;
        Ok(Response::new(GetTasksResponse {
            task_info: tasks.tasks.into_iter().map(Into::into).collect(),
            job_finished: tasks.job_finished,
        }))
    }

    async fn get_split(
        &self,
        request: Request<GetSplitRequest>,
    ) -> Result<Response<GetSplitResponse>, Status> {
        let req = request.into_inner();
        let response = match self.dispatcher.get_split(req.job_id, req.repetition).await? {
            Some(split) => GetSplitResponse {
                split,
                end_of_splits: false,
            },
            None => GetSplitResponse {
                split: Vec::new(),
                end_of_splits: true,
            },
        };
        Ok(Response::new(response))
    }

    async fn get_dataset_def(
        &self,
        request: Request<GetDatasetDefRequest>,
    ) -> Result<Response<GetDatasetDefResponse>, Status> {
        let def = self
            .dispatcher
            .get_dataset_def(request.into_inner().dataset_id)
            .await?;
        Ok(Response::new(GetDatasetDefResponse {
            dataset_def: Some(def.into()),
        }))
    }

    async fn worker_heartbeat(
        &self,
        request: Request<WorkerHeartbeatRequest>,
    ) -> Result<Response<WorkerHeartbeatResponse>, Status> {
        let req = request.into_inner();
        if req.worker_address.is_empty() {
            return Err(Status::invalid_argument("worker_address is required"));
        }
        let response = self
            .dispatcher
            .worker_heartbeat(&req.worker_address, &req.current_tasks)
            .await?;
        Ok(Response::new(response.into()))
    }

    async fn worker_update(
        &self,
        request: Request<WorkerUpdateRequest>,
    ) -> Result<Response<WorkerUpdateResponse>, Status> {
        let req = request.into_inner();
        let updates: Vec<TaskProgress> = req.updates.into_iter().map(Into::into).collect();
        self.dispatcher
            .worker_update(&req.worker_address, &updates)
            .await?;
        Ok(Response::new(WorkerUpdateResponse {}))
    }

    async fn get_workers(
        &self,
        _request: Request<GetWorkersRequest>,
    ) -> Result<Response<GetWorkersResponse>, Status> {
        let workers = self
            .dispatcher
            .get_workers()
            .await?
            .into_iter()
            .map(|address| WorkerInfo { address })
            .collect();
        Ok(Response::new(GetWorkersResponse { workers }))
    }
}
