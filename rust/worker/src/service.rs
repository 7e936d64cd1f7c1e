//! gRPC service implementation for the worker.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use dataservice_core::rpc::proto::worker_service_server::WorkerService;
use dataservice_core::rpc::proto::{
    GetElementRequest, GetElementResponse, GetWorkerTasksRequest, GetWorkerTasksResponse,
    ProcessTaskRequest, ProcessTaskResponse,
};
use dataservice_core::rpc::TaskDef;

use crate::worker::WorkerImpl;

pub struct WorkerServiceImpl {
    worker: Arc<WorkerImpl>,
}

impl WorkerServiceImpl {
    pub fn new(worker: Arc<WorkerImpl>) -> Self {
        Self { worker }
    }
}

#[tonic::async_trait]
impl WorkerService for WorkerServiceImpl {
    async fn process_task(
        &self,
        request: Request<ProcessTaskRequest>,
    ) -> Result<Response<ProcessTaskResponse>, Status> {
        let task = request
            .into_inner()
            .task
            .ok_or_else(|| Status::invalid_argument("task is required"))?;
        self.worker.process_task(TaskDef::try_from(task)?).await?;
        Ok(Response::new(ProcessTaskResponse {}))
    }

    async fn get_element(
        &self,
        request: Request<GetElementRequest>,
    ) -> Result<Response<GetElementResponse>, Status> {
        let result = self
            .worker
            .get_element(request.into_inner().task_id)
            .await?;
        Ok(Response::new(result.into()))
    }

    async fn get_worker_tasks(
        &self,
        _request: Request<GetWorkerTasksRequest>,
    ) -> Result<Response<GetWorkerTasksResponse>, Status> {
        let tasks = self.worker.get_worker_tasks().await;
        Ok(Response::new(GetWorkerTasksResponse {
            tasks: tasks.into_iter().map(Into::into).collect(),
        }))
    }
}
