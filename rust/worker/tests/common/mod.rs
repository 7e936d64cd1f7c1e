//! In-process cluster: a dispatcher and workers wired together through the
//! same client traits the gRPC implementations provide.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use dataservice_core::dataset::{DatasetDef, DatasetGraph, Split};
use dataservice_core::rpc::{
    GetElementResult, HeartbeatResponse, TaskDef, TaskInfo, TaskProgress, TasksResponse,
};
use dataservice_core::{
    DataServiceClient, DispatcherClient, DispatcherConfig, ManualClock, ProcessingMode, Result,
    ServiceError, WorkerClient, WorkerClientFactory, WorkerConfig,
};
use dataservice_dispatcher::DispatcherImpl;
use dataservice_worker::WorkerImpl;

pub struct LocalDispatcher(pub Arc<DispatcherImpl>);

#[async_trait]
impl DispatcherClient for LocalDispatcher {
    async fn register_dataset(&self, dataset: DatasetDef) -> Result<i64> {
        self.0.register_dataset(dataset).await
    }

    async fn create_job(&self, dataset_id: i64, processing_mode: ProcessingMode) -> Result<i64> {
        self.0.create_job(dataset_id, processing_mode).await
    }

    async fn get_or_create_job(
        &self,
        dataset_id: i64,
        processing_mode: ProcessingMode,
        job_name: &str,
        job_name_index: i64,
    ) -> Result<i64> {
        self.0
            .get_or_create_job(dataset_id, processing_mode, job_name, job_name_index)
            .await
    }

    async fn release_job_client(&self, job_client_id: i64) -> Result<()> {
        self.0.release_job_client(job_client_id).await
    }

    async fn get_tasks(&self, job_client_id: i64) -> Result<TasksResponse> {
        self.0.get_tasks(job_client_id).await
    }

    async fn get_split(&self, job_id: i64, repetition: i64) -> Result<Option<Split>> {
        self.0.get_split(job_id, repetition).await
    }

    async fn get_dataset_def(&self, dataset_id: i64) -> Result<DatasetDef> {
        self.0.get_dataset_def(dataset_id).await
    }

    async fn worker_heartbeat(
        &self,
        worker_address: &str,
        current_tasks: Vec<i64>,
    ) -> Result<HeartbeatResponse> {
        self.0.worker_heartbeat(worker_address, &current_tasks).await
    }

    async fn worker_update(&self, worker_address: &str, updates: Vec<TaskProgress>) -> Result<()> {
        self.0.worker_update(worker_address, &updates).await
    }

    async fn get_workers(&self) -> Result<Vec<String>> {
        self.0.get_workers().await
    }
}

/// Address book of in-process workers. Can drop `ProcessTask` calls to
/// simulate lost assignment RPCs.
#[derive(Default)]
pub struct LocalWorkers {
    workers: Mutex<HashMap<String, Arc<WorkerImpl>>>,
    drop_process_task: AtomicBool,
}

impl LocalWorkers {
    pub fn add(&self, address: &str, worker: Arc<WorkerImpl>) {
        self.workers
            .lock()
            .unwrap()
            .insert(address.to_string(), worker);
    }

    pub fn set_drop_process_task(&self, drop: bool) {
        self.drop_process_task.store(drop, Ordering::SeqCst);
    }

    fn get(&self, address: &str) -> Result<Arc<WorkerImpl>> {
        self.workers
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| ServiceError::unavailable(format!("no worker at {address}")))
    }
}

struct LocalWorkerClient {
    address: String,
    workers: Arc<LocalWorkers>,
}

#[async_trait]
impl WorkerClient for LocalWorkerClient {
    async fn process_task(&self, task: TaskDef) -> Result<()> {
        if self.workers.drop_process_task.load(Ordering::SeqCst) {
            return Err(ServiceError::unavailable("ProcessTask dropped"));
        }
        self.workers.get(&self.address)?.process_task(task).await
    }

    async fn get_element(&self, task_id: i64) -> Result<GetElementResult> {
        self.workers.get(&self.address)?.get_element(task_id).await
    }

    async fn get_worker_tasks(&self) -> Result<Vec<TaskInfo>> {
        Ok(self.workers.get(&self.address)?.get_worker_tasks().await)
    }
}

pub struct LocalWorkerFactory(pub Arc<LocalWorkers>);

impl WorkerClientFactory for LocalWorkerFactory {
    fn create(&self, address: &str) -> Result<Arc<dyn WorkerClient>> {
        Ok(Arc::new(LocalWorkerClient {
            address: address.to_string(),
            workers: Arc::clone(&self.0),
        }))
    }
}

pub struct Cluster {
    pub dispatcher: Arc<DispatcherImpl>,
    pub workers: Arc<LocalWorkers>,
    pub clock: Arc<ManualClock>,
    started_workers: Mutex<Vec<Arc<WorkerImpl>>>,
}

impl Cluster {
    pub async fn start(config: DispatcherConfig) -> Self {
        let workers = Arc::new(LocalWorkers::default());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let dispatcher = Arc::new(
            DispatcherImpl::with_clock(
                config,
                Arc::new(LocalWorkerFactory(Arc::clone(&workers))),
                clock.clone(),
            )
            .unwrap(),
        );
        dispatcher.start().await.unwrap();
        Self {
            dispatcher,
            workers,
            clock,
            started_workers: Mutex::new(Vec::new()),
        }
    }

    pub fn worker_config() -> WorkerConfig {
        WorkerConfig {
            dispatcher_address: "in-process".into(),
            heartbeat_interval_ms: 50,
            dispatcher_timeout_ms: 5_000,
            retry_interval_ms: 10,
            ..Default::default()
        }
    }

    /// Starts a worker at `address` that heartbeats every `heartbeat_interval_ms`.
    pub async fn add_worker_with_heartbeat(
        &self,
        address: &str,
        heartbeat_interval_ms: u64,
    ) -> Arc<WorkerImpl> {
        let config = WorkerConfig {
            heartbeat_interval_ms,
            ..Self::worker_config()
        };
        let worker = Arc::new(WorkerImpl::new(
            config,
            Arc::new(LocalDispatcher(Arc::clone(&self.dispatcher))),
        ));
        self.workers.add(address, Arc::clone(&worker));
        worker.start(address).await.unwrap();
        self.started_workers.lock().unwrap().push(Arc::clone(&worker));
        worker
    }

    pub async fn add_worker(&self, address: &str) -> Arc<WorkerImpl> {
        self.add_worker_with_heartbeat(address, 50).await
    }

    pub fn dispatcher_client(&self) -> Arc<dyn DispatcherClient> {
        Arc::new(LocalDispatcher(Arc::clone(&self.dispatcher)))
    }

    pub fn client(&self) -> DataServiceClient {
        DataServiceClient::new(
            self.dispatcher_client(),
            Arc::new(LocalWorkerFactory(Arc::clone(&self.workers))),
        )
        .with_task_refresh_interval(Duration::from_millis(10))
    }

    pub async fn stop(&self) {
        let workers: Vec<_> = self.started_workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            worker.stop().await;
        }
        self.dispatcher.shutdown().await;
    }
}

pub fn range_dataset(stop: i64) -> DatasetDef {
    DatasetDef::from_graph(&DatasetGraph::range(0, stop)).unwrap()
}

pub fn decode_i64(bytes: &[u8]) -> i64 {
    i64::from_le_bytes(bytes.try_into().unwrap())
}

/// Polls `condition` every 10ms for up to five seconds.
pub async fn wait_for<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
