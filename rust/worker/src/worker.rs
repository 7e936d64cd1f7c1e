//! Worker task runtime.
//!
//! A worker holds the tasks the dispatcher assigned to it and produces their
//! elements on request. Two background tasks keep it in sync with the
//! dispatcher: the heartbeat task reconciles the task set, and the completion
//! task reports tasks that reached end of sequence.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use dataservice_core::dataset::{
    compressed_element_from_outputs, Dataset, DatasetDef, DatasetIterator, GraphDataset,
};
use dataservice_core::rpc::{GetElementResult, TaskDataset, TaskDef, TaskInfo, TaskProgress};
use dataservice_core::storage::read_dataset_file;
use dataservice_core::{DispatcherClient, ProcessingMode, Result, ServiceError, WorkerConfig};

use crate::split_provider::RemoteSplitProvider;

struct Task {
    def: TaskDef,
    // Guards one-time iterator initialization and element production
    state: Mutex<TaskState>,
}

#[derive(Default)]
struct TaskState {
    iterator: Option<Box<dyn DatasetIterator>>,
    finished: bool,
}

#[derive(Default)]
struct Inner {
    worker_address: String,
    tasks: HashMap<i64, Arc<Task>>,
    pending_completed_tasks: HashSet<i64>,
    registered: bool,
}

pub struct WorkerImpl {
    config: WorkerConfig,
    dispatcher: Arc<dyn DispatcherClient>,
    inner: Mutex<Inner>,
    task_completed: Notify,
    shutdown_tx: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerImpl {
    pub fn new(config: WorkerConfig, dispatcher: Arc<dyn DispatcherClient>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            dispatcher,
            inner: Mutex::new(Inner::default()),
            task_completed: Notify::new(),
            shutdown_tx,
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Registers with the dispatcher under `worker_address`, then starts the
    /// heartbeat and completion tasks.
    ///
    /// The first heartbeat is retried on transient failures until it
    /// succeeds or the worker is stopped.
    pub async fn start(self: &Arc<Self>, worker_address: &str) -> Result<()> {
        self.inner.lock().await.worker_address = worker_address.to_string();

        let retry_interval = Duration::from_millis(self.config.retry_interval_ms);
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            match self.heartbeat().await {
                Ok(()) => break,
                Err(e) if e.is_retriable() => {
                    warn!(
                        "Failed to register with dispatcher at {}: {}. Retrying in {:?}",
                        self.config.dispatcher_address, e, retry_interval
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(retry_interval) => {}
                        _ = shutdown.changed() => {
                            return Err(ServiceError::Cancelled(
                                "worker stopped before registering with the dispatcher".into(),
                            ));
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
        self.inner.lock().await.registered = true;

        let heartbeat = tokio::spawn(Arc::clone(self).heartbeat_loop(self.shutdown_tx.subscribe()));
        let completion =
            tokio::spawn(Arc::clone(self).task_completion_loop(self.shutdown_tx.subscribe()));
        self.background.lock().await.extend([heartbeat, completion]);
        info!("Worker {} registered with dispatcher", worker_address);
        Ok(())
    }

    /// Stops the background tasks and waits for them to exit.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = self.background.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Worker background task panicked: {}", e);
            }
        }
    }

    /// Accepts a task from the dispatcher. Tasks already held are ignored.
    pub async fn process_task(&self, def: TaskDef) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.tasks.contains_key(&def.task_id) {
            debug!("Task {} is already being processed", def.task_id);
            return Ok(());
        }
        info!(
            "Received task {} of job {} ({})",
            def.task_id, def.job_id, def.processing_mode
        );
        inner.tasks.insert(
            def.task_id,
            Arc::new(Task {
                def,
                state: Mutex::new(TaskState::default()),
            }),
        );
        Ok(())
    }

    pub async fn get_element(&self, task_id: i64) -> Result<GetElementResult> {
        let task = {
            let inner = self.inner.lock().await;
            if !inner.registered {
                // Not NotFound: the task may simply not have arrived yet
                return Err(ServiceError::unavailable(
                    "Worker has not yet registered with dispatcher.",
                ));
            }
            match inner.tasks.get(&task_id) {
                Some(task) => Arc::clone(task),
                None => {
                    debug!("Task {} is unknown, reporting end of sequence", task_id);
                    return Ok(GetElementResult::EndOfSequence);
                }
            }
        };

        let mut state = task.state.lock().await;
        if state.finished {
            return Ok(GetElementResult::EndOfSequence);
        }
        if state.iterator.is_none() {
            state.iterator = Some(self.make_iterator(&task.def).await?);
        }
        let iterator = state
            .iterator
            .as_mut()
            .ok_or_else(|| ServiceError::internal("task iterator missing after initialization"))?;

        match iterator.get_next().await? {
            Some(outputs) => Ok(GetElementResult::Element(compressed_element_from_outputs(
                outputs,
            )?)),
            None => {
                state.finished = true;
                state.iterator = None;
                drop(state);
                self.inner
                    .lock()
                    .await
                    .pending_completed_tasks
                    .insert(task_id);
                self.task_completed.notify_one();
                debug!("Task {} reached end of sequence", task_id);
                Ok(GetElementResult::EndOfSequence)
            }
        }
    }

    pub async fn get_worker_tasks(&self) -> Vec<TaskInfo> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<TaskInfo> = inner
            .tasks
            .values()
            .map(|task| TaskInfo {
                worker_address: inner.worker_address.clone(),
                task_id: task.def.task_id,
                job_id: task.def.job_id,
            })
            .collect();
        tasks.sort_by_key(|task| task.task_id);
        tasks
    }

    /// Sends one heartbeat and applies the dispatcher's answer: new tasks are
    /// started and tasks the dispatcher no longer assigns here are dropped.
    pub async fn heartbeat(&self) -> Result<()> {
        let (worker_address, current_tasks) = {
            let inner = self.inner.lock().await;
            (
                inner.worker_address.clone(),
                inner.tasks.keys().copied().collect::<Vec<_>>(),
            )
        };
        let response = self
            .dispatcher
            .worker_heartbeat(&worker_address, current_tasks)
            .await?;

        for task in response.new_tasks {
            self.process_task(task).await?;
        }
        if !response.tasks_to_delete.is_empty() {
            let mut inner = self.inner.lock().await;
            for task_id in &response.tasks_to_delete {
                if inner.tasks.remove(task_id).is_some() {
                    debug!("Deleted task {}", task_id);
                }
            }
        }
        Ok(())
    }

    async fn heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_millis(self.config.heartbeat_interval_ms);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.heartbeat().await {
                        warn!("Failed to send heartbeat to dispatcher: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Heartbeat task exiting");
    }

    async fn task_completion_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let retry_interval = Duration::from_millis(self.config.retry_interval_ms);
        loop {
            let pending: Vec<i64> = {
                let inner = self.inner.lock().await;
                inner.pending_completed_tasks.iter().copied().collect()
            };
            if pending.is_empty() {
                tokio::select! {
                    _ = self.task_completed.notified() => continue,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
            }

            match self.send_task_updates(&pending).await {
                Ok(()) => {
                    let mut inner = self.inner.lock().await;
                    for task_id in &pending {
                        inner.pending_completed_tasks.remove(task_id);
                    }
                }
                Err(e) => {
                    warn!(
                        "Failed to send task updates to dispatcher: {}. Retrying in {:?}",
                        e, retry_interval
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(retry_interval) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        debug!("Task completion task exiting");
    }

    async fn send_task_updates(&self, task_ids: &[i64]) -> Result<()> {
        let worker_address = self.inner.lock().await.worker_address.clone();
        let updates = task_ids
            .iter()
            .map(|&task_id| TaskProgress {
                task_id,
                completed: true,
            })
            .collect();
        self.dispatcher.worker_update(&worker_address, updates).await?;
        debug!("Reported {} completed tasks", task_ids.len());
        Ok(())
    }

    async fn make_iterator(&self, task: &TaskDef) -> Result<Box<dyn DatasetIterator>> {
        let def = self.dataset_def(task).await?;
        let dataset = GraphDataset::from_def(&def)?;
        match task.processing_mode {
            ProcessingMode::ParallelEpochs => dataset.make_iterator(None),
            ProcessingMode::DistributedEpoch => {
                let split_provider = RemoteSplitProvider::new(
                    Arc::clone(&self.dispatcher),
                    task.job_id,
                    Duration::from_millis(self.config.dispatcher_timeout_ms),
                );
                dataset.make_iterator(Some(Box::new(split_provider)))
            }
        }
    }

    // Prefers the dataset file named by the task, falling back to the
    // dispatcher when the file is not readable here.
    async fn dataset_def(&self, task: &TaskDef) -> Result<DatasetDef> {
        match &task.dataset {
            TaskDataset::Def(def) => Ok(def.clone()),
            TaskDataset::Path(path) => match read_dataset_file(Path::new(path)) {
                Ok(def) => Ok(def),
                Err(e) => {
                    info!(
                        "Failed to read dataset from {}: {}. Falling back to reading from dispatcher",
                        path, e
                    );
                    self.dispatcher.get_dataset_def(task.dataset_id).await
                }
            },
        }
    }
}
