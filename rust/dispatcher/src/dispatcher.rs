//! Dispatcher request handlers.
//!
//! `DispatcherImpl` serializes all state changes through one lock. Each
//! handler journals its updates before applying them, and any RPC to a worker
//! happens after the lock is released. A failed journal write is fatal: every
//! later request is refused and the job GC task stops.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use dataservice_core::dataset::{Dataset as _, DatasetDef, GraphDataset, Split, SplitProvider};
use dataservice_core::rpc::{HeartbeatResponse, TaskDataset, TaskDef, TaskInfo, TaskProgress, TasksResponse};
use dataservice_core::storage::{dataset_key, run_blocking, DATASETS_DIR};
use dataservice_core::{
    Clock, DatasetStore, DispatcherConfig, FileSystemDatasetStore, JournalReader, JournalWriter,
    MemoryDatasetStore, ProcessingMode, Result, ServiceError, SystemClock, WorkerClient,
    WorkerClientFactory,
};

use crate::state::{DispatcherState, Job, NamedJobKey, Task, Update};

/// Split providers of a distributed-epoch job, created lazily per repetition.
struct DistributedEpochJob {
    dataset_id: i64,
    split_providers: HashMap<i64, Box<dyn SplitProvider>>,
}

impl DistributedEpochJob {
    fn new(dataset_id: i64) -> Self {
        Self {
            dataset_id,
            split_providers: HashMap::new(),
        }
    }
}

struct Inner {
    state: DispatcherState,
    journal: Option<JournalWriter>,
    distributed_epoch_jobs: HashMap<i64, DistributedEpochJob>,
    worker_clients: HashMap<String, Arc<dyn WorkerClient>>,
    started: bool,
    journal_failure: watch::Sender<Option<String>>,
}

/// Task ready to be handed to a worker once the lock is released.
struct PendingAssignment {
    worker_address: String,
    task: TaskDef,
}

pub struct DispatcherImpl {
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
    worker_client_factory: Arc<dyn WorkerClientFactory>,
    dataset_store: Arc<dyn DatasetStore>,
    inner: Mutex<Inner>,
    shutdown_tx: watch::Sender<bool>,
    journal_failure: watch::Receiver<Option<String>>,
    gc_task: Mutex<Option<JoinHandle<()>>>,
}

impl DispatcherImpl {
    /// Creates a dispatcher reading the system clock.
    pub fn new(
        config: DispatcherConfig,
        worker_client_factory: Arc<dyn WorkerClientFactory>,
    ) -> Result<Self> {
        Self::with_clock(config, worker_client_factory, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: DispatcherConfig,
        worker_client_factory: Arc<dyn WorkerClientFactory>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let dataset_store: Arc<dyn DatasetStore> = match &config.work_dir {
            Some(work_dir) => Arc::new(FileSystemDatasetStore::new(work_dir.join(DATASETS_DIR))?),
            None => Arc::new(MemoryDatasetStore::new()),
        };
        let (shutdown_tx, _) = watch::channel(false);
        let (journal_failure_tx, journal_failure) = watch::channel(None);

        Ok(Self {
            config,
            clock,
            worker_client_factory,
            dataset_store,
            inner: Mutex::new(Inner {
                state: DispatcherState::new(),
                journal: None,
                distributed_epoch_jobs: HashMap::new(),
                worker_clients: HashMap::new(),
                started: false,
                journal_failure: journal_failure_tx,
            }),
            shutdown_tx,
            journal_failure,
            gc_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Restores state from the journal when fault tolerant, then starts
    /// serving and launches the job GC task.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.started {
            return Ok(());
        }

        if self.config.fault_tolerant_mode {
            let work_dir = self.config.work_dir.as_deref().ok_or_else(|| {
                ServiceError::invalid_argument(
                    "fault_tolerant_mode is true, but no work_dir is configured",
                )
            })?;
            inner.state = restore_state(work_dir)?;

            let mut journal = JournalWriter::new(work_dir);
            journal.ensure_initialized()?;
            inner.journal = Some(journal);
        } else {
            info!(
                "Running with fault_tolerant_mode=false. The dispatcher will not be able to recover its state on restart"
            );
        }

        let distributed_epoch_jobs: Vec<(i64, i64)> = inner
            .state
            .list_jobs()
            .iter()
            .filter(|job| !job.finished && job.processing_mode == ProcessingMode::DistributedEpoch)
            .map(|job| (job.job_id, job.dataset_id))
            .collect();
        for (job_id, dataset_id) in distributed_epoch_jobs {
            inner
                .distributed_epoch_jobs
                .insert(job_id, DistributedEpochJob::new(dataset_id));
        }

        inner.started = true;
        drop(inner);

        let handle = tokio::spawn(Arc::clone(self).job_gc_loop(
            self.shutdown_tx.subscribe(),
            self.journal_failure.clone(),
        ));
        *self.gc_task.lock().await = Some(handle);
        info!("Dispatcher started");
        Ok(())
    }

    /// Stops the job GC task and waits for it to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.gc_task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Job GC task panicked: {}", e);
            }
        }
    }

    /// The journal error that stopped the dispatcher, if any.
    pub fn journal_failure(&self) -> Option<ServiceError> {
        self.journal_failure
            .borrow()
            .as_ref()
            .map(|message| journal_failure_error(message))
    }

    /// Resolves once a journal write has failed.
    pub async fn wait_for_journal_failure(&self) -> ServiceError {
        let mut failure = self.journal_failure.clone();
        let error = match failure.wait_for(Option::is_some).await {
            Ok(message) => journal_failure_error(message.as_deref().unwrap_or_default()),
            // The sender is owned by `inner`, so it is never dropped first
            Err(_) => std::future::pending().await,
        };
        error
    }

    async fn job_gc_loop(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        mut journal_failure: watch::Receiver<Option<String>>,
    ) {
        let interval = Duration::from_millis(self.config.job_gc_check_interval_ms);
        loop {
            tokio::select! {
                _ = async { journal_failure.wait_for(Option::is_some).await.map(|_| ()) } => {
                    warn!("Stopping job GC after a journal failure");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.gc_old_jobs().await {
                        warn!("Error garbage collecting old jobs: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Job GC task exiting");
    }

    async fn lock_started(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self.inner.lock().await;
        if !inner.started {
            return Err(ServiceError::unavailable("Dispatcher has not started yet."));
        }
        if let Some(message) = inner.journal_failure.borrow().as_ref() {
            return Err(journal_failure_error(message));
        }
        Ok(inner)
    }

    pub async fn register_dataset(&self, dataset: DatasetDef) -> Result<i64> {
        let fingerprint = dataset.fingerprint()?;
        let mut inner = self.lock_started().await?;
        if let Ok(existing) = inner.state.dataset_from_fingerprint(fingerprint) {
            debug!(
                "Found existing dataset {} with fingerprint {}",
                existing.dataset_id, fingerprint
            );
            return Ok(existing.dataset_id);
        }

        let dataset_id = inner.state.next_available_dataset_id();
        let store = Arc::clone(&self.dataset_store);
        let key = dataset_key(dataset_id, fingerprint);
        tokio::task::spawn_blocking(move || store.put(&key, &dataset))
            .await
            .map_err(|e| ServiceError::internal_with_source("Dataset store write panicked", e))??;
        inner.apply(Update::RegisterDataset {
            dataset_id,
            fingerprint,
        })?;
        info!("Registered dataset {} (fingerprint {})", dataset_id, fingerprint);
        Ok(dataset_id)
    }

    /// Creates an anonymous job and returns a client id for it.
    pub async fn create_job(&self, dataset_id: i64, processing_mode: ProcessingMode) -> Result<i64> {
        let (job_client_id, assignments) = {
            let mut inner = self.lock_started().await?;
            let job = self.create_job_locked(&mut inner, dataset_id, processing_mode, None)?;
            let job_client_id = inner.acquire_job_client(job.job_id)?;
            let assignments = self.create_tasks_for_job(&mut inner, &job)?;
            (job_client_id, assignments)
        };
        self.assign_tasks(assignments).await;
        Ok(job_client_id)
    }

    /// Attaches to the live job named `(job_name, job_name_index)`, creating
    /// it if there is none.
    pub async fn get_or_create_job(
        &self,
        dataset_id: i64,
        processing_mode: ProcessingMode,
        job_name: &str,
        job_name_index: i64,
    ) -> Result<i64> {
        let key = NamedJobKey::new(job_name, job_name_index);
        let (job_client_id, assignments) = {
            let mut inner = self.lock_started().await?;
            match inner.state.named_job_by_key(&key) {
                Ok(job) => {
                    validate_matching_job(&job, processing_mode, dataset_id)?;
                    let job_client_id = inner.acquire_job_client(job.job_id)?;
                    debug!(
                        "Found existing job {} for name={}, index={}",
                        job.job_id, key.name, key.index
                    );
                    return Ok(job_client_id);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            let job =
                self.create_job_locked(&mut inner, dataset_id, processing_mode, Some(key))?;
            let job_client_id = inner.acquire_job_client(job.job_id)?;
            let assignments = self.create_tasks_for_job(&mut inner, &job)?;
            (job_client_id, assignments)
        };
        self.assign_tasks(assignments).await;
        Ok(job_client_id)
    }

    pub async fn release_job_client(&self, job_client_id: i64) -> Result<()> {
        let mut inner = self.lock_started().await?;
        // Validated up front: the update is journaled before it is applied
        inner.state.job_for_job_client_id(job_client_id)?;
        if inner.state.is_job_client_released(job_client_id) {
            return Err(ServiceError::not_found(format!(
                "Job client id {job_client_id} has already been released"
            )));
        }
        inner.apply(Update::ReleaseJobClient {
            job_client_id,
            time_micros: self.clock.now_micros(),
        })
    }

    pub async fn get_tasks(&self, job_client_id: i64) -> Result<TasksResponse> {
        let inner = self.lock_started().await?;
        let job = match inner.state.job_for_job_client_id(job_client_id) {
            Ok(job) => job,
            Err(e) if e.is_not_found() && !self.config.fault_tolerant_mode => {
                return Err(ServiceError::not_found(format!(
                    "Unknown job client id {job_client_id}. The dispatcher is not configured to be fault tolerant, so this could be caused by a dispatcher restart."
                )));
            }
            Err(e) => return Err(e),
        };
        let tasks = inner
            .state
            .tasks_for_job(job.job_id)?
            .iter()
            .map(|task| TaskInfo {
                worker_address: task.worker_address.clone(),
                task_id: task.task_id,
                job_id: job.job_id,
            })
            .collect();
        Ok(TasksResponse {
            tasks,
            job_finished: job.finished,
        })
    }

    /// Returns the next split of `(job_id, repetition)`, or `None` once the
    /// repetition is exhausted.
    pub async fn get_split(&self, job_id: i64, repetition: i64) -> Result<Option<Split>> {
        let mut guard = self.lock_started().await?;
        let inner = &mut *guard;
        let job = inner.distributed_epoch_jobs.get_mut(&job_id).ok_or_else(|| {
            ServiceError::not_found(format!("distributed_epoch_job id not found: {job_id}"))
        })?;

        if !job.split_providers.contains_key(&repetition) {
            debug!(
                "Creating split provider for job {} repetition {}",
                job_id, repetition
            );
            let def = self.dataset_def(&inner.state, job.dataset_id)?;
            let provider = GraphDataset::from_def(&def)?.make_split_provider()?;
            job.split_providers.insert(repetition, provider);
        }
        let provider = job
            .split_providers
            .get_mut(&repetition)
            .ok_or_else(|| ServiceError::internal("split provider vanished"))?;
        provider.get_next().await
    }

    pub async fn get_dataset_def(&self, dataset_id: i64) -> Result<DatasetDef> {
        let inner = self.lock_started().await?;
        let def = self.dataset_def(&inner.state, dataset_id)?;
        Ok(def.as_ref().clone())
    }

    /// Registers the worker on first contact and reconciles its task list
    /// with the dispatcher's view.
    pub async fn worker_heartbeat(
        &self,
        worker_address: &str,
        current_tasks: &[i64],
    ) -> Result<HeartbeatResponse> {
        let mut inner = self.lock_started().await?;
        let assigned = match inner.state.tasks_for_worker(worker_address) {
            Ok(tasks) => tasks,
            Err(e) if e.is_not_found() => {
                inner.apply(Update::RegisterWorker {
                    worker_address: worker_address.to_string(),
                })?;
                self.create_tasks_for_worker(&mut inner, worker_address)?;
                info!("Registered worker {}", worker_address);
                inner.state.tasks_for_worker(worker_address)?
            }
            Err(e) => return Err(e),
        };

        let current: HashSet<i64> = current_tasks.iter().copied().collect();
        let mut response = HeartbeatResponse::default();
        for task in &assigned {
            if !current.contains(&task.task_id) {
                response.new_tasks.push(self.task_def(&inner.state, task)?);
            }
        }
        let assigned_ids: HashSet<i64> = assigned.iter().map(|task| task.task_id).collect();
        response.tasks_to_delete = current
            .into_iter()
            .filter(|task_id| !assigned_ids.contains(task_id))
            .collect();

        debug!(
            "Heartbeat from {}: {} new tasks, {} to delete",
            worker_address,
            response.new_tasks.len(),
            response.tasks_to_delete.len()
        );
        Ok(response)
    }

    pub async fn worker_update(&self, worker_address: &str, updates: &[TaskProgress]) -> Result<()> {
        let mut inner = self.lock_started().await?;
        for update in updates {
            let task = inner.state.task_from_id(update.task_id)?;
            if !update.completed {
                continue;
            }
            if task.finished {
                debug!(
                    "Received completion update for already-finished task {} on worker {}",
                    task.task_id, task.worker_address
                );
                continue;
            }
            inner.apply(Update::FinishTask {
                task_id: update.task_id,
            })?;
            info!(
                "Task {} from job {} completed on worker {}",
                task.task_id, task.job_id, worker_address
            );
        }
        Ok(())
    }

    pub async fn get_workers(&self) -> Result<Vec<String>> {
        let inner = self.lock_started().await?;
        Ok(inner
            .state
            .list_workers()
            .iter()
            .map(|worker| worker.address.clone())
            .collect())
    }

    /// Finishes every job that has had no clients for longer than the GC
    /// timeout.
    pub async fn gc_old_jobs(&self) -> Result<()> {
        let mut inner = self.lock_started().await?;
        let now = self.clock.now_micros();
        let timeout_micros = i64::try_from(self.config.job_gc_timeout_ms)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);

        for job in inner.state.list_jobs() {
            if job.finished
                || job.num_clients > 0
                || job.last_client_released_micros < 0
                || now <= job.last_client_released_micros.saturating_add(timeout_micros)
            {
                continue;
            }
            for task in inner.state.tasks_for_job(job.job_id)? {
                if !task.finished {
                    inner.apply(Update::FinishTask {
                        task_id: task.task_id,
                    })?;
                }
            }
            if !inner.state.job_from_id(job.job_id)?.finished {
                inner.apply(Update::FinishJob { job_id: job.job_id })?;
            }
            inner.distributed_epoch_jobs.remove(&job.job_id);
            info!("Job {} has been garbage collected", job.job_id);
        }
        Ok(())
    }

    /// Snapshot of the current state.
    pub async fn state(&self) -> DispatcherState {
        self.inner.lock().await.state.clone()
    }

    fn create_job_locked(
        &self,
        inner: &mut Inner,
        dataset_id: i64,
        processing_mode: ProcessingMode,
        named_job_key: Option<NamedJobKey>,
    ) -> Result<Arc<Job>> {
        inner.state.dataset_from_id(dataset_id)?;
        let job_id = inner.state.next_available_job_id();
        inner.apply(Update::CreateJob {
            job_id,
            dataset_id,
            processing_mode,
            named_job_key,
        })?;
        if processing_mode == ProcessingMode::DistributedEpoch {
            inner
                .distributed_epoch_jobs
                .insert(job_id, DistributedEpochJob::new(dataset_id));
        }
        info!(
            "Created job {} for dataset {} ({})",
            job_id, dataset_id, processing_mode
        );
        inner.state.job_from_id(job_id)
    }

    fn create_tasks_for_job(&self, inner: &mut Inner, job: &Job) -> Result<Vec<PendingAssignment>> {
        let mut assignments = Vec::new();
        for worker in inner.state.list_workers() {
            let task = inner.create_task(job, &worker.address)?;
            assignments.push(PendingAssignment {
                worker_address: worker.address.clone(),
                task: self.task_def(&inner.state, &task)?,
            });
        }
        Ok(assignments)
    }

    fn create_tasks_for_worker(&self, inner: &mut Inner, worker_address: &str) -> Result<()> {
        for job in inner.state.list_jobs() {
            if !job.finished {
                inner.create_task(&job, worker_address)?;
            }
        }
        Ok(())
    }

    // Hands tasks to their workers. Failures are only logged: the worker
    // picks the task up on its next heartbeat.
    async fn assign_tasks(&self, assignments: Vec<PendingAssignment>) {
        let calls = assignments.into_iter().map(|assignment| async move {
            let task_id = assignment.task.task_id;
            let address = assignment.worker_address;
            let result = match self.worker_client(&address).await {
                Ok(client) => client.process_task(assignment.task).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => debug!("Assigned task {} to worker {}", task_id, address),
                Err(e) => warn!(
                    "Failed to submit task {} to worker {}: {}",
                    task_id, address, e
                ),
            }
        });
        join_all(calls).await;
    }

    async fn worker_client(&self, address: &str) -> Result<Arc<dyn WorkerClient>> {
        if let Some(client) = self.inner.lock().await.worker_clients.get(address) {
            return Ok(Arc::clone(client));
        }
        let client = self.worker_client_factory.create(address)?;
        let mut inner = self.inner.lock().await;
        // A concurrent call may have cached a client first
        Ok(Arc::clone(
            inner
                .worker_clients
                .entry(address.to_string())
                .or_insert(client),
        ))
    }

    fn dataset_def(&self, state: &DispatcherState, dataset_id: i64) -> Result<Arc<DatasetDef>> {
        let dataset = state.dataset_from_id(dataset_id)?;
        let key = dataset_key(dataset.dataset_id, dataset.fingerprint);
        run_blocking(|| self.dataset_store.get(&key))
    }

    fn task_def(&self, state: &DispatcherState, task: &Task) -> Result<TaskDef> {
        let dataset = match &self.config.work_dir {
            None => TaskDataset::Def(self.dataset_def(state, task.dataset_id)?.as_ref().clone()),
            Some(work_dir) => {
                let dataset = state.dataset_from_id(task.dataset_id)?;
                let path: PathBuf = work_dir
                    .join(DATASETS_DIR)
                    .join(dataset_key(dataset.dataset_id, dataset.fingerprint));
                TaskDataset::Path(path.to_string_lossy().into_owned())
            }
        };
        Ok(TaskDef {
            task_id: task.task_id,
            job_id: task.job_id,
            dataset_id: task.dataset_id,
            processing_mode: task.processing_mode,
            dataset,
        })
    }
}

impl Inner {
    /// Validates `update`, journals it, then applies it. Only valid updates
    /// reach the journal, so replay never fails on a record.
    fn apply(&mut self, update: Update) -> Result<()> {
        self.state.validate(&update)?;
        if let Some(journal) = self.journal.as_mut() {
            if let Err(e) = run_blocking(|| journal.write(&update)) {
                error!("Failed to journal update, refusing further requests: {}", e);
                self.journal_failure.send_replace(Some(e.to_string()));
                return Err(ServiceError::internal_with_source("Failed to journal update", e));
            }
        }
        self.state.apply(&update)
    }

    fn acquire_job_client(&mut self, job_id: i64) -> Result<i64> {
        let job_client_id = self.state.next_available_job_client_id();
        self.apply(Update::AcquireJobClient {
            job_client_id,
            job_id,
        })?;
        Ok(job_client_id)
    }

    fn create_task(&mut self, job: &Job, worker_address: &str) -> Result<Arc<Task>> {
        let task_id = self.state.next_available_task_id();
        self.apply(Update::CreateTask {
            task_id,
            job_id: job.job_id,
            dataset_id: job.dataset_id,
            processing_mode: job.processing_mode,
            worker_address: worker_address.to_string(),
        })?;
        self.state.task_from_id(task_id)
    }
}

fn validate_matching_job(job: &Job, processing_mode: ProcessingMode, dataset_id: i64) -> Result<()> {
    let job_name = job
        .named_job_key
        .as_ref()
        .map(|key| key.name.as_str())
        .unwrap_or_default();
    if job.processing_mode != processing_mode {
        return Err(ServiceError::failed_precondition(format!(
            "Tried to create a job with name {job_name} and processing_mode <{processing_mode}> but there is already an existing job with that name using processing mode <{}>",
            job.processing_mode
        )));
    }
    if job.dataset_id != dataset_id {
        return Err(ServiceError::failed_precondition(format!(
            "Tried to create a job with name {job_name} for dataset {dataset_id} but there is already an existing job with that name for dataset {}",
            job.dataset_id
        )));
    }
    Ok(())
}

fn journal_failure_error(message: &str) -> ServiceError {
    ServiceError::internal(format!(
        "Dispatcher stopped serving after a journal write failed: {message}"
    ))
}

fn restore_state(work_dir: &std::path::Path) -> Result<DispatcherState> {
    let mut state = DispatcherState::new();
    let mut reader = JournalReader::new(work_dir);
    info!(
        "Attempting to restore dispatcher state from journal in {}",
        work_dir.display()
    );
    let mut count = 0usize;
    loop {
        match reader.read::<Update>() {
            Ok(Some(update)) => {
                state.apply(&update)?;
                count += 1;
            }
            Ok(None) => break,
            Err(e) if e.is_not_found() => {
                info!("No journal found. Starting dispatcher from new state");
                return Ok(state);
            }
            Err(e) => return Err(e),
        }
    }
    info!("Restored dispatcher state from {} journal updates", count);
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use dataservice_core::dataset::DatasetGraph;
    use dataservice_core::rpc::GetElementResult;
    use dataservice_core::{ErrorCode, ManualClock};
    use tempfile::TempDir;

    /// Records the tasks the dispatcher hands out.
    #[derive(Default)]
    struct RecordingWorkers {
        assigned: StdMutex<Vec<(String, i64)>>,
    }

    struct RecordingClient {
        address: String,
        workers: Arc<RecordingWorkers>,
    }

    #[async_trait]
    impl WorkerClient for RecordingClient {
        async fn process_task(&self, task: TaskDef) -> Result<()> {
            self.workers
                .assigned
                .lock()
                .unwrap()
                .push((self.address.clone(), task.task_id));
            Ok(())
        }

        async fn get_element(&self, _task_id: i64) -> Result<GetElementResult> {
            Ok(GetElementResult::EndOfSequence)
        }

        async fn get_worker_tasks(&self) -> Result<Vec<TaskInfo>> {
            Ok(Vec::new())
        }
    }

    struct RecordingFactory(Arc<RecordingWorkers>);

    impl WorkerClientFactory for RecordingFactory {
        fn create(&self, address: &str) -> Result<Arc<dyn WorkerClient>> {
            Ok(Arc::new(RecordingClient {
                address: address.to_string(),
                workers: Arc::clone(&self.0),
            }))
        }
    }

    fn dataset(stop: i64) -> DatasetDef {
        DatasetDef::from_graph(&DatasetGraph::range(0, stop)).unwrap()
    }

    async fn started(config: DispatcherConfig) -> (Arc<DispatcherImpl>, Arc<RecordingWorkers>, Arc<ManualClock>) {
        let workers = Arc::new(RecordingWorkers::default());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let dispatcher = Arc::new(
            DispatcherImpl::with_clock(
                config,
                Arc::new(RecordingFactory(Arc::clone(&workers))),
                clock.clone(),
            )
            .unwrap(),
        );
        dispatcher.start().await.unwrap();
        (dispatcher, workers, clock)
    }

    #[tokio::test]
    async fn test_not_started_is_unavailable() {
        let dispatcher =
            DispatcherImpl::new(DispatcherConfig::default(), Arc::new(RecordingFactory(Default::default())))
                .unwrap();
        let err = dispatcher.get_workers().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unavailable);
    }

    #[tokio::test]
    async fn test_fault_tolerance_requires_work_dir() {
        let config = DispatcherConfig {
            fault_tolerant_mode: true,
            ..Default::default()
        };
        let dispatcher = Arc::new(
            DispatcherImpl::new(config, Arc::new(RecordingFactory(Default::default()))).unwrap(),
        );
        let err = dispatcher.start().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_register_dataset_dedups_by_fingerprint() {
        let (dispatcher, _, _) = started(DispatcherConfig::default()).await;
        assert_eq!(dispatcher.register_dataset(dataset(3)).await.unwrap(), 1);
        assert_eq!(dispatcher.register_dataset(dataset(3)).await.unwrap(), 1);
        assert_eq!(dispatcher.register_dataset(dataset(4)).await.unwrap(), 2);
        assert_eq!(dispatcher.get_dataset_def(2).await.unwrap(), dataset(4));
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_undecodable_dataset_is_rejected() {
        let (dispatcher, _, _) = started(DispatcherConfig::default()).await;
        let err = dispatcher
            .register_dataset(DatasetDef { graph: vec![0xff; 3] })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        assert_eq!(dispatcher.state().await.next_available_dataset_id(), 1);
    }

    #[tokio::test]
    async fn test_create_job_assigns_task_per_worker() {
        let (dispatcher, workers, _) = started(DispatcherConfig::default()).await;
        let dataset_id = dispatcher.register_dataset(dataset(3)).await.unwrap();
        dispatcher.worker_heartbeat("w1", &[]).await.unwrap();
        dispatcher.worker_heartbeat("w2", &[]).await.unwrap();

        let job_client_id = dispatcher
            .create_job(dataset_id, ProcessingMode::ParallelEpochs)
            .await
            .unwrap();
        let tasks = dispatcher.get_tasks(job_client_id).await.unwrap();
        assert_eq!(tasks.tasks.len(), 2);
        assert!(!tasks.job_finished);

        let mut assigned = workers.assigned.lock().unwrap().clone();
        assigned.sort();
        assert_eq!(assigned, vec![("w1".to_string(), 1), ("w2".to_string(), 2)]);
    }

    #[tokio::test]
    async fn test_create_job_unknown_dataset() {
        let (dispatcher, _, _) = started(DispatcherConfig::default()).await;
        let err = dispatcher
            .create_job(9, ProcessingMode::ParallelEpochs)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_heartbeat_reconciles_tasks() {
        let (dispatcher, _, _) = started(DispatcherConfig::default()).await;
        let dataset_id = dispatcher.register_dataset(dataset(3)).await.unwrap();
        dispatcher
            .create_job(dataset_id, ProcessingMode::ParallelEpochs)
            .await
            .unwrap();

        let response = dispatcher.worker_heartbeat("w1", &[77]).await.unwrap();
        assert_eq!(response.new_tasks.len(), 1);
        let task = &response.new_tasks[0];
        assert_eq!(task.dataset_id, dataset_id);
        assert_eq!(task.dataset, TaskDataset::Def(dataset(3)));
        assert_eq!(response.tasks_to_delete, vec![77]);

        let response = dispatcher
            .worker_heartbeat("w1", &[task.task_id])
            .await
            .unwrap();
        assert!(response.new_tasks.is_empty());
        assert!(response.tasks_to_delete.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_sends_path_with_work_dir() {
        let dir = TempDir::new().unwrap();
        let config = DispatcherConfig {
            work_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let (dispatcher, _, _) = started(config).await;
        let dataset_id = dispatcher.register_dataset(dataset(3)).await.unwrap();
        dispatcher
            .create_job(dataset_id, ProcessingMode::ParallelEpochs)
            .await
            .unwrap();

        let response = dispatcher.worker_heartbeat("w1", &[]).await.unwrap();
        match &response.new_tasks[0].dataset {
            TaskDataset::Path(path) => {
                let def = dataservice_core::storage::read_dataset_file(std::path::Path::new(path)).unwrap();
                assert_eq!(def, dataset(3));
            }
            other => panic!("expected a path, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_named_job_attach() {
        let (dispatcher, _, _) = started(DispatcherConfig::default()).await;
        let dataset_id = dispatcher.register_dataset(dataset(3)).await.unwrap();

        let first = dispatcher
            .get_or_create_job(dataset_id, ProcessingMode::ParallelEpochs, "a", 0)
            .await
            .unwrap();
        let second = dispatcher
            .get_or_create_job(dataset_id, ProcessingMode::ParallelEpochs, "a", 0)
            .await
            .unwrap();
        assert_ne!(first, second);

        let state = dispatcher.state().await;
        let job = state.job_for_job_client_id(second).unwrap();
        assert_eq!(job.job_id, state.job_for_job_client_id(first).unwrap().job_id);
        assert_eq!(job.num_clients, 2);

        let err = dispatcher
            .get_or_create_job(dataset_id, ProcessingMode::DistributedEpoch, "a", 0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);

        let other = dispatcher.register_dataset(dataset(5)).await.unwrap();
        let err = dispatcher
            .get_or_create_job(other, ProcessingMode::ParallelEpochs, "a", 0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_get_tasks_unknown_client_mentions_restart() {
        let (dispatcher, _, _) = started(DispatcherConfig::default()).await;
        let err = dispatcher.get_tasks(5).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("dispatcher restart"));
    }

    #[tokio::test]
    async fn test_release_job_client() {
        let (dispatcher, _, _) = started(DispatcherConfig::default()).await;
        assert!(dispatcher.release_job_client(3).await.unwrap_err().is_not_found());

        let dataset_id = dispatcher.register_dataset(dataset(3)).await.unwrap();
        let job_client_id = dispatcher
            .create_job(dataset_id, ProcessingMode::ParallelEpochs)
            .await
            .unwrap();
        dispatcher.release_job_client(job_client_id).await.unwrap();
        assert!(dispatcher
            .release_job_client(job_client_id)
            .await
            .unwrap_err()
            .is_not_found());
        // A released client can still poll its job
        assert!(dispatcher.get_tasks(job_client_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_get_split_exhausts_dataset() {
        let (dispatcher, _, _) = started(DispatcherConfig::default()).await;
        let dataset_id = dispatcher.register_dataset(dataset(3)).await.unwrap();
        let job_client_id = dispatcher
            .create_job(dataset_id, ProcessingMode::DistributedEpoch)
            .await
            .unwrap();
        let job_id = dispatcher
            .state()
            .await
            .job_for_job_client_id(job_client_id)
            .unwrap()
            .job_id;

        let mut splits = Vec::new();
        while let Some(split) = dispatcher.get_split(job_id, 0).await.unwrap() {
            splits.push(split);
        }
        assert_eq!(splits.len(), 3);
        assert!(dispatcher.get_split(job_id, 0).await.unwrap().is_none());
        // A new repetition starts over
        assert!(dispatcher.get_split(job_id, 1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_get_split_requires_distributed_epoch_job() {
        let (dispatcher, _, _) = started(DispatcherConfig::default()).await;
        let dataset_id = dispatcher.register_dataset(dataset(3)).await.unwrap();
        dispatcher
            .create_job(dataset_id, ProcessingMode::ParallelEpochs)
            .await
            .unwrap();
        assert!(dispatcher.get_split(1, 0).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_worker_update_finishes_job() {
        let (dispatcher, _, _) = started(DispatcherConfig::default()).await;
        let dataset_id = dispatcher.register_dataset(dataset(3)).await.unwrap();
        let job_client_id = dispatcher
            .create_job(dataset_id, ProcessingMode::ParallelEpochs)
            .await
            .unwrap();
        let task_id = dispatcher.worker_heartbeat("w1", &[]).await.unwrap().new_tasks[0].task_id;

        let update = TaskProgress {
            task_id,
            completed: true,
        };
        dispatcher.worker_update("w1", &[update]).await.unwrap();
        dispatcher.worker_update("w1", &[update]).await.unwrap();
        assert!(dispatcher.get_tasks(job_client_id).await.unwrap().job_finished);

        let err = dispatcher
            .worker_update(
                "w1",
                &[TaskProgress {
                    task_id: 99,
                    completed: true,
                }],
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_gc_finishes_released_jobs() {
        let config = DispatcherConfig {
            job_gc_timeout_ms: 1000,
            ..Default::default()
        };
        let (dispatcher, _, clock) = started(config).await;
        let dataset_id = dispatcher.register_dataset(dataset(3)).await.unwrap();
        dispatcher.worker_heartbeat("w1", &[]).await.unwrap();
        let with_task = dispatcher
            .create_job(dataset_id, ProcessingMode::ParallelEpochs)
            .await
            .unwrap();
        let held = dispatcher
            .create_job(dataset_id, ProcessingMode::ParallelEpochs)
            .await
            .unwrap();

        dispatcher.release_job_client(with_task).await.unwrap();
        clock.advance_millis(1000);
        dispatcher.gc_old_jobs().await.unwrap();
        let state = dispatcher.state().await;
        assert!(!state.job_from_id(1).unwrap().finished);

        clock.advance_millis(1);
        dispatcher.gc_old_jobs().await.unwrap();
        let state = dispatcher.state().await;
        let job = state.job_from_id(1).unwrap();
        assert!(job.finished);
        assert!(state.tasks_for_job(1).unwrap().iter().all(|task| task.finished));
        // Jobs with attached clients are left alone
        assert!(!state.job_for_job_client_id(held).unwrap().finished);
    }

    #[tokio::test]
    async fn test_gc_finishes_taskless_job() {
        let config = DispatcherConfig {
            job_gc_timeout_ms: 10,
            ..Default::default()
        };
        let (dispatcher, _, clock) = started(config).await;
        let dataset_id = dispatcher.register_dataset(dataset(3)).await.unwrap();
        let job_client_id = dispatcher
            .get_or_create_job(dataset_id, ProcessingMode::ParallelEpochs, "solo", 0)
            .await
            .unwrap();
        dispatcher.release_job_client(job_client_id).await.unwrap();
        clock.advance_millis(11);
        dispatcher.gc_old_jobs().await.unwrap();

        let state = dispatcher.state().await;
        assert!(state.job_from_id(1).unwrap().finished);
        assert!(state.named_job_by_key(&NamedJobKey::new("solo", 0)).is_err());
    }

    #[tokio::test]
    async fn test_restart_restores_journaled_state() {
        let dir = TempDir::new().unwrap();
        let config = DispatcherConfig {
            work_dir: Some(dir.path().to_path_buf()),
            fault_tolerant_mode: true,
            ..Default::default()
        };

        let (dispatcher, _, _) = started(config.clone()).await;
        let dataset_id = dispatcher.register_dataset(dataset(3)).await.unwrap();
        let job_client_id = dispatcher
            .create_job(dataset_id, ProcessingMode::DistributedEpoch)
            .await
            .unwrap();
        dispatcher.worker_heartbeat("w1", &[]).await.unwrap();
        let before = dispatcher.state().await;
        dispatcher.shutdown().await;
        drop(dispatcher);

        let (restarted, _, _) = started(config).await;
        assert_eq!(restarted.state().await, before);
        assert_eq!(restarted.register_dataset(dataset(3)).await.unwrap(), dataset_id);
        assert_eq!(restarted.get_tasks(job_client_id).await.unwrap().tasks.len(), 1);
        assert!(restarted.get_split(1, 0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_restart_skips_finished_distributed_jobs() {
        let dir = TempDir::new().unwrap();
        let config = DispatcherConfig {
            work_dir: Some(dir.path().to_path_buf()),
            fault_tolerant_mode: true,
            job_gc_timeout_ms: 10,
            ..Default::default()
        };

        let (dispatcher, _, clock) = started(config.clone()).await;
        let dataset_id = dispatcher.register_dataset(dataset(3)).await.unwrap();
        let job_client_id = dispatcher
            .create_job(dataset_id, ProcessingMode::DistributedEpoch)
            .await
            .unwrap();
        dispatcher.release_job_client(job_client_id).await.unwrap();
        clock.advance_millis(11);
        dispatcher.gc_old_jobs().await.unwrap();
        assert!(dispatcher.get_split(1, 0).await.unwrap_err().is_not_found());
        dispatcher.shutdown().await;
        drop(dispatcher);

        let (restarted, _, _) = started(config).await;
        assert!(restarted.state().await.job_from_id(1).unwrap().finished);
        assert!(restarted.inner.lock().await.distributed_epoch_jobs.is_empty());
        assert!(restarted.get_split(1, 0).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_journal_failure_refuses_later_requests() {
        let dir = TempDir::new().unwrap();
        let config = DispatcherConfig {
            work_dir: Some(dir.path().to_path_buf()),
            fault_tolerant_mode: true,
            ..Default::default()
        };
        let (dispatcher, _, _) = started(config.clone()).await;
        let dataset_id = dispatcher.register_dataset(dataset(3)).await.unwrap();
        assert!(dispatcher.journal_failure().is_none());

        // A plain file where the journal directory should be created
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, b"").unwrap();
        dispatcher.inner.lock().await.journal = Some(JournalWriter::new(&blocker));

        let err = dispatcher
            .create_job(dataset_id, ProcessingMode::ParallelEpochs)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
        let failure = tokio::time::timeout(
            Duration::from_secs(1),
            dispatcher.wait_for_journal_failure(),
        )
        .await
        .unwrap();
        assert!(failure.to_string().contains("journal"));
        assert!(dispatcher.state().await.list_jobs().is_empty());

        // Reads and writes alike are refused from now on
        let refused = [
            dispatcher.get_workers().await.unwrap_err(),
            dispatcher.worker_heartbeat("w1", &[]).await.unwrap_err(),
            dispatcher.register_dataset(dataset(5)).await.unwrap_err(),
        ];
        for err in refused {
            assert_eq!(err.code(), ErrorCode::Internal);
        }

        // The GC task stops on its own
        let gc_task = dispatcher.gc_task.lock().await.take().unwrap();
        tokio::time::timeout(Duration::from_secs(1), gc_task)
            .await
            .unwrap()
            .unwrap();

        // Nothing was appended to the real journal, so it still replays
        drop(dispatcher);
        let (restarted, _, _) = started(config).await;
        let state = restarted.state().await;
        assert_eq!(state.dataset_from_id(dataset_id).unwrap().dataset_id, dataset_id);
        assert!(state.list_jobs().is_empty());
    }
}
