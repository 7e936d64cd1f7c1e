//! Dispatcher state machine.
//!
//! `DispatcherState` holds every dataset, worker, job, job client and task the
//! dispatcher knows about. It changes only through [`DispatcherState::apply`],
//! which performs no I/O, so replaying a journal of `Update`s from an empty
//! state rebuilds exactly the state that produced it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use dataservice_core::{ProcessingMode, Result, ServiceError};

/// Key under which a named job can be found by the clients sharing it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamedJobKey {
    pub name: String,
    pub index: i64,
}

impl NamedJobKey {
    pub fn new(name: impl Into<String>, index: i64) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }
}

/// A state-mutating intent. These are the records of the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Update {
    RegisterDataset {
        dataset_id: i64,
        fingerprint: u64,
    },
    RegisterWorker {
        worker_address: String,
    },
    CreateJob {
        job_id: i64,
        dataset_id: i64,
        processing_mode: ProcessingMode,
        named_job_key: Option<NamedJobKey>,
    },
    CreateTask {
        task_id: i64,
        job_id: i64,
        dataset_id: i64,
        processing_mode: ProcessingMode,
        worker_address: String,
    },
    FinishTask {
        task_id: i64,
    },
    AcquireJobClient {
        job_client_id: i64,
        job_id: i64,
    },
    ReleaseJobClient {
        job_client_id: i64,
        time_micros: i64,
    },
    /// Finishes a job along with any of its unfinished tasks.
    FinishJob {
        job_id: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub dataset_id: i64,
    pub fingerprint: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub job_id: i64,
    pub dataset_id: i64,
    pub processing_mode: ProcessingMode,
    pub named_job_key: Option<NamedJobKey>,
    pub num_clients: i64,
    /// Time the client count last dropped to zero, or -1 if it never has.
    pub last_client_released_micros: i64,
    pub finished: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub task_id: i64,
    pub job_id: i64,
    pub dataset_id: i64,
    pub processing_mode: ProcessingMode,
    pub worker_address: String,
    pub finished: bool,
}

/// In-memory dispatcher state.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherState {
    datasets_by_id: BTreeMap<i64, Arc<Dataset>>,
    datasets_by_fingerprint: HashMap<u64, i64>,
    workers: BTreeMap<String, Arc<Worker>>,
    jobs: BTreeMap<i64, Arc<Job>>,
    named_jobs: HashMap<NamedJobKey, i64>,
    // Released clients keep their mapping so they can still poll the job
    job_for_job_client_id: HashMap<i64, i64>,
    released_job_clients: BTreeSet<i64>,
    tasks: BTreeMap<i64, Arc<Task>>,
    tasks_by_job: HashMap<i64, Vec<i64>>,
    // Unfinished tasks only; an entry exists for every registered worker
    tasks_by_worker: HashMap<String, BTreeSet<i64>>,
    next_available_dataset_id: i64,
    next_available_job_id: i64,
    next_available_job_client_id: i64,
    next_available_task_id: i64,
}

impl Default for DispatcherState {
    fn default() -> Self {
        Self {
            datasets_by_id: BTreeMap::new(),
            datasets_by_fingerprint: HashMap::new(),
            workers: BTreeMap::new(),
            jobs: BTreeMap::new(),
            named_jobs: HashMap::new(),
            job_for_job_client_id: HashMap::new(),
            released_job_clients: BTreeSet::new(),
            tasks: BTreeMap::new(),
            tasks_by_job: HashMap::new(),
            tasks_by_worker: HashMap::new(),
            next_available_dataset_id: 1,
            next_available_job_id: 1,
            next_available_job_client_id: 1,
            next_available_task_id: 1,
        }
    }
}

impl DispatcherState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `update`. An update that fails validation leaves the state
    /// untouched.
    pub fn apply(&mut self, update: &Update) -> Result<()> {
        self.validate(update)?;
        match update {
            Update::RegisterDataset {
                dataset_id,
                fingerprint,
            } => self.register_dataset(*dataset_id, *fingerprint),
            Update::RegisterWorker { worker_address } => self.register_worker(worker_address),
            Update::CreateJob {
                job_id,
                dataset_id,
                processing_mode,
                named_job_key,
            } => self.create_job(*job_id, *dataset_id, *processing_mode, named_job_key.clone()),
            Update::CreateTask {
                task_id,
                job_id,
                dataset_id,
                processing_mode,
                worker_address,
            } => self.create_task(
                *task_id,
                *job_id,
                *dataset_id,
                *processing_mode,
                worker_address,
            ),
            Update::FinishTask { task_id } => self.finish_task(*task_id),
            Update::AcquireJobClient {
                job_client_id,
                job_id,
            } => self.acquire_job_client(*job_client_id, *job_id),
            Update::ReleaseJobClient {
                job_client_id,
                time_micros,
            } => self.release_job_client(*job_client_id, *time_micros),
            Update::FinishJob { job_id } => self.mark_job_finished_with_tasks(*job_id),
        }
        Ok(())
    }

    /// Checks that `update` would apply cleanly, without changing anything.
    pub fn validate(&self, update: &Update) -> Result<()> {
        match update {
            Update::RegisterDataset {
                dataset_id,
                fingerprint,
            } => {
                if self.datasets_by_id.contains_key(dataset_id) {
                    return Err(ServiceError::already_exists(format!(
                        "Dataset id {dataset_id} is already registered"
                    )));
                }
                if let Some(existing) = self.datasets_by_fingerprint.get(fingerprint) {
                    return Err(ServiceError::already_exists(format!(
                        "Fingerprint {fingerprint} is already registered as dataset {existing}"
                    )));
                }
            }
            Update::RegisterWorker { worker_address } => {
                if self.workers.contains_key(worker_address) {
                    return Err(ServiceError::already_exists(format!(
                        "Worker {worker_address} is already registered"
                    )));
                }
            }
            Update::CreateJob {
                job_id,
                dataset_id,
                named_job_key,
                ..
            } => {
                if self.jobs.contains_key(job_id) {
                    return Err(ServiceError::already_exists(format!(
                        "Job id {job_id} already exists"
                    )));
                }
                self.dataset_from_id(*dataset_id)?;
                if let Some(key) = named_job_key {
                    if self.named_jobs.contains_key(key) {
                        return Err(ServiceError::already_exists(format!(
                            "A live job named {} with index {} already exists",
                            key.name, key.index
                        )));
                    }
                }
            }
            Update::CreateTask {
                task_id,
                job_id,
                dataset_id,
                processing_mode,
                worker_address,
            } => {
                if self.tasks.contains_key(task_id) {
                    return Err(ServiceError::already_exists(format!(
                        "Task id {task_id} already exists"
                    )));
                }
                let job = self.job_from_id(*job_id)?;
                if job.dataset_id != *dataset_id || job.processing_mode != *processing_mode {
                    return Err(ServiceError::invalid_argument(format!(
                        "Task {task_id} does not match job {job_id}: dataset {dataset_id} ({processing_mode}) vs dataset {} ({})",
                        job.dataset_id, job.processing_mode
                    )));
                }
                if !self.workers.contains_key(worker_address) {
                    return Err(ServiceError::not_found(format!(
                        "Worker {worker_address} not found"
                    )));
                }
                let on_worker = self
                    .tasks_by_job
                    .get(job_id)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| self.tasks.get(id))
                    .any(|task| task.worker_address == *worker_address);
                if on_worker {
                    return Err(ServiceError::already_exists(format!(
                        "Job {job_id} already has a task on worker {worker_address}"
                    )));
                }
            }
            Update::FinishTask { task_id } => {
                self.task_from_id(*task_id)?;
            }
            Update::AcquireJobClient {
                job_client_id,
                job_id,
            } => {
                if self.job_for_job_client_id.contains_key(job_client_id) {
                    return Err(ServiceError::already_exists(format!(
                        "Job client id {job_client_id} is already in use"
                    )));
                }
                self.job_from_id(*job_id)?;
            }
            Update::ReleaseJobClient { job_client_id, .. } => {
                let job_id = match self.job_for_job_client_id.get(job_client_id) {
                    Some(job_id) if !self.released_job_clients.contains(job_client_id) => {
                        *job_id
                    }
                    _ => {
                        return Err(ServiceError::not_found(format!(
                            "Job client id {job_client_id} not found or already released"
                        )))
                    }
                };
                if !self.jobs.contains_key(&job_id) {
                    return Err(ServiceError::internal(format!(
                        "Job client {job_client_id} refers to missing job {job_id}"
                    )));
                }
            }
            Update::FinishJob { job_id } => {
                self.job_from_id(*job_id)?;
            }
        }
        Ok(())
    }

    fn register_dataset(&mut self, dataset_id: i64, fingerprint: u64) {
        self.datasets_by_id.insert(
            dataset_id,
            Arc::new(Dataset {
                dataset_id,
                fingerprint,
            }),
        );
        self.datasets_by_fingerprint.insert(fingerprint, dataset_id);
        self.next_available_dataset_id = self.next_available_dataset_id.max(dataset_id + 1);
    }

    fn register_worker(&mut self, address: &str) {
        self.workers.insert(
            address.to_string(),
            Arc::new(Worker {
                address: address.to_string(),
            }),
        );
        self.tasks_by_worker.entry(address.to_string()).or_default();
    }

    fn create_job(
        &mut self,
        job_id: i64,
        dataset_id: i64,
        processing_mode: ProcessingMode,
        named_job_key: Option<NamedJobKey>,
    ) {
        if let Some(key) = &named_job_key {
            self.named_jobs.insert(key.clone(), job_id);
        }
        self.jobs.insert(
            job_id,
            Arc::new(Job {
                job_id,
                dataset_id,
                processing_mode,
                named_job_key,
                num_clients: 0,
                last_client_released_micros: -1,
                finished: false,
            }),
        );
        self.tasks_by_job.entry(job_id).or_default();
        self.next_available_job_id = self.next_available_job_id.max(job_id + 1);
    }

    fn create_task(
        &mut self,
        task_id: i64,
        job_id: i64,
        dataset_id: i64,
        processing_mode: ProcessingMode,
        worker_address: &str,
    ) {
        self.tasks_by_job.entry(job_id).or_default().push(task_id);
        self.tasks.insert(
            task_id,
            Arc::new(Task {
                task_id,
                job_id,
                dataset_id,
                processing_mode,
                worker_address: worker_address.to_string(),
                finished: false,
            }),
        );
        self.tasks_by_worker
            .entry(worker_address.to_string())
            .or_default()
            .insert(task_id);
        self.next_available_task_id = self.next_available_task_id.max(task_id + 1);
    }

    fn finish_task(&mut self, task_id: i64) {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        if task.finished {
            return;
        }
        Arc::make_mut(task).finished = true;
        let job_id = task.job_id;
        if let Some(ids) = self.tasks_by_worker.get_mut(&task.worker_address) {
            ids.remove(&task_id);
        }

        let all_finished = self
            .tasks_by_job
            .get(&job_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.tasks.get(id))
                    .all(|task| task.finished)
            })
            .unwrap_or(true);
        if all_finished {
            self.mark_job_finished(job_id);
        }
    }

    fn mark_job_finished_with_tasks(&mut self, job_id: i64) {
        let task_ids = self.tasks_by_job.get(&job_id).cloned().unwrap_or_default();
        for task_id in task_ids {
            if let Some(task) = self.tasks.get_mut(&task_id) {
                if !task.finished {
                    Arc::make_mut(task).finished = true;
                    if let Some(ids) = self.tasks_by_worker.get_mut(&task.worker_address) {
                        ids.remove(&task_id);
                    }
                }
            }
        }
        self.mark_job_finished(job_id);
    }

    fn mark_job_finished(&mut self, job_id: i64) {
        if let Some(job) = self.jobs.get_mut(&job_id) {
            let job = Arc::make_mut(job);
            job.finished = true;
            if let Some(key) = &job.named_job_key {
                self.named_jobs.remove(key);
            }
        }
    }

    fn acquire_job_client(&mut self, job_client_id: i64, job_id: i64) {
        if let Some(job) = self.jobs.get_mut(&job_id) {
            Arc::make_mut(job).num_clients += 1;
        }
        self.job_for_job_client_id.insert(job_client_id, job_id);
        self.next_available_job_client_id =
            self.next_available_job_client_id.max(job_client_id + 1);
    }

    fn release_job_client(&mut self, job_client_id: i64, time_micros: i64) {
        let Some(&job_id) = self.job_for_job_client_id.get(&job_client_id) else {
            return;
        };
        if let Some(job) = self.jobs.get_mut(&job_id) {
            let job = Arc::make_mut(job);
            job.num_clients = (job.num_clients - 1).max(0);
            if job.num_clients == 0 {
                job.last_client_released_micros = time_micros;
            }
        }
        self.released_job_clients.insert(job_client_id);
    }

    pub fn next_available_dataset_id(&self) -> i64 {
        self.next_available_dataset_id
    }

    pub fn next_available_job_id(&self) -> i64 {
        self.next_available_job_id
    }

    pub fn next_available_job_client_id(&self) -> i64 {
        self.next_available_job_client_id
    }

    pub fn next_available_task_id(&self) -> i64 {
        self.next_available_task_id
    }

    pub fn dataset_from_id(&self, dataset_id: i64) -> Result<Arc<Dataset>> {
        self.datasets_by_id
            .get(&dataset_id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("Dataset id {dataset_id} not found")))
    }

    pub fn dataset_from_fingerprint(&self, fingerprint: u64) -> Result<Arc<Dataset>> {
        let dataset_id = self.datasets_by_fingerprint.get(&fingerprint).ok_or_else(|| {
            ServiceError::not_found(format!("Dataset fingerprint {fingerprint} not found"))
        })?;
        self.dataset_from_id(*dataset_id)
    }

    /// Registered workers, ordered by address.
    pub fn list_workers(&self) -> Vec<Arc<Worker>> {
        self.workers.values().cloned().collect()
    }

    /// All jobs, ordered by id.
    pub fn list_jobs(&self) -> Vec<Arc<Job>> {
        self.jobs.values().cloned().collect()
    }

    pub fn job_from_id(&self, job_id: i64) -> Result<Arc<Job>> {
        self.jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("Job id {job_id} not found")))
    }

    /// The job a client attached to. Released clients still resolve.
    pub fn job_for_job_client_id(&self, job_client_id: i64) -> Result<Arc<Job>> {
        let job_id = self.job_for_job_client_id.get(&job_client_id).ok_or_else(|| {
            ServiceError::not_found(format!("Job client id {job_client_id} not found"))
        })?;
        self.job_from_id(*job_id)
    }

    /// The live job registered under `key`. Finished jobs are not found.
    pub fn named_job_by_key(&self, key: &NamedJobKey) -> Result<Arc<Job>> {
        let job_id = self.named_jobs.get(key).ok_or_else(|| {
            ServiceError::not_found(format!(
                "Named job key ({}, {}) not found",
                key.name, key.index
            ))
        })?;
        self.job_from_id(*job_id)
    }

    pub fn is_job_client_released(&self, job_client_id: i64) -> bool {
        self.released_job_clients.contains(&job_client_id)
    }

    pub fn task_from_id(&self, task_id: i64) -> Result<Arc<Task>> {
        self.tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("Task {task_id} not found")))
    }

    /// Every task of a job, finished or not, in creation order.
    pub fn tasks_for_job(&self, job_id: i64) -> Result<Vec<Arc<Task>>> {
        let task_ids = self
            .tasks_by_job
            .get(&job_id)
            .ok_or_else(|| ServiceError::not_found(format!("Job {job_id} not found")))?;
        Ok(task_ids
            .iter()
            .filter_map(|id| self.tasks.get(id).cloned())
            .collect())
    }

    /// Unfinished tasks assigned to a worker.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the worker has never registered.
    pub fn tasks_for_worker(&self, worker_address: &str) -> Result<Vec<Arc<Task>>> {
        let task_ids = self.tasks_by_worker.get(worker_address).ok_or_else(|| {
            ServiceError::not_found(format!("Worker {worker_address} not found"))
        })?;
        Ok(task_ids
            .iter()
            .filter_map(|id| self.tasks.get(id).cloned())
            .collect())
    }
}
