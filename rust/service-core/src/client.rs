// rust/service-core/src/client.rs

//! Client-side iterator over a job's elements.
//!
//! A `DataServiceClient` registers a dataset, creates or joins a job, then
//! polls the dispatcher for the job's tasks and reads elements from the
//! workers running them in round-robin order. Dropping a started client
//! releases its job client in the background.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::dataset::DatasetDef;
use crate::error::{Result, ServiceError};
use crate::rpc::{
    retry_async, DispatcherClient, GetElementResult, ProcessingMode, RetryPolicy, RetryResult,
    TaskInfo, WorkerClient, WorkerClientFactory,
};

const DEFAULT_TASK_REFRESH_INTERVAL: Duration = Duration::from_millis(100);

/// Name of a shared job that several clients may attach to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobName {
    pub name: String,
    pub index: i64,
}

impl JobName {
    pub fn new(name: impl Into<String>, index: i64) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }
}

struct ClientTask {
    info: TaskInfo,
    worker: Arc<dyn WorkerClient>,
    end_of_sequence: bool,
}

pub struct DataServiceClient {
    dispatcher: Arc<dyn DispatcherClient>,
    worker_factory: Arc<dyn WorkerClientFactory>,
    retry_policy: RetryPolicy,
    task_refresh_interval: Duration,
    job_client_id: Option<i64>,
    tasks: Vec<ClientTask>,
    seen_tasks: HashSet<i64>,
    next_task: usize,
    job_finished: bool,
}

impl DataServiceClient {
    pub fn new(
        dispatcher: Arc<dyn DispatcherClient>,
        worker_factory: Arc<dyn WorkerClientFactory>,
    ) -> Self {
        Self {
            dispatcher,
            worker_factory,
            retry_policy: RetryPolicy::default(),
            task_refresh_interval: DEFAULT_TASK_REFRESH_INTERVAL,
            job_client_id: None,
            tasks: Vec::new(),
            seen_tasks: HashSet::new(),
            next_task: 0,
            job_finished: false,
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// How long to wait between `GetTasks` polls while no task has elements.
    #[must_use]
    pub fn with_task_refresh_interval(mut self, interval: Duration) -> Self {
        self.task_refresh_interval = interval;
        self
    }

    pub fn job_client_id(&self) -> Option<i64> {
        self.job_client_id
    }

    /// Registers `dataset` and creates a job over it, or joins the live job
    /// named `job_name`. Returns the job client id.
    ///
    /// # Errors
    ///
    /// Fails if the client already started or the dispatcher rejects the job.
    pub async fn start(
        &mut self,
        dataset: DatasetDef,
        processing_mode: ProcessingMode,
        job_name: Option<JobName>,
    ) -> Result<i64> {
        if self.job_client_id.is_some() {
            return Err(ServiceError::failed_precondition(
                "data service client already started",
            ));
        }
        let dispatcher = &self.dispatcher;
        let dataset_id = retry_async(&self.retry_policy, || {
            let dataset = dataset.clone();
            async move { RetryResult::from(dispatcher.register_dataset(dataset).await) }
        })
        .await?;

        let job_client_id = retry_async(&self.retry_policy, || {
            let job_name = job_name.clone();
            async move {
                let result = match job_name {
                    Some(JobName { name, index }) => {
                        dispatcher
                            .get_or_create_job(dataset_id, processing_mode, &name, index)
                            .await
                    }
                    None => dispatcher.create_job(dataset_id, processing_mode).await,
                };
                RetryResult::from(result)
            }
        })
        .await?;

        info!(
            "Started job client {} for dataset {} in {} mode",
            job_client_id, dataset_id, processing_mode
        );
        self.job_client_id = Some(job_client_id);
        Ok(job_client_id)
    }

    /// Returns the next element's uncompressed bytes, or `None` once the job
    /// is finished and every task has reached end of sequence.
    pub async fn get_next(&mut self) -> Result<Option<Vec<u8>>> {
        if self.job_client_id.is_none() {
            return Err(ServiceError::failed_precondition(
                "data service client has not started a job",
            ));
        }
        loop {
            if let Some(index) = self.next_readable_task() {
                let task_id = self.tasks[index].info.task_id;
                let worker = Arc::clone(&self.tasks[index].worker);
                let result = retry_async(&self.retry_policy, || {
                    let worker = Arc::clone(&worker);
                    async move { RetryResult::from(worker.get_element(task_id).await) }
                })
                .await?;
                match result {
                    GetElementResult::Element(element) => return element.decompress().map(Some),
                    GetElementResult::EndOfSequence => {
                        debug!("Task {} reached end of sequence", task_id);
                        self.tasks[index].end_of_sequence = true;
                    }
                }
                continue;
            }

            if self.job_finished {
                return Ok(None);
            }
            let added = self.refresh_tasks().await?;
            if added == 0 && !self.job_finished {
                tokio::time::sleep(self.task_refresh_interval).await;
            }
        }
    }

    /// Releases the job client so the dispatcher can collect the job.
    pub async fn release(&mut self) -> Result<()> {
        if let Some(job_client_id) = self.job_client_id.take() {
            self.dispatcher.release_job_client(job_client_id).await?;
            info!("Released job client {}", job_client_id);
        }
        Ok(())
    }

    fn next_readable_task(&mut self) -> Option<usize> {
        let len = self.tasks.len();
        for offset in 0..len {
            let index = (self.next_task + offset) % len;
            if !self.tasks[index].end_of_sequence {
                self.next_task = (index + 1) % len;
                return Some(index);
            }
        }
        None
    }

    // Returns how many new tasks were discovered.
    async fn refresh_tasks(&mut self) -> Result<usize> {
        let Some(job_client_id) = self.job_client_id else {
            return Ok(0);
        };
        let dispatcher = &self.dispatcher;
        let response = retry_async(&self.retry_policy, || async move {
            RetryResult::from(dispatcher.get_tasks(job_client_id).await)
        })
        .await?;

        let mut added = 0;
        for info in response.tasks {
            if !self.seen_tasks.insert(info.task_id) {
                continue;
            }
            let worker = self.worker_factory.create(&info.worker_address)?;
            debug!(
                "Reading task {} from worker {}",
                info.task_id, info.worker_address
            );
            self.tasks.push(ClientTask {
                info,
                worker,
                end_of_sequence: false,
            });
            added += 1;
        }
        self.job_finished = response.job_finished;
        Ok(added)
    }
}

impl Drop for DataServiceClient {
    fn drop(&mut self) {
        let Some(job_client_id) = self.job_client_id.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                let dispatcher = Arc::clone(&self.dispatcher);
                handle.spawn(async move {
                    match dispatcher.release_job_client(job_client_id).await {
                        Ok(()) => info!("Released job client {} on drop", job_client_id),
                        Err(e) => warn!(
                            "Failed to release job client {} on drop: {}",
                            job_client_id, e
                        ),
                    }
                });
            }
            Err(_) => warn!(
                "Job client {} dropped outside a tokio runtime and was not released",
                job_client_id
            ),
        }
    }
}
