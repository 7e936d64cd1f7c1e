//! Split provider backed by the dispatcher's `GetSplit` RPC.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use dataservice_core::dataset::{Split, SplitProvider};
use dataservice_core::rpc::{retry_async, RetryPolicy, RetryResult};
use dataservice_core::{DispatcherClient, Result, ServiceError};

/// Pulls the splits of a distributed-epoch job from the dispatcher.
///
/// Every worker of the job shares the dispatcher-side provider for a
/// repetition, so each split is handed out once across all of them.
pub struct RemoteSplitProvider {
    dispatcher: Arc<dyn DispatcherClient>,
    job_id: i64,
    repetition: i64,
    timeout: Duration,
    retry_policy: RetryPolicy,
}

impl RemoteSplitProvider {
    /// Transient failures are retried until `timeout` elapses.
    pub fn new(dispatcher: Arc<dyn DispatcherClient>, job_id: i64, timeout: Duration) -> Self {
        Self {
            dispatcher,
            job_id,
            repetition: 0,
            timeout,
            retry_policy: RetryPolicy {
                max_retries: u32::MAX,
                max_delay: Duration::from_secs(1),
                ..RetryPolicy::default()
            },
        }
    }

    pub fn repetition(&self) -> i64 {
        self.repetition
    }
}

#[async_trait]
impl SplitProvider for RemoteSplitProvider {
    async fn get_next(&mut self) -> Result<Option<Split>> {
        let dispatcher = &self.dispatcher;
        let (job_id, repetition) = (self.job_id, self.repetition);
        let split = tokio::time::timeout(
            self.timeout,
            retry_async(&self.retry_policy, || async move {
                RetryResult::from(dispatcher.get_split(job_id, repetition).await)
            }),
        )
        .await
        .map_err(|_| {
            ServiceError::DeadlineExceeded(format!(
                "Timed out after {:?} getting a split for job {job_id} repetition {repetition}",
                self.timeout
            ))
        })??;
        trace!(
            "Got {} for job {} repetition {}",
            if split.is_some() { "split" } else { "end of splits" },
            job_id,
            repetition
        );
        Ok(split)
    }

    async fn reset(&mut self) -> Result<()> {
        self.repetition += 1;
        Ok(())
    }
}
