//! Work queue: job records, retry decisions and the in-memory implementation.

mod memory;
mod record;
mod retry;
mod state;

use std::time::Duration;

pub use memory::InMemoryWorkQueue;
pub use record::JobRecord;
pub use retry::{RetryDecision, decide};
pub use state::JobState;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Job, JobId, JobKind, JobOptions, JobPayload};
use crate::observability::QueueCounts;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("job {0} is not in the queue")]
    UnknownJob(JobId),

    #[error("job payload could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("queue snapshot i/o: {0}")]
    Snapshot(#[from] std::io::Error),
}

/// What happened to a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Redelivery scheduled after `delay`.
    Retrying { attempts_made: u32, delay: Duration },
    /// No attempts left; the job will not be delivered again.
    Exhausted { attempts_made: u32 },
}

/// A leased job. The consumer owns the lease and must either `ack` or `fail` it.
#[async_trait]
pub trait JobLease: Send {
    fn job(&self) -> &Job;

    /// Completed; the job is removed.
    async fn ack(self: Box<Self>) -> Result<(), QueueError>;

    /// Failed; the queue redelivers with backoff or marks it failed.
    async fn fail(self: Box<Self>, error: String) -> Result<FailOutcome, QueueError>;

    /// Interrupted before it could finish; back to waiting with the attempt not counted.
    async fn release(self: Box<Self>) -> Result<(), QueueError>;
}

/// Queue port. Delivery is at-least-once, so consumers must tolerate redelivery.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Add a job. Returns as soon as the job is stored.
    async fn enqueue(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId, QueueError>;

    /// Wait for a ready job of `kind`. Returns `None` once the queue is closed.
    async fn lease(&self, kind: JobKind) -> Option<Box<dyn JobLease>>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;

    /// Stop handing out jobs and wake every waiting consumer. Enqueue keeps working so jobs
    /// still running can requeue follow-ups.
    async fn close(&self);

    /// Close, and refuse enqueue from now on with [`QueueError::Closed`].
    async fn seal(&self);
}

impl dyn WorkQueue {
    /// Enqueue a typed payload under its kind.
    pub async fn add<T: JobPayload>(
        &self,
        data: &T,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        let payload = serde_json::to_value(data)?;
        self.enqueue(T::KIND, payload, options).await
    }
}
