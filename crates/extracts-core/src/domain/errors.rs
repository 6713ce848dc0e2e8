//! Job-boundary error taxonomy.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::code::CodeKind;
use super::ids::JobId;
use crate::broker::BrokerError;
use crate::ports::{PortalError, RepositoryError};
use crate::queue::QueueError;
use crate::schedule::ScheduleError;

/// How a processor reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Redeliver while attempts remain.
    Retryable,
    /// Cannot succeed until an operator acts. Skips in-queue retries.
    OperatorAction,
    /// Repository or queue unavailable. Bubbles to the worker loop.
    Infrastructure,
    /// Stopped by shutdown or a cancelled code wait. The delivery goes back to the queue
    /// and does not count as an attempt.
    Interrupted,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("portal error: {0}")]
    TransientPortal(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("timed out after {waited:?} waiting for {kind} code for {subject}")]
    CodeTimeout {
        subject: String,
        kind: CodeKind,
        waited: Duration,
    },

    #[error("no answer available for anomaly question: {question}")]
    UnansweredAnomalyQuestion { question: String },

    #[error("artifact {path} failed validation: {reason}")]
    ArtifactValidationFailed { path: PathBuf, reason: String },

    #[error("job {job_id} exhausted {attempts} attempts")]
    QueueExhausted { job_id: JobId, attempts: u32 },

    #[error("worker initialization failed: {0}")]
    Initialization(String),

    #[error("code delivery: {0}")]
    CodeDelivery(BrokerError),

    #[error("invalid job payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

impl ProcessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcessError::TransientPortal(_)
            | ProcessError::AuthenticationFailed(_)
            | ProcessError::CodeTimeout { .. }
            | ProcessError::ArtifactValidationFailed { .. }
            | ProcessError::QueueExhausted { .. } => ErrorKind::Retryable,
            ProcessError::CodeDelivery(BrokerError::ShuttingDown | BrokerError::Cancelled { .. }) => {
                ErrorKind::Interrupted
            }
            ProcessError::CodeDelivery(_) => ErrorKind::Retryable,
            ProcessError::UnansweredAnomalyQuestion { .. } => ErrorKind::OperatorAction,
            ProcessError::Initialization(_)
            | ProcessError::InvalidPayload(_)
            | ProcessError::Repository(_)
            | ProcessError::Queue(_)
            | ProcessError::Schedule(_) => ErrorKind::Infrastructure,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }
}

impl From<BrokerError> for ProcessError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Timeout {
                subject,
                kind,
                waited,
            } => ProcessError::CodeTimeout {
                subject,
                kind,
                waited,
            },
            other => ProcessError::CodeDelivery(other),
        }
    }
}

impl From<PortalError> for ProcessError {
    fn from(err: PortalError) -> Self {
        match err {
            PortalError::InvalidCredentials(msg) => ProcessError::AuthenticationFailed(msg),
            other => ProcessError::TransientPortal(other.to_string()),
        }
    }
}
