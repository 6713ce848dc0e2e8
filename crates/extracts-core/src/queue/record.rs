//! Job record: the job plus queue-owned metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JobState;
use crate::domain::Job;

/// Single source of truth for a job's queue state.
/// Ready and delayed structures only hold ids; all transitions happen here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job: Job,
    pub state: JobState,

    /// Enqueue sequence number; breaks priority ties in FIFO order.
    pub seq: u64,

    /// Earliest time the job may be leased.
    pub available_at: DateTime<Utc>,

    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(job: Job, seq: u64, now: DateTime<Utc>) -> Self {
        let (state, available_at) = match job.delay.and_then(|d| chrono::Duration::from_std(d).ok()) {
            Some(delay) if !delay.is_zero() => (JobState::Delayed, now + delay),
            _ => (JobState::Waiting, now),
        };
        Self {
            job,
            state,
            seq,
            available_at,
            last_error: None,
            updated_at: now,
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Active;
        self.updated_at = now;
    }

    /// Failed delivery with attempts left: count it and wait until `available_at`.
    pub fn schedule_retry(&mut self, available_at: DateTime<Utc>, error: String, now: DateTime<Utc>) {
        self.job.attempts_made += 1;
        self.state = JobState::Delayed;
        self.available_at = available_at;
        self.last_error = Some(error);
        self.updated_at = now;
    }

    /// Failed delivery with no attempts left.
    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.job.attempts_made += 1;
        self.state = JobState::Failed;
        self.last_error = Some(error);
        self.updated_at = now;
    }

    /// Active -> Waiting without counting the delivery as an attempt.
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Waiting;
        self.available_at = now;
        self.updated_at = now;
    }

    /// Delayed -> Waiting.
    pub fn promote(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Waiting;
        self.updated_at = now;
    }

    /// Priority key: prioritized jobs first (lower first), then enqueue order.
    pub fn ready_key(&self) -> (u32, u64) {
        (self.job.priority.unwrap_or(u32::MAX), self.seq)
    }
}
