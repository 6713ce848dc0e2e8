//! Job state machine inside the queue.

use serde::{Deserialize, Serialize};

/// State transitions:
/// - Waiting -> Active -> (acked, removed)
/// - Delayed -> Waiting (when due)
/// - Active -> Delayed -> Waiting (retry with backoff, until attempts run out)
/// - Active -> Failed (attempts exhausted)
/// - Active -> Waiting (lease released on shutdown, attempt not counted)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Ready to be leased.
    Waiting,
    /// Not ready until its due time (initial delay or retry backoff).
    Delayed,
    /// Leased by a consumer.
    Active,
    /// Exhausted; kept for inspection and never leased again.
    Failed,
}

impl JobState {
    pub fn is_leasable(self) -> bool {
        matches!(self, JobState::Waiting)
    }
}
