//! Queue jobs: kinds, options, the job record handed to consumers and typed payloads.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::ids::{JobId, OrderId};

/// Kind of work a job represents. Each kind has its own consumers and concurrency cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobKind {
    /// Place an extract order on the portal.
    #[serde(rename = "process-order")]
    PlaceOrder,
    /// Poll a registered order and download its artifact once ready.
    #[serde(rename = "check-and-download-order")]
    CheckAndDownload,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::PlaceOrder, JobKind::CheckAndDownload];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::PlaceOrder => "process-order",
            JobKind::CheckAndDownload => "check-and-download-order",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential backoff: `initial_delay * 2^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Backoff {
    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(10), Duration::from_secs(600))
    }
}

/// Priority given to jobs that must be retried before newer work.
pub const HEAD_PRIORITY: u32 = 1;

/// Per-job queue options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Delay before the first delivery.
    pub delay: Option<Duration>,
    /// Lower numbers are leased first; jobs without a priority come after all prioritized ones.
    pub priority: Option<u32>,
}

impl JobOptions {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            delay: None,
            priority: None,
        }
    }
}

/// A job as seen by its consumer.
///
/// The payload is immutable; `attempts_made` counts failed deliveries so far and is the
/// only field the queue changes after enqueue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub delay: Option<Duration>,
    pub priority: Option<u32>,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    /// True when a failure of the current delivery can still be redelivered by the queue.
    pub fn has_retries_left(&self) -> bool {
        self.attempts_made + 1 < self.max_attempts
    }

    /// The options this job was enqueued with.
    pub fn options(&self) -> JobOptions {
        JobOptions {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            delay: self.delay,
            priority: self.priority,
        }
    }

    pub fn decode<T: JobPayload>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Typed payload bound to a job kind.
///
/// `Serialize + DeserializeOwned` so payloads can live in the queue as JSON,
/// `Send + Sync + 'static` so they can cross task boundaries.
pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: JobKind;
}

/// Payload of a place-order job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderJobData {
    pub order_id: OrderId,
    pub cadastral_number: String,
    pub owner_id: i64,
}

impl JobPayload for OrderJobData {
    const KIND: JobKind = JobKind::PlaceOrder;
}

/// Payload of a check-and-download job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCheckJobData {
    pub order_id: OrderId,
    pub external_order_number: String,
}

impl JobPayload for StatusCheckJobData {
    const KIND: JobKind = JobKind::CheckAndDownload;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    fn job(attempts_made: u32, max_attempts: u32) -> Job {
        Job {
            id: JobId::from_ulid(Ulid::new()),
            kind: JobKind::PlaceOrder,
            payload: serde_json::json!({}),
            attempts_made,
            max_attempts,
            backoff: Backoff::default(),
            delay: None,
            priority: None,
            enqueued_at: Utc::now(),
        }
    }

    #[rstest]
    #[case::first_of_three(0, 3, true)]
    #[case::second_of_three(1, 3, true)]
    #[case::last_of_three(2, 3, false)]
    #[case::single_attempt(0, 1, false)]
    fn retries_left_counts_the_current_delivery(
        #[case] attempts_made: u32,
        #[case] max_attempts: u32,
        #[case] expected: bool,
    ) {
        assert_eq!(job(attempts_made, max_attempts).has_retries_left(), expected);
    }

    #[test]
    fn payload_uses_wire_field_names() {
        let data = OrderJobData {
            order_id: OrderId(1),
            cadastral_number: "77:01:0001001:1234".into(),
            owner_id: 9,
        };
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["orderId"], 1);
        assert_eq!(value["cadastralNumber"], "77:01:0001001:1234");

        let mut j = job(0, 3);
        j.payload = value;
        assert_eq!(j.decode::<OrderJobData>().unwrap(), data);
        assert!(j.decode::<StatusCheckJobData>().is_err());
    }

    #[test]
    fn kinds_use_queue_names() {
        assert_eq!(JobKind::PlaceOrder.to_string(), "process-order");
        assert_eq!(
            serde_json::to_string(&JobKind::CheckAndDownload).unwrap(),
            "\"check-and-download-order\""
        );
    }
}
