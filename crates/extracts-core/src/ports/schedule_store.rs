use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};

use crate::domain::{GateDecision, ScheduleRecord};
use crate::schedule::ScheduleError;

/// Persistence of schedule records.
///
/// `try_mark_run_start` must evaluate the record and stamp `last_run_at` atomically, so two
/// processes sharing a store cannot both start a run.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn get(&self, task_name: &str) -> Result<Option<ScheduleRecord>, ScheduleError>;

    /// Insert `record` unless one with the same task name exists. Returns true if inserted.
    async fn seed(&self, record: ScheduleRecord) -> Result<bool, ScheduleError>;

    async fn upsert(&self, record: ScheduleRecord) -> Result<(), ScheduleError>;

    /// Evaluate the gate at `local_time` and, on [`GateDecision::Run`], set `last_run_at = now`.
    async fn try_mark_run_start(
        &self,
        task_name: &str,
        now: DateTime<Utc>,
        local_time: NaiveTime,
    ) -> Result<GateDecision, ScheduleError>;

    /// Set `last_run_at = now` without evaluating.
    async fn mark_run_start(&self, task_name: &str, now: DateTime<Utc>) -> Result<(), ScheduleError>;

    async fn mark_run_complete(
        &self,
        task_name: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ScheduleError>;
}
