//! Time-windowed, single-flight gate for recurring tasks.

mod store;

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{FixedOffset, NaiveTime};
use thiserror::Error;

pub use store::JsonScheduleStore;

use crate::domain::{GateDecision, ScheduleRecord};
use crate::ports::{Clock, ScheduleStore};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("no schedule record for task '{0}'")]
    NotFound(String),

    #[error("schedule store i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("schedule store format: {0}")]
    Format(#[from] serde_json::Error),
}

/// Result of [`ScheduleGate::run_exclusive`].
#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome<T> {
    Ran(T),
    Skipped(GateDecision),
}

/// Gate for named recurring tasks.
///
/// The persisted record is authoritative across restarts; the in-process set of running
/// task names is a fast local check in front of it.
pub struct ScheduleGate {
    store: Arc<dyn ScheduleStore>,
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
    running: Mutex<HashSet<String>>,
}

impl ScheduleGate {
    /// `offset` is the time zone the activity windows are written in.
    pub fn new(store: Arc<dyn ScheduleStore>, clock: Arc<dyn Clock>, offset: FixedOffset) -> Self {
        Self {
            store,
            clock,
            offset,
            running: Mutex::new(HashSet::new()),
        }
    }

    fn local_time(&self) -> NaiveTime {
        self.clock.now().with_timezone(&self.offset).time()
    }

    fn is_running_locally(&self, task_name: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(task_name)
    }

    /// Insert default records for tasks that have none yet.
    pub async fn seed_defaults(
        &self,
        records: impl IntoIterator<Item = ScheduleRecord>,
    ) -> Result<(), ScheduleError> {
        for record in records {
            let name = record.task_name.clone();
            if self.store.seed(record).await? {
                tracing::info!(task = %name, "schedule record seeded");
            }
        }
        Ok(())
    }

    /// Why the task would or would not run right now.
    pub async fn check(&self, task_name: &str) -> Result<GateDecision, ScheduleError> {
        if self.is_running_locally(task_name) {
            return Ok(GateDecision::InFlight);
        }
        Ok(match self.store.get(task_name).await? {
            None => GateDecision::Missing,
            Some(record) => record.evaluate(self.local_time()),
        })
    }

    pub async fn should_run(&self, task_name: &str) -> Result<bool, ScheduleError> {
        Ok(self.check(task_name).await?.allows_run())
    }

    pub async fn mark_run_start(&self, task_name: &str) -> Result<(), ScheduleError> {
        self.store.mark_run_start(task_name, self.clock.now()).await
    }

    pub async fn mark_run_complete(&self, task_name: &str) -> Result<(), ScheduleError> {
        self.store.mark_run_complete(task_name, self.clock.now()).await
    }

    /// Run `body` if the gate allows it.
    ///
    /// The start is claimed atomically in the store. The completion stamp is written after
    /// `body` returns whatever its result, so a failed run cannot wedge the gate.
    pub async fn run_exclusive<F, Fut, T>(
        &self,
        task_name: &str,
        body: F,
    ) -> Result<RunOutcome<T>, ScheduleError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(_local) = LocalClaim::acquire(self, task_name) else {
            tracing::debug!(task = task_name, "run already in flight in this process");
            return Ok(RunOutcome::Skipped(GateDecision::InFlight));
        };

        let decision = self
            .store
            .try_mark_run_start(task_name, self.clock.now(), self.local_time())
            .await?;
        if !decision.allows_run() {
            tracing::debug!(task = task_name, ?decision, "run skipped");
            return Ok(RunOutcome::Skipped(decision));
        }

        tracing::info!(task = task_name, "run started");
        let output = body().await;
        self.mark_run_complete(task_name).await?;
        tracing::info!(task = task_name, "run completed");
        Ok(RunOutcome::Ran(output))
    }
}

/// In-process claim on a task name, released on drop.
struct LocalClaim<'a> {
    gate: &'a ScheduleGate,
    task_name: String,
}

impl<'a> LocalClaim<'a> {
    fn acquire(gate: &'a ScheduleGate, task_name: &str) -> Option<Self> {
        let inserted = gate
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_name.to_string());
        inserted.then(|| Self {
            gate,
            task_name: task_name.to_string(),
        })
    }
}

impl Drop for LocalClaim<'_> {
    fn drop(&mut self) {
        self.gate
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.task_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use chrono::{DateTime, TimeZone, Utc};
    use rstest::rstest;

    const TASK: &str = "order-status-checker";

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    async fn gate(clock: Arc<FixedClock>, store: Arc<dyn ScheduleStore>) -> ScheduleGate {
        let gate = ScheduleGate::new(store, clock, FixedOffset::east_opt(0).unwrap());
        gate.seed_defaults([ScheduleRecord::new(TASK, "20:00-07:00".parse().unwrap())])
            .await
            .unwrap();
        gate
    }

    #[rstest]
    #[case::late_evening(23, true)]
    #[case::small_hours(3, true)]
    #[case::noon(12, false)]
    #[tokio::test]
    async fn window_wraps_past_midnight(#[case] hour: u32, #[case] expected: bool) {
        let clock = Arc::new(FixedClock::new(at(hour)));
        let gate = gate(clock, Arc::new(JsonScheduleStore::in_memory())).await;
        assert_eq!(gate.should_run(TASK).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn window_is_evaluated_in_the_configured_offset() {
        // 18:00 UTC is 21:00 in UTC+3, inside 20:00-07:00.
        let clock = Arc::new(FixedClock::new(at(18)));
        let store: Arc<dyn ScheduleStore> = Arc::new(JsonScheduleStore::in_memory());
        let gate = ScheduleGate::new(store, clock, FixedOffset::east_opt(3 * 3600).unwrap());
        gate.seed_defaults([ScheduleRecord::new(TASK, "20:00-07:00".parse().unwrap())])
            .await
            .unwrap();
        assert!(gate.should_run(TASK).await.unwrap());
    }

    #[tokio::test]
    async fn single_flight_until_completion() {
        let clock = Arc::new(FixedClock::new(at(23)));
        let gate = gate(Arc::clone(&clock), Arc::new(JsonScheduleStore::in_memory())).await;

        gate.mark_run_start(TASK).await.unwrap();
        assert!(!gate.should_run(TASK).await.unwrap());
        assert_eq!(gate.check(TASK).await.unwrap(), GateDecision::InFlight);

        clock.advance(chrono::Duration::minutes(4));
        gate.mark_run_complete(TASK).await.unwrap();
        assert!(gate.should_run(TASK).await.unwrap());
    }

    #[tokio::test]
    async fn unfinished_run_blocks_a_restarted_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.json");
        let clock = Arc::new(FixedClock::new(at(23)));

        let first = gate(
            Arc::clone(&clock),
            Arc::new(JsonScheduleStore::open(&path).await.unwrap()),
        )
        .await;
        first.mark_run_start(TASK).await.unwrap();
        drop(first);

        let restarted = gate(clock, Arc::new(JsonScheduleStore::open(&path).await.unwrap())).await;
        assert!(!restarted.should_run(TASK).await.unwrap());
    }

    #[tokio::test]
    async fn inactive_and_missing_tasks_never_run() {
        let clock = Arc::new(FixedClock::new(at(23)));
        let store = Arc::new(JsonScheduleStore::in_memory());
        let gate = gate(clock, Arc::clone(&store) as Arc<dyn ScheduleStore>).await;

        let mut record = store.get(TASK).await.unwrap().unwrap();
        record.is_active = false;
        store.upsert(record).await.unwrap();

        assert_eq!(gate.check(TASK).await.unwrap(), GateDecision::Inactive);
        assert_eq!(gate.check("other").await.unwrap(), GateDecision::Missing);
    }

    #[tokio::test]
    async fn run_exclusive_completes_even_when_the_body_fails() {
        let clock = Arc::new(FixedClock::new(at(23)));
        let store = Arc::new(JsonScheduleStore::in_memory());
        let gate = gate(clock, Arc::clone(&store) as Arc<dyn ScheduleStore>).await;

        let outcome = gate
            .run_exclusive(TASK, || async { Err::<(), &str>("portal down") })
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Ran(Err("portal down")));

        let record = store.get(TASK).await.unwrap().unwrap();
        assert!(record.last_run_at.is_some());
        assert!(record.can_run());
    }

    #[tokio::test]
    async fn overlapping_runs_in_one_process_are_skipped() {
        let clock = Arc::new(FixedClock::new(at(23)));
        let gate = Arc::new(gate(clock, Arc::new(JsonScheduleStore::in_memory())).await);

        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let first = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                gate.run_exclusive(TASK, || async move {
                    let _ = entered_tx.send(());
                    let _ = release_rx.await;
                })
                .await
            })
        };
        entered_rx.await.unwrap();

        let second = gate.run_exclusive(TASK, || async {}).await.unwrap();
        assert_eq!(second, RunOutcome::Skipped(GateDecision::InFlight));

        release_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), RunOutcome::Ran(()));
    }
}
