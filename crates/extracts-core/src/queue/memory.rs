//! In-memory work queue with an optional JSON snapshot for restarts.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::retry::{RetryDecision, decide};
use super::{FailOutcome, JobLease, JobRecord, JobState, QueueError, WorkQueue};
use crate::domain::{Job, JobId, JobKind, JobOptions};
use crate::observability::QueueCounts;
use crate::ports::{Clock, IdGenerator};

/// Ready entry. Reverse ordering turns `BinaryHeap` into a min-heap on `(priority, seq)`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    key: (u32, u64),
    id: JobId,
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.key.cmp(&self.key)
    }
}

/// Delayed entry, earliest due first.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DelayedEntry {
    due: Instant,
    id: JobId,
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.due.cmp(&self.due)
    }
}

#[derive(Default)]
struct QueueState {
    records: HashMap<JobId, JobRecord>,
    ready: HashMap<JobKind, BinaryHeap<ReadyEntry>>,
    delayed: BinaryHeap<DelayedEntry>,
    next_seq: u64,
    /// No more leases; enqueue still accepted so in-flight jobs can settle.
    closed: bool,
    /// No more enqueues either.
    sealed: bool,
}

impl QueueState {
    fn push_ready(&mut self, id: JobId) {
        if let Some(record) = self.records.get(&id) {
            let entry = ReadyEntry {
                key: record.ready_key(),
                id,
            };
            self.ready.entry(record.job.kind).or_default().push(entry);
        }
    }

    /// Move due delayed jobs to their ready heaps. Returns how many were promoted.
    fn promote_due(&mut self, clock: &dyn Clock) -> usize {
        let now = Instant::now();
        let mut promoted = 0;
        while let Some(entry) = self.delayed.peek() {
            if entry.due > now {
                break;
            }
            let Some(entry) = self.delayed.pop() else {
                break;
            };
            if let Some(record) = self.records.get_mut(&entry.id)
                && record.state == JobState::Delayed
            {
                record.promote(clock.now());
                self.push_ready(entry.id);
                promoted += 1;
            }
        }
        promoted
    }

    fn pop_ready(&mut self, kind: JobKind) -> Option<JobId> {
        let heap = self.ready.get_mut(&kind)?;
        while let Some(entry) = heap.pop() {
            if self
                .records
                .get(&entry.id)
                .is_some_and(|r| r.state.is_leasable())
            {
                return Some(entry.id);
            }
        }
        None
    }

    fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for record in self.records.values() {
            match record.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    snapshot: Option<PathBuf>,
}

impl Shared {
    /// Write every record to the snapshot file, if one is configured.
    async fn persist(&self, state: &QueueState) -> Result<(), QueueError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let mut records: Vec<&JobRecord> = state.records.values().collect();
        records.sort_by_key(|r| r.seq);
        let bytes = serde_json::to_vec_pretty(&records)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    fn delay_until(&self, record: &JobRecord) -> Instant {
        let remaining = (record.available_at - self.clock.now())
            .to_std()
            .unwrap_or_default();
        Instant::now() + remaining
    }
}

/// In-memory [`WorkQueue`].
///
/// One lock guards all state; leasing waits on a [`Notify`] or the earliest delayed job,
/// whichever comes first.
#[derive(Clone)]
pub struct InMemoryWorkQueue {
    shared: Arc<Shared>,
}

impl InMemoryWorkQueue {
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                clock,
                ids,
                snapshot: None,
            }),
        }
    }

    /// Queue backed by a snapshot file. Jobs found in the file are restored; jobs that were
    /// leased when the previous process stopped become waiting again.
    pub fn with_snapshot(
        path: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();
        let records: Vec<JobRecord> = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let shared = Shared {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            clock,
            ids,
            snapshot: Some(path),
        };

        let mut state = QueueState::default();
        for mut record in records {
            state.next_seq = state.next_seq.max(record.seq + 1);
            let id = record.job.id;
            match record.state {
                JobState::Active | JobState::Waiting => {
                    record.state = JobState::Waiting;
                    state.records.insert(id, record);
                    state.push_ready(id);
                }
                JobState::Delayed => {
                    let due = shared.delay_until(&record);
                    state.records.insert(id, record);
                    state.delayed.push(DelayedEntry { due, id });
                }
                JobState::Failed => {
                    state.records.insert(id, record);
                }
            }
        }
        tracing::info!(restored = state.records.len(), "queue snapshot loaded");

        let shared = Shared {
            state: Mutex::new(state),
            ..shared
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// All records currently held, in enqueue order.
    pub async fn records(&self) -> Vec<JobRecord> {
        let state = self.shared.state.lock().await;
        let mut records: Vec<JobRecord> = state.records.values().cloned().collect();
        records.sort_by_key(|r| r.seq);
        records
    }

    pub async fn record(&self, id: JobId) -> Option<JobRecord> {
        self.shared.state.lock().await.records.get(&id).cloned()
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        let shared = &self.shared;
        let id = {
            let mut state = shared.state.lock().await;
            if state.sealed {
                return Err(QueueError::Closed);
            }
            let now = shared.clock.now();
            let job = Job {
                id: shared.ids.generate_job_id(),
                kind,
                payload,
                attempts_made: 0,
                max_attempts: options.max_attempts.max(1),
                backoff: options.backoff,
                delay: options.delay,
                priority: options.priority,
                enqueued_at: now,
            };
            let id = job.id;
            let seq = state.next_seq;
            state.next_seq += 1;

            let record = JobRecord::new(job, seq, now);
            let delayed = record.state == JobState::Delayed;
            let due = Instant::now() + options.delay.unwrap_or_default();
            state.records.insert(id, record);
            if delayed {
                state.delayed.push(DelayedEntry { due, id });
            } else {
                state.push_ready(id);
            }
            shared.persist(&state).await?;
            id
        };

        tracing::debug!(job_id = %id, %kind, "job enqueued");
        shared.notify.notify_waiters();
        Ok(id)
    }

    async fn lease(&self, kind: JobKind) -> Option<Box<dyn JobLease>> {
        let shared = &self.shared;
        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (next_wake, promoted) = {
                let mut state = shared.state.lock().await;
                if state.closed {
                    return None;
                }
                let promoted = state.promote_due(shared.clock.as_ref());

                if let Some(id) = state.pop_ready(kind)
                    && let Some(record) = state.records.get_mut(&id)
                {
                    record.start(shared.clock.now());
                    let job = record.job.clone();
                    if let Err(e) = shared.persist(&state).await {
                        tracing::warn!(job_id = %id, error = %e, "queue snapshot failed on lease");
                    }
                    drop(state);
                    if promoted > 0 {
                        shared.notify.notify_waiters();
                    }
                    return Some(Box::new(InMemoryLease {
                        job,
                        shared: Arc::clone(shared),
                    }));
                }

                (state.delayed.peek().map(|e| e.due), promoted)
            };

            // Other kinds may have become ready.
            if promoted > 0 {
                shared.notify.notify_waiters();
            }

            match next_wake {
                Some(due) => {
                    tokio::select! {
                        _ = &mut notified => {},
                        _ = tokio::time::sleep_until(due) => {},
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        Ok(self.shared.state.lock().await.counts())
    }

    async fn close(&self) {
        self.shared.state.lock().await.closed = true;
        self.shared.notify.notify_waiters();
    }

    async fn seal(&self) {
        let mut state = self.shared.state.lock().await;
        state.closed = true;
        state.sealed = true;
        drop(state);
        self.shared.notify.notify_waiters();
    }
}

struct InMemoryLease {
    job: Job,
    shared: Arc<Shared>,
}

#[async_trait]
impl JobLease for InMemoryLease {
    fn job(&self) -> &Job {
        &self.job
    }

    async fn ack(self: Box<Self>) -> Result<(), QueueError> {
        let mut state = self.shared.state.lock().await;
        state.records.remove(&self.job.id);
        self.shared.persist(&state).await
    }

    async fn release(self: Box<Self>) -> Result<(), QueueError> {
        let shared = &self.shared;
        {
            let mut state = shared.state.lock().await;
            let Some(record) = state.records.get_mut(&self.job.id) else {
                return Err(QueueError::UnknownJob(self.job.id));
            };
            record.release(shared.clock.now());
            state.push_ready(self.job.id);
            shared.persist(&state).await?;
        }
        tracing::debug!(job_id = %self.job.id, "lease released");
        shared.notify.notify_waiters();
        Ok(())
    }

    async fn fail(self: Box<Self>, error: String) -> Result<FailOutcome, QueueError> {
        let shared = &self.shared;
        let outcome = {
            let mut state = shared.state.lock().await;
            let now = shared.clock.now();
            let Some(record) = state.records.get_mut(&self.job.id) else {
                return Err(QueueError::UnknownJob(self.job.id));
            };

            let outcome = match decide(&record.job) {
                RetryDecision::Retry { delay } => {
                    let available_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
                    record.schedule_retry(available_at, error, now);
                    let attempts_made = record.job.attempts_made;
                    state.delayed.push(DelayedEntry {
                        due: Instant::now() + delay,
                        id: self.job.id,
                    });
                    FailOutcome::Retrying {
                        attempts_made,
                        delay,
                    }
                }
                RetryDecision::Exhausted => {
                    record.mark_failed(error, now);
                    FailOutcome::Exhausted {
                        attempts_made: record.job.attempts_made,
                    }
                }
            };
            shared.persist(&state).await?;
            outcome
        };

        if matches!(outcome, FailOutcome::Retrying { .. }) {
            shared.notify.notify_waiters();
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::{Backoff, HEAD_PRIORITY};
    use crate::ports::{SystemClock, UlidGenerator};

    fn queue() -> InMemoryWorkQueue {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        InMemoryWorkQueue::new(Arc::clone(&clock), Arc::new(UlidGenerator::new(clock)))
    }

    fn fast_options(max_attempts: u32) -> JobOptions {
        JobOptions {
            max_attempts,
            backoff: Backoff::exponential(Duration::from_millis(10), Duration::from_millis(100)),
            ..JobOptions::default()
        }
    }

    async fn lease_within(
        q: &InMemoryWorkQueue,
        kind: JobKind,
        ms: u64,
    ) -> Option<Box<dyn JobLease>> {
        tokio::time::timeout(Duration::from_millis(ms), q.lease(kind))
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn enqueue_and_counts() {
        let q = queue();
        q.enqueue(JobKind::PlaceOrder, serde_json::json!({"n": 1}), JobOptions::default())
            .await
            .unwrap();

        let counts = q.counts().await.unwrap();
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.active, 0);
    }

    #[tokio::test]
    async fn lease_is_scoped_to_kind() {
        let q = queue();
        q.enqueue(JobKind::PlaceOrder, serde_json::json!({}), JobOptions::default())
            .await
            .unwrap();

        assert!(lease_within(&q, JobKind::CheckAndDownload, 50).await.is_none());
        let lease = lease_within(&q, JobKind::PlaceOrder, 50).await.unwrap();
        assert_eq!(lease.job().kind, JobKind::PlaceOrder);
        assert_eq!(q.counts().await.unwrap().active, 1);
    }

    #[tokio::test]
    async fn ack_removes_the_job() {
        let q = queue();
        q.enqueue(JobKind::PlaceOrder, serde_json::json!({}), JobOptions::default())
            .await
            .unwrap();
        let lease = q.lease(JobKind::PlaceOrder).await.unwrap();
        lease.ack().await.unwrap();

        assert_eq!(q.counts().await.unwrap(), QueueCounts::default());
    }

    #[tokio::test]
    async fn priority_jobs_jump_ahead_and_ties_stay_fifo() {
        let q = queue();
        for n in 0..3 {
            q.enqueue(JobKind::CheckAndDownload, serde_json::json!({"n": n}), JobOptions::default())
                .await
                .unwrap();
        }
        q.enqueue(
            JobKind::CheckAndDownload,
            serde_json::json!({"n": "head"}),
            JobOptions::default().with_priority(HEAD_PRIORITY),
        )
        .await
        .unwrap();

        let mut order = Vec::new();
        for _ in 0..4 {
            let lease = q.lease(JobKind::CheckAndDownload).await.unwrap();
            order.push(lease.job().payload["n"].clone());
            lease.ack().await.unwrap();
        }
        assert_eq!(
            order,
            vec![
                serde_json::json!("head"),
                serde_json::json!(0),
                serde_json::json!(1),
                serde_json::json!(2)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_jobs_wait_for_their_delay() {
        let q = queue();
        q.enqueue(
            JobKind::CheckAndDownload,
            serde_json::json!({}),
            JobOptions::default().with_delay(Duration::from_secs(60)),
        )
        .await
        .unwrap();
        assert_eq!(q.counts().await.unwrap().delayed, 1);

        let started = Instant::now();
        let lease = q.lease(JobKind::CheckAndDownload).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(lease.job().attempts_made, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_increase_by_one_per_failed_delivery_until_exhausted() {
        let q = queue();
        q.enqueue(JobKind::PlaceOrder, serde_json::json!({}), fast_options(3))
            .await
            .unwrap();

        let mut seen = Vec::new();
        let mut outcomes = Vec::new();
        for _ in 0..3 {
            let lease = lease_within(&q, JobKind::PlaceOrder, 5_000).await.unwrap();
            seen.push(lease.job().attempts_made);
            outcomes.push(lease.fail("boom".into()).await.unwrap());
        }

        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(
            outcomes,
            vec![
                FailOutcome::Retrying {
                    attempts_made: 1,
                    delay: Duration::from_millis(10)
                },
                FailOutcome::Retrying {
                    attempts_made: 2,
                    delay: Duration::from_millis(20)
                },
                FailOutcome::Exhausted { attempts_made: 3 },
            ]
        );

        // Never delivered a fourth time.
        assert!(lease_within(&q, JobKind::PlaceOrder, 60_000).await.is_none());
        let counts = q.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        let records = q.records().await;
        assert_eq!(records[0].last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn close_releases_waiting_consumers_but_keeps_accepting_jobs() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.lease(JobKind::PlaceOrder).await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close().await;

        assert!(waiter.await.unwrap());
        q.enqueue(JobKind::PlaceOrder, serde_json::json!({}), JobOptions::default())
            .await
            .unwrap();
        assert!(lease_within(&q, JobKind::PlaceOrder, 50).await.is_none());
        assert_eq!(q.counts().await.unwrap().waiting, 1);

        q.seal().await;
        assert!(matches!(
            q.enqueue(JobKind::PlaceOrder, serde_json::json!({}), JobOptions::default())
                .await,
            Err(QueueError::Closed)
        ));
    }

    #[tokio::test]
    async fn released_lease_is_redelivered_without_counting_an_attempt() {
        let q = queue();
        let id = q
            .enqueue(JobKind::PlaceOrder, serde_json::json!({}), fast_options(1))
            .await
            .unwrap();

        let lease = q.lease(JobKind::PlaceOrder).await.unwrap();
        q.close().await;
        lease.release().await.unwrap();

        let record = q.record(id).await.unwrap();
        assert_eq!(record.state, JobState::Waiting);
        assert_eq!(record.job.attempts_made, 0);
    }

    #[tokio::test]
    async fn released_lease_survives_a_restart_as_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));

        let first = InMemoryWorkQueue::with_snapshot(&path, Arc::clone(&clock), Arc::clone(&ids))
            .unwrap();
        let id = first
            .enqueue(JobKind::PlaceOrder, serde_json::json!({}), fast_options(1))
            .await
            .unwrap();
        let lease = first.lease(JobKind::PlaceOrder).await.unwrap();
        first.seal().await;
        lease.release().await.unwrap();
        drop(first);

        let second = InMemoryWorkQueue::with_snapshot(&path, clock, ids).unwrap();
        let lease = lease_within(&second, JobKind::PlaceOrder, 100).await.unwrap();
        assert_eq!(lease.job().id, id);
        assert_eq!(lease.job().attempts_made, 0);
    }

    #[tokio::test]
    async fn snapshot_restores_leased_jobs_as_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));

        let first = InMemoryWorkQueue::with_snapshot(&path, Arc::clone(&clock), Arc::clone(&ids))
            .unwrap();
        let id = first
            .enqueue(JobKind::PlaceOrder, serde_json::json!({"orderId": 1}), JobOptions::default())
            .await
            .unwrap();
        let lease = first.lease(JobKind::PlaceOrder).await.unwrap();
        // Process "crashes" while the job is leased.
        drop(lease);
        drop(first);

        let second = InMemoryWorkQueue::with_snapshot(&path, clock, ids).unwrap();
        let lease = lease_within(&second, JobKind::PlaceOrder, 100).await.unwrap();
        assert_eq!(lease.job().id, id);
        assert_eq!(lease.job().payload["orderId"], 1);
    }
}
