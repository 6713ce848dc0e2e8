//! What a processor does with a failed attempt.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::{ErrorKind, HEAD_PRIORITY, Job, OrderId, OrderStatus, OrderUpdate, ProcessError};
use crate::ports::OrderRepository;
use crate::queue::WorkQueue;

/// How a job is put back once the queue will not redeliver it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Fresh job at the back of the line; order goes back to `Queued`.
    RequeueAtTail,
    /// Fresh job ahead of newer work; order stays `Registered`.
    RequeueAtHead,
}

impl Disposition {
    /// Status the order rests in while its job waits in the queue.
    fn resting_status(self) -> OrderStatus {
        match self {
            Disposition::RequeueAtTail => OrderStatus::Queued,
            Disposition::RequeueAtHead => OrderStatus::Registered,
        }
    }
}

/// Result of settling a failure.
#[derive(Debug)]
pub enum Settled {
    /// Hand the error back to the queue for a backoff redelivery.
    Redeliver(ProcessError),
    /// The job was replaced by a new one; the current delivery is done.
    Requeued,
    /// The attempt was interrupted; the lease goes back to the queue uncounted.
    Release(ProcessError),
}

pub struct FailurePolicy {
    queue: Arc<dyn WorkQueue>,
    orders: Arc<dyn OrderRepository>,
    operator_action_delay: Duration,
}

impl FailurePolicy {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        orders: Arc<dyn OrderRepository>,
        operator_action_delay: Duration,
    ) -> Self {
        Self {
            queue,
            orders,
            operator_action_delay,
        }
    }

    /// Record the failure on the order, then either let the queue retry or requeue the job.
    ///
    /// Infrastructure errors are returned untouched. Interrupted attempts put the order back
    /// in its resting status without an error.
    pub async fn settle(
        &self,
        job: &Job,
        order_id: OrderId,
        err: ProcessError,
        disposition: Disposition,
    ) -> Result<Settled, ProcessError> {
        let kind = err.kind();
        if kind == ErrorKind::Infrastructure {
            return Err(err);
        }
        if kind == ErrorKind::Interrupted {
            self.orders
                .update(
                    order_id,
                    OrderUpdate {
                        operator_id: Some(None),
                        ..OrderUpdate::status(disposition.resting_status())
                    },
                )
                .await?;
            tracing::info!(
                job_id = %job.id,
                order_id = %order_id,
                error = %err,
                "attempt interrupted"
            );
            return Ok(Settled::Release(err));
        }

        let message = err.to_string();
        self.orders
            .update(
                order_id,
                OrderUpdate {
                    operator_id: Some(None),
                    comment: Some(message.clone()),
                    ..OrderUpdate::status(OrderStatus::error(&message))
                },
            )
            .await?;

        if kind == ErrorKind::Retryable && job.has_retries_left() {
            tracing::warn!(
                job_id = %job.id,
                order_id = %order_id,
                attempt = job.attempts_made + 1,
                max_attempts = job.max_attempts,
                error = %message,
                "attempt failed, queue will retry"
            );
            return Ok(Settled::Redeliver(err));
        }

        let exhausted = ProcessError::QueueExhausted {
            job_id: job.id,
            attempts: job.attempts_made + 1,
        };
        tracing::warn!(
            order_id = %order_id,
            ?disposition,
            cause = %message,
            error = %exhausted,
            "requeueing"
        );
        self.requeue(job, order_id, message, kind, disposition)
            .await?;
        Ok(Settled::Requeued)
    }

    async fn requeue(
        &self,
        job: &Job,
        order_id: OrderId,
        message: String,
        kind: ErrorKind,
        disposition: Disposition,
    ) -> Result<(), ProcessError> {
        let mut options = job.options();
        options.delay = (kind == ErrorKind::OperatorAction).then_some(self.operator_action_delay);
        options.priority = match disposition {
            Disposition::RequeueAtTail => None,
            Disposition::RequeueAtHead => Some(HEAD_PRIORITY),
        };

        // The order only leaves its error status once a job exists to pick it up.
        let new_id = self
            .queue
            .enqueue(job.kind, job.payload.clone(), options)
            .await?;
        self.orders
            .update(
                order_id,
                OrderUpdate {
                    is_complete: Some(false),
                    comment: Some(message),
                    ..OrderUpdate::status(disposition.resting_status())
                },
            )
            .await?;
        tracing::info!(old_job = %job.id, new_job = %new_id, ?disposition, "job requeued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerError;
    use crate::domain::{JobId, JobKind, JobOptions, NewOrder, OperatorId, OrderJobData};
    use crate::queue::QueueError;
    use crate::impls::InMemoryOrderRepository;
    use crate::ports::{PortalError, SystemClock, UlidGenerator};
    use crate::queue::{InMemoryWorkQueue, JobState};

    struct Fixture {
        queue: InMemoryWorkQueue,
        orders: Arc<InMemoryOrderRepository>,
        policy: FailurePolicy,
        order_id: OrderId,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(SystemClock);
        let queue = InMemoryWorkQueue::new(clock.clone(), Arc::new(UlidGenerator::new(clock.clone())));
        let orders = Arc::new(InMemoryOrderRepository::new(clock));
        let order = orders
            .create(NewOrder {
                owner_id: 7,
                cadastral_number: "77:01:0001001:1234".into(),
            })
            .await
            .unwrap();
        orders
            .update(
                order.id,
                OrderUpdate {
                    operator_id: Some(Some(OperatorId(1))),
                    ..OrderUpdate::status(OrderStatus::Processing)
                },
            )
            .await
            .unwrap();
        let policy = FailurePolicy::new(
            Arc::new(queue.clone()),
            Arc::clone(&orders) as Arc<dyn OrderRepository>,
            Duration::from_secs(600),
        );
        Fixture {
            queue,
            orders,
            policy,
            order_id: order.id,
        }
    }

    fn job(attempts_made: u32) -> Job {
        let payload = OrderJobData {
            order_id: OrderId(1),
            cadastral_number: "77:01:0001001:1234".into(),
            owner_id: 7,
        };
        let options = JobOptions::default();
        Job {
            id: JobId::from_ulid(ulid::Ulid::new()),
            kind: JobKind::PlaceOrder,
            payload: serde_json::to_value(payload).unwrap(),
            attempts_made,
            max_attempts: options.max_attempts,
            backoff: options.backoff,
            delay: None,
            priority: None,
            enqueued_at: chrono::Utc::now(),
        }
    }

    fn transient() -> ProcessError {
        PortalError::Transient("portal returned 503".into()).into()
    }

    #[tokio::test]
    async fn early_failure_records_error_and_redelivers() {
        let f = fixture().await;
        let settled = f
            .policy
            .settle(&job(0), f.order_id, transient(), Disposition::RequeueAtTail)
            .await
            .unwrap();
        assert!(matches!(settled, Settled::Redeliver(_)));

        let order = f.orders.find_by_id(f.order_id).await.unwrap();
        assert!(order.status.is_error());
        assert_eq!(order.operator_id, None);
        assert!(f.queue.records().await.is_empty());
    }

    #[tokio::test]
    async fn last_attempt_requeues_at_tail() {
        let f = fixture().await;
        let settled = f
            .policy
            .settle(&job(2), f.order_id, transient(), Disposition::RequeueAtTail)
            .await
            .unwrap();
        assert!(matches!(settled, Settled::Requeued));

        let order = f.orders.find_by_id(f.order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Queued);
        assert!(order.comment.unwrap().contains("503"));

        let records = f.queue.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].job.attempts_made, 0);
        assert_eq!(records[0].job.priority, None);
        assert_eq!(records[0].state, JobState::Waiting);
    }

    #[tokio::test]
    async fn last_attempt_requeues_at_head_with_priority() {
        let f = fixture().await;
        f.policy
            .settle(&job(2), f.order_id, transient(), Disposition::RequeueAtHead)
            .await
            .unwrap();

        let order = f.orders.find_by_id(f.order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Registered);
        let records = f.queue.records().await;
        assert_eq!(records[0].job.priority, Some(HEAD_PRIORITY));
    }

    #[tokio::test]
    async fn operator_action_skips_retries_and_delays_the_new_job() {
        let f = fixture().await;
        let err = ProcessError::UnansweredAnomalyQuestion {
            question: "кличка питомца?".into(),
        };
        let settled = f
            .policy
            .settle(&job(0), f.order_id, err, Disposition::RequeueAtTail)
            .await
            .unwrap();
        assert!(matches!(settled, Settled::Requeued));

        let records = f.queue.records().await;
        assert_eq!(records[0].state, JobState::Delayed);
        assert_eq!(records[0].job.delay, Some(Duration::from_secs(600)));
    }

    #[tokio::test]
    async fn shutdown_on_the_last_attempt_releases_instead_of_requeueing() {
        let f = fixture().await;
        f.queue.close().await;
        let err = ProcessError::CodeDelivery(BrokerError::ShuttingDown);
        let settled = f
            .policy
            .settle(&job(2), f.order_id, err, Disposition::RequeueAtTail)
            .await
            .unwrap();
        assert!(matches!(settled, Settled::Release(_)));

        let order = f.orders.find_by_id(f.order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Queued);
        assert_eq!(order.operator_id, None);
        assert!(f.queue.records().await.is_empty());
    }

    #[tokio::test]
    async fn failed_requeue_leaves_the_order_in_error() {
        let f = fixture().await;
        f.queue.seal().await;
        let result = f
            .policy
            .settle(&job(2), f.order_id, transient(), Disposition::RequeueAtTail)
            .await;
        assert!(matches!(result, Err(ProcessError::Queue(QueueError::Closed))));

        let order = f.orders.find_by_id(f.order_id).await.unwrap();
        assert!(order.status.is_error());
    }

    #[tokio::test]
    async fn infrastructure_errors_pass_through() {
        let f = fixture().await;
        let err = ProcessError::Initialization("operator missing".into());
        let result = f
            .policy
            .settle(&job(0), f.order_id, err, Disposition::RequeueAtTail)
            .await;
        assert!(matches!(result, Err(ProcessError::Initialization(_))));
        let order = f.orders.find_by_id(f.order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Processing);
    }
}
