//! Place-order jobs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::failure::{Disposition, FailurePolicy, Settled};
use super::init::WorkerInitializer;
use super::portal_failure;
use super::registry::JobHandler;
use crate::auth::AuthSessionManager;
use crate::domain::{
    Job, JobOptions, OrderJobData, OrderStatus, OrderUpdate, ProcessError, StatusCheckJobData,
};
use crate::ports::{Clock, OrderRepository, Portal, RepositoryError};
use crate::queue::WorkQueue;

pub struct OrderJobProcessor {
    init: Arc<WorkerInitializer>,
    auth: Arc<AuthSessionManager>,
    portal: Arc<dyn Portal>,
    orders: Arc<dyn OrderRepository>,
    queue: Arc<dyn WorkQueue>,
    failures: Arc<FailurePolicy>,
    clock: Arc<dyn Clock>,
    /// Options for the follow-up status check; its delay is the wait before the first check.
    status_check: JobOptions,
}

impl OrderJobProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        init: Arc<WorkerInitializer>,
        auth: Arc<AuthSessionManager>,
        portal: Arc<dyn Portal>,
        orders: Arc<dyn OrderRepository>,
        queue: Arc<dyn WorkQueue>,
        failures: Arc<FailurePolicy>,
        clock: Arc<dyn Clock>,
        status_check: JobOptions,
    ) -> Self {
        Self {
            init,
            auth,
            portal,
            orders,
            queue,
            failures,
            clock,
            status_check,
        }
    }

    pub fn status_check_delay(&self) -> Duration {
        self.status_check.delay.unwrap_or_default()
    }

    async fn place(&self, data: &OrderJobData) -> Result<(), ProcessError> {
        let operator = self.init.wait_ready().await?;

        let order = match self.orders.find_by_id(data.order_id).await {
            Ok(order) => order,
            Err(RepositoryError::NotFound { .. }) => {
                tracing::warn!(order_id = %data.order_id, "order no longer exists, dropping job");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        // Redelivery after the portal already accepted the order: only the follow-up is missing.
        if let Some(number) = order.external_order_number {
            tracing::info!(order_id = %order.id, %number, "order already placed");
            return self.schedule_status_check(data, number).await;
        }

        self.orders
            .update(
                data.order_id,
                OrderUpdate {
                    operator_id: Some(Some(operator.id)),
                    ..OrderUpdate::status(OrderStatus::Processing)
                },
            )
            .await?;

        let lease = self.auth.acquire(&operator).await?;
        let placed = match self
            .portal
            .place_order(lease.session(), &data.cadastral_number)
            .await
        {
            Ok(placed) => placed,
            Err(e) => return Err(portal_failure(lease, e)),
        };
        drop(lease);

        let now = self.clock.now();
        let mut update = OrderUpdate {
            is_complete: Some(placed.is_complete),
            ..OrderUpdate::status(placed.status.clone())
        };
        if placed.external_order_number.is_some() {
            update.external_order_number = placed.external_order_number.clone();
            update.registered_at = Some(now);
        }
        if placed.is_complete {
            update.completed_at = Some(now);
        }
        self.orders.update(data.order_id, update).await?;
        tracing::info!(
            order_id = %data.order_id,
            cadastral_number = %data.cadastral_number,
            status = %placed.status,
            number = ?placed.external_order_number,
            "order placed"
        );

        match placed.external_order_number {
            Some(number) => self.schedule_status_check(data, number).await,
            None => Ok(()),
        }
    }

    async fn schedule_status_check(
        &self,
        data: &OrderJobData,
        external_order_number: String,
    ) -> Result<(), ProcessError> {
        let follow_up = StatusCheckJobData {
            order_id: data.order_id,
            external_order_number,
        };
        let job_id = self.queue.add(&follow_up, self.status_check).await?;
        tracing::debug!(
            order_id = %data.order_id,
            %job_id,
            delay = ?self.status_check.delay,
            "status check scheduled"
        );
        Ok(())
    }
}

#[async_trait]
impl JobHandler for OrderJobProcessor {
    async fn handle(&self, job: &Job) -> Result<(), ProcessError> {
        let data: OrderJobData = job.decode()?;
        match self.place(&data).await {
            Ok(()) => Ok(()),
            Err(err) => match self
                .failures
                .settle(job, data.order_id, err, Disposition::RequeueAtTail)
                .await?
            {
                Settled::Redeliver(err) | Settled::Release(err) => Err(err),
                Settled::Requeued => Ok(()),
            },
        }
    }
}
