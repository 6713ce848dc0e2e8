//! Check-and-download: poll the portal for a registered order and fetch its extract.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::failure::{Disposition, FailurePolicy, Settled};
use super::init::WorkerInitializer;
use super::registry::JobHandler;
use super::portal_failure;
use crate::artifact::{self, ArtifactReport};
use crate::auth::AuthSessionManager;
use crate::domain::{Job, OrderId, OrderStatus, OrderUpdate, ProcessError, StatusCheckJobData};
use crate::ports::{Clock, OrderRepository, Portal, RepositoryError};

/// Result of one status check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckResult {
    /// Extract downloaded, validated and the order completed.
    Downloaded { path: PathBuf, report: ArtifactReport },
    /// Portal is still working on it.
    Pending { status_text: String },
    /// Nothing to do: the order is gone or already complete.
    Skipped,
}

/// The check routine shared by the job processor and the periodic sweep.
pub struct StatusChecker {
    init: Arc<WorkerInitializer>,
    auth: Arc<AuthSessionManager>,
    portal: Arc<dyn Portal>,
    orders: Arc<dyn OrderRepository>,
    clock: Arc<dyn Clock>,
    downloads_dir: PathBuf,
}

impl StatusChecker {
    pub fn new(
        init: Arc<WorkerInitializer>,
        auth: Arc<AuthSessionManager>,
        portal: Arc<dyn Portal>,
        orders: Arc<dyn OrderRepository>,
        clock: Arc<dyn Clock>,
        downloads_dir: PathBuf,
    ) -> Self {
        Self {
            init,
            auth,
            portal,
            orders,
            clock,
            downloads_dir,
        }
    }

    pub async fn check(
        &self,
        order_id: OrderId,
        external_order_number: &str,
    ) -> Result<CheckResult, ProcessError> {
        let operator = self.init.wait_ready().await?;

        let order = match self.orders.find_by_id(order_id).await {
            Ok(order) => order,
            Err(RepositoryError::NotFound { .. }) => {
                tracing::warn!(order_id = %order_id, "order no longer exists, skipping");
                return Ok(CheckResult::Skipped);
            }
            Err(e) => return Err(e.into()),
        };
        if order.is_complete {
            tracing::debug!(order_id = %order_id, "order already complete");
            return Ok(CheckResult::Skipped);
        }

        let lease = self.auth.acquire(&operator).await?;
        let status = match self
            .portal
            .check_status(lease.session(), external_order_number)
            .await
        {
            Ok(status) => status,
            Err(e) => return Err(portal_failure(lease, e)),
        };

        if !status.ready {
            drop(lease);
            self.orders
                .update(
                    order_id,
                    OrderUpdate {
                        last_checked_at: Some(self.clock.now()),
                        ..OrderUpdate::default()
                    },
                )
                .await?;
            tracing::info!(
                order_id = %order_id,
                number = external_order_number,
                status = %status.status_text,
                "extract not ready yet"
            );
            return Ok(CheckResult::Pending {
                status_text: status.status_text,
            });
        }

        let path = match self
            .portal
            .download_artifact(lease.session(), external_order_number, &self.downloads_dir)
            .await
        {
            Ok(path) => path,
            Err(e) => return Err(portal_failure(lease, e)),
        };
        drop(lease);

        self.orders
            .update(order_id, OrderUpdate::status(OrderStatus::Downloaded))
            .await?;
        let report = match artifact::validate(path.clone()).await {
            Ok(report) => report,
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&path).await {
                    tracing::debug!(path = %path.display(), error = %rm, "could not remove rejected artifact");
                }
                return Err(e.into());
            }
        };

        let now = self.clock.now();
        self.orders
            .update(
                order_id,
                OrderUpdate {
                    is_complete: Some(true),
                    completed_at: Some(now),
                    last_checked_at: Some(now),
                    ..OrderUpdate::status(OrderStatus::Completed)
                },
            )
            .await?;
        tracing::info!(
            order_id = %order_id,
            path = %path.display(),
            entries = report.entries,
            bytes = report.size,
            "extract downloaded"
        );
        Ok(CheckResult::Downloaded { path, report })
    }
}

/// Consumer of check-and-download jobs. Exhausted jobs are requeued at the head.
pub struct StatusCheckJobProcessor {
    checker: Arc<StatusChecker>,
    failures: Arc<FailurePolicy>,
}

impl StatusCheckJobProcessor {
    pub fn new(checker: Arc<StatusChecker>, failures: Arc<FailurePolicy>) -> Self {
        Self { checker, failures }
    }
}

#[async_trait]
impl JobHandler for StatusCheckJobProcessor {
    async fn handle(&self, job: &Job) -> Result<(), ProcessError> {
        let data: StatusCheckJobData = job.decode()?;
        match self
            .checker
            .check(data.order_id, &data.external_order_number)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => match self
                .failures
                .settle(job, data.order_id, err, Disposition::RequeueAtHead)
                .await?
            {
                Settled::Redeliver(err) | Settled::Release(err) => Err(err),
                Settled::Requeued => Ok(()),
            },
        }
    }
}
