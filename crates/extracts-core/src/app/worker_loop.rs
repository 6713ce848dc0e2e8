use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::registry::{HandlerRegistry, JobHandler};
use crate::domain::{ErrorKind, JobKind};
use crate::queue::{FailOutcome, JobLease, WorkQueue};

/// Consumer tasks for every registered job kind.
///
/// Shutdown stops new leases; a job already running is allowed to finish.
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `concurrency` consumers per registered kind.
    pub fn spawn(
        queue: Arc<dyn WorkQueue>,
        registry: &HandlerRegistry,
        concurrency: usize,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::new();
        for kind in registry.kinds() {
            let Some(handler) = registry.get(kind) else {
                continue;
            };
            for slot in 0..concurrency.max(1) {
                let queue = Arc::clone(&queue);
                let handler = Arc::clone(&handler);
                let rx = shutdown_rx.clone();
                joins.push(tokio::spawn(async move {
                    consume(kind, slot, queue, handler, rx).await;
                }));
            }
        }
        tracing::info!(consumers = joins.len(), "workers started");

        Self { shutdown_tx, joins }
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                tracing::error!(error = %e, "worker task panicked");
            }
        }
    }
}

async fn consume(
    kind: JobKind,
    slot: usize,
    queue: Arc<dyn WorkQueue>,
    handler: Arc<dyn JobHandler>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let lease = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            lease = queue.lease(kind) => lease,
        };

        // None means the queue was closed.
        let Some(lease) = lease else {
            break;
        };
        run_job(lease, handler.as_ref()).await;
    }
    tracing::debug!(%kind, slot, "worker stopped");
}

/// Run one leased job and report the result back to the queue.
pub(crate) async fn run_job(lease: Box<dyn JobLease>, handler: &dyn JobHandler) {
    let job = lease.job().clone();
    let span = tracing::info_span!("job", id = %job.id, kind = %job.kind, attempt = job.attempts_made + 1);

    match handler.handle(&job).instrument(span).await {
        Ok(()) => {
            if let Err(e) = lease.ack().await {
                tracing::error!(job_id = %job.id, error = %e, "ack failed");
            }
        }
        Err(err) if err.kind() == ErrorKind::Interrupted => {
            match lease.release().await {
                Ok(()) => tracing::info!(
                    job_id = %job.id,
                    error = %err,
                    "job interrupted, returned to the queue"
                ),
                Err(e) => tracing::error!(job_id = %job.id, error = %e, "lease release failed"),
            }
        }
        Err(err) => {
            let kind = err.kind();
            match lease.fail(err.to_string()).await {
                Ok(FailOutcome::Retrying { attempts_made, delay }) => tracing::warn!(
                    job_id = %job.id,
                    ?kind,
                    attempts_made,
                    ?delay,
                    error = %err,
                    "job failed, retry scheduled"
                ),
                Ok(FailOutcome::Exhausted { attempts_made }) => tracing::error!(
                    job_id = %job.id,
                    ?kind,
                    attempts_made,
                    error = %err,
                    "job failed permanently"
                ),
                Err(e) => tracing::error!(job_id = %job.id, error = %e, "failure report failed"),
            }
        }
    }
}
