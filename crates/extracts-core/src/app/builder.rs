//! Worker wiring.
//!
//! [`WorkerBuilder`] collects the adapters, builds every component in dependency order and
//! refuses to build when an adapter or a job handler is missing.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::failure::FailurePolicy;
use super::init::WorkerInitializer;
use super::order::OrderJobProcessor;
use super::registry::{HandlerRegistry, JobHandler, RegistryError};
use super::status::{StatusCheckJobProcessor, StatusChecker};
use super::sweep::{StatusSweep, SweepSettings};
use super::worker_loop::WorkerGroup;
use crate::auth::AuthSessionManager;
use crate::broker::{CodeBroker, CodeIntake};
use crate::config::{ConfigError, WorkerConfig};
use crate::domain::{JobId, JobKind, NewOrder, Order, OrderJobData, ProcessError};
use crate::ports::{
    AnswerStore, ChallengeNotifier, Clock, LogNotifier, LoginDriver, OperatorDirectory,
    OrderRepository, Portal, ScheduleStore, SystemClock, UlidGenerator,
};
use crate::queue::{InMemoryWorkQueue, QueueError, WorkQueue};
use crate::schedule::{JsonScheduleStore, ScheduleGate};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("missing adapter: {0}")]
    MissingAdapter(&'static str),

    #[error("no handler registered for job kinds: {0:?}")]
    MissingHandlers(Vec<JobKind>),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("queue could not be opened: {0}")]
    Queue(#[from] QueueError),
}

pub struct WorkerBuilder {
    config: WorkerConfig,
    clock: Option<Arc<dyn Clock>>,
    queue: Option<Arc<dyn WorkQueue>>,
    orders: Option<Arc<dyn OrderRepository>>,
    operators: Option<Arc<dyn OperatorDirectory>>,
    answers: Option<Arc<dyn AnswerStore>>,
    driver: Option<Arc<dyn LoginDriver>>,
    portal: Option<Arc<dyn Portal>>,
    notifier: Option<Arc<dyn ChallengeNotifier>>,
    schedule_store: Option<Arc<dyn ScheduleStore>>,
    handlers: Vec<(JobKind, Arc<dyn JobHandler>)>,
    default_processors: bool,
}

impl WorkerBuilder {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            clock: None,
            queue: None,
            orders: None,
            operators: None,
            answers: None,
            driver: None,
            portal: None,
            notifier: None,
            schedule_store: None,
            handlers: Vec::new(),
            default_processors: true,
        }
    }

    /// Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to an in-memory queue, mirrored to `queue.snapshot_path` when configured.
    pub fn queue(mut self, queue: Arc<dyn WorkQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn orders(mut self, orders: Arc<dyn OrderRepository>) -> Self {
        self.orders = Some(orders);
        self
    }

    pub fn operators(mut self, operators: Arc<dyn OperatorDirectory>) -> Self {
        self.operators = Some(operators);
        self
    }

    pub fn answers(mut self, answers: Arc<dyn AnswerStore>) -> Self {
        self.answers = Some(answers);
        self
    }

    pub fn login_driver(mut self, driver: Arc<dyn LoginDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn portal(mut self, portal: Arc<dyn Portal>) -> Self {
        self.portal = Some(portal);
        self
    }

    /// Defaults to logging the CAPTCHA image path.
    pub fn notifier(mut self, notifier: Arc<dyn ChallengeNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Defaults to an in-memory store.
    pub fn schedule_store(mut self, store: Arc<dyn ScheduleStore>) -> Self {
        self.schedule_store = Some(store);
        self
    }

    /// Use `handler` for `kind` instead of the built-in processor.
    pub fn handler(mut self, kind: JobKind, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.push((kind, handler));
        self
    }

    /// Leave kinds without an explicit handler unserved. `build` then fails for them.
    pub fn without_default_processors(mut self) -> Self {
        self.default_processors = false;
        self
    }

    pub fn build(self) -> Result<Worker, BuildError> {
        self.config.validate()?;
        let config = self.config;

        let orders = self.orders.ok_or(BuildError::MissingAdapter("order repository"))?;
        let operators = self
            .operators
            .ok_or(BuildError::MissingAdapter("operator directory"))?;
        let answers = self.answers.ok_or(BuildError::MissingAdapter("answer store"))?;
        let driver = self.driver.ok_or(BuildError::MissingAdapter("login driver"))?;
        let portal = self.portal.ok_or(BuildError::MissingAdapter("portal"))?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));
        let schedule_store = self
            .schedule_store
            .unwrap_or_else(|| Arc::new(JsonScheduleStore::in_memory()));
        let queue: Arc<dyn WorkQueue> = match self.queue {
            Some(queue) => queue,
            None => {
                let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
                match &config.queue.snapshot_path {
                    Some(path) => Arc::new(InMemoryWorkQueue::with_snapshot(
                        path,
                        Arc::clone(&clock),
                        ids,
                    )?),
                    None => Arc::new(InMemoryWorkQueue::new(Arc::clone(&clock), ids)),
                }
            }
        };

        let broker = Arc::new(CodeBroker::new(Arc::clone(&clock)));
        let init = Arc::new(WorkerInitializer::new(
            operators,
            Arc::clone(&driver),
            config.operator_username.clone(),
        ));
        let auth = Arc::new(AuthSessionManager::new(
            driver,
            Arc::clone(&broker),
            answers,
            notifier,
            config.auth_settings(),
        ));
        let failures = Arc::new(FailurePolicy::new(
            Arc::clone(&queue),
            Arc::clone(&orders),
            config.operator_action_delay(),
        ));
        let checker = Arc::new(StatusChecker::new(
            Arc::clone(&init),
            Arc::clone(&auth),
            Arc::clone(&portal),
            Arc::clone(&orders),
            Arc::clone(&clock),
            config.downloads_dir.clone(),
        ));

        let mut registry = HandlerRegistry::new();
        for (kind, handler) in self.handlers {
            registry.register(kind, handler)?;
        }
        if self.default_processors {
            if !registry.contains(JobKind::PlaceOrder) {
                let processor = OrderJobProcessor::new(
                    Arc::clone(&init),
                    Arc::clone(&auth),
                    Arc::clone(&portal),
                    Arc::clone(&orders),
                    Arc::clone(&queue),
                    Arc::clone(&failures),
                    Arc::clone(&clock),
                    config
                        .job_options()
                        .with_delay(config.status_check_delay()),
                );
                registry.register(JobKind::PlaceOrder, Arc::new(processor))?;
            }
            if !registry.contains(JobKind::CheckAndDownload) {
                let processor = StatusCheckJobProcessor::new(Arc::clone(&checker), failures);
                registry.register(JobKind::CheckAndDownload, Arc::new(processor))?;
            }
        }
        let missing = registry.missing(&JobKind::ALL);
        if !missing.is_empty() {
            return Err(BuildError::MissingHandlers(missing));
        }

        let gate = Arc::new(ScheduleGate::new(
            schedule_store,
            Arc::clone(&clock),
            config.utc_offset()?,
        ));
        let (pause_min, pause_max) = config.sweep_pause();
        let sweep = Arc::new(StatusSweep::new(
            Arc::clone(&gate),
            checker,
            Arc::clone(&orders),
            SweepSettings {
                task_name: config.schedule.task_name.clone(),
                period: config.sweep_period(),
                pause_min,
                pause_max,
            },
        ));

        Ok(Worker {
            intake: CodeIntake::new(Arc::clone(&broker)),
            config,
            queue,
            orders,
            broker,
            init,
            auth,
            gate,
            sweep,
            registry,
        })
    }
}

/// A fully wired worker, not yet consuming.
pub struct Worker {
    config: WorkerConfig,
    queue: Arc<dyn WorkQueue>,
    orders: Arc<dyn OrderRepository>,
    broker: Arc<CodeBroker>,
    intake: CodeIntake,
    init: Arc<WorkerInitializer>,
    auth: Arc<AuthSessionManager>,
    gate: Arc<ScheduleGate>,
    sweep: Arc<StatusSweep>,
    registry: HandlerRegistry,
}

impl Worker {
    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    pub fn orders(&self) -> &Arc<dyn OrderRepository> {
        &self.orders
    }

    pub fn broker(&self) -> &Arc<CodeBroker> {
        &self.broker
    }

    /// Inbound endpoint for operator-supplied codes.
    pub fn intake(&self) -> &CodeIntake {
        &self.intake
    }

    pub fn initializer(&self) -> &Arc<WorkerInitializer> {
        &self.init
    }

    pub fn auth(&self) -> &Arc<AuthSessionManager> {
        &self.auth
    }

    pub fn gate(&self) -> &Arc<ScheduleGate> {
        &self.gate
    }

    pub fn sweep(&self) -> &Arc<StatusSweep> {
        &self.sweep
    }

    pub fn handler(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.registry.get(kind)
    }

    /// Create the order record and queue its place-order job.
    pub async fn submit_order(&self, order: NewOrder) -> Result<(Order, JobId), ProcessError> {
        let order = self.orders.create(order).await?;
        let data = OrderJobData {
            order_id: order.id,
            cadastral_number: order.cadastral_number.clone(),
            owner_id: order.owner_id,
        };
        let job_id = self.queue.add(&data, self.config.job_options()).await?;
        tracing::info!(
            order_id = %order.id,
            cadastral_number = %order.cadastral_number,
            %job_id,
            "order submitted"
        );
        Ok((order, job_id))
    }

    /// Seed the schedule, then start consumers and the periodic sweep.
    pub async fn start(&self) -> Result<RunningWorker, ProcessError> {
        let record = self
            .config
            .schedule_record()
            .map_err(|e| ProcessError::Initialization(e.to_string()))?;
        self.gate.seed_defaults([record]).await?;

        let (sweep_tx, sweep_rx) = watch::channel(false);
        let sweep = Arc::clone(&self.sweep).spawn(sweep_rx);
        let group = WorkerGroup::spawn(
            Arc::clone(&self.queue),
            &self.registry,
            self.config.queue.concurrency,
        );

        // Warm up in the background so the first job does not pay for it.
        let init = Arc::clone(&self.init);
        tokio::spawn(async move {
            if let Err(e) = init.wait_ready().await {
                tracing::error!(error = %e, "worker initialization failed");
            }
        });

        Ok(RunningWorker {
            group,
            sweep,
            sweep_tx,
            queue: Arc::clone(&self.queue),
            broker: Arc::clone(&self.broker),
            auth: Arc::clone(&self.auth),
        })
    }
}

/// Handle to the started consumers and sweep.
pub struct RunningWorker {
    group: WorkerGroup,
    sweep: JoinHandle<()>,
    sweep_tx: watch::Sender<bool>,
    queue: Arc<dyn WorkQueue>,
    broker: Arc<CodeBroker>,
    auth: Arc<AuthSessionManager>,
}

impl RunningWorker {
    /// Stop leasing, end pending code waits, let in-flight jobs finish, close the browser.
    ///
    /// Jobs interrupted here return to the queue uncounted. Enqueue stays open until every
    /// consumer has settled its job.
    pub async fn shutdown(self) {
        tracing::info!("worker shutting down");
        self.group.request_shutdown();
        let _ = self.sweep_tx.send(true);
        self.queue.close().await;
        let cancelled = self.broker.shutdown();
        if cancelled > 0 {
            tracing::warn!(cancelled, "pending code requests cancelled");
        }

        self.group.shutdown_and_join().await;
        if let Err(e) = self.sweep.await {
            tracing::error!(error = %e, "status sweep task panicked");
        }
        self.queue.seal().await;
        self.auth.close().await;
        tracing::info!("worker stopped");
    }
}
