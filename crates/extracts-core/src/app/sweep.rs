//! Periodic status sweep over every order still waiting for its extract.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::status::{CheckResult, StatusChecker};
use crate::ports::OrderRepository;
use crate::schedule::{RunOutcome, ScheduleError, ScheduleGate};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub downloaded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct SweepSettings {
    pub task_name: String,
    pub period: Duration,
    /// Random pause between two orders, drawn from `pause_min..=pause_max`.
    pub pause_min: Duration,
    pub pause_max: Duration,
}

pub struct StatusSweep {
    gate: Arc<ScheduleGate>,
    checker: Arc<StatusChecker>,
    orders: Arc<dyn OrderRepository>,
    settings: SweepSettings,
}

impl StatusSweep {
    pub fn new(
        gate: Arc<ScheduleGate>,
        checker: Arc<StatusChecker>,
        orders: Arc<dyn OrderRepository>,
        settings: SweepSettings,
    ) -> Self {
        Self {
            gate,
            checker,
            orders,
            settings,
        }
    }

    /// One gated sweep. Skipped outside the active window or while another run is in flight.
    pub async fn run_once(&self) -> Result<RunOutcome<SweepReport>, ScheduleError> {
        let outcome = self
            .gate
            .run_exclusive(&self.settings.task_name, || self.sweep())
            .await?;
        match &outcome {
            RunOutcome::Ran(report) => tracing::info!(
                checked = report.checked,
                downloaded = report.downloaded,
                failed = report.failed,
                "status sweep finished"
            ),
            RunOutcome::Skipped(decision) => {
                tracing::debug!(?decision, "status sweep skipped")
            }
        }
        Ok(outcome)
    }

    async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let pending: Vec<_> = match self.orders.find_all().await {
            Ok(orders) => orders.into_iter().filter(|o| o.awaits_download()).collect(),
            Err(e) => {
                tracing::error!(error = %e, "status sweep could not load orders");
                return report;
            }
        };
        tracing::info!(orders = pending.len(), "status sweep started");

        for (i, order) in pending.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.pause()).await;
            }
            let Some(number) = order.external_order_number.as_deref() else {
                continue;
            };
            report.checked += 1;
            match self.checker.check(order.id, number).await {
                Ok(CheckResult::Downloaded { .. }) => report.downloaded += 1,
                Ok(_) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(order_id = %order.id, %number, error = %e, "status check failed");
                }
            }
        }
        report
    }

    fn pause(&self) -> Duration {
        let (min, max) = (self.settings.pause_min, self.settings.pause_max);
        if max <= min {
            return min;
        }
        rand::thread_rng().gen_range(min..=max)
    }

    /// Run every `period` until `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.run_once().await {
                    tracing::error!(error = %e, "status sweep gate failed");
                }
            }
            tracing::debug!("status sweep stopped");
        })
    }
}
