//! Composition of the ports into a running worker.
//!
//! - **WorkerInitializer**: do-once startup gate
//! - **OrderJobProcessor / StatusCheckJobProcessor**: queue consumers
//! - **StatusSweep**: gated periodic check of every registered order
//! - **WorkerGroup**: per-kind consumer tasks
//! - **WorkerBuilder**: wiring and fail-fast validation

pub mod builder;
pub mod failure;
pub mod init;
pub mod order;
pub mod registry;
pub mod status;
pub mod sweep;
pub mod worker_loop;


pub use self::builder::{BuildError, RunningWorker, Worker, WorkerBuilder};
pub use self::failure::{Disposition, FailurePolicy, Settled};
pub use self::init::WorkerInitializer;
pub use self::order::OrderJobProcessor;
pub use self::registry::{HandlerRegistry, JobHandler, RegistryError};
pub use self::status::{CheckResult, StatusCheckJobProcessor, StatusChecker};
pub use self::sweep::{StatusSweep, SweepReport, SweepSettings};
pub use self::worker_loop::WorkerGroup;

use crate::auth::SessionLease;
use crate::domain::ProcessError;
use crate::ports::PortalError;

/// Release the session after a failed portal call, dropping it if the portal rejected it.
fn portal_failure(lease: SessionLease, err: PortalError) -> ProcessError {
    if matches!(err, PortalError::SessionExpired) {
        tracing::info!("portal session expired, signing in again next time");
        lease.invalidate();
    }
    err.into()
}
