//! Ports: the narrow contracts to everything outside the orchestration core.

pub mod answers;
pub mod clock;
pub mod id_generator;
pub mod operators;
pub mod orders;
pub mod portal;
pub mod schedule_store;

pub use answers::{AnswerStore, normalize_question};
pub use clock::{Clock, FixedClock, SystemClock};
pub use id_generator::{IdGenerator, UlidGenerator};
pub use operators::OperatorDirectory;
pub use orders::{OrderRepository, RepositoryError};
pub use portal::{
    ChallengeNotifier, ExternalStatus, LogNotifier, LoginDriver, PlacedOrder, Portal, PortalError,
    StepMarker,
};
pub use schedule_store::ScheduleStore;
