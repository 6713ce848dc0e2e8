//! Adapters that run without external services.

mod memory;
mod simulated;

pub use memory::{InMemoryAnswerStore, InMemoryOperatorDirectory, InMemoryOrderRepository};
pub use simulated::{ArtifactKind, Scenario, SimulatedPortal};
