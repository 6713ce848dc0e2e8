use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Job, JobKind, ProcessError};

/// Consumer of one job kind.
///
/// `Ok` acks the delivery. `Err` hands the job back to the queue, which retries with
/// backoff until attempts run out.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), ProcessError>;
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("handler for job kind '{0}' is already registered")]
    AlreadyRegistered(JobKind),
}

/// Handlers by job kind. Filled during startup, read-only afterwards.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: JobKind,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&kind) {
            return Err(RegistryError::AlreadyRegistered(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn contains(&self, kind: JobKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Registered kinds in declaration order.
    pub fn kinds(&self) -> Vec<JobKind> {
        let mut kinds: Vec<JobKind> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Kinds from `expected` that have no handler.
    pub fn missing(&self, expected: &[JobKind]) -> Vec<JobKind> {
        expected
            .iter()
            .filter(|kind| !self.contains(**kind))
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn handle(&self, _job: &Job) -> Result<(), ProcessError> {
            Ok(())
        }
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register(JobKind::PlaceOrder, Arc::new(Noop)).unwrap();
        let result = registry.register(JobKind::PlaceOrder, Arc::new(Noop));
        assert!(matches!(
            result,
            Err(RegistryError::AlreadyRegistered(JobKind::PlaceOrder))
        ));
    }

    #[test]
    fn reports_missing_kinds() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(JobKind::CheckAndDownload, Arc::new(Noop))
            .unwrap();
        assert_eq!(registry.missing(&JobKind::ALL), vec![JobKind::PlaceOrder]);
        assert_eq!(registry.kinds(), vec![JobKind::CheckAndDownload]);
        assert!(registry.get(JobKind::PlaceOrder).is_none());
    }
}
