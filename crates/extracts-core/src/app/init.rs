//! One-time worker startup shared by every consumer.

use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::domain::{Operator, ProcessError};
use crate::ports::{LoginDriver, OperatorDirectory};

/// Resolves the operator identity and opens the browser, once.
///
/// Concurrent first callers wait on the same initialization. A failed attempt is not
/// cached: the next caller tries again.
pub struct WorkerInitializer {
    directory: Arc<dyn OperatorDirectory>,
    driver: Arc<dyn LoginDriver>,
    username: String,
    ready: OnceCell<Arc<Operator>>,
}

impl WorkerInitializer {
    pub fn new(
        directory: Arc<dyn OperatorDirectory>,
        driver: Arc<dyn LoginDriver>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            directory,
            driver,
            username: username.into(),
            ready: OnceCell::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.initialized()
    }

    /// Block until startup has completed and return the operator this worker acts as.
    pub async fn wait_ready(&self) -> Result<Arc<Operator>, ProcessError> {
        self.ready
            .get_or_try_init(|| self.initialize())
            .await
            .cloned()
    }

    async fn initialize(&self) -> Result<Arc<Operator>, ProcessError> {
        tracing::info!(operator = %self.username, "initializing worker");
        let operator = self
            .directory
            .find_by_username(&self.username)
            .await?
            .ok_or_else(|| {
                ProcessError::Initialization(format!("operator '{}' not found", self.username))
            })?;

        self.driver
            .open()
            .await
            .map_err(|e| ProcessError::Initialization(format!("browser did not start: {e}")))?;

        tracing::info!(operator = %operator.username, id = %operator.id, "worker ready");
        Ok(Arc::new(operator))
    }
}
