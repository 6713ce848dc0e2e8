use async_trait::async_trait;

use super::RepositoryError;
use crate::domain::Operator;

/// Lookup of operator accounts (portal identities with their decrypted credentials).
#[async_trait]
pub trait OperatorDirectory: Send + Sync {
    async fn find_by_username(&self, username: &str) -> Result<Option<Operator>, RepositoryError>;
}
