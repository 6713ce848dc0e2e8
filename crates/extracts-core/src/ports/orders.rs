//! Order repository contract.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{NewOrder, Order, OrderId, OrderUpdate};

/// Repository failures. Not-found is a domain outcome; infrastructure failures bubble.
#[derive(Debug, Clone, Error)]
pub enum RepositoryError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("repository unavailable: {0}")]
    Infrastructure(String),
}

impl RepositoryError {
    pub fn order_not_found(id: OrderId) -> Self {
        RepositoryError::NotFound {
            entity: "order",
            id: id.to_string(),
        }
    }
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn find_by_id(&self, id: OrderId) -> Result<Order, RepositoryError>;

    /// All orders that are not soft-deleted.
    async fn find_all(&self) -> Result<Vec<Order>, RepositoryError>;

    async fn create(&self, order: NewOrder) -> Result<Order, RepositoryError>;

    async fn create_many(&self, orders: Vec<NewOrder>) -> Result<Vec<Order>, RepositoryError>;

    /// Apply a partial update and return the updated order.
    async fn update(&self, id: OrderId, update: OrderUpdate) -> Result<Order, RepositoryError>;

    async fn soft_delete(&self, id: OrderId) -> Result<(), RepositoryError>;
}
