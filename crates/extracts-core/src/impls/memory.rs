//! In-process adapters for the repository-style ports.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::{NewOrder, Operator, Order, OrderId, OrderStatus, OrderUpdate};
use crate::ports::{
    AnswerStore, Clock, OperatorDirectory, OrderRepository, RepositoryError, normalize_question,
};

#[derive(Default)]
struct OrderTable {
    next_id: i64,
    rows: BTreeMap<OrderId, Order>,
}

pub struct InMemoryOrderRepository {
    table: RwLock<OrderTable>,
    clock: Arc<dyn Clock>,
}

impl InMemoryOrderRepository {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            table: RwLock::new(OrderTable::default()),
            clock,
        }
    }

    fn insert(&self, table: &mut OrderTable, new: NewOrder) -> Order {
        table.next_id += 1;
        let order = Order {
            id: OrderId(table.next_id),
            owner_id: new.owner_id,
            cadastral_number: new.cadastral_number,
            status: OrderStatus::Queued,
            external_order_number: None,
            is_complete: false,
            operator_id: None,
            comment: None,
            registered_at: None,
            completed_at: None,
            last_checked_at: None,
            created_at: self.clock.now(),
            deleted_at: None,
        };
        table.rows.insert(order.id, order.clone());
        order
    }
}

fn live(table: &mut OrderTable, id: OrderId) -> Result<&mut Order, RepositoryError> {
    table
        .rows
        .get_mut(&id)
        .filter(|o| o.deleted_at.is_none())
        .ok_or_else(|| RepositoryError::order_not_found(id))
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn find_by_id(&self, id: OrderId) -> Result<Order, RepositoryError> {
        self.table
            .read()
            .await
            .rows
            .get(&id)
            .filter(|o| o.deleted_at.is_none())
            .cloned()
            .ok_or_else(|| RepositoryError::order_not_found(id))
    }

    async fn find_all(&self) -> Result<Vec<Order>, RepositoryError> {
        Ok(self
            .table
            .read()
            .await
            .rows
            .values()
            .filter(|o| o.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn create(&self, order: NewOrder) -> Result<Order, RepositoryError> {
        let mut table = self.table.write().await;
        Ok(self.insert(&mut table, order))
    }

    async fn create_many(&self, orders: Vec<NewOrder>) -> Result<Vec<Order>, RepositoryError> {
        let mut table = self.table.write().await;
        Ok(orders
            .into_iter()
            .map(|o| self.insert(&mut table, o))
            .collect())
    }

    async fn update(&self, id: OrderId, update: OrderUpdate) -> Result<Order, RepositoryError> {
        let mut table = self.table.write().await;
        let order = live(&mut table, id)?;
        update.apply(order);
        Ok(order.clone())
    }

    async fn soft_delete(&self, id: OrderId) -> Result<(), RepositoryError> {
        let now = self.clock.now();
        let mut table = self.table.write().await;
        live(&mut table, id)?.deleted_at = Some(now);
        Ok(())
    }
}

/// Answers keyed by (normalized question, subject). Unknown questions are kept for operators.
#[derive(Default)]
pub struct InMemoryAnswerStore {
    answers: RwLock<HashMap<(String, String), String>>,
    unanswered: RwLock<Vec<(String, String)>>,
}

impl InMemoryAnswerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_answer(&self, question: &str, subject: &str, answer: &str) {
        let key = (normalize_question(question), subject.to_string());
        self.unanswered.write().await.retain(|q| q != &key);
        self.answers.write().await.insert(key, answer.to_string());
    }

    /// Questions seen without an answer, as (normalized question, subject).
    pub async fn unanswered(&self) -> Vec<(String, String)> {
        self.unanswered.read().await.clone()
    }
}

#[async_trait]
impl AnswerStore for InMemoryAnswerStore {
    async fn lookup(
        &self,
        question: &str,
        subject: &str,
    ) -> Result<Option<String>, RepositoryError> {
        let key = (normalize_question(question), subject.to_string());
        if let Some(answer) = self.answers.read().await.get(&key) {
            return Ok(Some(answer.clone()));
        }
        let mut unanswered = self.unanswered.write().await;
        if !unanswered.contains(&key) {
            unanswered.push(key);
        }
        Ok(None)
    }
}

#[derive(Default)]
pub struct InMemoryOperatorDirectory {
    operators: RwLock<HashMap<String, Operator>>,
}

impl InMemoryOperatorDirectory {
    pub fn new(operators: impl IntoIterator<Item = Operator>) -> Self {
        Self {
            operators: RwLock::new(
                operators
                    .into_iter()
                    .map(|op| (op.username.clone(), op))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl OperatorDirectory for InMemoryOperatorDirectory {
    async fn find_by_username(&self, username: &str) -> Result<Option<Operator>, RepositoryError> {
        Ok(self.operators.read().await.get(username).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OperatorId;
    use crate::ports::SystemClock;

    fn repo() -> InMemoryOrderRepository {
        InMemoryOrderRepository::new(Arc::new(SystemClock))
    }

    fn new_order(cadastral: &str) -> NewOrder {
        NewOrder {
            owner_id: 7,
            cadastral_number: cadastral.into(),
        }
    }

    #[tokio::test]
    async fn create_assigns_sequential_ids_and_starts_queued() {
        let repo = repo();
        let created = repo
            .create_many(vec![new_order("77:01:0001001:1"), new_order("77:01:0001001:2")])
            .await
            .unwrap();
        assert_eq!(created[0].id, OrderId(1));
        assert_eq!(created[1].id, OrderId(2));
        assert!(created.iter().all(|o| o.status == OrderStatus::Queued));
    }

    #[tokio::test]
    async fn update_applies_partial_changes() {
        let repo = repo();
        let order = repo.create(new_order("77:01:0001001:1")).await.unwrap();

        repo.update(
            order.id,
            OrderUpdate {
                operator_id: Some(Some(OperatorId(3))),
                ..OrderUpdate::status(OrderStatus::Processing)
            },
        )
        .await
        .unwrap();
        let updated = repo
            .update(order.id, OrderUpdate::status(OrderStatus::error("boom")))
            .await
            .unwrap();

        assert_eq!(updated.status, OrderStatus::error("boom"));
        assert_eq!(updated.operator_id, Some(OperatorId(3)));
    }

    #[tokio::test]
    async fn soft_deleted_orders_disappear() {
        let repo = repo();
        let order = repo.create(new_order("77:01:0001001:1")).await.unwrap();
        repo.soft_delete(order.id).await.unwrap();

        assert!(repo.find_all().await.unwrap().is_empty());
        assert!(matches!(
            repo.find_by_id(order.id).await,
            Err(RepositoryError::NotFound { .. })
        ));
        assert!(repo.update(order.id, OrderUpdate::default()).await.is_err());
    }

    #[tokio::test]
    async fn answers_match_after_normalization() {
        let store = InMemoryAnswerStore::new();
        assert_eq!(store.lookup("Кличка  питомца?", "user1").await.unwrap(), None);
        assert_eq!(store.unanswered().await.len(), 1);

        store.set_answer("кличка питомца?", "user1", "Шарик").await;
        assert_eq!(
            store.lookup("  КЛИЧКА питомца? ", "user1").await.unwrap().as_deref(),
            Some("Шарик")
        );
        assert!(store.unanswered().await.is_empty());
        assert_eq!(store.lookup("кличка питомца?", "user2").await.unwrap(), None);
    }
}
