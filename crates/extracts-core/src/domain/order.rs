//! Orders as seen through the repository contract.
//!
//! Orders are referenced, never owned: processors load them, apply an [`OrderUpdate`]
//! and drop them within a single job execution.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{OperatorId, OrderId};

/// The externally visible progress indicator of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum OrderStatus {
    Queued,
    Processing,
    Registered,
    Downloaded,
    Completed,
    CadastralNumberNotFound,
    InsufficientBalance,
    Error(String),
}

impl OrderStatus {
    pub fn error(message: impl Into<String>) -> Self {
        OrderStatus::Error(message.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, OrderStatus::Error(_))
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Queued => f.write_str("Queued"),
            OrderStatus::Processing => f.write_str("Processing"),
            OrderStatus::Registered => f.write_str("Registered on the portal"),
            OrderStatus::Downloaded => f.write_str("Files downloaded"),
            OrderStatus::Completed => f.write_str("Completed"),
            OrderStatus::CadastralNumberNotFound => f.write_str("Cadastral number not found"),
            OrderStatus::InsufficientBalance => f.write_str("Insufficient balance"),
            OrderStatus::Error(message) => write!(f, "Error: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub owner_id: i64,
    pub cadastral_number: String,
    pub status: OrderStatus,
    /// Order number assigned by the portal once the order is registered.
    pub external_order_number: Option<String>,
    pub is_complete: bool,
    pub operator_id: Option<OperatorId>,
    /// Last error recorded for operators.
    pub comment: Option<String>,
    pub registered_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Registered on the portal but the artifact has not been downloaded yet.
    pub fn awaits_download(&self) -> bool {
        self.external_order_number.is_some() && !self.is_complete && self.deleted_at.is_none()
    }
}

/// Input for creating an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrder {
    pub owner_id: i64,
    pub cadastral_number: String,
}

/// Partial update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderUpdate {
    pub status: Option<OrderStatus>,
    pub external_order_number: Option<String>,
    pub is_complete: Option<bool>,
    /// `Some(None)` clears the operator.
    pub operator_id: Option<Option<OperatorId>>,
    pub comment: Option<String>,
    pub registered_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl OrderUpdate {
    pub fn status(status: OrderStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn apply(self, order: &mut Order) {
        if let Some(status) = self.status {
            order.status = status;
        }
        if let Some(number) = self.external_order_number {
            order.external_order_number = Some(number);
        }
        if let Some(done) = self.is_complete {
            order.is_complete = done;
        }
        if let Some(operator) = self.operator_id {
            order.operator_id = operator;
        }
        if let Some(comment) = self.comment {
            order.comment = Some(comment);
        }
        if let Some(at) = self.registered_at {
            order.registered_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            order.completed_at = Some(at);
        }
        if let Some(at) = self.last_checked_at {
            order.last_checked_at = Some(at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> Order {
        Order {
            id: OrderId(1),
            owner_id: 7,
            cadastral_number: "77:01:0001001:1234".into(),
            status: OrderStatus::Queued,
            external_order_number: None,
            is_complete: false,
            operator_id: Some(OperatorId(3)),
            comment: None,
            registered_at: None,
            completed_at: None,
            last_checked_at: None,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[test]
    fn error_status_carries_a_readable_suffix() {
        assert_eq!(
            OrderStatus::error("portal returned 503").to_string(),
            "Error: portal returned 503"
        );
    }

    #[test]
    fn partial_update_touches_only_given_fields() {
        let mut o = order();
        OrderUpdate {
            status: Some(OrderStatus::Registered),
            external_order_number: Some("80-1".into()),
            operator_id: Some(None),
            ..OrderUpdate::default()
        }
        .apply(&mut o);

        assert_eq!(o.status, OrderStatus::Registered);
        assert_eq!(o.external_order_number.as_deref(), Some("80-1"));
        assert_eq!(o.operator_id, None);
        assert_eq!(o.cadastral_number, "77:01:0001001:1234");
        assert!(o.awaits_download());
    }
}
