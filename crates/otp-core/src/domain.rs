use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{errors::Error, Result};

/// Telegram chat id (numeric). Identifies who is waiting for an order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChatId(pub i64);

/// Telegram message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct MessageId(pub i32);

/// A stable reference to a sent message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// Vendor-issued activation id. Opaque to us.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OrderId(pub String);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Fulfilled,
    Cancelled,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Fulfilled => "fulfilled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Expired => "expired",
        }
    }
}

/// A rented virtual number.
///
/// Identity fields are private so they stay immutable after rental; only
/// `status` and `code` move, and only once.
#[derive(Clone, Debug, Serialize)]
pub struct Order {
    order_id: OrderId,
    phone: String,
    requester: ChatId,
    status: OrderStatus,
    code: Option<String>,
    pub service: String,
    pub operator: String,
    pub price: String,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn new(order_id: OrderId, phone: impl Into<String>, requester: ChatId) -> Self {
        Self {
            order_id,
            phone: phone.into(),
            requester,
            status: OrderStatus::Pending,
            code: None,
            service: String::new(),
            operator: "any".to_string(),
            price: "?".to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn order_id(&self) -> &OrderId {
        &self.order_id
    }

    pub fn phone(&self) -> &str {
        &self.phone
    }

    pub fn requester(&self) -> ChatId {
        self.requester
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Move the order into a terminal state.
    ///
    /// `code` is recorded only for `Fulfilled`. Fails if the order already left
    /// `Pending` or if `to` is not terminal.
    pub fn transition(&mut self, to: OrderStatus, code: Option<String>) -> Result<()> {
        if self.status.is_terminal() || !to.is_terminal() {
            return Err(Error::InvalidTransition {
                order_id: self.order_id.0.clone(),
                from: self.status.as_str(),
                to: to.as_str(),
            });
        }
        self.status = to;
        if to == OrderStatus::Fulfilled {
            self.code = code;
        }
        Ok(())
    }
}
