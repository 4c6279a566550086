use std::{collections::HashMap, sync::Mutex};

use crate::{
    domain::{ChatId, Order, OrderId, OrderStatus},
    errors::Error,
    Result,
};

/// Latest order per requester.
///
/// A requester may hold at most one `Pending` order. The lock is a plain
/// `std::sync::Mutex` and is never held across an await.
#[derive(Debug, Default)]
pub struct OrderBook {
    orders: Mutex<HashMap<ChatId, Order>>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly rented order.
    ///
    /// Replaces a previous terminal order of the same requester; rejects the
    /// new one while the previous is still pending.
    pub fn open(&self, order: Order) -> Result<()> {
        let mut orders = self.lock();
        if let Some(existing) = orders.get(&order.requester()) {
            if existing.status() == OrderStatus::Pending {
                return Err(Error::OrderInProgress {
                    requester: existing.requester().0,
                    order_id: existing.order_id().0.clone(),
                });
            }
        }
        orders.insert(order.requester(), order);
        Ok(())
    }

    pub fn get(&self, requester: ChatId) -> Option<Order> {
        self.lock().get(&requester).cloned()
    }

    /// The requester's order, only if it is the one with `order_id`.
    pub fn find(&self, requester: ChatId, order_id: &OrderId) -> Option<Order> {
        self.lock()
            .get(&requester)
            .filter(|o| o.order_id() == order_id)
            .cloned()
    }

    /// Apply the one-time terminal transition to a tracked order.
    pub fn settle(
        &self,
        requester: ChatId,
        order_id: &OrderId,
        status: OrderStatus,
        code: Option<String>,
    ) -> Result<Order> {
        let mut orders = self.lock();
        let order = orders
            .get_mut(&requester)
            .filter(|o| o.order_id() == order_id)
            .ok_or_else(|| {
                Error::External(format!(
                    "order {order_id} is not tracked for requester {}",
                    requester.0
                ))
            })?;
        order.transition(status, code)?;
        Ok(order.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ChatId, Order>> {
        // A poisoned map still holds consistent orders; every write is a single insert/update.
        self.orders.lock().unwrap_or_else(|e| e.into_inner())
    }
}
