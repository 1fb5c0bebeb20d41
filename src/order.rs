// =============================================================================
// Order lifecycle tracking — limit/market orders placed against order blocks
// =============================================================================
//
// Tracks orders from placement through fill, cancel, or rejection. The
// critical path is `cancel_orders_by_ob`: when an order block invalidates,
// every pending order still resting against it must be cancelled before the
// exchange can fill it on stale liquidity.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: i64,
    pub internal_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub size: u64,
    pub price: Option<f64>,
    pub account: String,
    pub ob_id: String,
    pub created_at: String,
    pub status: OrderStatus,
    pub filled_size: u64,
    pub remaining_size: u64,
    pub filled_price: Option<f64>,
    pub filled_at: Option<String>,
    pub cancelled_at: Option<String>,
    pub cancel_reason: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct SymbolOrderStats {
    orders: u64,
    filled: u64,
    cancelled: u64,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct OrderStats {
    pub total_orders: u64,
    pub filled_orders: u64,
    pub cancelled_orders: u64,
    pub rejected_orders: u64,
}

/// Tracks the full lifecycle of orders placed by one sub-account. Not
/// thread-safe internally — callers hold it behind their own lock, mirroring
/// how `PositionTracker` is owned by `AppState`.
pub struct OrderTracker {
    account_name: String,
    orders: HashMap<i64, Order>,
    completed: Vec<Order>,
    next_internal_id: u64,
    stats: OrderStats,
    by_symbol: HashMap<String, SymbolOrderStats>,
}

impl OrderTracker {
    pub fn new(account_name: impl Into<String>) -> Self {
        let account_name = account_name.into();
        info!(account = %account_name, "order tracker initialized");
        Self {
            account_name,
            orders: HashMap::new(),
            completed: Vec::new(),
            next_internal_id: 1,
            stats: OrderStats::default(),
            by_symbol: HashMap::new(),
        }
    }

    fn generate_internal_id(&mut self) -> String {
        let id = format!("{}_ORDER_{}", self.account_name, self.next_internal_id);
        self.next_internal_id += 1;
        id
    }

    pub fn add_order(
        &mut self,
        order_id: i64,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        size: u64,
        price: Option<f64>,
        ob_id: &str,
    ) -> Order {
        let order = Order {
            order_id,
            internal_id: self.generate_internal_id(),
            symbol: symbol.to_string(),
            side,
            order_type,
            size,
            price,
            account: self.account_name.clone(),
            ob_id: ob_id.to_string(),
            created_at: Utc::now().to_rfc3339(),
            status: OrderStatus::Pending,
            filled_size: 0,
            remaining_size: size,
            filled_price: None,
            filled_at: None,
            cancelled_at: None,
            cancel_reason: None,
        };

        self.orders.insert(order_id, order.clone());
        self.stats.total_orders += 1;
        self.by_symbol.entry(symbol.to_string()).or_default().orders += 1;

        info!(
            internal_id = %order.internal_id,
            symbol,
            side = ?side,
            size,
            price,
            order_id,
            "order added"
        );
        order
    }

    pub fn order(&self, order_id: i64) -> Option<&Order> {
        self.orders.get(&order_id)
    }

    pub fn orders_by_symbol(&self, symbol: &str, status: Option<OrderStatus>) -> Vec<&Order> {
        self.orders
            .values()
            .filter(|o| o.symbol == symbol)
            .filter(|o| status.map_or(true, |s| o.status == s))
            .collect()
    }

    pub fn pending_orders(&self, symbol: Option<&str>) -> Vec<&Order> {
        self.orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending)
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .collect()
    }

    pub fn orders_by_ob(&self, ob_id: &str) -> Vec<&Order> {
        self.orders.values().filter(|o| o.ob_id == ob_id).collect()
    }

    pub fn mark_filled(&mut self, order_id: i64, fill_price: f64, fill_size: Option<u64>) -> Option<&Order> {
        let symbol;
        {
            let order = self.orders.get_mut(&order_id)?;
            let fill_size = fill_size.unwrap_or(order.remaining_size);
            order.filled_size += fill_size;
            order.remaining_size = order.remaining_size.saturating_sub(fill_size);
            order.filled_price = Some(fill_price);
            order.filled_at = Some(Utc::now().to_rfc3339());
            order.status = if order.remaining_size == 0 {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
            symbol = order.symbol.clone();
            info!(
                internal_id = %order.internal_id,
                fill_size,
                fill_price,
                status = ?order.status,
                "order fill recorded"
            );
        }

        self.stats.filled_orders += 1;
        self.by_symbol.entry(symbol).or_default().filled += 1;

        if self.orders.get(&order_id).map(|o| o.status) == Some(OrderStatus::Filled) {
            self.complete_order(order_id);
        }
        self.orders.get(&order_id)
    }

    pub fn cancel_order(&mut self, order_id: i64, reason: &str) -> bool {
        let symbol;
        {
            let Some(order) = self.orders.get_mut(&order_id) else {
                error!(order_id, "cannot cancel: order not found");
                return false;
            };
            order.status = OrderStatus::Cancelled;
            order.cancelled_at = Some(Utc::now().to_rfc3339());
            order.cancel_reason = Some(reason.to_string());
            symbol = order.symbol.clone();
            info!(internal_id = %order.internal_id, reason, "order cancelled");
        }

        self.stats.cancelled_orders += 1;
        self.by_symbol.entry(symbol).or_default().cancelled += 1;
        self.complete_order(order_id);
        true
    }

    /// Cancels every still-pending order resting against `ob_id`. Called
    /// whenever an order block transitions to invalidated.
    pub fn cancel_orders_by_ob(&mut self, ob_id: &str, reason: &str) -> usize {
        let ids: Vec<i64> = self
            .orders_by_ob(ob_id)
            .into_iter()
            .filter(|o| o.status == OrderStatus::Pending)
            .map(|o| o.order_id)
            .collect();

        let count = ids.into_iter().filter(|id| self.cancel_order(*id, reason)).count();
        info!(ob_id, count, "cancelled orders for invalidated order block");
        count
    }

    pub fn cancel_orders_by_symbol(&mut self, symbol: &str, reason: &str) -> usize {
        let ids: Vec<i64> = self.pending_orders(Some(symbol)).iter().map(|o| o.order_id).collect();
        ids.into_iter().filter(|id| self.cancel_order(*id, reason)).count()
    }

    pub fn mark_rejected(&mut self, order_id: i64, rejection_reason: &str) -> bool {
        let Some(order) = self.orders.get_mut(&order_id) else {
            error!(order_id, "cannot reject: order not found");
            return false;
        };
        order.status = OrderStatus::Rejected;
        order.cancel_reason = Some(rejection_reason.to_string());
        self.stats.rejected_orders += 1;
        self.complete_order(order_id);
        true
    }

    fn complete_order(&mut self, order_id: i64) {
        if let Some(order) = self.orders.remove(&order_id) {
            self.completed.push(order);
        }
    }

    pub fn stats(&self) -> &OrderStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_full_fill_moves_to_completed() {
        let mut tracker = OrderTracker::new("account_1");
        tracker.add_order(1001, "SOLUSD", OrderSide::Buy, OrderType::Limit, 50, Some(99.6), "ob_1");
        let order = tracker.mark_filled(1001, 99.55, None).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert!(tracker.order(1001).is_none());
        assert_eq!(tracker.stats().filled_orders, 1);
    }

    #[test]
    fn partial_fill_keeps_order_pending_id_around() {
        let mut tracker = OrderTracker::new("account_1");
        tracker.add_order(1002, "SOLUSD", OrderSide::Buy, OrderType::Limit, 50, Some(99.6), "ob_1");
        let order = tracker.mark_filled(1002, 99.55, Some(20)).unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.remaining_size, 30);
        assert!(tracker.order(1002).is_some());
    }

    #[test]
    fn cancel_orders_by_ob_only_touches_pending_orders_for_that_ob() {
        let mut tracker = OrderTracker::new("account_1");
        tracker.add_order(1, "SOLUSD", OrderSide::Buy, OrderType::Limit, 10, Some(99.0), "ob_a");
        tracker.add_order(2, "SOLUSD", OrderSide::Buy, OrderType::Limit, 10, Some(98.0), "ob_a");
        tracker.add_order(3, "AAVEUSD", OrderSide::Sell, OrderType::Limit, 5, Some(200.0), "ob_b");
        tracker.mark_filled(2, 98.0, None);

        let cancelled = tracker.cancel_orders_by_ob("ob_a", "ob_invalidated");
        assert_eq!(cancelled, 1);
        assert!(tracker.order(3).is_some());
    }
}
