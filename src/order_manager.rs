// ===============================
// src/order_manager.rs
// ===============================
//
// Authoritative registry of orders and fills. Status transitions are
// monotone in the ordinal ranking; a stale update is a silent no-op, a
// symbol mismatch or duplicate/orphan fill is rejected without mutation.

use ahash::{AHashMap, AHashSet};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::domain::{CoreError, Fill, Order, OrderStatus, StrategyId, Timestamp};

pub struct OrderManager {
    orders: AHashMap<u64, Order>,
    /// Orders not yet fully filled or canceled, for O(1) compliance queries.
    standing: AHashSet<u64>,
    canceled: AHashSet<u64>,
    applied_fills: AHashSet<u64>,
}

impl OrderManager {
    pub fn new() -> Self {
        OrderManager {
            orders: AHashMap::new(),
            standing: AHashSet::new(),
            canceled: AHashSet::new(),
            applied_fills: AHashSet::new(),
        }
    }

    fn index_status(standing: &mut AHashSet<u64>, canceled: &mut AHashSet<u64>, order: &Order) {
        if order.status.is_standing() {
            standing.insert(order.id);
        } else {
            standing.remove(&order.id);
        }
        if order.status == OrderStatus::Canceled {
            canceled.insert(order.id);
        }
    }

    /// Apply a status update. An unseen id is inserted as-is; otherwise the
    /// update must reference the stored symbol and may only move the status
    /// ordinal forward.
    pub fn on_order_status(&mut self, update: &Order) -> Result<(), CoreError> {
        match self.orders.get_mut(&update.id) {
            None => {
                self.orders.insert(update.id, update.clone());
                Self::index_status(&mut self.standing, &mut self.canceled, update);
                Ok(())
            }
            Some(stored) => {
                if stored.symbol != update.symbol {
                    return Err(CoreError::SymbolMismatch {
                        id: update.id,
                        want: stored.symbol.clone(),
                        got: update.symbol.clone(),
                    });
                }
                if update.status < stored.status {
                    debug!(
                        id = update.id,
                        stale = ?update.status,
                        stored = ?stored.status,
                        "stale order status ignored"
                    );
                    return Ok(());
                }
                stored.status = update.status;
                if update.filled_ts.is_some() {
                    stored.filled_ts = update.filled_ts;
                }
                if update.canceled_ts.is_some() {
                    stored.canceled_ts = update.canceled_ts;
                }
                let stored = stored.clone();
                Self::index_status(&mut self.standing, &mut self.canceled, &stored);
                Ok(())
            }
        }
    }

    /// Apply a fill: dedup by fill id, reject orphans and overfills, then
    /// update cumulative size and the size-weighted average fill price.
    pub fn on_fill(&mut self, fill: &Fill) -> Result<(), CoreError> {
        if self.applied_fills.contains(&fill.fill_id) {
            return Err(CoreError::DuplicateFill(fill.fill_id));
        }
        let order = self.orders.get_mut(&fill.order_id).ok_or(CoreError::OrphanFill {
            fill_id: fill.fill_id,
            order_id: fill.order_id,
        })?;

        let new_filled = order.filled_size + fill.size;
        if new_filled.abs() > order.size.abs() {
            return Err(CoreError::OverFill {
                id: order.id,
                attempted: new_filled,
                requested: order.size,
            });
        }

        let prev_abs = Decimal::from(order.filled_size.abs());
        let fill_abs = Decimal::from(fill.size.abs());
        let total_abs = prev_abs + fill_abs;
        if !total_abs.is_zero() {
            order.filled_avg_price =
                (order.filled_avg_price * prev_abs + fill.price * fill_abs) / total_abs;
        }
        order.filled_size = new_filled;

        let status = if new_filled.abs() == order.size.abs() {
            order.filled_ts = Some(fill.ts);
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        // The fill itself cannot move the status backwards.
        if status > order.status {
            order.status = status;
        }
        let snapshot = order.clone();
        Self::index_status(&mut self.standing, &mut self.canceled, &snapshot);
        self.applied_fills.insert(fill.fill_id);
        Ok(())
    }

    /// Record local cancel intent. True cancellation is adopted only when
    /// the broker echoes `Canceled` through `on_order_status`.
    pub fn on_cancel(&mut self, id: u64, ts: Timestamp) -> Result<(), CoreError> {
        let order = self.orders.get_mut(&id).ok_or(CoreError::OrphanCancel(id))?;
        if order.status < OrderStatus::PendingCancel {
            order.status = OrderStatus::PendingCancel;
            order.canceled_ts = Some(ts);
            let snapshot = order.clone();
            Self::index_status(&mut self.standing, &mut self.canceled, &snapshot);
        } else {
            warn!(id, status = ?order.status, "cancel on finished order ignored");
        }
        Ok(())
    }

    pub fn order(&self, id: u64) -> Option<&Order> {
        self.orders.get(&id)
    }

    fn count_matching(&self, ids: &AHashSet<u64>, strategy: Option<StrategyId>) -> usize {
        match strategy {
            None => ids.len(),
            Some(sid) => ids
                .iter()
                .filter(|id| {
                    self.orders
                        .get(id)
                        .map(|o| o.strategy_id == sid)
                        .unwrap_or(false)
                })
                .count(),
        }
    }

    /// Non-canceled orders, optionally for one strategy.
    pub fn order_count(&self, strategy: Option<StrategyId>) -> usize {
        match strategy {
            None => self.orders.len() - self.canceled.len(),
            Some(sid) => self
                .orders
                .values()
                .filter(|o| o.strategy_id == sid && o.status != OrderStatus::Canceled)
                .count(),
        }
    }

    pub fn canceled_count(&self, strategy: Option<StrategyId>) -> usize {
        self.count_matching(&self.canceled, strategy)
    }

    pub fn standing_count(&self, strategy: Option<StrategyId>) -> usize {
        self.count_matching(&self.standing, strategy)
    }

    pub fn standing_ids(&self) -> impl Iterator<Item = &u64> {
        self.standing.iter()
    }

    /// Orders are destroyed only here, never mid-session.
    pub fn reset(&mut self) {
        self.orders.clear();
        self.standing.clear();
        self.canceled.clear();
        self.applied_fills.clear();
    }
}

impl Default for OrderManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderKind;
    use chrono::Utc;

    fn order(id: u64, symbol: &str, size: i64, status: OrderStatus) -> Order {
        let mut o = Order::new(symbol, OrderKind::Market, size, Utc::now());
        o.id = id;
        o.status = status;
        o
    }

    fn fill(fill_id: u64, order_id: u64, symbol: &str, price: i64, size: i64) -> Fill {
        Fill {
            fill_id,
            order_id,
            symbol: symbol.to_string(),
            price: Decimal::from(price),
            size,
            commission: Decimal::ONE,
            exchange: "SIM".to_string(),
            ts: Utc::now(),
            strategy_id: 1,
        }
    }

    #[test]
    fn status_ordinal_never_decreases() {
        let mut om = OrderManager::new();
        om.on_order_status(&order(1, "SPY STK", 10, OrderStatus::Submitted))
            .unwrap();
        // Stale update: applied as a no-op.
        om.on_order_status(&order(1, "SPY STK", 10, OrderStatus::Newborn))
            .unwrap();
        assert_eq!(om.order(1).unwrap().status, OrderStatus::Submitted);

        om.on_order_status(&order(1, "SPY STK", 10, OrderStatus::Filled))
            .unwrap();
        assert_eq!(om.order(1).unwrap().status, OrderStatus::Filled);
        assert_eq!(om.standing_count(None), 0);
    }

    #[test]
    fn symbol_mismatch_is_rejected_without_mutation() {
        let mut om = OrderManager::new();
        om.on_order_status(&order(1, "SPY STK", 10, OrderStatus::Newborn))
            .unwrap();
        let err = om
            .on_order_status(&order(1, "QQQ STK", 10, OrderStatus::Filled))
            .unwrap_err();
        assert!(matches!(err, CoreError::SymbolMismatch { id: 1, .. }));
        assert_eq!(om.order(1).unwrap().status, OrderStatus::Newborn);
        assert_eq!(om.standing_count(None), 1);
    }

    #[test]
    fn cancel_moves_standing_to_canceled_on_broker_echo() {
        let mut om = OrderManager::new();
        om.on_order_status(&order(1, "SPY STK", 10, OrderStatus::Acknowledged))
            .unwrap();
        om.on_cancel(1, Utc::now()).unwrap();
        // Local intent only.
        assert_eq!(om.order(1).unwrap().status, OrderStatus::PendingCancel);
        assert_eq!(om.canceled_count(None), 0);

        om.on_order_status(&order(1, "SPY STK", 10, OrderStatus::Canceled))
            .unwrap();
        assert_eq!(om.canceled_count(None), 1);
        assert_eq!(om.standing_count(None), 0);
        assert_eq!(om.order_count(None), 0);

        assert_eq!(om.on_cancel(99, Utc::now()), Err(CoreError::OrphanCancel(99)));
    }

    #[test]
    fn fills_accumulate_vwap_and_finish_the_order() {
        let mut om = OrderManager::new();
        om.on_order_status(&order(1, "SPY STK", 10, OrderStatus::Submitted))
            .unwrap();

        om.on_fill(&fill(100, 1, "SPY STK", 10, 4)).unwrap();
        let o = om.order(1).unwrap();
        assert_eq!(o.status, OrderStatus::PartiallyFilled);
        assert_eq!(o.filled_size, 4);
        assert_eq!(o.filled_avg_price, Decimal::from(10));
        assert_eq!(om.standing_count(None), 1);

        om.on_fill(&fill(101, 1, "SPY STK", 12, 6)).unwrap();
        let o = om.order(1).unwrap();
        assert_eq!(o.status, OrderStatus::Filled);
        assert_eq!(o.filled_size, 10);
        // (10*4 + 12*6) / 10 = 11.2
        assert_eq!(o.filled_avg_price, Decimal::new(112, 1));
        assert_eq!(om.standing_count(None), 0);
    }

    #[test]
    fn duplicate_and_orphan_fills_are_rejected() {
        let mut om = OrderManager::new();
        om.on_order_status(&order(1, "SPY STK", 10, OrderStatus::Submitted))
            .unwrap();
        om.on_fill(&fill(100, 1, "SPY STK", 10, 10)).unwrap();

        assert_eq!(
            om.on_fill(&fill(100, 1, "SPY STK", 10, 10)),
            Err(CoreError::DuplicateFill(100))
        );
        assert!(matches!(
            om.on_fill(&fill(101, 42, "SPY STK", 10, 10)),
            Err(CoreError::OrphanFill { fill_id: 101, order_id: 42 })
        ));
        assert_eq!(om.order(1).unwrap().filled_size, 10);
    }

    #[test]
    fn overfill_is_rejected_without_mutation() {
        let mut om = OrderManager::new();
        om.on_order_status(&order(1, "SPY STK", 10, OrderStatus::Submitted))
            .unwrap();
        assert!(matches!(
            om.on_fill(&fill(100, 1, "SPY STK", 10, 11)),
            Err(CoreError::OverFill { id: 1, .. })
        ));
        assert_eq!(om.order(1).unwrap().filled_size, 0);
    }

    #[test]
    fn per_strategy_counts() {
        let mut om = OrderManager::new();
        let mut a = order(1, "SPY STK", 10, OrderStatus::Acknowledged);
        a.strategy_id = 1;
        let mut b = order(2, "SPY STK", -5, OrderStatus::Acknowledged);
        b.strategy_id = 2;
        om.on_order_status(&a).unwrap();
        om.on_order_status(&b).unwrap();

        assert_eq!(om.standing_count(None), 2);
        assert_eq!(om.standing_count(Some(1)), 1);
        assert_eq!(om.order_count(Some(2)), 1);
        assert_eq!(om.canceled_count(Some(2)), 0);
    }
}
