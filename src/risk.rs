// ===============================
// src/risk.rs
// ===============================
//
// Pre-trade compliance. Every order and cancel intent passes a `RiskGate`
// before it reaches the broker; a breach vetoes the intent (warn + drop),
// it never aborts the session. Flatten liquidations bypass the gate.

use chrono::Timelike;
use thiserror::Error;
use tracing::warn;

use crate::config::{RiskConfig, RiskLimits};
use crate::domain::{Order, StrategyId, Timestamp};
use crate::metrics::RISK_VETOES;
use crate::order_manager::OrderManager;
use crate::positions::PositionManager;
use rust_decimal::Decimal;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RiskBreach {
    #[error("order at {0} outside the trading window")]
    OutsideWindow(Timestamp),
    #[error("order size {size} exceeds limit {limit}")]
    SizeExceeded { size: i64, limit: i64 },
    #[error("order count {count} at limit {limit}")]
    TooManyOrders { count: usize, limit: usize },
    #[error("cancel count {count} at limit {limit}")]
    TooManyCancels { count: usize, limit: usize },
    #[error("standing order count {count} at limit {limit}")]
    TooManyStanding { count: usize, limit: usize },
    #[error("aggregate loss {loss} exceeds cap {cap}")]
    LossCapExceeded { loss: Decimal, cap: Decimal },
}

impl RiskBreach {
    fn label(&self) -> &'static str {
        match self {
            RiskBreach::OutsideWindow(_) => "window",
            RiskBreach::SizeExceeded { .. } => "size",
            RiskBreach::TooManyOrders { .. } => "orders",
            RiskBreach::TooManyCancels { .. } => "cancels",
            RiskBreach::TooManyStanding { .. } => "standing",
            RiskBreach::LossCapExceeded { .. } => "loss",
        }
    }
}

/// Pre-trade gate in front of the broker.
pub trait RiskGate: Send {
    /// Adopt limits carried in a strategy's own config record. Gates that
    /// cannot enforce them must say so rather than drop them silently.
    fn set_strategy_limits(&mut self, strategy_id: StrategyId, _limits: RiskLimits) {
        warn!(strategy_id, "gate cannot enforce per-strategy limits, ignored");
    }

    fn check_order(
        &self,
        order: &Order,
        orders: &OrderManager,
        positions: &PositionManager,
    ) -> Result<(), RiskBreach>;

    fn check_cancel(
        &self,
        id: u64,
        strategy_id: StrategyId,
        orders: &OrderManager,
    ) -> Result<(), RiskBreach>;
}

/// Gate that admits everything.
#[derive(Default)]
pub struct PassThroughRisk;

impl RiskGate for PassThroughRisk {
    fn check_order(
        &self,
        _order: &Order,
        _orders: &OrderManager,
        _positions: &PositionManager,
    ) -> Result<(), RiskBreach> {
        Ok(())
    }

    fn check_cancel(
        &self,
        _id: u64,
        _strategy_id: StrategyId,
        _orders: &OrderManager,
    ) -> Result<(), RiskBreach> {
        Ok(())
    }
}

/// Enforcing gate: global limits apply to the whole account, per-strategy
/// limits to that strategy's own orders.
pub struct RiskManager {
    config: RiskConfig,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        RiskManager { config }
    }

    fn check_order_limits(
        limits: &RiskLimits,
        scope: Option<StrategyId>,
        order: &Order,
        orders: &OrderManager,
        positions: &PositionManager,
    ) -> Result<(), RiskBreach> {
        if let Some((start, end)) = limits.trade_window {
            let tod = order.created_ts.time();
            // Truncate to whole seconds so bar timestamps compare cleanly.
            let tod = tod.with_nanosecond(0).unwrap_or(tod);
            if tod < start || tod >= end {
                return Err(RiskBreach::OutsideWindow(order.created_ts));
            }
        }
        if let Some(limit) = limits.max_order_size {
            if order.size.abs() > limit {
                return Err(RiskBreach::SizeExceeded {
                    size: order.size.abs(),
                    limit,
                });
            }
        }
        if let Some(limit) = limits.max_order_count {
            let count = orders.order_count(scope);
            if count >= limit {
                return Err(RiskBreach::TooManyOrders { count, limit });
            }
        }
        if let Some(limit) = limits.max_standing_count {
            let count = orders.standing_count(scope);
            if count >= limit {
                return Err(RiskBreach::TooManyStanding { count, limit });
            }
        }
        if let Some(cap) = limits.max_loss {
            // Account-level drawdown, regardless of scope.
            let loss = positions.initial_capital() - positions.total_equity();
            if loss > cap {
                return Err(RiskBreach::LossCapExceeded { loss, cap });
            }
        }
        Ok(())
    }

    fn check_cancel_limits(
        limits: &RiskLimits,
        scope: Option<StrategyId>,
        orders: &OrderManager,
    ) -> Result<(), RiskBreach> {
        if let Some(limit) = limits.max_cancel_count {
            let count = orders.canceled_count(scope);
            if count >= limit {
                return Err(RiskBreach::TooManyCancels { count, limit });
            }
        }
        Ok(())
    }
}

impl RiskGate for RiskManager {
    fn set_strategy_limits(&mut self, strategy_id: StrategyId, limits: RiskLimits) {
        self.config.per_strategy.insert(strategy_id, limits);
    }

    fn check_order(
        &self,
        order: &Order,
        orders: &OrderManager,
        positions: &PositionManager,
    ) -> Result<(), RiskBreach> {
        let outcome = Self::check_order_limits(&self.config.global, None, order, orders, positions)
            .and_then(|_| match self.config.per_strategy.get(&order.strategy_id) {
                Some(limits) => Self::check_order_limits(
                    limits,
                    Some(order.strategy_id),
                    order,
                    orders,
                    positions,
                ),
                None => Ok(()),
            });
        if let Err(breach) = &outcome {
            warn!(id = order.id, strategy = order.strategy_id, %breach, "order vetoed");
            RISK_VETOES.with_label_values(&[breach.label()]).inc();
        }
        outcome
    }

    fn check_cancel(
        &self,
        id: u64,
        strategy_id: StrategyId,
        orders: &OrderManager,
    ) -> Result<(), RiskBreach> {
        let outcome = Self::check_cancel_limits(&self.config.global, None, orders).and_then(|_| {
            match self.config.per_strategy.get(&strategy_id) {
                Some(limits) => Self::check_cancel_limits(limits, Some(strategy_id), orders),
                None => Ok(()),
            }
        });
        if let Err(breach) = &outcome {
            warn!(id, strategy = strategy_id, %breach, "cancel vetoed");
            RISK_VETOES.with_label_values(&[breach.label()]).inc();
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstrumentTable;
    use crate::domain::OrderStatus;
    use chrono::{NaiveTime, TimeZone, Utc};

    fn order(id: u64, size: i64, strategy_id: StrategyId, ts: Timestamp) -> Order {
        let mut o = Order::market("SPY STK", size, ts);
        o.id = id;
        o.strategy_id = strategy_id;
        o
    }

    fn positions(capital: i64) -> PositionManager {
        PositionManager::new(Decimal::from(capital), InstrumentTable::new())
    }

    fn manager(global: RiskLimits) -> RiskManager {
        RiskManager::new(RiskConfig {
            global,
            per_strategy: Default::default(),
        })
    }

    #[test]
    fn pass_through_admits_everything() {
        let gate = PassThroughRisk;
        let om = OrderManager::new();
        let pm = positions(100_000);
        assert!(gate.check_order(&order(1, 1_000_000, 1, Utc::now()), &om, &pm).is_ok());
        assert!(gate.check_cancel(99, 1, &om).is_ok());
    }

    #[test]
    fn window_and_size_limits() {
        let gate = manager(RiskLimits {
            trade_window: Some((
                NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
                NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
            )),
            max_order_size: Some(100),
            ..Default::default()
        });
        let om = OrderManager::new();
        let pm = positions(100_000);

        let in_window = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let after_close = Utc.with_ymd_and_hms(2024, 3, 1, 16, 0, 0).unwrap();
        assert!(gate.check_order(&order(1, 100, 1, in_window), &om, &pm).is_ok());
        assert_eq!(
            gate.check_order(&order(2, 100, 1, after_close), &om, &pm),
            Err(RiskBreach::OutsideWindow(after_close))
        );
        // Signed sells count by magnitude.
        assert_eq!(
            gate.check_order(&order(3, -101, 1, in_window), &om, &pm),
            Err(RiskBreach::SizeExceeded { size: 101, limit: 100 })
        );
    }

    #[test]
    fn count_limits_consult_the_order_manager() {
        let gate = manager(RiskLimits {
            max_order_count: Some(1),
            max_standing_count: Some(1),
            max_cancel_count: Some(1),
            ..Default::default()
        });
        let mut om = OrderManager::new();
        let pm = positions(100_000);
        let now = Utc::now();

        assert!(gate.check_order(&order(1, 1, 1, now), &om, &pm).is_ok());
        let mut standing = order(1, 1, 1, now);
        standing.status = OrderStatus::Acknowledged;
        om.on_order_status(&standing).unwrap();

        assert_eq!(
            gate.check_order(&order(2, 1, 1, now), &om, &pm),
            Err(RiskBreach::TooManyOrders { count: 1, limit: 1 })
        );

        assert!(gate.check_cancel(1, 1, &om).is_ok());
        let mut canceled = standing.clone();
        canceled.status = OrderStatus::Canceled;
        om.on_order_status(&canceled).unwrap();
        assert_eq!(
            gate.check_cancel(1, 1, &om),
            Err(RiskBreach::TooManyCancels { count: 1, limit: 1 })
        );
    }

    #[test]
    fn per_strategy_limits_only_bind_their_strategy() {
        let mut per_strategy = ahash::AHashMap::new();
        per_strategy.insert(
            2,
            RiskLimits {
                max_order_size: Some(10),
                ..Default::default()
            },
        );
        let gate = RiskManager::new(RiskConfig {
            global: RiskLimits::default(),
            per_strategy,
        });
        let om = OrderManager::new();
        let pm = positions(100_000);
        let now = Utc::now();

        assert!(gate.check_order(&order(1, 500, 1, now), &om, &pm).is_ok());
        assert_eq!(
            gate.check_order(&order(2, 500, 2, now), &om, &pm),
            Err(RiskBreach::SizeExceeded { size: 500, limit: 10 })
        );
    }

    #[test]
    fn adopted_strategy_limits_are_enforced() {
        let mut gate = manager(RiskLimits::default());
        let om = OrderManager::new();
        let pm = positions(100_000);
        let now = Utc::now();

        assert!(gate.check_order(&order(1, 500, 3, now), &om, &pm).is_ok());
        gate.set_strategy_limits(
            3,
            RiskLimits {
                max_order_size: Some(100),
                ..Default::default()
            },
        );
        assert_eq!(
            gate.check_order(&order(2, 500, 3, now), &om, &pm),
            Err(RiskBreach::SizeExceeded { size: 500, limit: 100 })
        );
    }

    #[test]
    fn loss_cap_tracks_equity_drawdown() {
        let gate = manager(RiskLimits {
            max_loss: Some(Decimal::from(50)),
            ..Default::default()
        });
        let om = OrderManager::new();
        let mut pm = positions(100_000);
        let now = Utc::now();
        assert!(gate.check_order(&order(1, 1, 1, now), &om, &pm).is_ok());

        // Lose 100 on a round trip: drawdown 100 > cap 50.
        let mut board = crate::data_board::DataBoard::new();
        board.on_tick(&crate::domain::Tick::trade("SPY STK", Decimal::from(10), 1, now));
        pm.on_fill(&crate::domain::Fill {
            fill_id: 1,
            order_id: 1,
            symbol: "SPY STK".to_string(),
            price: Decimal::from(10),
            size: 10,
            commission: Decimal::ZERO,
            exchange: "SIM".to_string(),
            ts: now,
            strategy_id: 1,
        })
        .unwrap();
        pm.mark_to_market(now, "SPY STK", Some(Decimal::ZERO), &board);
        assert!(matches!(
            gate.check_order(&order(2, 1, 1, now), &om, &pm),
            Err(RiskBreach::LossCapExceeded { .. })
        ));
    }
}
