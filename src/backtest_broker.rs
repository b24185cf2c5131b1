// ===============================
// src/backtest_broker.rs
// ===============================
//
// Deterministic fill simulator for replay sessions. Matching always prices
// off the data board's historical close, never the raw tick, so fills and
// mark-to-market agree. An order that crosses at placement fills
// immediately; otherwise it stands and is re-evaluated on every tick of its
// instrument, in placement order.

use std::sync::{Arc, Mutex};

use ahash::AHashSet;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::bus::{lock, EventSender};
use crate::data_board::{root_of, DataBoard};
use crate::domain::{
    CoreError, Event, Fill, Order, OrderKind, OrderStatus, Tick, Timestamp,
};
use crate::gateway::Broker;
use crate::metrics::{EXEC_REPORTS, FILLS};

const SIM_EXCHANGE: &str = "SIM";

/// Per-fill commission keyed by the instrument markers in the symbol.
pub struct CommissionSchedule;

impl CommissionSchedule {
    pub fn commission(symbol: &str, price: Decimal, size: i64) -> Decimal {
        let qty = Decimal::from(size.abs());
        let notional = price * qty;
        if symbol.contains("STK") {
            // $0.005 per share, $1 minimum.
            (Decimal::new(5, 3) * qty).max(Decimal::ONE)
        } else if symbol.contains("FUT") {
            // $2.01 per contract, flat.
            Decimal::new(201, 2) * qty
        } else if symbol.contains("OPT") {
            // $0.70 per contract, $1 minimum.
            (Decimal::new(7, 1) * qty).max(Decimal::ONE)
        } else if symbol.contains("CASH") {
            // 0.2bp of notional, $2 minimum.
            (notional * Decimal::new(2, 5)).max(Decimal::from(2))
        } else {
            // 1bp of notional.
            notional * Decimal::new(1, 4)
        }
    }
}

pub struct BacktestBrokerage {
    board: Arc<Mutex<DataBoard>>,
    bus: EventSender,
    /// Resting orders in placement order, for deterministic re-evaluation.
    standing: Vec<Order>,
    subscriptions: AHashSet<String>,
    next_order_id: u64,
    next_fill_id: u64,
}

impl BacktestBrokerage {
    pub fn new(board: Arc<Mutex<DataBoard>>, bus: EventSender) -> Self {
        BacktestBrokerage {
            board,
            bus,
            standing: Vec::new(),
            subscriptions: AHashSet::new(),
            next_order_id: 1,
            next_fill_id: 1,
        }
    }

    pub fn standing_len(&self) -> usize {
        self.standing.len()
    }

    /// Does the order trade against `px` right now? The trailing variant is
    /// checked as a plain stop; its stop price is ratcheted separately.
    fn crosses(order: &Order, px: Decimal) -> bool {
        let buy = order.is_buy();
        match order.kind {
            OrderKind::Market => true,
            OrderKind::Limit => (buy && order.limit_price >= px) || (!buy && order.limit_price <= px),
            OrderKind::Stop | OrderKind::TrailingStop => {
                (buy && order.stop_price <= px) || (!buy && order.stop_price >= px)
            }
            OrderKind::StopLimit => {
                let stop_hit = (buy && order.stop_price <= px) || (!buy && order.stop_price >= px);
                let limit_ok =
                    (buy && order.limit_price >= px) || (!buy && order.limit_price <= px);
                stop_hit && limit_ok
            }
        }
    }

    /// Pull the trailing stop along with the price. `limit_price` carries
    /// the distance; the stop only ever tightens.
    fn ratchet(order: &mut Order, px: Decimal) {
        if order.kind != OrderKind::TrailingStop {
            return;
        }
        let candidate = if order.is_buy() {
            px + order.limit_price
        } else {
            px - order.limit_price
        };
        if order.stop_price.is_zero() {
            order.stop_price = candidate;
        } else if order.is_buy() {
            order.stop_price = order.stop_price.min(candidate);
        } else {
            order.stop_price = order.stop_price.max(candidate);
        }
    }

    /// Full fill at `px`: the matured order first, then its fill.
    fn fill(&mut self, mut order: Order, px: Decimal, ts: Timestamp) {
        order.status = OrderStatus::Filled;
        order.filled_size = order.size;
        order.filled_avg_price = px;
        order.filled_ts = Some(ts);
        let commission = CommissionSchedule::commission(&order.symbol, px, order.size);
        debug!(id = order.id, symbol = %order.symbol, %px, size = order.size, "simulated fill");
        self.bus.publish(Event::Order(order.clone()));
        self.bus.publish(Event::Fill(Fill {
            fill_id: self.next_fill_id,
            order_id: order.id,
            symbol: order.symbol,
            price: px,
            size: order.size,
            commission,
            exchange: SIM_EXCHANGE.to_string(),
            ts,
            strategy_id: order.strategy_id,
        }));
        self.next_fill_id += 1;
        FILLS.inc();
    }

    /// Re-evaluate resting orders against the close at `tick.ts`. Wired as
    /// an earlier tick handler than the data board's.
    pub fn on_tick(&mut self, tick: &Tick) {
        if self.standing.is_empty() {
            return;
        }
        let tick_root = root_of(&tick.symbol).to_string();
        let board = Arc::clone(&self.board);
        let mut remaining = Vec::with_capacity(self.standing.len());
        let resting = std::mem::take(&mut self.standing);
        for mut order in resting {
            if order.symbol != tick.symbol && root_of(&order.symbol) != tick_root {
                remaining.push(order);
                continue;
            }
            let px = lock(&board).hist_close(&order.symbol, tick.ts);
            let Some(px) = px else {
                remaining.push(order);
                continue;
            };
            Self::ratchet(&mut order, px);
            if Self::crosses(&order, px) {
                self.fill(order, px, tick.ts);
            } else {
                remaining.push(order);
            }
        }
        // Anything a fill handler placed synchronously arrives through the
        // bus, not here, so this replace is race-free.
        self.standing = remaining;
    }
}

impl Broker for BacktestBrokerage {
    fn next_order_id(&mut self) -> u64 {
        let id = self.next_order_id;
        self.next_order_id += 1;
        id
    }

    fn place_order(&mut self, order: &Order) -> Result<(), CoreError> {
        let px = lock(&self.board)
            .hist_close(&order.symbol, order.created_ts)
            .ok_or_else(|| CoreError::PriceUnavailable {
                symbol: order.symbol.clone(),
            })?;
        let mut order = order.clone();
        Self::ratchet(&mut order, px);
        if Self::crosses(&order, px) {
            let ts = order.created_ts;
            self.fill(order, px, ts);
            return Ok(());
        }
        order.status = OrderStatus::Acknowledged;
        self.bus.publish(Event::Order(order.clone()));
        EXEC_REPORTS.with_label_values(&["acknowledged"]).inc();
        self.standing.push(order);
        Ok(())
    }

    fn cancel_order(&mut self, id: u64) -> Result<(), CoreError> {
        let Some(pos) = self.standing.iter().position(|o| o.id == id) else {
            warn!(id, "cancel for order not resting at the simulator");
            return Err(CoreError::OrphanCancel(id));
        };
        let mut order = self.standing.remove(pos);
        order.status = OrderStatus::Canceled;
        order.canceled_ts = Some(lock(&self.board).current_ts());
        self.bus.publish(Event::Order(order));
        EXEC_REPORTS.with_label_values(&["canceled"]).inc();
        Ok(())
    }

    fn subscribe(&mut self, symbol: &str) {
        if self.subscriptions.insert(symbol.to_string()) {
            info!(%symbol, "simulator subscribed");
        }
    }

    fn unsubscribe(&mut self, symbol: &str) {
        self.subscriptions.remove(symbol);
    }
}
