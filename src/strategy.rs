// ===============================
// src/strategy.rs
// ===============================
//
// Strategy trait and the manager that fans events out to strategies. A
// strategy never touches the broker or the shared managers directly: during
// a callback it reads board/order/position state through `StrategyContext`
// and queues intents, which the manager flushes through the risk gate to
// the broker after the callback returns.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::bus::lock;
use crate::config::{ParamMap, StrategyConfig};
use crate::data_board::{root_of, DataBoard};
use crate::domain::{
    CoreError, Fill, Order, OrderStatus, StrategyId, Tick, Timestamp,
};
use crate::gateway::Broker;
use crate::metrics::ORDERS_PLACED;
use crate::order_manager::OrderManager;
use crate::performance::PerformanceManager;
use crate::positions::PositionManager;
use crate::risk::RiskGate;

/// Reserved id for orders the manager itself creates (flatten liquidations).
pub const MANUAL_STRATEGY: StrategyId = 0;

pub trait Strategy: Send {
    fn name(&self) -> &str;

    /// Validate and apply configuration parameters. Unknown keys are an
    /// error, as is a value of the wrong shape.
    fn set_params(&mut self, params: &ParamMap) -> Result<(), CoreError>;

    /// Called once before the first event, with history already loaded.
    fn on_init(&mut self, _board: &DataBoard, _symbols: &[String]) {}

    fn on_tick(&mut self, tick: &Tick, ctx: &mut StrategyContext);

    fn on_order_status(&mut self, _order: &Order) {}

    fn on_fill(&mut self, _fill: &Fill, _ctx: &mut StrategyContext) {}
}

pub(crate) enum Intent {
    Place(Order),
    Adjust {
        symbol: String,
        target: i64,
        strategy_id: StrategyId,
    },
    Cancel(u64),
}

/// Read view plus intent queue handed to a strategy for one callback.
pub struct StrategyContext<'a> {
    strategy_id: StrategyId,
    board: &'a DataBoard,
    orders: &'a OrderManager,
    positions: &'a PositionManager,
    pub(crate) intents: Vec<Intent>,
}

impl<'a> StrategyContext<'a> {
    pub(crate) fn new(
        strategy_id: StrategyId,
        board: &'a DataBoard,
        orders: &'a OrderManager,
        positions: &'a PositionManager,
    ) -> Self {
        StrategyContext {
            strategy_id,
            board,
            orders,
            positions,
            intents: Vec::new(),
        }
    }

    pub fn board(&self) -> &DataBoard {
        self.board
    }

    pub fn orders(&self) -> &OrderManager {
        self.orders
    }

    pub fn positions(&self) -> &PositionManager {
        self.positions
    }

    pub fn position_size(&self, symbol: &str) -> i64 {
        self.positions.position(symbol).map(|p| p.size).unwrap_or(0)
    }

    /// Queue an order intent. The manager stamps the id and owner before it
    /// reaches the risk gate.
    pub fn place(&mut self, mut order: Order) {
        order.strategy_id = self.strategy_id;
        self.intents.push(Intent::Place(order));
    }

    pub fn buy_market(&mut self, symbol: &str, size: i64, ts: Timestamp) {
        self.place(Order::market(symbol, size.abs(), ts));
    }

    pub fn sell_market(&mut self, symbol: &str, size: i64, ts: Timestamp) {
        self.place(Order::market(symbol, -size.abs(), ts));
    }

    /// Queue a sizing intent: the manager computes the market-order delta
    /// to `target` at flush time and routes it through the risk gate like
    /// any other order. Already at target means no order.
    pub fn adjust_position(&mut self, symbol: &str, target: i64) {
        self.intents.push(Intent::Adjust {
            symbol: symbol.to_string(),
            target,
            strategy_id: self.strategy_id,
        });
    }

    pub fn cancel(&mut self, order_id: u64) {
        self.intents.push(Intent::Cancel(order_id));
    }
}

struct StrategyEntry {
    id: StrategyId,
    strategy: Box<dyn Strategy>,
    symbols: Vec<String>,
    active: bool,
}

impl StrategyEntry {
    fn wants(&self, symbol: &str) -> bool {
        self.symbols
            .iter()
            .any(|s| s == symbol || root_of(s) == root_of(symbol))
    }
}

/// Owns the strategies and mediates everything between them and the shared
/// managers and broker.
pub struct StrategyManager {
    board: Arc<Mutex<DataBoard>>,
    orders: Arc<Mutex<OrderManager>>,
    positions: Arc<Mutex<PositionManager>>,
    performance: Arc<Mutex<PerformanceManager>>,
    broker: Arc<Mutex<dyn Broker>>,
    risk: Box<dyn RiskGate>,
    strategies: Vec<StrategyEntry>,
}

impl StrategyManager {
    pub fn new(
        board: Arc<Mutex<DataBoard>>,
        orders: Arc<Mutex<OrderManager>>,
        positions: Arc<Mutex<PositionManager>>,
        performance: Arc<Mutex<PerformanceManager>>,
        broker: Arc<Mutex<dyn Broker>>,
        risk: Box<dyn RiskGate>,
    ) -> Self {
        StrategyManager {
            board,
            orders,
            positions,
            performance,
            broker,
            risk,
            strategies: Vec::new(),
        }
    }

    /// Configure and adopt a strategy. Parameters are validated before the
    /// strategy sees any event; its symbols are subscribed at the broker.
    pub fn add_strategy(
        &mut self,
        mut strategy: Box<dyn Strategy>,
        config: &StrategyConfig,
    ) -> Result<StrategyId, CoreError> {
        strategy.set_params(&config.params)?;
        let id = self.strategies.len() as StrategyId + 1;
        if let Some(limits) = &config.risk {
            self.risk.set_strategy_limits(id, limits.clone());
        }
        {
            let board = lock(&self.board);
            strategy.on_init(&board, &config.symbols);
        }
        let mut broker = lock(&self.broker);
        for symbol in &config.symbols {
            broker.subscribe(symbol);
        }
        drop(broker);
        info!(id, name = strategy.name(), symbols = ?config.symbols, "strategy added");
        self.strategies.push(StrategyEntry {
            id,
            strategy,
            symbols: config.symbols.clone(),
            active: config.active,
        });
        Ok(id)
    }

    pub fn start_strategy(&mut self, id: StrategyId) {
        if let Some(entry) = self.strategies.iter_mut().find(|e| e.id == id) {
            entry.active = true;
            info!(id, "strategy started");
        }
    }

    /// Deactivate: the strategy stops receiving events, its standing orders
    /// are left alone.
    pub fn stop_strategy(&mut self, id: StrategyId) {
        if let Some(entry) = self.strategies.iter_mut().find(|e| e.id == id) {
            entry.active = false;
            info!(id, "strategy stopped");
        }
    }

    pub fn start_all(&mut self) {
        for entry in &mut self.strategies {
            entry.active = true;
        }
        info!("all strategies started");
    }

    pub fn stop_all(&mut self) {
        for entry in &mut self.strategies {
            entry.active = false;
        }
        info!("all strategies stopped");
    }

    pub fn on_tick(&mut self, tick: &Tick) {
        let mut intents = Vec::new();
        {
            let board = lock(&self.board);
            let orders = lock(&self.orders);
            let positions = lock(&self.positions);
            for entry in &mut self.strategies {
                if !entry.active || !entry.wants(&tick.symbol) {
                    continue;
                }
                let mut ctx = StrategyContext::new(entry.id, &board, &orders, &positions);
                entry.strategy.on_tick(tick, &mut ctx);
                intents.append(&mut ctx.intents);
            }
        }
        self.flush(intents, tick.ts);
    }

    /// Order updates flow into the registry first; only an accepted update
    /// reaches the owning strategy.
    pub fn on_order_status(&mut self, order: &Order) {
        if let Err(e) = lock(&self.orders).on_order_status(order) {
            warn!(id = order.id, %e, "order update rejected");
            return;
        }
        for entry in &mut self.strategies {
            if entry.id == order.strategy_id {
                entry.strategy.on_order_status(order);
            }
        }
    }

    /// A fill is applied to the order registry, the account, and the
    /// performance ledger, in that order, then routed to its strategy. A
    /// registry rejection (duplicate, orphan, overfill) stops the cascade.
    pub fn on_fill(&mut self, fill: &Fill) {
        if let Err(e) = lock(&self.orders).on_fill(fill) {
            warn!(fill_id = fill.fill_id, %e, "fill rejected");
            return;
        }
        {
            let mut positions = lock(&self.positions);
            if let Err(e) = positions.on_fill(fill) {
                warn!(fill_id = fill.fill_id, %e, "fill not applied to positions");
                return;
            }
            let mut performance = lock(&self.performance);
            performance.on_fill(fill);
            performance.record_realized_pnl(positions.realized_pnl());
        }

        let mut intents = Vec::new();
        {
            let board = lock(&self.board);
            let orders = lock(&self.orders);
            let positions = lock(&self.positions);
            for entry in &mut self.strategies {
                if entry.id != fill.strategy_id {
                    continue;
                }
                let mut ctx = StrategyContext::new(entry.id, &board, &orders, &positions);
                entry.strategy.on_fill(fill, &mut ctx);
                intents.append(&mut ctx.intents);
            }
        }
        self.flush(intents, fill.ts);
    }

    /// Liquidate every open position with manual market orders. Bypasses
    /// the risk gate: getting flat must always be possible.
    pub fn flatten_all(&mut self, ts: Timestamp) {
        let open: Vec<(String, i64)> = lock(&self.positions)
            .positions()
            .filter(|p| p.size != 0)
            .map(|p| (p.symbol.clone(), p.size))
            .collect();
        self.liquidate(open, ts);
    }

    /// Liquidate the positions attributable to one strategy, by its symbol
    /// subscriptions. Bypasses the risk gate like `flatten_all`.
    pub fn flatten(&mut self, id: StrategyId, ts: Timestamp) {
        let Some(entry) = self.strategies.iter().find(|e| e.id == id) else {
            warn!(id, "flatten for unknown strategy ignored");
            return;
        };
        let open: Vec<(String, i64)> = lock(&self.positions)
            .positions()
            .filter(|p| p.size != 0 && entry.wants(&p.symbol))
            .map(|p| (p.symbol.clone(), p.size))
            .collect();
        self.liquidate(open, ts);
    }

    fn liquidate(&mut self, open: Vec<(String, i64)>, ts: Timestamp) {
        for (symbol, size) in open {
            let mut order = Order::market(&symbol, -size, ts);
            order.strategy_id = MANUAL_STRATEGY;
            order.id = lock(&self.broker).next_order_id();
            info!(symbol = %order.symbol, size = order.size, "flatten order");
            if let Err(e) = lock(&self.orders).on_order_status(&order) {
                warn!(%e, "flatten order not recorded");
                continue;
            }
            ORDERS_PLACED.inc();
            if let Err(e) = lock(&self.broker).place_order(&order) {
                warn!(%e, "flatten order rejected by broker");
            }
        }
    }

    /// Single order path: id assignment, risk gate, registry record plus
    /// owner echo, then the broker.
    fn submit_order(&mut self, mut order: Order) {
        order.id = lock(&self.broker).next_order_id();
        order.status = OrderStatus::Newborn;
        {
            let orders = lock(&self.orders);
            let positions = lock(&self.positions);
            if self.risk.check_order(&order, &orders, &positions).is_err() {
                // Breach already logged and counted by the gate.
                return;
            }
        }
        if let Err(e) = lock(&self.orders).on_order_status(&order) {
            warn!(id = order.id, %e, "order not recorded");
            return;
        }
        // The owner learns about its newborn order before the broker does.
        for entry in &mut self.strategies {
            if entry.id == order.strategy_id {
                entry.strategy.on_order_status(&order);
            }
        }
        ORDERS_PLACED.inc();
        if let Err(e) = lock(&self.broker).place_order(&order) {
            warn!(id = order.id, %e, "broker rejected order");
            let mut errored = order;
            errored.status = OrderStatus::Error;
            let _ = lock(&self.orders).on_order_status(&errored);
        }
    }

    fn flush(&mut self, intents: Vec<Intent>, ts: Timestamp) {
        for intent in intents {
            match intent {
                Intent::Place(order) => self.submit_order(order),
                Intent::Adjust {
                    symbol,
                    target,
                    strategy_id,
                } => {
                    let current = lock(&self.positions)
                        .position(&symbol)
                        .map(|p| p.size)
                        .unwrap_or(0);
                    let delta = target - current;
                    if delta == 0 {
                        continue;
                    }
                    let mut order = Order::market(&symbol, delta, ts);
                    order.strategy_id = strategy_id;
                    self.submit_order(order);
                }
                Intent::Cancel(id) => {
                    let owner = lock(&self.orders)
                        .order(id)
                        .map(|o| o.strategy_id)
                        .unwrap_or(MANUAL_STRATEGY);
                    {
                        let orders = lock(&self.orders);
                        if self.risk.check_cancel(id, owner, &orders).is_err() {
                            continue;
                        }
                    }
                    if let Err(e) = lock(&self.orders).on_cancel(id, ts) {
                        warn!(id, %e, "cancel not recorded");
                        continue;
                    }
                    if let Err(e) = lock(&self.broker).cancel_order(id) {
                        warn!(id, %e, "broker rejected cancel");
                    }
                }
            }
        }
    }
}
