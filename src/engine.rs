// ===============================
// src/engine.rs
// ===============================
//
// Backtest session assembly. Builds the shared components, wires them onto
// the replay bus in the canonical handler order, runs the feed to
// exhaustion, and settles the books. Tick handler order matters:
//
//   1. broker     re-evaluates standing orders
//   2. strategies react and queue new intents
//   3. valuation  marks positions and records equity
//   4. board      absorbs the tick (so 1-3 still saw the prior price)

use std::sync::{Arc, Mutex};

use rust_decimal::Decimal;
use tracing::info;

use crate::backtest_broker::BacktestBrokerage;
use crate::bus::{lock, ReplayEventBus};
use crate::config::{InstrumentTable, RiskConfig, StrategyConfig};
use crate::data_board::DataBoard;
use crate::domain::{Bar, CoreError, Event, EventKind, Position, StrategyId, ALL_SYMBOLS};
use crate::feed::BarFeed;
use crate::gateway::Broker;
use crate::metrics::TICKS;
use crate::order_manager::OrderManager;
use crate::performance::{PerformanceManager, PerformanceSummary};
use crate::positions::PositionManager;
use crate::risk::{RiskGate, RiskManager};
use crate::strategy::{Strategy, StrategyManager};

pub struct BacktestConfig {
    pub capital: Decimal,
    pub max_steps: Option<u64>,
    pub instruments: InstrumentTable,
    /// No config means an unlimited gate that still adopts any per-strategy
    /// limits carried by strategy configs.
    pub risk: Option<RiskConfig>,
}

impl BacktestConfig {
    pub fn new(capital: Decimal) -> Self {
        BacktestConfig {
            capital,
            max_steps: None,
            instruments: InstrumentTable::new(),
            risk: None,
        }
    }
}

#[derive(Debug)]
pub struct BacktestReport {
    pub steps: u64,
    pub cash: Decimal,
    pub total_equity: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub positions: Vec<Position>,
    pub summary: PerformanceSummary,
}

pub struct BacktestEngine {
    bus: ReplayEventBus,
    feed: BarFeed,
    board: Arc<Mutex<DataBoard>>,
    positions: Arc<Mutex<PositionManager>>,
    performance: Arc<Mutex<PerformanceManager>>,
    broker: Arc<Mutex<BacktestBrokerage>>,
    strategies: Arc<Mutex<StrategyManager>>,
}

impl BacktestEngine {
    pub fn new(config: BacktestConfig) -> Self {
        let mut bus = ReplayEventBus::new();
        if let Some(budget) = config.max_steps {
            bus = bus.with_step_budget(budget);
        }

        let board = Arc::new(Mutex::new(DataBoard::new()));
        let orders = Arc::new(Mutex::new(OrderManager::new()));
        let positions = Arc::new(Mutex::new(PositionManager::new(
            config.capital,
            config.instruments,
        )));
        let performance = Arc::new(Mutex::new(PerformanceManager::new(config.capital)));
        let broker = Arc::new(Mutex::new(BacktestBrokerage::new(
            Arc::clone(&board),
            bus.sender(),
        )));
        let risk: Box<dyn RiskGate> =
            Box::new(RiskManager::new(config.risk.unwrap_or_default()));
        let strategies = Arc::new(Mutex::new(StrategyManager::new(
            Arc::clone(&board),
            Arc::clone(&orders),
            Arc::clone(&positions),
            Arc::clone(&performance),
            Arc::clone(&broker) as Arc<Mutex<dyn Broker>>,
            risk,
        )));

        {
            let broker = Arc::clone(&broker);
            bus.register(
                EventKind::Tick,
                "broker",
                Box::new(move |ev| {
                    if let Event::Tick(tick) = ev {
                        lock(&broker).on_tick(tick);
                    }
                }),
            );
        }
        {
            let strategies = Arc::clone(&strategies);
            bus.register(
                EventKind::Tick,
                "strategies",
                Box::new(move |ev| {
                    if let Event::Tick(tick) = ev {
                        TICKS.with_label_values(&[tick.symbol.as_str()]).inc();
                        lock(&strategies).on_tick(tick);
                    }
                }),
            );
        }
        {
            let board = Arc::clone(&board);
            let positions = Arc::clone(&positions);
            let performance = Arc::clone(&performance);
            bus.register(
                EventKind::Tick,
                "valuation",
                Box::new(move |ev| {
                    if let Event::Tick(tick) = ev {
                        let board = lock(&board);
                        let mut positions = lock(&positions);
                        positions.mark_to_market(tick.ts, &tick.symbol, Some(tick.price), &board);
                        lock(&performance).update_performance(tick.ts, positions.total_equity());
                    }
                }),
            );
        }
        {
            // Last, so every other tick handler priced off the prior tick.
            let board = Arc::clone(&board);
            bus.register(
                EventKind::Tick,
                "board",
                Box::new(move |ev| {
                    if let Event::Tick(tick) = ev {
                        lock(&board).on_tick(tick);
                    }
                }),
            );
        }
        {
            let strategies = Arc::clone(&strategies);
            bus.register(
                EventKind::Order,
                "strategies",
                Box::new(move |ev| {
                    if let Event::Order(order) = ev {
                        lock(&strategies).on_order_status(order);
                    }
                }),
            );
        }
        {
            let strategies = Arc::clone(&strategies);
            bus.register(
                EventKind::Fill,
                "strategies",
                Box::new(move |ev| {
                    if let Event::Fill(fill) = ev {
                        lock(&strategies).on_fill(fill);
                    }
                }),
            );
        }
        {
            let positions = Arc::clone(&positions);
            bus.register(
                EventKind::Contract,
                "positions",
                Box::new(move |ev| {
                    if let Event::Contract(contract) = ev {
                        lock(&positions).upsert_instrument(&contract.symbol, contract.multiplier);
                    }
                }),
            );
        }
        {
            let board = Arc::clone(&board);
            let positions = Arc::clone(&positions);
            let performance = Arc::clone(&performance);
            bus.register(
                EventKind::Timer,
                "valuation",
                Box::new(move |ev| {
                    if let Event::Timer(ts) = ev {
                        let board = lock(&board);
                        let mut positions = lock(&positions);
                        positions.mark_to_market(*ts, ALL_SYMBOLS, None, &board);
                        lock(&performance).update_performance(*ts, positions.total_equity());
                    }
                }),
            );
        }

        BacktestEngine {
            bus,
            feed: BarFeed::new(),
            board,
            positions,
            performance,
            broker,
            strategies,
        }
    }

    /// History feeds both the board (for matching and valuation) and the
    /// replay feed (as the tick stream).
    pub fn load_history(&mut self, symbol: &str, bars: Vec<Bar>) {
        lock(&self.board).load_history(symbol, bars.clone());
        self.feed.add_bars(symbol, bars);
        lock(&self.broker).subscribe(symbol);
    }

    pub fn add_strategy(
        &mut self,
        strategy: Box<dyn Strategy>,
        config: &StrategyConfig,
    ) -> Result<StrategyId, CoreError> {
        lock(&self.strategies).add_strategy(strategy, config)
    }

    /// Run to feed exhaustion, then settle: one final full mark-to-market at
    /// the last seen timestamp and the mandatory equity-curve close-out.
    pub fn run(mut self) -> BacktestReport {
        let steps = self.bus.run(&mut self.feed);

        let (cash, total_equity, realized_pnl, unrealized_pnl, positions) = {
            let board = lock(&self.board);
            let mut positions = lock(&self.positions);
            let ts = board.current_ts();
            positions.mark_to_market(ts, ALL_SYMBOLS, None, &board);
            let mut performance = lock(&self.performance);
            performance.update_performance(ts, positions.total_equity());
            performance.close_out();
            let mut held: Vec<Position> = positions.positions().cloned().collect();
            held.sort_by(|a, b| a.symbol.cmp(&b.symbol));
            (
                positions.cash,
                positions.total_equity(),
                positions.realized_pnl(),
                positions.unrealized_pnl(),
                held,
            )
        };
        let summary = lock(&self.performance).summary();
        info!(steps, equity = %total_equity, "backtest complete");

        BacktestReport {
            steps,
            cash,
            total_equity,
            realized_pnl,
            unrealized_pnl,
            positions,
            summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Timestamp;
    use crate::strategies::BuyAndHold;
    use chrono::{Duration, Utc};

    fn bar(ts: Timestamp, close: i64) -> Bar {
        Bar {
            ts,
            open: Decimal::from(close),
            high: Decimal::from(close),
            low: Decimal::from(close),
            close: Decimal::from(close),
            volume: 1000,
        }
    }

    fn bars(t0: Timestamp, closes: &[i64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| bar(t0 + Duration::minutes(i as i64), *c))
            .collect()
    }

    #[test]
    fn buy_and_hold_settles_to_cash_plus_marked_position() {
        let capital = Decimal::from(100_000);
        let mut engine = BacktestEngine::new(BacktestConfig::new(capital));
        let t0 = Utc::now();
        engine.load_history("SPY STK", bars(t0, &[100, 110, 120]));
        engine
            .add_strategy(
                Box::new(BuyAndHold::new(capital)),
                &StrategyConfig::new("buyhold", capital, vec!["SPY STK".into()]),
            )
            .unwrap();

        let report = engine.run();
        // floor(100000 / 100) shares at 100, STK commission 0.005 * 1000 = 5.
        let position = &report.positions[0];
        assert_eq!(position.size, 1000);
        assert_eq!(report.cash, Decimal::from(-5));
        assert_eq!(report.total_equity, Decimal::from(119_995));
        assert_eq!(report.total_equity, report.cash + Decimal::from(1000 * 120));
        // 3 ticks + the fill's order update + the fill itself.
        assert_eq!(report.steps, 5);
        assert_eq!(report.summary.fill_count, 1);
        assert_eq!(report.summary.points, 3);
        assert_eq!(
            report.summary.final_equity,
            report.total_equity
        );
    }

    #[test]
    fn no_strategy_means_equity_stays_at_capital() {
        let capital = Decimal::from(50_000);
        let mut engine = BacktestEngine::new(BacktestConfig::new(capital));
        let t0 = Utc::now();
        engine.load_history("SPY STK", bars(t0, &[100, 90, 80]));

        let report = engine.run();
        assert_eq!(report.steps, 3);
        assert_eq!(report.cash, capital);
        assert_eq!(report.total_equity, capital);
        assert!(report.positions.is_empty());
        assert_eq!(report.summary.total_return_pct, Decimal::ZERO);
    }

    #[test]
    fn step_budget_truncates_the_session() {
        let capital = Decimal::from(100_000);
        let mut config = BacktestConfig::new(capital);
        config.max_steps = Some(2);
        let mut engine = BacktestEngine::new(config);
        let t0 = Utc::now();
        engine.load_history("SPY STK", bars(t0, &[100, 110, 120, 130]));

        let report = engine.run();
        assert_eq!(report.steps, 2);
    }
}
