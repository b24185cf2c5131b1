// ===============================
// src/strategies.rs
// ===============================
//
// Bundled strategies. BuyAndHold is the reference for end-to-end checks;
// MeanReversion is the rolling-window fade that also drives the live demo.

use ahash::AHashSet;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use tracing::{debug, info};

use crate::config::ParamMap;
use crate::data_board::DataBoard;
use crate::domain::{CoreError, Fill, Tick};
use crate::strategy::{Strategy, StrategyContext};

fn param_decimal(key: &str, value: &serde_json::Value) -> Result<Decimal, CoreError> {
    let text = match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    text.parse().map_err(|_| CoreError::InvalidParam(key.to_string()))
}

fn param_usize(key: &str, value: &serde_json::Value) -> Result<usize, CoreError> {
    value
        .as_u64()
        .map(|v| v as usize)
        .ok_or_else(|| CoreError::InvalidParam(key.to_string()))
}

/// Spends its allocation on the first tick of each symbol and holds.
pub struct BuyAndHold {
    capital: Decimal,
    symbols: Vec<String>,
    bought: AHashSet<String>,
}

impl BuyAndHold {
    pub fn new(capital: Decimal) -> Self {
        BuyAndHold {
            capital,
            symbols: Vec::new(),
            bought: AHashSet::new(),
        }
    }
}

impl Strategy for BuyAndHold {
    fn name(&self) -> &str {
        "buy-and-hold"
    }

    fn set_params(&mut self, params: &ParamMap) -> Result<(), CoreError> {
        for (key, value) in params {
            match key.as_str() {
                "capital" => self.capital = param_decimal(key, value)?,
                _ => return Err(CoreError::UnknownParam(key.clone())),
            }
        }
        Ok(())
    }

    fn on_init(&mut self, _board: &DataBoard, symbols: &[String]) {
        self.symbols = symbols.to_vec();
    }

    fn on_tick(&mut self, tick: &Tick, ctx: &mut StrategyContext) {
        if self.bought.contains(&tick.symbol) || tick.price <= Decimal::ZERO {
            return;
        }
        let slots = Decimal::from(self.symbols.len().max(1));
        let size = (self.capital / slots / tick.price)
            .floor()
            .to_i64()
            .unwrap_or(0);
        if size > 0 {
            info!(symbol = %tick.symbol, size, price = %tick.price, "initial allocation");
            ctx.buy_market(&tick.symbol, size, tick.ts);
        }
        self.bought.insert(tick.symbol.clone());
    }

    fn on_fill(&mut self, fill: &Fill, _ctx: &mut StrategyContext) {
        debug!(symbol = %fill.symbol, size = fill.size, price = %fill.price, "allocation filled");
    }
}

/// Fades deviations from a rolling mean: buy when price sits `threshold`
/// below the window mean, sell when it sits that far above. At most one
/// open position per symbol direction.
pub struct MeanReversion {
    window: usize,
    threshold: Decimal,
    size: i64,
    prices: VecDeque<Decimal>,
}

impl MeanReversion {
    pub fn new(window: usize, threshold: Decimal, size: i64) -> Self {
        MeanReversion {
            window,
            threshold,
            size,
            prices: VecDeque::with_capacity(window),
        }
    }

    fn mean(&self) -> Option<Decimal> {
        if self.prices.len() < self.window {
            return None;
        }
        let sum: Decimal = self.prices.iter().copied().sum();
        Some(sum / Decimal::from(self.prices.len() as i64))
    }
}

impl Strategy for MeanReversion {
    fn name(&self) -> &str {
        "mean-reversion"
    }

    fn set_params(&mut self, params: &ParamMap) -> Result<(), CoreError> {
        for (key, value) in params {
            match key.as_str() {
                "window" => self.window = param_usize(key, value)?,
                "threshold" => self.threshold = param_decimal(key, value)?,
                "size" => {
                    self.size = value
                        .as_i64()
                        .ok_or_else(|| CoreError::InvalidParam(key.clone()))?;
                }
                _ => return Err(CoreError::UnknownParam(key.clone())),
            }
        }
        if self.window == 0 || self.size <= 0 {
            return Err(CoreError::InvalidParam("window/size".to_string()));
        }
        Ok(())
    }

    fn on_tick(&mut self, tick: &Tick, ctx: &mut StrategyContext) {
        if self.prices.len() == self.window {
            self.prices.pop_front();
        }
        self.prices.push_back(tick.price);
        let Some(mean) = self.mean() else { return };
        if mean.is_zero() {
            return;
        }
        let deviation = (tick.price - mean) / mean;
        let held = ctx.position_size(&tick.symbol);

        if deviation <= -self.threshold && held <= 0 {
            debug!(symbol = %tick.symbol, %deviation, "below mean, buying");
            ctx.buy_market(&tick.symbol, self.size, tick.ts);
        } else if deviation >= self.threshold && held >= 0 {
            debug!(symbol = %tick.symbol, %deviation, "above mean, selling");
            ctx.sell_market(&tick.symbol, self.size, tick.ts);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstrumentTable;
    use crate::order_manager::OrderManager;
    use crate::positions::PositionManager;
    use crate::strategy::Intent;
    use chrono::Utc;

    struct World {
        board: DataBoard,
        orders: OrderManager,
        positions: PositionManager,
    }

    fn world() -> World {
        World {
            board: DataBoard::new(),
            orders: OrderManager::new(),
            positions: PositionManager::new(Decimal::from(100_000), InstrumentTable::new()),
        }
    }

    fn drive(strategy: &mut dyn Strategy, world: &World, tick: &Tick) -> Vec<Intent> {
        let mut ctx = StrategyContext::new(1, &world.board, &world.orders, &world.positions);
        strategy.on_tick(tick, &mut ctx);
        ctx.intents
    }

    #[test]
    fn buy_and_hold_spends_allocation_once() {
        let world = world();
        let mut strategy = BuyAndHold::new(Decimal::from(100_000));
        strategy.on_init(&world.board, &["SPY STK".to_string()]);

        let tick = Tick::trade("SPY STK", Decimal::from(333), 1, Utc::now());
        let intents = drive(&mut strategy, &world, &tick);
        assert_eq!(intents.len(), 1);
        let Intent::Place(order) = &intents[0] else { panic!() };
        // floor(100000 / 333)
        assert_eq!(order.size, 300);

        // Subsequent ticks are ignored.
        assert!(drive(&mut strategy, &world, &tick).is_empty());
    }

    #[test]
    fn buy_and_hold_splits_capital_across_symbols() {
        let world = world();
        let mut strategy = BuyAndHold::new(Decimal::from(100_000));
        strategy.on_init(
            &world.board,
            &["SPY STK".to_string(), "QQQ STK".to_string()],
        );
        let tick = Tick::trade("SPY STK", Decimal::from(100), 1, Utc::now());
        let intents = drive(&mut strategy, &world, &tick);
        let Intent::Place(order) = &intents[0] else { panic!() };
        // floor(50000 / 100)
        assert_eq!(order.size, 500);
    }

    #[test]
    fn buy_and_hold_rejects_unknown_params() {
        let mut strategy = BuyAndHold::new(Decimal::from(100_000));
        let mut params = ParamMap::new();
        params.insert("leverage".to_string(), serde_json::json!(2));
        assert_eq!(
            strategy.set_params(&params),
            Err(CoreError::UnknownParam("leverage".to_string()))
        );

        let mut params = ParamMap::new();
        params.insert("capital".to_string(), serde_json::json!("250000"));
        strategy.set_params(&params).unwrap();
        assert_eq!(strategy.capital, Decimal::from(250_000));
    }

    #[test]
    fn mean_reversion_fades_a_dip_after_the_window_fills() {
        let world = world();
        let mut strategy = MeanReversion::new(3, Decimal::new(2, 2), 10);
        let ts = Utc::now();

        for price in [100, 100, 100] {
            let tick = Tick::trade("SPY STK", Decimal::from(price), 1, ts);
            assert!(drive(&mut strategy, &world, &tick).is_empty());
        }
        // 95 against a mean near 98.3: > 2% below, buys.
        let tick = Tick::trade("SPY STK", Decimal::from(95), 1, ts);
        let intents = drive(&mut strategy, &world, &tick);
        assert_eq!(intents.len(), 1);
        let Intent::Place(order) = &intents[0] else { panic!() };
        assert_eq!(order.size, 10);
    }

    #[test]
    fn mean_reversion_validates_params() {
        let mut strategy = MeanReversion::new(3, Decimal::new(2, 2), 10);
        let mut params = ParamMap::new();
        params.insert("window".to_string(), serde_json::json!(0));
        assert!(strategy.set_params(&params).is_err());

        let mut params = ParamMap::new();
        params.insert("window".to_string(), serde_json::json!(5));
        params.insert("threshold".to_string(), serde_json::json!("0.01"));
        params.insert("size".to_string(), serde_json::json!(25));
        strategy.set_params(&params).unwrap();
        assert_eq!(strategy.window, 5);
        assert_eq!(strategy.threshold, Decimal::new(1, 2));
        assert_eq!(strategy.size, 25);
    }
}
