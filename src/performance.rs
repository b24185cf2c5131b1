// ===============================
// src/performance.rs
// ===============================
//
// Equity-curve and fill bookkeeping. One curve point per distinct
// timestamp: a slot stays open while updates keep arriving for the same
// timestamp and is committed when a later one appears. `close_out` commits
// the final open slot and must run after the session loop.

use rust_decimal::Decimal;
use tracing::info;

use crate::domain::{Fill, Timestamp};
use crate::metrics::{EQUITY, REALIZED_PNL};

#[derive(Debug, Clone)]
pub struct PerformanceSummary {
    pub initial_capital: Decimal,
    pub final_equity: Decimal,
    pub total_return_pct: Decimal,
    pub max_drawdown_pct: Decimal,
    pub fill_count: usize,
    pub commission_total: Decimal,
    pub points: usize,
}

pub struct PerformanceManager {
    initial_capital: Decimal,
    curve: Vec<(Timestamp, Decimal)>,
    open_slot: Option<(Timestamp, Decimal)>,
    fills: Vec<Fill>,
    commission_total: Decimal,
}

impl PerformanceManager {
    pub fn new(initial_capital: Decimal) -> Self {
        PerformanceManager {
            initial_capital,
            curve: Vec::new(),
            open_slot: None,
            fills: Vec::new(),
            commission_total: Decimal::ZERO,
        }
    }

    /// Record account equity as of `ts`. A repeat of the open timestamp
    /// overwrites in place; a later timestamp commits the open slot first.
    pub fn update_performance(&mut self, ts: Timestamp, equity: Decimal) {
        match self.open_slot {
            Some((open_ts, _)) if open_ts == ts => {
                self.open_slot = Some((ts, equity));
            }
            Some(slot) => {
                self.curve.push(slot);
                self.open_slot = Some((ts, equity));
            }
            None => {
                self.open_slot = Some((ts, equity));
            }
        }
        EQUITY.set(decimal_to_f64(equity));
    }

    pub fn on_fill(&mut self, fill: &Fill) {
        self.commission_total += fill.commission;
        self.fills.push(fill.clone());
    }

    pub fn record_realized_pnl(&self, pnl: Decimal) {
        REALIZED_PNL.set(decimal_to_f64(pnl));
    }

    /// Commit the final open slot. Mandatory after the session loop, or the
    /// last timestamp never reaches the curve.
    pub fn close_out(&mut self) {
        if let Some(slot) = self.open_slot.take() {
            self.curve.push(slot);
        }
    }

    pub fn equity_curve(&self) -> &[(Timestamp, Decimal)] {
        &self.curve
    }

    pub fn fills(&self) -> &[Fill] {
        &self.fills
    }

    pub fn summary(&self) -> PerformanceSummary {
        let final_equity = self
            .curve
            .last()
            .map(|(_, e)| *e)
            .unwrap_or(self.initial_capital);
        let hundred = Decimal::from(100);
        let total_return_pct = if self.initial_capital.is_zero() {
            Decimal::ZERO
        } else {
            (final_equity - self.initial_capital) / self.initial_capital * hundred
        };

        let mut peak = self.initial_capital;
        let mut max_drawdown_pct = Decimal::ZERO;
        for (_, equity) in &self.curve {
            if *equity > peak {
                peak = *equity;
            } else if !peak.is_zero() {
                let dd = (peak - *equity) / peak * hundred;
                if dd > max_drawdown_pct {
                    max_drawdown_pct = dd;
                }
            }
        }

        let summary = PerformanceSummary {
            initial_capital: self.initial_capital,
            final_equity,
            total_return_pct,
            max_drawdown_pct,
            fill_count: self.fills.len(),
            commission_total: self.commission_total,
            points: self.curve.len(),
        };
        info!(
            final_equity = %summary.final_equity,
            return_pct = %summary.total_return_pct,
            drawdown_pct = %summary.max_drawdown_pct,
            fills = summary.fill_count,
            "performance summary"
        );
        summary
    }

    pub fn reset(&mut self, capital: Decimal) {
        self.initial_capital = capital;
        self.curve.clear();
        self.open_slot = None;
        self.fills.clear();
        self.commission_total = Decimal::ZERO;
    }
}

fn decimal_to_f64(d: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    d.to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn fill(commission: i64) -> Fill {
        Fill {
            fill_id: 0,
            order_id: 0,
            symbol: "SPY STK".to_string(),
            price: Decimal::from(10),
            size: 1,
            commission: Decimal::from(commission),
            exchange: "SIM".to_string(),
            ts: Utc::now(),
            strategy_id: 1,
        }
    }

    #[test]
    fn one_curve_point_per_distinct_timestamp() {
        let mut perf = PerformanceManager::new(Decimal::from(100_000));
        let t0 = Utc::now();

        perf.update_performance(t0, Decimal::from(100_000));
        // Same timestamp: overwrites the open slot.
        perf.update_performance(t0, Decimal::from(100_010));
        perf.update_performance(t0 + Duration::minutes(1), Decimal::from(100_020));
        assert_eq!(perf.equity_curve().len(), 1);
        assert_eq!(perf.equity_curve()[0].1, Decimal::from(100_010));

        perf.close_out();
        assert_eq!(perf.equity_curve().len(), 2);
        assert_eq!(perf.equity_curve()[1].1, Decimal::from(100_020));
    }

    #[test]
    fn close_out_without_updates_is_a_no_op() {
        let mut perf = PerformanceManager::new(Decimal::from(100_000));
        perf.close_out();
        assert!(perf.equity_curve().is_empty());
        let summary = perf.summary();
        assert_eq!(summary.final_equity, Decimal::from(100_000));
        assert_eq!(summary.total_return_pct, Decimal::ZERO);
    }

    #[test]
    fn summary_return_and_drawdown() {
        let mut perf = PerformanceManager::new(Decimal::from(1000));
        let t0 = Utc::now();
        for (i, equity) in [1000, 1200, 900, 1100].into_iter().enumerate() {
            perf.update_performance(t0 + Duration::minutes(i as i64), Decimal::from(equity));
        }
        perf.on_fill(&fill(1));
        perf.on_fill(&fill(2));
        perf.close_out();

        let summary = perf.summary();
        assert_eq!(summary.final_equity, Decimal::from(1100));
        assert_eq!(summary.total_return_pct, Decimal::from(10));
        // Peak 1200 to trough 900 = 25%.
        assert_eq!(summary.max_drawdown_pct, Decimal::from(25));
        assert_eq!(summary.fill_count, 2);
        assert_eq!(summary.commission_total, Decimal::from(3));
        assert_eq!(summary.points, 4);
    }
}
