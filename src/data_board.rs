// ===============================
// src/data_board.rs
// ===============================
//
// Latest-tick cache plus the full historical price series per instrument.
// Both the fill simulator and the mark-to-market path price off this board
// so matching and revaluation always agree.

use ahash::AHashMap;
use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;

use crate::domain::{Bar, Tick, Timestamp};

/// Instrument root: the symbol's leading token ("ES FUT GLOBEX" -> "ES"),
/// falling back to its leading alphabetic run ("ESZ5" -> "ESZ").
pub fn root_of(symbol: &str) -> &str {
    if let Some((head, _)) = symbol.split_once(' ') {
        return head;
    }
    let end = symbol
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(symbol.len());
    &symbol[..end]
}

pub struct DataBoard {
    latest: AHashMap<String, Tick>,
    series: AHashMap<String, Vec<Bar>>,
    current_ts: Timestamp,
}

impl DataBoard {
    pub fn new() -> Self {
        DataBoard {
            latest: AHashMap::new(),
            series: AHashMap::new(),
            current_ts: Utc.timestamp_opt(0, 0).unwrap(),
        }
    }

    /// Absorb a tick. Wired as the LAST tick handler on the bus, so during
    /// the processing of tick T every other handler still observes the
    /// price as of T-1 through `last_price`.
    pub fn on_tick(&mut self, tick: &Tick) {
        self.current_ts = tick.ts;
        self.latest.insert(tick.symbol.clone(), tick.clone());
    }

    /// Load (or extend) a symbol's bar series. Append-only during a session.
    pub fn load_history(&mut self, symbol: impl Into<String>, mut bars: Vec<Bar>) {
        self.series.entry(symbol.into()).or_default().append(&mut bars);
    }

    fn resolve_series(&self, symbol: &str) -> Option<&Vec<Bar>> {
        self.series
            .get(symbol)
            .or_else(|| self.series.get(root_of(symbol)))
    }

    /// The symbol's bars up to and including `ts`. An absent literal symbol
    /// resolves through its instrument root.
    pub fn hist_slice(&self, symbol: &str, ts: Timestamp) -> &[Bar] {
        match self.resolve_series(symbol) {
            Some(bars) => {
                let end = bars.partition_point(|b| b.ts <= ts);
                &bars[..end]
            }
            None => &[],
        }
    }

    /// Close of the last bar at or before `ts`.
    pub fn hist_close(&self, symbol: &str, ts: Timestamp) -> Option<Decimal> {
        self.hist_slice(symbol, ts).last().map(|b| b.close)
    }

    /// Most recent tick price prior to the tick currently being processed
    /// (see `on_tick` for the ordering guarantee).
    pub fn last_price(&self, symbol: &str) -> Option<Decimal> {
        self.latest.get(symbol).map(|t| t.price)
    }

    pub fn last_tick(&self, symbol: &str) -> Option<&Tick> {
        self.latest.get(symbol)
    }

    pub fn current_ts(&self) -> Timestamp {
        self.current_ts
    }

    pub fn tracked_symbols(&self) -> impl Iterator<Item = &String> {
        self.series.keys()
    }

    /// Clear everything between sessions.
    pub fn reset(&mut self) {
        self.latest.clear();
        self.series.clear();
        self.current_ts = Utc.timestamp_opt(0, 0).unwrap();
    }
}

impl Default for DataBoard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn bar(ts: Timestamp, close: i64) -> Bar {
        Bar {
            ts,
            open: Decimal::from(close),
            high: Decimal::from(close),
            low: Decimal::from(close),
            close: Decimal::from(close),
            volume: 100,
        }
    }

    #[test]
    fn root_resolution() {
        assert_eq!(root_of("ES FUT GLOBEX"), "ES");
        assert_eq!(root_of("ESZ5"), "ESZ");
        assert_eq!(root_of("SPY"), "SPY");
    }

    #[test]
    fn hist_slice_is_inclusive_of_timestamp() {
        let mut board = DataBoard::new();
        let t0 = Utc::now();
        let bars: Vec<Bar> = (0..5).map(|i| bar(t0 + Duration::minutes(i), 100 + i)).collect();
        board.load_history("SPY STK", bars);

        let slice = board.hist_slice("SPY STK", t0 + Duration::minutes(2));
        assert_eq!(slice.len(), 3);
        assert_eq!(
            board.hist_close("SPY STK", t0 + Duration::minutes(2)),
            Some(Decimal::from(102))
        );
        assert!(board.hist_slice("SPY STK", t0 - Duration::minutes(1)).is_empty());
    }

    #[test]
    fn absent_symbol_resolves_through_root() {
        let mut board = DataBoard::new();
        let t0 = Utc::now();
        board.load_history("ES", vec![bar(t0, 5000)]);
        assert_eq!(board.hist_close("ES FUT GLOBEX", t0), Some(Decimal::from(5000)));
        assert_eq!(board.hist_close("NQ FUT", t0), None);
    }

    #[test]
    fn last_price_reflects_latest_absorbed_tick_only() {
        let mut board = DataBoard::new();
        let t0 = Utc::now();
        assert_eq!(board.last_price("SPY STK"), None);

        board.on_tick(&Tick::trade("SPY STK", Decimal::from(100), 1, t0));
        // A consumer running before the board absorbs the next tick still
        // sees the prior price.
        assert_eq!(board.last_price("SPY STK"), Some(Decimal::from(100)));

        board.on_tick(&Tick::trade(
            "SPY STK",
            Decimal::from(101),
            1,
            t0 + Duration::minutes(1),
        ));
        assert_eq!(board.last_price("SPY STK"), Some(Decimal::from(101)));
        assert_eq!(board.current_ts(), t0 + Duration::minutes(1));
    }
}
