// ===============================
// src/feed.rs
// ===============================
//
// Market data sources:
// - HistoricalFeed / BarFeed : chronological replay source for backtests
// - random_walk_bars         : seedable synthetic OHLCV generator
// - run_mock_feed            : live-mode random-walk tick task (~N ticks/s)
//
// Historical file parsing is a collaborator's job; the core only consumes
// already-built bar series.

use chrono::Duration as ChronoDuration;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

use crate::bus::EventSender;
use crate::domain::{Bar, Event, Tick, Timestamp};
use crate::metrics::TICKS;

/// Chronological event source driven by the replay bus.
pub trait HistoricalFeed {
    fn next_event(&mut self) -> Option<Event>;
}

/// Merges per-symbol bar series into one chronological stream of trade
/// ticks (bar close as the tick price, volume as the size).
pub struct BarFeed {
    pending: Vec<(Timestamp, String, Bar)>,
    queue: VecDeque<Event>,
    built: bool,
}

impl BarFeed {
    pub fn new() -> Self {
        BarFeed {
            pending: Vec::new(),
            queue: VecDeque::new(),
            built: false,
        }
    }

    pub fn add_bars(&mut self, symbol: impl Into<String>, bars: Vec<Bar>) {
        let symbol = symbol.into();
        for bar in bars {
            self.pending.push((bar.ts, symbol.clone(), bar));
        }
    }

    fn build(&mut self) {
        // Stable sort keeps insertion order for equal (ts, symbol) keys.
        self.pending
            .sort_by(|a, b| (a.0, a.1.as_str()).cmp(&(b.0, b.1.as_str())));
        for (ts, symbol, bar) in self.pending.drain(..) {
            self.queue
                .push_back(Event::Tick(Tick::trade(symbol, bar.close, bar.volume, ts)));
        }
        self.built = true;
    }
}

impl Default for BarFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoricalFeed for BarFeed {
    fn next_event(&mut self) -> Option<Event> {
        if !self.built {
            self.build();
        }
        self.queue.pop_front()
    }
}

/// Seedable random-walk bars for demos and tests; one bar per minute.
pub fn random_walk_bars(
    start: Timestamp,
    n: usize,
    start_price: Decimal,
    seed: u64,
) -> Vec<Bar> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut close = start_price;
    let floor = Decimal::ONE;
    let mut bars = Vec::with_capacity(n);
    for i in 0..n {
        let open = close;
        // Steps in cents, bounded so the walk stays positive.
        let step = Decimal::new(rng.gen_range(-50..=50), 2);
        close = (open + step).max(floor);
        let high = open.max(close) + Decimal::new(rng.gen_range(0..=10), 2);
        let low = (open.min(close) - Decimal::new(rng.gen_range(0..=10), 2)).max(floor);
        bars.push(Bar {
            ts: start + ChronoDuration::minutes(i as i64),
            open,
            high,
            low,
            close,
            volume: rng.gen_range(100..10_000),
        });
    }
    bars
}

/// Live-mode mock market data: random-walk trade ticks published straight
/// onto the tick bus.
pub async fn run_mock_feed(bus: EventSender, symbol: String, interval_ms: u64) {
    info!(%symbol, interval_ms, "mock feed started");
    let mut price = Decimal::from(100);
    let floor = Decimal::ONE;
    loop {
        // Do not hold the rng across an .await.
        let step = Decimal::new(rand::thread_rng().gen_range(-3..=3), 2);
        price = (price + step).max(floor);
        let spread = Decimal::new(1, 2);
        let ts = chrono::Utc::now();
        let mut tick = Tick::trade(symbol.clone(), price, 100, ts);
        tick.bid_price = price - spread;
        tick.bid_size = 500;
        tick.ask_price = price + spread;
        tick.ask_size = 500;
        bus.publish(Event::Tick(tick));
        TICKS.with_label_values(&[&symbol]).inc();
        sleep(Duration::from_millis(interval_ms)).await;
    }
}
