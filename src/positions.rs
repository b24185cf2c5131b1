// ===============================
// src/positions.rs
// ===============================
//
// Per-instrument holdings, cash, and realized/unrealized PnL, updated from
// fills and mark-to-market ticks. Same-direction fills blend the average
// cost; reducing fills realize PnL on the closed portion; a direction flip
// restarts the average at the fill price.

use ahash::AHashMap;
use rust_decimal::Decimal;
use tracing::debug;

use crate::config::InstrumentTable;
use crate::data_board::DataBoard;
use crate::domain::{CoreError, Fill, Position, Timestamp, ALL_SYMBOLS};

impl Position {
    fn new(symbol: &str) -> Self {
        Position {
            symbol: symbol.to_string(),
            ..Position::default()
        }
    }

    fn on_fill(&mut self, fill: &Fill, multiplier: Decimal) {
        if fill.size == 0 {
            return;
        }
        let old_size = self.size;
        let new_size = old_size + fill.size;

        if old_size == 0 || old_size.signum() == fill.size.signum() {
            // Same direction: signed size-weighted blend, commission folded
            // in by dividing by the multiplier. The signed form handles the
            // short side (commission lowers the effective entry) as well.
            let total = Decimal::from(old_size) + Decimal::from(fill.size);
            self.avg_price = (self.avg_price * Decimal::from(old_size)
                + fill.price * Decimal::from(fill.size)
                + fill.commission / multiplier)
                / total;
            self.size = new_size;
            return;
        }

        // Reducing or flipping: realize PnL on the closed portion.
        let closed = old_size.abs().min(fill.size.abs());
        self.realized_pnl += (self.avg_price - fill.price)
            * Decimal::from(closed)
            * multiplier
            * Decimal::from(fill.size.signum())
            - fill.commission;
        self.size = new_size;
        if new_size == 0 {
            self.avg_price = Decimal::ZERO;
            self.unrealized_pnl = Decimal::ZERO;
        } else if new_size.signum() != old_size.signum() {
            // Flip: the residual opposite-side size opens at the fill price.
            self.avg_price = fill.price;
        }
    }

    fn mark(&mut self, price: Decimal, multiplier: Decimal) {
        self.unrealized_pnl = (price - self.avg_price) * Decimal::from(self.size) * multiplier;
    }
}

pub struct PositionManager {
    pub cash: Decimal,
    initial_capital: Decimal,
    /// Running account value maintained by the concrete-symbol mark path.
    total_equity: Decimal,
    positions: AHashMap<String, Position>,
    instruments: InstrumentTable,
}

impl PositionManager {
    pub fn new(initial_capital: Decimal, instruments: InstrumentTable) -> Self {
        PositionManager {
            cash: initial_capital,
            initial_capital,
            total_equity: initial_capital,
            positions: AHashMap::new(),
            instruments,
        }
    }

    pub fn initial_capital(&self) -> Decimal {
        self.initial_capital
    }

    pub fn total_equity(&self) -> Decimal {
        self.total_equity
    }

    pub fn multiplier(&self, symbol: &str) -> Decimal {
        self.instruments.multiplier(symbol)
    }

    /// Broker contract echoes refine the metadata table mid-session.
    pub fn upsert_instrument(&mut self, symbol: &str, multiplier: Decimal) {
        self.instruments.insert(crate::config::InstrumentMeta {
            symbol: symbol.to_string(),
            multiplier,
        });
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// Cash moves by `size * price * multiplier + commission`; the position
    /// is created lazily on first fill.
    pub fn on_fill(&mut self, fill: &Fill) -> Result<(), CoreError> {
        let multiplier = self.instruments.multiplier(&fill.symbol);
        self.cash -= Decimal::from(fill.size) * fill.price * multiplier + fill.commission;
        let position = self
            .positions
            .entry(fill.symbol.clone())
            .or_insert_with(|| Position::new(&fill.symbol));
        position.on_fill(fill, multiplier);
        debug!(
            symbol = %fill.symbol,
            size = position.size,
            avg = %position.avg_price,
            cash = %self.cash,
            "fill applied"
        );
        Ok(())
    }

    /// Revalue holdings. The `"ALL"` sentinel reprices every held position
    /// at the board's historical close at `ts` (not the raw tick price) so
    /// mark-to-market and order matching share one price surface. A
    /// concrete symbol revalues that position only, and total equity moves
    /// by `size * (new - previous board price) * multiplier`.
    pub fn mark_to_market(
        &mut self,
        ts: Timestamp,
        symbol: &str,
        last_price: Option<Decimal>,
        board: &DataBoard,
    ) {
        if symbol == ALL_SYMBOLS {
            let mut equity = self.cash;
            for position in self.positions.values_mut() {
                let multiplier = self.instruments.multiplier(&position.symbol);
                if let Some(close) = board.hist_close(&position.symbol, ts) {
                    position.mark(close, multiplier);
                    equity += Decimal::from(position.size) * close * multiplier;
                }
            }
            self.total_equity = equity;
            return;
        }

        let Some(position) = self.positions.get_mut(symbol) else {
            return;
        };
        let multiplier = self.instruments.multiplier(symbol);
        let Some(price) = last_price else { return };
        if let Some(previous) = board.last_price(symbol) {
            self.total_equity += Decimal::from(position.size) * (price - previous) * multiplier;
        }
        position.mark(price, multiplier);
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.positions.values().map(|p| p.realized_pnl).sum()
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.positions.values().map(|p| p.unrealized_pnl).sum()
    }

    /// Positions are destroyed only here, between sessions.
    pub fn reset(&mut self, capital: Decimal) {
        self.cash = capital;
        self.initial_capital = capital;
        self.total_equity = capital;
        self.positions.clear();
    }
}
