// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Timestamp = DateTime<Utc>;

/// Strategy identifier. Id 0 is reserved for manual / synthetic orders
/// (e.g. flatten liquidations).
pub type StrategyId = u32;

/// Sentinel symbol used by the replay clock: "revalue every tracked
/// instrument" rather than a single one.
pub const ALL_SYMBOLS: &str = "ALL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TickKind {
    Trade,
    Bid,
    Ask,
}

/// Atomic market-data update for one instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub kind: TickKind,
    pub price: Decimal,
    pub size: i64,
    pub bid_price: Decimal,
    pub bid_size: i64,
    pub ask_price: Decimal,
    pub ask_size: i64,
    pub ts: Timestamp,
}

impl Tick {
    /// Trade tick with no quote context (what a bar feed emits).
    pub fn trade(symbol: impl Into<String>, price: Decimal, size: i64, ts: Timestamp) -> Self {
        Tick {
            symbol: symbol.into(),
            kind: TickKind::Trade,
            price,
            size,
            bid_price: price,
            bid_size: 0,
            ask_price: price,
            ask_size: 0,
            ts,
        }
    }
}

/// One OHLCV bar. Per-symbol series are ordered by `ts` and append-only
/// during a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub ts: Timestamp,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
    StopLimit,
    /// `limit_price` carries the trailing distance.
    TrailingStop,
}

/// Order lifecycle states, ordinal-ranked: an order's status never moves to
/// a lower variant. Declaration order defines the ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Newborn,
    Acknowledged,
    Submitted,
    PartiallyFilled,
    Filled,
    PendingCancel,
    Canceled,
    Error,
}

impl OrderStatus {
    /// Standing = live at the broker, i.e. anything before a full fill.
    pub fn is_standing(self) -> bool {
        self < OrderStatus::Filled
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub symbol: String,
    pub kind: OrderKind,
    /// Signed size: positive = buy, negative = sell.
    pub size: i64,
    pub limit_price: Decimal,
    pub stop_price: Decimal,
    pub status: OrderStatus,
    /// Cumulative filled size (signed, same sign as `size`).
    pub filled_size: i64,
    /// Volume-weighted average fill price.
    pub filled_avg_price: Decimal,
    pub created_ts: Timestamp,
    pub filled_ts: Option<Timestamp>,
    pub canceled_ts: Option<Timestamp>,
    pub account: String,
    pub strategy_id: StrategyId,
}

impl Order {
    pub fn new(symbol: impl Into<String>, kind: OrderKind, size: i64, ts: Timestamp) -> Self {
        Order {
            id: 0,
            symbol: symbol.into(),
            kind,
            size,
            limit_price: Decimal::ZERO,
            stop_price: Decimal::ZERO,
            status: OrderStatus::Newborn,
            filled_size: 0,
            filled_avg_price: Decimal::ZERO,
            created_ts: ts,
            filled_ts: None,
            canceled_ts: None,
            account: String::new(),
            strategy_id: 0,
        }
    }

    pub fn market(symbol: impl Into<String>, size: i64, ts: Timestamp) -> Self {
        Self::new(symbol, OrderKind::Market, size, ts)
    }

    pub fn limit(symbol: impl Into<String>, size: i64, limit: Decimal, ts: Timestamp) -> Self {
        let mut o = Self::new(symbol, OrderKind::Limit, size, ts);
        o.limit_price = limit;
        o
    }

    pub fn is_buy(&self) -> bool {
        self.size > 0
    }
}

/// Execution record confirming that some or all of an order traded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: u64,
    pub order_id: u64,
    pub symbol: String,
    pub price: Decimal,
    /// Signed size, same convention as `Order::size`.
    pub size: i64,
    pub commission: Decimal,
    pub exchange: String,
    pub ts: Timestamp,
    pub strategy_id: StrategyId,
}

/// Per-instrument holding. Created lazily on first fill; persists at zero
/// size for the life of the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Commission-inclusive average entry price.
    pub avg_price: Decimal,
    /// Signed size: equals the signed sum of applied fills since reset.
    pub size: i64,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
}

/// Position snapshot pushed by a broker or manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub position: Position,
    pub ts: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub account: String,
    pub balance: Decimal,
    pub ts: Timestamp,
}

/// Instrument details echoed by a broker (contract multiplier etc.).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractInfo {
    pub symbol: String,
    pub multiplier: Decimal,
    pub exchange: String,
    pub ts: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: Timestamp,
    pub message: String,
}

/// Registration key for event handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Tick,
    Order,
    Fill,
    Position,
    Account,
    Contract,
    Log,
    Timer,
}

/// Tagged union carried by the buses. Each variant holds enough payload to
/// be handled without further lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Tick(Tick),
    Order(Order),
    Fill(Fill),
    Position(PositionUpdate),
    Account(AccountUpdate),
    Contract(ContractInfo),
    Log(LogEntry),
    Timer(Timestamp),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Tick(_) => EventKind::Tick,
            Event::Order(_) => EventKind::Order,
            Event::Fill(_) => EventKind::Fill,
            Event::Position(_) => EventKind::Position,
            Event::Account(_) => EventKind::Account,
            Event::Contract(_) => EventKind::Contract,
            Event::Log(_) => EventKind::Log,
            Event::Timer(_) => EventKind::Timer,
        }
    }

    pub fn ts(&self) -> Timestamp {
        match self {
            Event::Tick(t) => t.ts,
            Event::Order(o) => o.created_ts,
            Event::Fill(f) => f.ts,
            Event::Position(p) => p.ts,
            Event::Account(a) => a.ts,
            Event::Contract(c) => c.ts,
            Event::Log(l) => l.ts,
            Event::Timer(ts) => *ts,
        }
    }
}

/// Hard rejections from the managers. Stale status updates and risk vetoes
/// are not in here: the former are silent no-ops, the latter have their own
/// `RiskBreach` type.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("order {id}: update symbol {got} does not match stored {want}")]
    SymbolMismatch { id: u64, want: String, got: String },
    #[error("fill {0} already applied")]
    DuplicateFill(u64),
    #[error("fill {fill_id} references unknown order {order_id}")]
    OrphanFill { fill_id: u64, order_id: u64 },
    #[error("cancel references unknown order {0}")]
    OrphanCancel(u64),
    #[error("order {id}: fill would take filled size to {attempted} of {requested}")]
    OverFill {
        id: u64,
        attempted: i64,
        requested: i64,
    },
    #[error("no price available for {symbol}")]
    PriceUnavailable { symbol: String },
    #[error("unknown strategy parameter `{0}`")]
    UnknownParam(String),
    #[error("invalid value for strategy parameter `{0}`")]
    InvalidParam(String),
    #[error("broker unavailable: {0}")]
    BrokerFault(String),
}
