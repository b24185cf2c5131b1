// ===============================
// src/config.rs
// ===============================
//
// Configuration is parsed once, up front, into owned records handed to each
// component at construction. The core never reads a file format directly:
// strategy parameter maps and risk limits arrive as already-parsed values.

use std::collections::BTreeMap;
use std::env;

use ahash::AHashMap;
use chrono::NaiveTime;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::StrategyId;

/// Typed strategy parameter map (replaces "apply named keys onto the
/// strategy object"): each strategy validates its own keys in `set_params`
/// and rejects unknown ones.
pub type ParamMap = BTreeMap<String, serde_json::Value>;

/// Per-instrument metadata supplied by configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentMeta {
    pub symbol: String,
    pub multiplier: Decimal,
}

/// Symbol -> contract multiplier table. Lookups fall back to the instrument
/// root the same way the data board resolves series.
#[derive(Debug, Clone, Default)]
pub struct InstrumentTable {
    by_symbol: AHashMap<String, InstrumentMeta>,
}

impl InstrumentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, meta: InstrumentMeta) {
        self.by_symbol.insert(meta.symbol.clone(), meta);
    }

    pub fn multiplier(&self, symbol: &str) -> Decimal {
        if let Some(m) = self.by_symbol.get(symbol) {
            return m.multiplier;
        }
        if let Some(m) = self.by_symbol.get(crate::data_board::root_of(symbol)) {
            return m.multiplier;
        }
        Decimal::ONE
    }
}

/// Optional pre-trade compliance limits; absent fields are unchecked.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Orders outside [start, end) (UTC time of day) are vetoed.
    pub trade_window: Option<(NaiveTime, NaiveTime)>,
    pub max_order_size: Option<i64>,
    pub max_order_count: Option<usize>,
    pub max_cancel_count: Option<usize>,
    pub max_standing_count: Option<usize>,
    /// Cap on aggregate loss (realized + unrealized, sign-inverted).
    pub max_loss: Option<Decimal>,
}

/// Already-parsed per-strategy record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub name: String,
    pub capital: Decimal,
    pub symbols: Vec<String>,
    #[serde(default)]
    pub params: ParamMap,
    #[serde(default)]
    pub risk: Option<RiskLimits>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl StrategyConfig {
    pub fn new(name: impl Into<String>, capital: Decimal, symbols: Vec<String>) -> Self {
        StrategyConfig {
            name: name.into(),
            capital,
            symbols,
            params: ParamMap::new(),
            risk: None,
            active: true,
        }
    }
}

/// Per-strategy risk limits keyed by strategy id, plus an optional global
/// set applied to every order.
#[derive(Debug, Clone, Default)]
pub struct RiskConfig {
    pub global: RiskLimits,
    pub per_strategy: AHashMap<StrategyId, RiskLimits>,
}

// ---- CLI ----

#[derive(Debug, Parser)]
#[command(name = "quantcore", about = "event-driven trading core (replay & live)")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Deterministic replay over synthetic historical bars.
    Backtest {
        /// Comma-separated symbols, e.g. "SPY STK,ES FUT"
        #[arg(long, default_value = "SPY STK")]
        symbols: String,
        #[arg(long, default_value_t = 100_000)]
        capital: i64,
        /// Number of synthetic bars per symbol.
        #[arg(long, default_value_t = 500)]
        bars: usize,
        /// Seed for the synthetic random walk.
        #[arg(long, default_value_t = 7)]
        seed: u64,
        /// Optional dispatch step budget.
        #[arg(long)]
        max_steps: Option<u64>,
    },
    /// Live mode against the mock tick feed and paper gateway.
    Live {
        #[arg(long, default_value = "SPY STK")]
        symbols: String,
        #[arg(long, default_value_t = 100_000)]
        capital: i64,
        /// Run duration in seconds (0 = until ctrl-c).
        #[arg(long, default_value_t = 30)]
        duration_secs: u64,
        #[arg(long, default_value_t = 9898)]
        metrics_port: u16,
        /// JSONL event record file (overrides RECORD_FILE).
        #[arg(long)]
        record_file: Option<String>,
    },
}

pub fn split_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Env fallback for the record file, as in `.env` driven deployments.
pub fn record_file_from_env() -> Option<String> {
    env::var("RECORD_FILE").ok().filter(|s| !s.is_empty())
}
