// ===============================
// src/lib.rs
// ===============================
//
// Event-driven trading core: a deterministic replay scheduler and a
// threaded live scheduler over one set of components (data board, order
// and position managers, fill simulator, risk gate, strategies).

pub mod backtest_broker;
pub mod bus;
pub mod config;
pub mod data_board;
pub mod domain;
pub mod engine;
pub mod feed;
pub mod gateway;
pub mod metrics;
pub mod order_manager;
pub mod performance;
pub mod positions;
pub mod recorder;
pub mod risk;
pub mod strategies;
pub mod strategy;

pub use engine::{BacktestConfig, BacktestEngine, BacktestReport};
pub use strategy::{Strategy, StrategyContext, StrategyManager};
