// ===============================
// src/main.rs
// ===============================
//
// Entrypoint. `backtest` replays synthetic history through the replay
// engine; `live` runs the mock feed and paper gateway on two live buses
// (one for ticks, one for execution reports).

use std::sync::{Arc, Mutex};

use chrono::Utc;
use clap::Parser;
use rust_decimal::Decimal;
use tokio::time::{sleep, Duration};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use quantcore::bus::{lock, LiveEventBus};
use quantcore::config::{
    record_file_from_env, split_symbols, Cli, Command, InstrumentTable, RiskConfig, RiskLimits,
    StrategyConfig,
};
use quantcore::data_board::DataBoard;
use quantcore::domain::{Event, EventKind};
use quantcore::engine::{BacktestConfig, BacktestEngine};
use quantcore::feed::{random_walk_bars, run_mock_feed};
use quantcore::gateway::{Broker, PaperGateway};
use quantcore::metrics;
use quantcore::order_manager::OrderManager;
use quantcore::performance::PerformanceManager;
use quantcore::positions::PositionManager;
use quantcore::recorder::Recorder;
use quantcore::risk::RiskManager;
use quantcore::strategies::{BuyAndHold, MeanReversion};
use quantcore::strategy::StrategyManager;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    metrics::init();

    match Cli::parse().command {
        Command::Backtest {
            symbols,
            capital,
            bars,
            seed,
            max_steps,
        } => run_backtest(split_symbols(&symbols), capital, bars, seed, max_steps),
        Command::Live {
            symbols,
            capital,
            duration_secs,
            metrics_port,
            record_file,
        } => {
            run_live(
                split_symbols(&symbols),
                capital,
                duration_secs,
                metrics_port,
                record_file.or_else(record_file_from_env),
            )
            .await
        }
    }
}

fn run_backtest(
    symbols: Vec<String>,
    capital: i64,
    bars: usize,
    seed: u64,
    max_steps: Option<u64>,
) {
    let capital = Decimal::from(capital);
    let mut config = BacktestConfig::new(capital);
    config.max_steps = max_steps;
    let mut engine = BacktestEngine::new(config);

    let start = Utc::now() - chrono::Duration::minutes(bars as i64);
    for (i, symbol) in symbols.iter().enumerate() {
        let start_price = Decimal::from(100 + 25 * i as i64);
        engine.load_history(
            symbol,
            random_walk_bars(start, bars, start_price, seed + i as u64),
        );
    }

    let strategy_config = StrategyConfig::new("buy-and-hold", capital, symbols);
    if let Err(e) = engine.add_strategy(Box::new(BuyAndHold::new(capital)), &strategy_config) {
        error!(%e, "strategy rejected");
        return;
    }

    let report = engine.run();
    for position in &report.positions {
        info!(
            symbol = %position.symbol,
            size = position.size,
            avg = %position.avg_price,
            realized = %position.realized_pnl,
            unrealized = %position.unrealized_pnl,
            "final position"
        );
    }
    info!(
        steps = report.steps,
        cash = %report.cash,
        equity = %report.total_equity,
        "backtest done"
    );
}

async fn run_live(
    symbols: Vec<String>,
    capital: i64,
    duration_secs: u64,
    metrics_port: u16,
    record_file: Option<String>,
) {
    let capital = Decimal::from(capital);
    metrics::serve(metrics_port);

    let mut tick_bus = LiveEventBus::new("ticks");
    let mut order_bus = LiveEventBus::new("orders");

    let board = Arc::new(Mutex::new(DataBoard::new()));
    let orders = Arc::new(Mutex::new(OrderManager::new()));
    let positions = Arc::new(Mutex::new(PositionManager::new(
        capital,
        InstrumentTable::new(),
    )));
    let performance = Arc::new(Mutex::new(PerformanceManager::new(capital)));
    let gateway = PaperGateway::spawn(order_bus.sender(), 500, Arc::clone(&board));
    let broker: Arc<Mutex<dyn Broker>> = Arc::new(Mutex::new(gateway));

    let risk = RiskManager::new(RiskConfig {
        global: RiskLimits {
            max_order_size: Some(10_000),
            max_standing_count: Some(100),
            ..Default::default()
        },
        per_strategy: Default::default(),
    });
    let strategies = Arc::new(Mutex::new(StrategyManager::new(
        Arc::clone(&board),
        Arc::clone(&orders),
        Arc::clone(&positions),
        Arc::clone(&performance),
        Arc::clone(&broker),
        Box::new(risk),
    )));
    {
        let mut manager = lock(&strategies);
        let config = StrategyConfig::new("mean-reversion", capital, symbols.clone());
        if let Err(e) = manager.add_strategy(
            Box::new(MeanReversion::new(60, Decimal::new(2, 3), 10)),
            &config,
        ) {
            error!(%e, "strategy rejected");
            return;
        }
    }

    let recorder = record_file.map(Recorder::spawn);
    if let Some(recorder) = &recorder {
        let tick_handle = recorder.handle();
        tick_bus.register(
            EventKind::Tick,
            "recorder",
            Box::new(move |ev| tick_handle.record(ev)),
        );
        for kind in [EventKind::Order, EventKind::Fill] {
            let handle = recorder.handle();
            order_bus.register(kind, "recorder", Box::new(move |ev| handle.record(ev)));
        }
    }

    // Tick bus: strategies, then valuation, then the board (last).
    {
        let strategies = Arc::clone(&strategies);
        tick_bus.register(
            EventKind::Tick,
            "strategies",
            Box::new(move |ev| {
                if let Event::Tick(tick) = ev {
                    lock(&strategies).on_tick(tick);
                }
            }),
        );
    }
    {
        let board = Arc::clone(&board);
        let positions = Arc::clone(&positions);
        tick_bus.register(
            EventKind::Tick,
            "valuation",
            Box::new(move |ev| {
                if let Event::Tick(tick) = ev {
                    let board = lock(&board);
                    let mut positions = lock(&positions);
                    positions.mark_to_market(tick.ts, &tick.symbol, Some(tick.price), &board);
                }
            }),
        );
    }
    {
        let board = Arc::clone(&board);
        tick_bus.register(
            EventKind::Tick,
            "board",
            Box::new(move |ev| {
                if let Event::Tick(tick) = ev {
                    lock(&board).on_tick(tick);
                }
            }),
        );
    }
    // The live equity curve advances on the timer, not per tick.
    {
        let positions = Arc::clone(&positions);
        let performance = Arc::clone(&performance);
        tick_bus.register(
            EventKind::Timer,
            "performance",
            Box::new(move |ev| {
                if let Event::Timer(ts) = ev {
                    let equity = lock(&positions).total_equity();
                    lock(&performance).update_performance(*ts, equity);
                }
            }),
        );
    }

    // Order bus: execution reports and contract echoes.
    {
        let strategies = Arc::clone(&strategies);
        order_bus.register(
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
        order_bus.register(
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
        order_bus.register(
            EventKind::Contract,
            "positions",
            Box::new(move |ev| {
                if let Event::Contract(contract) = ev {
                    lock(&positions).upsert_instrument(&contract.symbol, contract.multiplier);
                }
            }),
        );
    }

    tick_bus.start();
    order_bus.start();

    for symbol in &symbols {
        tokio::spawn(run_mock_feed(tick_bus.sender(), symbol.clone(), 250));
    }
    {
        let sender = tick_bus.sender();
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(1)).await;
                sender.publish(Event::Timer(Utc::now()));
            }
        });
    }
    {
        let positions = Arc::clone(&positions);
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(5)).await;
                let (cash, equity) = {
                    let positions = lock(&positions);
                    (positions.cash, positions.total_equity())
                };
                info!(%cash, %equity, "heartbeat");
            }
        });
    }

    info!(?symbols, duration_secs, "live session running");
    if duration_secs == 0 {
        let _ = tokio::signal::ctrl_c().await;
    } else {
        tokio::select! {
            _ = sleep(Duration::from_secs(duration_secs)) => {}
            _ = tokio::signal::ctrl_c() => info!("interrupted"),
        }
    }

    info!("shutting down: flattening positions");
    lock(&strategies).flatten_all(Utc::now());
    // Give the paper gateway time to fill the liquidation orders.
    sleep(Duration::from_millis(1500)).await;

    tick_bus.stop();
    order_bus.stop();
    if let Some(recorder) = recorder {
        recorder.close().await;
    }
    {
        let equity = lock(&positions).total_equity();
        let mut performance = lock(&performance);
        performance.update_performance(Utc::now(), equity);
        performance.close_out();
        performance.summary();
    }
    info!("live session stopped");
}
