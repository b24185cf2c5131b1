// ===============================
// src/metrics.rs
// ===============================
//
// Prometheus counters and gauges on a process-wide registry, plus a tiny
// plaintext exporter on a std listener. `init` must run once at startup;
// in tests the statics work unregistered.

use once_cell::sync::Lazy;
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;
use tracing::{error, info, warn};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static TICKS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("core_ticks_total", "Market data ticks ingested"),
        &["symbol"],
    )
    .expect("ticks metric")
});

pub static ORDERS_PLACED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("core_orders_placed_total", "Orders accepted past the risk gate")
        .expect("orders metric")
});

pub static RISK_VETOES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("core_risk_vetoes_total", "Intents vetoed by the risk gate"),
        &["reason"],
    )
    .expect("vetoes metric")
});

pub static FILLS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("core_fills_total", "Simulated fills").expect("fills metric"));

pub static EXEC_REPORTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("core_exec_reports_total", "Broker execution reports"),
        &["report"],
    )
    .expect("exec reports metric")
});

pub static EQUITY: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("core_equity", "Account equity").expect("equity metric"));

pub static REALIZED_PNL: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("core_realized_pnl", "Realized PnL").expect("pnl metric"));

pub fn init() {
    let registry = &*REGISTRY;
    let _ = registry.register(Box::new(TICKS.clone()));
    let _ = registry.register(Box::new(ORDERS_PLACED.clone()));
    let _ = registry.register(Box::new(RISK_VETOES.clone()));
    let _ = registry.register(Box::new(FILLS.clone()));
    let _ = registry.register(Box::new(EXEC_REPORTS.clone()));
    let _ = registry.register(Box::new(EQUITY.clone()));
    let _ = registry.register(Box::new(REALIZED_PNL.clone()));
}

pub fn render() -> String {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buf) {
        error!(%e, "metrics encode failed");
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Blocking plaintext exporter on its own thread; answers every request
/// with the full registry dump.
pub fn serve(port: u16) {
    thread::Builder::new()
        .name("metrics".to_string())
        .spawn(move || {
            let listener = match TcpListener::bind(("0.0.0.0", port)) {
                Ok(l) => l,
                Err(e) => {
                    error!(%e, port, "metrics listener bind failed");
                    return;
                }
            };
            info!(port, "metrics exporter listening");
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut drain = [0u8; 1024];
                let _ = stream.read(&mut drain);
                let body = render();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                if let Err(e) = stream.write_all(response.as_bytes()) {
                    warn!(%e, "metrics response failed");
                }
            }
        })
        .expect("spawn metrics thread");
}
