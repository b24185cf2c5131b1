// ===============================
// src/gateway.rs
// ===============================
//
// Broker capability surface plus the live-mode paper gateway. Broker
// responses never come back as direct returns: they arrive later as Order /
// Fill events on the order bus (ack first, fill after a simulated latency).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::bus::{lock, EventSender};
use crate::data_board::DataBoard;
use crate::domain::{ContractInfo, CoreError, Event, Fill, Order, OrderStatus};
use crate::metrics::EXEC_REPORTS;

/// What the core asks of any broker. Results are delivered asynchronously
/// as bus events, never synchronously.
pub trait Broker: Send {
    fn next_order_id(&mut self) -> u64;
    fn place_order(&mut self, order: &Order) -> Result<(), CoreError>;
    fn cancel_order(&mut self, id: u64) -> Result<(), CoreError>;
    fn subscribe(&mut self, symbol: &str);
    fn unsubscribe(&mut self, symbol: &str);
}

enum GatewayCmd {
    Place(Order),
    Cancel(u64),
}

/// Live mock broker: acks immediately, fills the full size at the board's
/// last seen price after `fill_ms`. A cancel that lands before the fill
/// timer removes the order from the standing book and echoes Canceled; the
/// fill task finding its order gone does nothing.
pub struct PaperGateway {
    tx: mpsc::Sender<GatewayCmd>,
    next_id: AtomicU64,
}

impl PaperGateway {
    /// Spawns the gateway task on the current tokio runtime. Fills price
    /// off `board`; an unpriceable order comes back with Error status.
    pub fn spawn(order_bus: EventSender, fill_ms: u64, board: Arc<Mutex<DataBoard>>) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(run_gateway(rx, order_bus, fill_ms, board));
        PaperGateway {
            tx,
            next_id: AtomicU64::new(1),
        }
    }
}

impl Broker for PaperGateway {
    fn next_order_id(&mut self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn place_order(&mut self, order: &Order) -> Result<(), CoreError> {
        self.tx
            .try_send(GatewayCmd::Place(order.clone()))
            .map_err(|e| CoreError::BrokerFault(format!("gateway queue: {e}")))
    }

    fn cancel_order(&mut self, id: u64) -> Result<(), CoreError> {
        self.tx
            .try_send(GatewayCmd::Cancel(id))
            .map_err(|e| CoreError::BrokerFault(format!("gateway queue: {e}")))
    }

    fn subscribe(&mut self, symbol: &str) {
        info!(%symbol, "paper gateway subscribe");
    }

    fn unsubscribe(&mut self, symbol: &str) {
        info!(%symbol, "paper gateway unsubscribe");
    }
}

/// Reference price for a paper fill: the board's last trade, falling back
/// to the order's own limit price.
fn reference_price(board: &Mutex<DataBoard>, order: &Order) -> Option<Decimal> {
    if let Some(price) = lock(board).last_price(&order.symbol) {
        return Some(price);
    }
    (order.limit_price > Decimal::ZERO).then_some(order.limit_price)
}

async fn run_gateway(
    mut rx: mpsc::Receiver<GatewayCmd>,
    order_bus: EventSender,
    fill_ms: u64,
    board: Arc<Mutex<DataBoard>>,
) {
    info!(fill_ms, "paper gateway started");
    let fill_counter = Arc::new(AtomicU64::new(1));
    let standing: Arc<Mutex<AHashMap<u64, Order>>> = Arc::new(Mutex::new(AHashMap::new()));
    while let Some(cmd) = rx.recv().await {
        match cmd {
            GatewayCmd::Place(order) => {
                let mut ack = order.clone();
                ack.status = OrderStatus::Submitted;
                order_bus.publish(Event::Order(ack));
                EXEC_REPORTS.with_label_values(&["submitted"]).inc();

                // Contract echo so the position manager learns multipliers.
                order_bus.publish(Event::Contract(ContractInfo {
                    symbol: order.symbol.clone(),
                    multiplier: Decimal::ONE,
                    exchange: "PAPER".to_string(),
                    ts: Utc::now(),
                }));

                lock(&standing).insert(order.id, order.clone());
                let bus = order_bus.clone();
                let counter = Arc::clone(&fill_counter);
                let standing = Arc::clone(&standing);
                let board = Arc::clone(&board);
                tokio::spawn(async move {
                    sleep(Duration::from_millis(fill_ms)).await;
                    // A cancel that won the race already removed the order.
                    let Some(order) = lock(&standing).remove(&order.id) else {
                        return;
                    };
                    let Some(price) = reference_price(&board, &order) else {
                        warn!(id = order.id, symbol = %order.symbol, "no reference price");
                        let mut errored = order;
                        errored.status = OrderStatus::Error;
                        bus.publish(Event::Order(errored));
                        EXEC_REPORTS.with_label_values(&["error"]).inc();
                        return;
                    };
                    let ts = Utc::now();
                    let mut filled = order.clone();
                    filled.status = OrderStatus::Filled;
                    filled.filled_size = order.size;
                    filled.filled_avg_price = price;
                    filled.filled_ts = Some(ts);
                    // Order transition first, then its fill.
                    bus.publish(Event::Order(filled));
                    bus.publish(Event::Fill(Fill {
                        fill_id: counter.fetch_add(1, Ordering::Relaxed),
                        order_id: order.id,
                        symbol: order.symbol.clone(),
                        price,
                        size: order.size,
                        commission: Decimal::ONE,
                        exchange: "PAPER".to_string(),
                        ts,
                        strategy_id: order.strategy_id,
                    }));
                    EXEC_REPORTS.with_label_values(&["filled"]).inc();
                });
            }
            GatewayCmd::Cancel(id) => {
                let Some(order) = lock(&standing).remove(&id) else {
                    warn!(id, "cancel for unknown or already filled order");
                    continue;
                };
                let mut canceled = order;
                canceled.status = OrderStatus::Canceled;
                canceled.canceled_ts = Some(Utc::now());
                order_bus.publish(Event::Order(canceled));
                EXEC_REPORTS.with_label_values(&["canceled"]).inc();
            }
        }
    }
    info!("paper gateway stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LiveEventBus;
    use crate::domain::Tick;

    fn collect_bus() -> (LiveEventBus, Arc<Mutex<Vec<Event>>>) {
        let mut bus = LiveEventBus::new("gateway-test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        for kind in [
            crate::domain::EventKind::Order,
            crate::domain::EventKind::Fill,
            crate::domain::EventKind::Contract,
        ] {
            let sink = Arc::clone(&sink);
            bus.register(kind, "collect", Box::new(move |ev| lock(&sink).push(ev.clone())));
        }
        bus.start();
        (bus, seen)
    }

    fn priced_board(symbol: &str, price: i64) -> Arc<Mutex<DataBoard>> {
        let mut board = DataBoard::new();
        board.on_tick(&Tick::trade(symbol, Decimal::from(price), 1, Utc::now()));
        Arc::new(Mutex::new(board))
    }

    #[tokio::test]
    async fn fills_land_at_the_board_price() {
        let (bus, seen) = collect_bus();
        let board = priced_board("EUR.USD CASH", 2);
        let mut gateway = PaperGateway::spawn(bus.sender(), 10, board);

        let mut order = Order::market("EUR.USD CASH", 100, Utc::now());
        order.id = gateway.next_order_id();
        gateway.place_order(&order).unwrap();
        sleep(Duration::from_millis(300)).await;

        let events = lock(&seen);
        let fill = events
            .iter()
            .find_map(|ev| match ev {
                Event::Fill(f) => Some(f.clone()),
                _ => None,
            })
            .expect("fill event");
        assert_eq!(fill.order_id, order.id);
        assert_eq!(fill.price, Decimal::from(2));
        assert_eq!(fill.size, 100);
    }

    #[tokio::test]
    async fn cancel_before_the_fill_timer_echoes_canceled_and_never_fills() {
        let (bus, seen) = collect_bus();
        let board = priced_board("SPY STK", 100);
        let mut gateway = PaperGateway::spawn(bus.sender(), 60_000, board);

        let mut order = Order::market("SPY STK", 10, Utc::now());
        order.id = gateway.next_order_id();
        gateway.place_order(&order).unwrap();
        sleep(Duration::from_millis(100)).await;
        gateway.cancel_order(order.id).unwrap();
        sleep(Duration::from_millis(300)).await;

        let events = lock(&seen);
        assert!(events
            .iter()
            .all(|ev| !matches!(ev, Event::Fill(_))));
        let canceled = events
            .iter()
            .find_map(|ev| match ev {
                Event::Order(o) if o.status == OrderStatus::Canceled => Some(o.clone()),
                _ => None,
            })
            .expect("canceled echo");
        assert_eq!(canceled.id, order.id);
        assert!(canceled.canceled_ts.is_some());
    }

    #[tokio::test]
    async fn unpriceable_order_comes_back_with_error_status() {
        let (bus, seen) = collect_bus();
        let board = Arc::new(Mutex::new(DataBoard::new()));
        let mut gateway = PaperGateway::spawn(bus.sender(), 10, board);

        let mut order = Order::market("GHOST STK", 5, Utc::now());
        order.id = gateway.next_order_id();
        gateway.place_order(&order).unwrap();
        sleep(Duration::from_millis(300)).await;

        let events = lock(&seen);
        assert!(events.iter().all(|ev| !matches!(ev, Event::Fill(_))));
        assert!(events.iter().any(|ev| matches!(
            ev,
            Event::Order(o) if o.id == order.id && o.status == OrderStatus::Error
        )));
    }
}
