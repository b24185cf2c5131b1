// ===============================
// src/bus.rs
// ===============================
//
// Event dispatch. Two interchangeable schedulers share one handler registry:
// - ReplayEventBus : single-threaded deterministic loop over a historical feed
// - LiveEventBus   : dedicated dispatcher thread draining a blocking queue
//
// Handlers for a kind run in registration order. A panicking handler is
// caught at the dispatch boundary and logged; it never takes down the loop
// or the other handlers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ahash::AHashMap;
use tracing::{debug, error, info, warn};

use crate::domain::{Event, EventKind};
use crate::feed::HistoricalFeed;

pub type Handler = Box<dyn FnMut(&Event) + Send>;

/// Lock a shared component, recovering from poisoning. Handler panics are
/// already contained and logged by the dispatcher, so a poisoned mutex is
/// not treated as fatal.
pub fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-kind handler lists, keyed by (kind, handler id).
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: AHashMap<EventKind, Vec<(String, Handler)>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: registering the same (kind, id) twice is a no-op.
    pub fn register(&mut self, kind: EventKind, id: &str, handler: Handler) {
        let list = self.handlers.entry(kind).or_default();
        if list.iter().any(|(hid, _)| hid == id) {
            debug!(?kind, id, "handler already registered, ignoring");
            return;
        }
        list.push((id.to_string(), handler));
    }

    /// Returns true if a handler was removed.
    pub fn unregister(&mut self, kind: EventKind, id: &str) -> bool {
        if let Some(list) = self.handlers.get_mut(&kind) {
            let before = list.len();
            list.retain(|(hid, _)| hid != id);
            return list.len() != before;
        }
        false
    }

    pub fn dispatch(&mut self, event: &Event) {
        if let Some(list) = self.handlers.get_mut(&event.kind()) {
            for (id, handler) in list.iter_mut() {
                let outcome = catch_unwind(AssertUnwindSafe(|| handler(event)));
                if outcome.is_err() {
                    error!(handler = %id, kind = ?event.kind(), "handler panicked, event dropped for this handler");
                }
            }
        }
    }
}

/// Cloneable producer handle. Publishing never blocks; a send to a torn-down
/// bus is dropped with a warning.
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<Event>,
}

impl EventSender {
    pub fn publish(&self, event: Event) {
        if self.tx.send(event).is_err() {
            warn!("event published to a stopped bus, dropped");
        }
    }
}

/// Deterministic single-threaded scheduler. When the queue is empty it pulls
/// the next chronological event from the feed; the loop ends when the feed
/// is exhausted and the queue is drained, or when the step budget runs out.
pub struct ReplayEventBus {
    registry: HandlerRegistry,
    tx: Sender<Event>,
    rx: Receiver<Event>,
    max_steps: Option<u64>,
}

impl ReplayEventBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        ReplayEventBus {
            registry: HandlerRegistry::new(),
            tx,
            rx,
            max_steps: None,
        }
    }

    pub fn with_step_budget(mut self, max_steps: u64) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn register(&mut self, kind: EventKind, id: &str, handler: Handler) {
        self.registry.register(kind, id, handler);
    }

    pub fn unregister(&mut self, kind: EventKind, id: &str) -> bool {
        self.registry.unregister(kind, id)
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    pub fn publish(&self, event: Event) {
        // Cannot fail: we hold the receiver.
        let _ = self.tx.send(event);
    }

    /// Run to feed exhaustion (or step budget). Returns dispatched steps.
    pub fn run(&mut self, feed: &mut dyn HistoricalFeed) -> u64 {
        let mut steps: u64 = 0;
        loop {
            if let Some(budget) = self.max_steps {
                if steps >= budget {
                    info!(steps, "replay step budget reached");
                    return steps;
                }
            }
            let event = match self.rx.try_recv() {
                Ok(ev) => ev,
                Err(_) => match feed.next_event() {
                    // Feed events go through the same queue so handler
                    // publications interleave deterministically.
                    Some(ev) => {
                        let _ = self.tx.send(ev);
                        continue;
                    }
                    None => break,
                },
            };
            self.registry.dispatch(&event);
            steps += 1;
        }
        info!(steps, "replay feed exhausted");
        steps
    }
}

impl Default for ReplayEventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Threaded scheduler for live mode. `start` moves the registry onto a
/// dedicated thread that blocks on the queue with a timeout so it can
/// observe the cooperative stop flag; `stop` flips the flag and joins
/// (bounded by the poll interval plus one handler invocation).
pub struct LiveEventBus {
    name: String,
    tx: Sender<Event>,
    rx: Option<Receiver<Event>>,
    registry: Option<HandlerRegistry>,
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    poll: Duration,
}

impl LiveEventBus {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::channel();
        LiveEventBus {
            name: name.into(),
            tx,
            rx: Some(rx),
            registry: Some(HandlerRegistry::new()),
            stop_flag: Arc::new(AtomicBool::new(false)),
            handle: None,
            poll: Duration::from_millis(100),
        }
    }

    /// Must be called before `start`; afterwards the registry lives on the
    /// dispatcher thread and registration is rejected.
    pub fn register(&mut self, kind: EventKind, id: &str, handler: Handler) {
        match self.registry.as_mut() {
            Some(reg) => reg.register(kind, id, handler),
            None => warn!(bus = %self.name, id, "register after start ignored"),
        }
    }

    pub fn unregister(&mut self, kind: EventKind, id: &str) -> bool {
        match self.registry.as_mut() {
            Some(reg) => reg.unregister(kind, id),
            None => false,
        }
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn start(&mut self) {
        let (Some(rx), Some(mut registry)) = (self.rx.take(), self.registry.take()) else {
            warn!(bus = %self.name, "already started");
            return;
        };
        let stop = Arc::clone(&self.stop_flag);
        let poll = self.poll;
        let name = self.name.clone();
        let handle = thread::Builder::new()
            .name(format!("bus-{name}"))
            .spawn(move || {
                info!(bus = %name, "dispatcher started");
                loop {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    match rx.recv_timeout(poll) {
                        Ok(event) => registry.dispatch(&event),
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!(bus = %name, "dispatcher stopped");
            })
            .expect("spawn dispatcher thread");
        self.handle = Some(handle);
    }

    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(bus = %self.name, "dispatcher thread panicked");
            }
        }
    }
}

impl Drop for LiveEventBus {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LogEntry, Tick, Timestamp};
    use crate::feed::HistoricalFeed;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::sync::atomic::AtomicUsize;

    struct VecEvents(Vec<Event>);

    impl HistoricalFeed for VecEvents {
        fn next_event(&mut self) -> Option<Event> {
            if self.0.is_empty() {
                None
            } else {
                Some(self.0.remove(0))
            }
        }
    }

    fn tick(symbol: &str, ts: Timestamp) -> Event {
        Event::Tick(Tick::trade(symbol, Decimal::from(100), 1, ts))
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut bus = ReplayEventBus::new();
        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.register(
                EventKind::Tick,
                name,
                Box::new(move |_| lock(&order).push(name)),
            );
        }
        let mut feed = VecEvents(vec![tick("SPY STK", Utc::now())]);
        assert_eq!(bus.run(&mut feed), 1);
        assert_eq!(*lock(&order), vec!["first", "second", "third"]);
    }

    #[test]
    fn register_is_idempotent_and_unregister_removes() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut bus = ReplayEventBus::new();
        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            bus.register(
                EventKind::Tick,
                "dup",
                Box::new(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        let mut feed = VecEvents(vec![tick("SPY STK", Utc::now())]);
        bus.run(&mut feed);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(bus.unregister(EventKind::Tick, "dup"));
        assert!(!bus.unregister(EventKind::Tick, "dup"));
        let mut feed = VecEvents(vec![tick("SPY STK", Utc::now())]);
        bus.run(&mut feed);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_does_not_stop_the_loop() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut bus = ReplayEventBus::new();
        bus.register(EventKind::Tick, "bad", Box::new(|_| panic!("strategy bug")));
        {
            let hits = Arc::clone(&hits);
            bus.register(
                EventKind::Tick,
                "good",
                Box::new(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        let mut feed = VecEvents(vec![tick("SPY STK", Utc::now()), tick("SPY STK", Utc::now())]);
        assert_eq!(bus.run(&mut feed), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn step_budget_halts_replay() {
        let mut bus = ReplayEventBus::new().with_step_budget(2);
        bus.register(EventKind::Tick, "noop", Box::new(|_| {}));
        let now = Utc::now();
        let mut feed = VecEvents((0..10).map(|_| tick("SPY STK", now)).collect());
        assert_eq!(bus.run(&mut feed), 2);
    }

    #[test]
    fn handler_publications_are_dispatched_before_next_feed_event() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = ReplayEventBus::new();
        let sender = bus.sender();
        {
            let seen = Arc::clone(&seen);
            bus.register(
                EventKind::Tick,
                "emitter",
                Box::new(move |ev| {
                    if let Event::Tick(t) = ev {
                        lock(&seen).push(format!("tick:{}", t.symbol));
                        sender.publish(Event::Log(LogEntry {
                            ts: t.ts,
                            message: t.symbol.clone(),
                        }));
                    }
                }),
            );
        }
        {
            let seen = Arc::clone(&seen);
            bus.register(
                EventKind::Log,
                "logger",
                Box::new(move |ev| {
                    if let Event::Log(l) = ev {
                        lock(&seen).push(format!("log:{}", l.message));
                    }
                }),
            );
        }
        let now = Utc::now();
        let mut feed = VecEvents(vec![tick("A STK", now), tick("B STK", now)]);
        bus.run(&mut feed);
        assert_eq!(
            *lock(&seen),
            vec!["tick:A STK", "log:A STK", "tick:B STK", "log:B STK"]
        );
    }

    #[test]
    fn live_bus_dispatches_and_stops_cooperatively() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut bus = LiveEventBus::new("test");
        {
            let hits = Arc::clone(&hits);
            bus.register(
                EventKind::Tick,
                "count",
                Box::new(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        bus.start();
        let sender = bus.sender();
        for _ in 0..5 {
            sender.publish(tick("SPY STK", Utc::now()));
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::SeqCst) < 5 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        bus.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }
}
