// ===============================
// src/recorder.rs
// ===============================
//
// Append-only JSONL event journal for live sessions. Events are cloned onto
// a bounded channel and written by a dedicated task; the session never
// blocks on disk. Lines are flushed once a second and on shutdown.

use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

use crate::domain::Event;

pub struct Recorder {
    tx: mpsc::Sender<Event>,
    handle: JoinHandle<()>,
}

/// Cheap clone for handing to bus handlers.
#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::Sender<Event>,
}

impl RecorderHandle {
    pub fn record(&self, event: &Event) {
        if self.tx.try_send(event.clone()).is_err() {
            warn!("recorder queue full, event dropped");
        }
    }
}

impl Recorder {
    pub fn spawn(path: impl Into<String>) -> Self {
        let path = path.into();
        let (tx, rx) = mpsc::channel(4096);
        let handle = tokio::spawn(run_recorder(rx, path));
        Recorder { tx, handle }
    }

    /// Non-blocking: a full journal queue drops the event with a warning.
    pub fn record(&self, event: &Event) {
        if self.tx.try_send(event.clone()).is_err() {
            warn!("recorder queue full, event dropped");
        }
    }

    pub fn handle(&self) -> RecorderHandle {
        RecorderHandle {
            tx: self.tx.clone(),
        }
    }

    /// Drain, flush, and stop the writer task.
    pub async fn close(self) {
        drop(self.tx);
        if self.handle.await.is_err() {
            error!("recorder task panicked");
        }
    }
}

async fn run_recorder(mut rx: mpsc::Receiver<Event>, path: String) {
    let file = match OpenOptions::new().create(true).append(true).open(&path).await {
        Ok(f) => f,
        Err(e) => {
            error!(%e, path, "recorder could not open journal");
            return;
        }
    };
    let mut writer = BufWriter::new(file);
    let mut flusher = interval(Duration::from_secs(1));
    let mut written: u64 = 0;
    info!(path, "recorder started");

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(event) => match serde_json::to_string(&event) {
                    Ok(mut line) => {
                        line.push('\n');
                        if let Err(e) = writer.write_all(line.as_bytes()).await {
                            error!(%e, "journal write failed");
                            return;
                        }
                        written += 1;
                    }
                    Err(e) => warn!(%e, "event not serializable, skipped"),
                },
                None => break,
            },
            _ = flusher.tick() => {
                if let Err(e) = writer.flush().await {
                    error!(%e, "journal flush failed");
                    return;
                }
            }
        }
    }
    if let Err(e) = writer.flush().await {
        error!(%e, "final journal flush failed");
    }
    info!(written, "recorder stopped");
}
