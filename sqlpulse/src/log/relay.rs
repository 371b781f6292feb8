//! The buffering log relay.
//!
//! One consumer task owns all relay state. Entries are level-filtered,
//! written to the optional file sink, and shipped over the transport with
//! a bounded write deadline. While disconnected, entries land in a
//! two-tier buffer:
//!
//! - `first_buf` fills once and is never overwritten — it preserves the
//!   entries closest to whatever caused the disconnect;
//! - `second_buf` is a sliding window of the most recent entries; each
//!   eviction bumps the `lost` tally.
//!
//! On reconnect the relay drains `first_buf`, ships a synthetic
//! `"Lost N log entries"` warning when anything was dropped, then drains
//! `second_buf`. The synthetic warning is never re-buffered on failure.

use super::logger::Logger;
use crate::proto::{LogEntry, LogLevel};
use crate::transport::Client;
use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Capacity of each buffer tier.
pub const BUFFER_SIZE: usize = 10;

/// Log-file sentinel mapping to the process stdout stream.
pub const STDOUT_SENTINEL: &str = "STDOUT";

/// Log-file sentinel mapping to the process stderr stream.
pub const STDERR_SENTINEL: &str = "STDERR";

/// Relay introspection snapshot, published after every processed input.
#[derive(Debug, Clone)]
pub struct RelayStatus {
    pub level: LogLevel,
    pub file: String,
    pub connected: bool,
    pub buffered: usize,
    pub lost: usize,
}

enum FileSink {
    None,
    Stdout,
    Stderr,
    File(fs::File),
}

/// Cloneable producer surface of the relay.
#[derive(Clone)]
pub struct RelayHandle {
    log_tx: mpsc::Sender<LogEntry>,
    level_tx: mpsc::Sender<LogLevel>,
    file_tx: mpsc::Sender<String>,
    status_rx: watch::Receiver<RelayStatus>,
}

impl RelayHandle {
    /// A named logger feeding this relay.
    pub fn logger(&self, service: &str) -> Logger {
        Logger::new(self.log_tx.clone(), service)
    }

    pub fn set_level(&self, level: LogLevel) {
        let _ = self.level_tx.try_send(level);
    }

    /// Changes the file sink. Empty string disables it.
    pub fn set_file(&self, file: String) {
        let _ = self.file_tx.try_send(file);
    }

    pub fn status(&self) -> RelayStatus {
        self.status_rx.borrow().clone()
    }
}

/// The relay itself. Construct, take the [`RelayHandle`], then spawn
/// [`run`](Relay::run).
pub struct Relay {
    client: Option<Arc<dyn Client>>,
    offline: bool,
    connected: bool,
    level: LogLevel,
    file: String,
    sink: FileSink,
    buf_size: usize,
    log_rx: mpsc::Receiver<LogEntry>,
    level_rx: mpsc::Receiver<LogLevel>,
    file_rx: mpsc::Receiver<String>,
    connect_rx: Option<mpsc::Receiver<bool>>,
    first_buf: Vec<LogEntry>,
    second_buf: VecDeque<LogEntry>,
    lost: usize,
    status_tx: watch::Sender<RelayStatus>,
}

impl Relay {
    /// `client` is optional: with `None` (or `offline`) only the file sink
    /// is active and nothing is ever buffered.
    pub fn new(
        client: Option<Arc<dyn Client>>,
        connect_rx: Option<mpsc::Receiver<bool>>,
        level: LogLevel,
        log_file: Option<String>,
        offline: bool,
    ) -> (Relay, RelayHandle) {
        let (log_tx, log_rx) = mpsc::channel(BUFFER_SIZE * 3);
        let (level_tx, level_rx) = mpsc::channel(1);
        let (file_tx, file_rx) = mpsc::channel(1);
        let file = log_file.unwrap_or_default();
        let (status_tx, status_rx) = watch::channel(RelayStatus {
            level,
            file: file.clone(),
            connected: false,
            buffered: 0,
            lost: 0,
        });
        let relay = Relay {
            client,
            offline,
            connected: false,
            level,
            file,
            sink: FileSink::None,
            buf_size: BUFFER_SIZE,
            log_rx,
            level_rx,
            file_rx,
            connect_rx,
            first_buf: Vec::new(),
            second_buf: VecDeque::new(),
            lost: 0,
            status_tx,
        };
        let handle = RelayHandle {
            log_tx,
            level_tx,
            file_tx,
            status_rx,
        };
        (relay, handle)
    }

    /// Overrides the per-tier buffer capacity. Exists for tests that
    /// exercise overflow without generating dozens of entries.
    pub fn with_buffer_size(mut self, size: usize) -> Relay {
        self.buf_size = size;
        self
    }

    /// Consumes inputs until every producer is gone.
    pub async fn run(mut self) {
        let initial = self.file.clone();
        self.set_log_file(&initial);
        if !self.offline {
            if let Some(client) = &self.client {
                client.connect();
            }
        }
        loop {
            tokio::select! {
                entry = self.log_rx.recv() => {
                    let Some(entry) = entry else { return };
                    self.process(entry).await;
                }
                Some(connected) = recv_connect(&mut self.connect_rx) => {
                    self.connected = connected;
                    if connected {
                        // Drain before anything else goes on the wire:
                        // first tier, lost warning, second tier. Only
                        // then may the live connected note ship.
                        self.flush().await;
                    }
                    let note = LogEntry::new(
                        LogLevel::Warning,
                        "log",
                        format!("connected: {connected}"),
                    );
                    self.process(note).await;
                    if !connected {
                        if let Some(client) = &self.client {
                            // Keep trying in the background; entries
                            // buffer while offline.
                            client.connect();
                        }
                    }
                }
                Some(level) = self.level_rx.recv() => {
                    self.level = level;
                    debug!(level = level.name(), "log level changed");
                }
                Some(file) = self.file_rx.recv() => {
                    self.set_log_file(&file);
                }
            }
            self.publish_status();
        }
    }

    async fn process(&mut self, entry: LogEntry) {
        // Higher numeric level = more verbose than currently wanted.
        if entry.level > self.level {
            return;
        }
        self.write_sink(&entry);
        if self.offline || self.client.is_none() {
            return;
        }
        if self.connected {
            let _ = self.ship(entry, true).await;
        } else {
            self.buffer(entry);
        }
    }

    /// Attempts one transport send. On failure the entry is re-buffered
    /// when `buffer_on_err` is set.
    async fn ship(&mut self, entry: LogEntry, buffer_on_err: bool) -> Result<(), ()> {
        let client = self.client.as_ref().expect("ship requires a client");
        match client.send_entry(entry.clone()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                if buffer_on_err {
                    self.buffer(entry);
                }
                Err(())
            }
        }
    }

    fn buffer(&mut self, entry: LogEntry) {
        if self.first_buf.len() < self.buf_size {
            self.first_buf.push(entry);
            return;
        }
        self.second_buf.push_back(entry);
        if self.second_buf.len() > self.buf_size {
            self.second_buf.pop_front();
            self.lost += 1;
        }
    }

    /// Resend-on-reconnect: first tier in order, the lost-count warning,
    /// then the sliding window. Entries whose send fails stay buffered;
    /// the warning does not.
    async fn flush(&mut self) {
        for entry in std::mem::take(&mut self.first_buf) {
            if self.ship(entry.clone(), false).await.is_err() {
                self.first_buf.push(entry);
            }
        }
        if self.lost > 0 {
            let warn = LogEntry::new(
                LogLevel::Warning,
                "log",
                format!("Lost {} log entries", self.lost),
            );
            let _ = self.ship(warn, false).await;
            self.lost = 0;
        }
        for entry in std::mem::take(&mut self.second_buf) {
            if self.ship(entry.clone(), false).await.is_err() {
                self.second_buf.push_back(entry);
            }
        }
    }

    fn set_log_file(&mut self, file: &str) {
        // Dropping the previous sink closes it.
        self.sink = match file {
            "" => FileSink::None,
            STDOUT_SENTINEL => FileSink::Stdout,
            STDERR_SENTINEL => FileSink::Stderr,
            path => {
                let mut options = fs::OpenOptions::new();
                options.append(true).create(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::OpenOptionsExt;
                    options.mode(0o755);
                }
                match options.open(path) {
                    Ok(f) => FileSink::File(f),
                    Err(e) => {
                        let note = LogEntry::new(
                            LogLevel::Warning,
                            "log",
                            format!("cannot open log file {path}: {e}"),
                        );
                        self.write_sink(&note);
                        return;
                    }
                }
            }
        };
        self.file = file.to_string();
    }

    fn write_sink(&mut self, entry: &LogEntry) {
        let line = format!(
            "{} {}: {}: {}",
            entry.ts.format("%Y-%m-%d %H:%M:%S%.3f"),
            entry.service,
            entry.level.name(),
            entry.msg
        );
        match &mut self.sink {
            FileSink::None => {}
            FileSink::Stdout => {
                let _ = writeln!(std::io::stdout(), "{line}");
            }
            FileSink::Stderr => {
                let _ = writeln!(std::io::stderr(), "{line}");
            }
            FileSink::File(f) => {
                let _ = writeln!(f, "{line}");
            }
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(RelayStatus {
            level: self.level,
            file: self.file.clone(),
            connected: self.connected,
            buffered: self.first_buf.len() + self.second_buf.len(),
            lost: self.lost,
        });
    }
}

async fn recv_connect(rx: &mut Option<mpsc::Receiver<bool>>) -> Option<bool> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
