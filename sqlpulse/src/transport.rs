//! Duplex transport capability.
//!
//! The core never touches a socket: it consumes a message-passing surface
//! with connect/disconnect notifications. The production websocket client
//! lives outside this crate; [`ChannelClient`] is the in-memory
//! implementation used by tests and by offline runs.
//!
//! ```text
//! control plane ── cmd ──▶ AgentLink.cmd_rx ──▶ agent supervisor
//! control plane ◀─ reply ─ AgentLink.reply_tx ◀─ agent supervisor
//! control plane ◀─ entry ─ Client::send_entry ◀─ log relay
//!                  connect_rx: true/false transitions
//! ```

use crate::error::Error;
use crate::proto::{Cmd, LogEntry, Reply};
use crate::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Write deadline for one log entry.
pub const SEND_ENTRY_DEADLINE: Duration = Duration::from_secs(2);

/// Channel halves of one command/reply session. Taken once by the agent
/// supervisor at wiring time.
pub struct AgentLink {
    pub cmd_rx: mpsc::Receiver<Cmd>,
    pub reply_tx: mpsc::Sender<Reply>,
    pub connect_rx: mpsc::Receiver<bool>,
    pub error_rx: mpsc::Receiver<Error>,
}

/// A duplex client as consumed by the core.
///
/// `connect`/`disconnect` are fire-and-forget: outcomes arrive as `bool`
/// transitions on the consumer's connect channel. Each consumer (agent,
/// log relay) gets its own client instance and its own session.
pub trait Client: Send + Sync {
    /// Begins connecting. Repeated calls while connected are no-ops.
    fn connect(&self);

    /// Drops the session. The connect channel observes `false`.
    fn disconnect(&self);

    /// Transport status lines, merged into the agent's status surface.
    fn status(&self) -> HashMap<String, String>;

    /// Ships one log entry with [`SEND_ENTRY_DEADLINE`] applied.
    fn send_entry(&self, entry: LogEntry) -> BoxFuture<'_, Result<(), Error>>;
}

// ============================================================================
// In-memory client
// ============================================================================

/// Control-plane side of a [`ChannelClient`]: what a test (or a loopback
/// harness) uses to inject commands and observe replies and log entries.
pub struct RemoteSide {
    pub cmd_tx: mpsc::Sender<Cmd>,
    pub reply_rx: mpsc::Receiver<Reply>,
    pub entry_rx: mpsc::Receiver<LogEntry>,
    pub error_tx: mpsc::Sender<Error>,
}

/// In-memory duplex client. Connect transitions are published on the
/// consumer-side connect channel exactly like a real transport would.
pub struct ChannelClient {
    name: String,
    connected: AtomicBool,
    connect_tx: mpsc::Sender<bool>,
    entry_tx: mpsc::Sender<LogEntry>,
}

impl ChannelClient {
    /// Builds a client plus both channel bundles. Buffer sizes are
    /// generous enough that a disconnected session keeps limping for a
    /// while, matching real transport behavior.
    pub fn new(name: &str) -> (Arc<ChannelClient>, AgentLink, RemoteSide) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (reply_tx, reply_rx) = mpsc::channel(16);
        let (connect_tx, connect_rx) = mpsc::channel(8);
        let (error_tx, error_rx) = mpsc::channel(8);
        let (entry_tx, entry_rx) = mpsc::channel(64);
        let client = Arc::new(ChannelClient {
            name: name.to_string(),
            connected: AtomicBool::new(false),
            connect_tx,
            entry_tx,
        });
        let link = AgentLink {
            cmd_rx,
            reply_tx,
            connect_rx,
            error_rx,
        };
        let remote = RemoteSide {
            cmd_tx,
            reply_rx,
            entry_rx,
            error_tx,
        };
        (client, link, remote)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl Client for ChannelClient {
    fn connect(&self) {
        if !self.connected.swap(true, Ordering::AcqRel) {
            let _ = self.connect_tx.try_send(true);
        }
    }

    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            let _ = self.connect_tx.try_send(false);
        }
    }

    fn status(&self) -> HashMap<String, String> {
        let mut status = HashMap::new();
        let state = if self.is_connected() {
            "Connected"
        } else {
            "Disconnected"
        };
        status.insert(format!("ws-{}", self.name), state.to_string());
        status
    }

    fn send_entry(&self, entry: LogEntry) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(Error::Transport("not connected".to_string()));
            }
            tokio::time::timeout(SEND_ENTRY_DEADLINE, self.entry_tx.send(entry))
                .await
                .map_err(|_| Error::Transport("send deadline exceeded".to_string()))?
                .map_err(|_| Error::Transport("session closed".to_string()))
        })
    }
}
