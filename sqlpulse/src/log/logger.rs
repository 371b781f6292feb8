//! Per-component logger handle.

use crate::proto::{LogEntry, LogLevel};
use tokio::sync::mpsc;

/// Named, cloneable handle feeding the relay's entry channel.
///
/// Sends are non-blocking: when the relay channel is saturated the entry
/// still reaches the local `tracing` subscriber, only the shipped copy is
/// dropped. A logger never stalls the component that holds it.
#[derive(Clone)]
pub struct Logger {
    service: String,
    tx: mpsc::Sender<LogEntry>,
}

impl Logger {
    pub fn new(tx: mpsc::Sender<LogEntry>, service: &str) -> Self {
        Logger {
            service: service.to_string(),
            tx,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn emit(&self, level: LogLevel, msg: String) {
        match level {
            LogLevel::Debug => tracing::debug!(service = %self.service, "{msg}"),
            LogLevel::Info | LogLevel::Notice => {
                tracing::info!(service = %self.service, "{msg}")
            }
            LogLevel::Warning => tracing::warn!(service = %self.service, "{msg}"),
            _ => tracing::error!(service = %self.service, "{msg}"),
        }
        let _ = self.tx.try_send(LogEntry::new(level, &self.service, msg));
    }

    pub fn debug(&self, msg: impl Into<String>) {
        self.emit(LogLevel::Debug, msg.into());
    }

    pub fn info(&self, msg: impl Into<String>) {
        self.emit(LogLevel::Info, msg.into());
    }

    pub fn warn(&self, msg: impl Into<String>) {
        self.emit(LogLevel::Warning, msg.into());
    }

    pub fn error(&self, msg: impl Into<String>) {
        self.emit(LogLevel::Error, msg.into());
    }

    /// FATAL severity: the condition is unrecoverable for the component,
    /// but the process keeps running.
    pub fn fatal(&self, msg: impl Into<String>) {
        self.emit(LogLevel::Crit, msg.into());
    }
}
