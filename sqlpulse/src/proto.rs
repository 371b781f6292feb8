//! Wire types for the control-plane protocol.
//!
//! Every message crossing the duplex transport is one of these structs,
//! serialized as JSON. `Cmd.data` is an opaque blob interpreted by the
//! handler the command is routed to (e.g. a QAN config for
//! `StartService qan`).

use crate::error::{join_errors, Error};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A command from the control plane.
///
/// `service == "agent"` targets the supervisor itself; any other value
/// targets the service manager registered under that name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cmd {
    pub id: u64,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub service: String,
    pub cmd: String,
    #[serde(default)]
    pub data: Value,
}

impl Cmd {
    /// Builds a command with the current timestamp. Used by tests and by
    /// internal actors (e.g. shutdown) that synthesize commands.
    pub fn new(id: u64, service: &str, cmd: &str, data: Value) -> Self {
        Cmd {
            id,
            ts: Utc::now(),
            user: String::new(),
            service: service.to_string(),
            cmd: cmd.to_string(),
            data,
        }
    }

    /// Builds the reply correlated to this command. Multiple errors are
    /// joined into the single `error` string.
    pub fn reply(&self, data: Option<Value>, errs: Vec<Error>) -> Reply {
        Reply {
            id: self.id,
            cmd: self.cmd.clone(),
            data: data.unwrap_or(Value::Null),
            error: join_errors(&errs),
        }
    }

    /// Shorthand for a successful reply with no payload.
    pub fn ok(&self) -> Reply {
        self.reply(None, Vec::new())
    }

    /// Shorthand for a reply carrying a single error.
    pub fn err(&self, err: Error) -> Reply {
        self.reply(None, vec![err])
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cmd[{}] {} {}", self.id, self.cmd, self.service)
    }
}

/// Reply correlated to a [`Cmd`] by id. An empty `error` means success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub id: u64,
    pub cmd: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub error: String,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }
}

/// Syslog-style log severity carried on [`LogEntry`].
///
/// Numeric order matters: an entry is dropped when its level is *greater*
/// (more verbose) than the relay's current level.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum LogLevel {
    Emergency = 0,
    Alert = 1,
    Crit = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
}

impl LogLevel {
    pub fn name(&self) -> &'static str {
        match self {
            LogLevel::Emergency => "emergency",
            LogLevel::Alert => "alert",
            LogLevel::Crit => "crit",
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Notice => "notice",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }

    pub fn from_u8(n: u8) -> Option<LogLevel> {
        match n {
            0 => Some(LogLevel::Emergency),
            1 => Some(LogLevel::Alert),
            2 => Some(LogLevel::Crit),
            3 => Some(LogLevel::Error),
            4 => Some(LogLevel::Warning),
            5 => Some(LogLevel::Notice),
            6 => Some(LogLevel::Info),
            7 => Some(LogLevel::Debug),
            _ => None,
        }
    }
}

/// One log entry shipped to the control plane by the log relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub service: String,
    pub msg: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, service: &str, msg: String) -> Self {
        LogEntry {
            ts: Utc::now(),
            level,
            service: service.to_string(),
            msg,
        }
    }
}

/// One service's config as returned by `GetConfig`/`GetAllConfigs`.
/// The config itself is a JSON string so the control plane can store it
/// opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfigResource {
    pub internal_service: String,
    pub config: String,
    pub running: bool,
}

/// Payload of `StartService`/`StopService`: the service name plus, for
/// start, that service's config blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceData {
    pub name: String,
    #[serde(default)]
    pub config: Value,
}

/// Payload of a `Version` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub running: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed: Option<String>,
}
