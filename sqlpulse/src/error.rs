//! Error taxonomy shared across the agent.
//!
//! Validation errors travel back to the control plane inside a [`Reply`];
//! transient operational errors (SQL, spool, rotation) are logged at the
//! call site and the pipeline continues at the next tick.
//!
//! [`Reply`]: crate::proto::Reply

use thiserror::Error;

/// Agent-wide error type.
///
/// The command/reply protocol serializes these as strings, so the display
/// impls are part of the wire contract (e.g. the control plane matches on
/// `"<service> is running"` after a duplicate `StartService`).
#[derive(Debug, Error)]
pub enum Error {
    /// A second `Start` without an intervening `Stop`.
    #[error("{service} is running")]
    ServiceIsRunning { service: String },

    /// `Stop` or a runtime command against a service that is not running.
    #[error("{service} is not running")]
    ServiceIsNotRunning { service: String },

    /// Command name not understood by the targeted handler.
    #[error("unknown command: {cmd}")]
    UnknownCmd { cmd: String },

    /// No service manager registered under this name.
    #[error("unknown service: {service}")]
    UnknownService { service: String },

    /// A bounded command or status queue rejected an enqueue.
    #[error("{name} is full (size {size}), cannot queue {cmd}")]
    QueueFull {
        cmd: String,
        name: String,
        size: usize,
    },

    /// A command handler did not finish within its deadline.
    #[error("timeout waiting for {cmd} to finish")]
    CmdTimeout { cmd: String },

    /// Config failed validation; the cause is human-readable.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("mysql: {0}")]
    Sql(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Sql(e.to_string())
    }
}

/// Joins multiple errors into the single string the reply wire format
/// carries. Empty input produces an empty string (success).
pub fn join_errors(errs: &[Error]) -> String {
    errs.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_is_running_display() {
        let err = Error::ServiceIsRunning {
            service: "qan".to_string(),
        };
        assert_eq!(err.to_string(), "qan is running");
    }

    #[test]
    fn test_queue_full_display() {
        let err = Error::QueueFull {
            cmd: "StartService".to_string(),
            name: "cmdQueue".to_string(),
            size: 10,
        };
        assert!(err.to_string().contains("cmdQueue"));
        assert!(err.to_string().contains("10"));
        assert!(err.to_string().contains("StartService"));
    }

    #[test]
    fn test_join_errors_empty_is_success() {
        assert_eq!(join_errors(&[]), "");
    }

    #[test]
    fn test_join_errors_multiple() {
        let errs = vec![
            Error::UnknownCmd {
                cmd: "Fly".to_string(),
            },
            Error::InvalidConfig("Interval must be > 0".to_string()),
        ];
        let joined = join_errors(&errs);
        assert!(joined.contains("unknown command: Fly"));
        assert!(joined.contains("; "));
        assert!(joined.contains("Interval must be > 0"));
    }
}
