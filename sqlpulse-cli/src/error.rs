//! CLI error type with user-facing messages.

use std::fmt;

#[derive(Debug)]
pub enum CliError {
    /// Bad or missing configuration; the message tells the user what to
    /// fix.
    Config(String),
    /// Anything the agent core reported.
    Agent(sqlpulse::error::Error),
    Io(std::io::Error),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Configuration error: {msg}"),
            CliError::Agent(e) => write!(f, "Agent error: {e}"),
            CliError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Agent(e) => Some(e),
            CliError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlpulse::error::Error> for CliError {
    fn from(e: sqlpulse::error::Error) -> Self {
        CliError::Agent(e)
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        CliError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_config_error() {
        let err = CliError::Config("missing ApiKey".to_string());
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("missing ApiKey"));
    }

    #[test]
    fn test_from_agent_error() {
        let err: CliError = sqlpulse::error::Error::InvalidConfig("x".to_string()).into();
        assert!(matches!(err, CliError::Agent(_)));
    }
}
