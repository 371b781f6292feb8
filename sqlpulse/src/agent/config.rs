//! Agent config: the single blob persisted as `config/agent.conf`.

use crate::basedir::Basedir;
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_API_HOSTNAME: &str = "https://api.sqlpulse.io";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api_hostname: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub agent_uuid: String,
    /// Control-plane resource links; internal, never echoed back by
    /// `GetConfig`.
    #[serde(default)]
    pub links: HashMap<String, String>,
}

/// Loads and validates the agent config from the basedir. The hostname
/// may be defaulted; the key and uuid may not.
pub fn load_config(basedir: &Basedir) -> Result<Config, Error> {
    let mut config: Config = basedir.read_config("agent")?;
    if config.api_hostname.is_empty() {
        config.api_hostname = DEFAULT_API_HOSTNAME.to_string();
    }
    if config.api_key.is_empty() {
        return Err(Error::InvalidConfig("missing ApiKey".to_string()));
    }
    if config.agent_uuid.is_empty() {
        return Err(Error::InvalidConfig("missing AgentUuid".to_string()));
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(basedir: &Basedir, config: &Config) {
        basedir.write_config("agent", config).unwrap();
    }

    #[test]
    fn test_load_defaults_hostname() {
        let tmp = tempfile::tempdir().unwrap();
        let basedir = Basedir::init(tmp.path()).unwrap();
        write(
            &basedir,
            &Config {
                api_key: "key".to_string(),
                agent_uuid: "uuid-1".to_string(),
                ..Default::default()
            },
        );
        let config = load_config(&basedir).unwrap();
        assert_eq!(config.api_hostname, DEFAULT_API_HOSTNAME);
    }

    #[test]
    fn test_load_requires_api_key() {
        let tmp = tempfile::tempdir().unwrap();
        let basedir = Basedir::init(tmp.path()).unwrap();
        write(
            &basedir,
            &Config {
                agent_uuid: "uuid-1".to_string(),
                ..Default::default()
            },
        );
        let err = load_config(&basedir).unwrap_err();
        assert!(err.to_string().contains("ApiKey"));
    }

    #[test]
    fn test_load_requires_agent_uuid() {
        let tmp = tempfile::tempdir().unwrap();
        let basedir = Basedir::init(tmp.path()).unwrap();
        write(
            &basedir,
            &Config {
                api_key: "key".to_string(),
                ..Default::default()
            },
        );
        assert!(load_config(&basedir).is_err());
    }
}
