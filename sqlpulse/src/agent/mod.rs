//! The agent supervisor and its collaborator capabilities.
//!
//! [`Agent`] owns the duplex transport session: it routes commands,
//! serializes mutating work through one command handler, answers status
//! queries concurrently through another, respawns either handler after a
//! crash (up to a bounded error budget), and reconnects when the
//! transport drops.

mod config;
#[allow(clippy::module_inception)]
mod agent;

pub use agent::{Agent, CMD_QUEUE_SIZE, MAX_ERRORS, STATUS_QUEUE_SIZE};
pub use config::{load_config, Config, DEFAULT_API_HOSTNAME};
pub use crate::VERSION;

use crate::error::Error;
use crate::BoxFuture;
use std::sync::RwLock;

/// The control-plane HTTP API, as consumed by `SetConfig`. The real
/// connector lives with the transport outside the core.
pub trait ApiConnector: Send + Sync {
    fn hostname(&self) -> String;
    fn api_key(&self) -> String;
    fn agent_uuid(&self) -> String;

    /// Re-establishes the API session with new credentials. On success
    /// the accessors reflect the new values.
    fn connect(
        &self,
        hostname: &str,
        api_key: &str,
        agent_uuid: &str,
    ) -> BoxFuture<'_, Result<(), Error>>;
}

/// In-memory [`ApiConnector`]: always connects, remembers what it was
/// given. Used offline and in tests.
pub struct NullApi {
    state: RwLock<(String, String, String)>,
}

impl NullApi {
    pub fn new(hostname: &str, api_key: &str, agent_uuid: &str) -> Self {
        NullApi {
            state: RwLock::new((
                hostname.to_string(),
                api_key.to_string(),
                agent_uuid.to_string(),
            )),
        }
    }
}

impl ApiConnector for NullApi {
    fn hostname(&self) -> String {
        self.state.read().expect("api lock").0.clone()
    }

    fn api_key(&self) -> String {
        self.state.read().expect("api lock").1.clone()
    }

    fn agent_uuid(&self) -> String {
        self.state.read().expect("api lock").2.clone()
    }

    fn connect(
        &self,
        hostname: &str,
        api_key: &str,
        agent_uuid: &str,
    ) -> BoxFuture<'_, Result<(), Error>> {
        let next = (
            hostname.to_string(),
            api_key.to_string(),
            agent_uuid.to_string(),
        );
        Box::pin(async move {
            *self.state.write().expect("api lock") = next;
            Ok(())
        })
    }
}

/// Binary self-update capability, driven by the `Update` command.
pub trait Updater: Send + Sync {
    fn update(&self, version: &str) -> BoxFuture<'_, Result<(), Error>>;
}

/// Build without self-update support.
pub struct NullUpdater;

impl Updater for NullUpdater {
    fn update(&self, version: &str) -> BoxFuture<'_, Result<(), Error>> {
        let version = version.to_string();
        Box::pin(async move {
            Err(Error::InvalidConfig(format!(
                "binary update to {version} is not supported by this build"
            )))
        })
    }
}
