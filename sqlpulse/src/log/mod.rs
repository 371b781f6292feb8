//! Log shipping: component loggers, the buffering relay, and the `"log"`
//! service manager.
//!
//! Components log through a cloned [`Logger`] handle. Entries flow into
//! one channel consumed by the [`Relay`], which filters by level, writes
//! the optional file sink, and ships to the control plane — buffering
//! across disconnects with a two-tier bounded buffer. Every entry is also
//! mirrored into `tracing` at emit time, so local logs never depend on
//! relay state.

mod logger;
mod relay;

pub use logger::Logger;
pub use relay::{Relay, RelayHandle, RelayStatus, BUFFER_SIZE, STDERR_SENTINEL, STDOUT_SENTINEL};

use crate::error::Error;
use crate::proto::{AgentConfigResource, Cmd, LogLevel, Reply};
use crate::service::ServiceManager;
use crate::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Persisted config of the log service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: LogLevel::Info,
            file: None,
        }
    }
}

/// The `"log"` service: thin lifecycle shell over the relay.
///
/// The relay task is spawned at agent boot and intentionally outlives the
/// cooperative shutdown (the supervisor skips `"log"`), so `stop` here
/// only reports success.
pub struct Manager {
    handle: RelayHandle,
    config: RwLock<LogConfig>,
}

impl Manager {
    pub fn new(handle: RelayHandle, config: LogConfig) -> Self {
        Manager {
            handle,
            config: RwLock::new(config),
        }
    }

    fn apply(&self, new: &LogConfig) {
        let mut config = self.config.write().expect("log config lock");
        if new.level != config.level {
            self.handle.set_level(new.level);
            config.level = new.level;
        }
        if new.file != config.file {
            self.handle
                .set_file(new.file.clone().unwrap_or_default());
            config.file = new.file.clone();
        }
    }
}

impl ServiceManager for Manager {
    fn start(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async { Ok(()) })
    }

    fn stop(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async { Ok(()) })
    }

    fn status(&self) -> HashMap<String, String> {
        let status = self.handle.status();
        let mut map = HashMap::new();
        map.insert(
            "log".to_string(),
            if status.connected {
                "Connected".to_string()
            } else {
                "Disconnected".to_string()
            },
        );
        map.insert("log-level".to_string(), status.level.name().to_string());
        map.insert("log-file".to_string(), status.file);
        map.insert("log-buffered".to_string(), status.buffered.to_string());
        map
    }

    fn handle(&self, cmd: Cmd) -> BoxFuture<'_, Reply> {
        Box::pin(async move {
            match cmd.cmd.as_str() {
                "SetConfig" => match serde_json::from_value::<LogConfig>(cmd.data.clone()) {
                    Ok(new) => {
                        self.apply(&new);
                        cmd.ok()
                    }
                    Err(e) => cmd.err(e.into()),
                },
                "GetConfig" => {
                    let (configs, errs) = self.get_config();
                    cmd.reply(Some(serde_json::json!(configs)), errs)
                }
                other => cmd.err(Error::UnknownCmd {
                    cmd: other.to_string(),
                }),
            }
        })
    }

    fn get_config(&self) -> (Vec<AgentConfigResource>, Vec<Error>) {
        let config = self.config.read().expect("log config lock");
        match serde_json::to_string(&*config) {
            Ok(json) => (
                vec![AgentConfigResource {
                    internal_service: "log".to_string(),
                    config: json,
                    running: true,
                }],
                Vec::new(),
            ),
            Err(e) => (Vec::new(), vec![e.into()]),
        }
    }
}
