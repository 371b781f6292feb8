//! Sysconfig monitor: tick-driven `SHOW GLOBAL VARIABLES` snapshots.
//!
//! Server configuration changes rarely, so the default cadence is hourly.
//! Each tick ships the full variable set as one report; diffing is the
//! control plane's job.

use crate::basedir::Basedir;
use crate::error::Error;
use crate::instance::Repo;
use crate::log::Logger;
use crate::mysql::{ConnectionFactory, Connector};
use crate::proto::{AgentConfigResource, Cmd, Reply};
use crate::service::ServiceManager;
use crate::spool::Spooler;
use crate::status::Status;
use crate::syncchan::{SyncChan, SyncHandle};
use crate::ticker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const SPOOL_TIMEOUT: Duration = Duration::from_millis(500);

fn default_interval() -> u64 {
    3600
}

/// Sysconfig service config, persisted as `config/sysconfig.conf`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub service: String,
    pub instance_id: u32,
    #[serde(default = "default_interval")]
    pub interval: u64,
}

/// One configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub ts: i64,
    pub system: String,
    pub settings: Vec<(String, String)>,
}

struct State {
    running: bool,
    sync: Option<SyncChan>,
    tick_sub: Option<ticker::SubId>,
    config: Option<Config>,
}

pub struct Manager {
    logger: Logger,
    basedir: Basedir,
    factory: Arc<dyn ConnectionFactory>,
    clock: Arc<dyn ticker::Manager>,
    spool: Arc<dyn Spooler>,
    repo: Arc<Repo>,
    status: Arc<Status>,
    state: tokio::sync::Mutex<State>,
    running: AtomicBool,
    config_mirror: std::sync::Mutex<Option<Config>>,
}

impl Manager {
    pub fn new(
        logger: Logger,
        basedir: Basedir,
        factory: Arc<dyn ConnectionFactory>,
        clock: Arc<dyn ticker::Manager>,
        spool: Arc<dyn Spooler>,
        repo: Arc<Repo>,
    ) -> Arc<Self> {
        Arc::new(Manager {
            logger,
            basedir,
            factory,
            clock,
            spool,
            repo,
            status: Arc::new(Status::new(&["sysconfig"])),
            state: tokio::sync::Mutex::new(State {
                running: false,
                sync: None,
                tick_sub: None,
                config: None,
            }),
            running: AtomicBool::new(false),
            config_mirror: std::sync::Mutex::new(None),
        })
    }

    async fn start_monitor(&self, state: &mut State, config: Config) -> Result<(), Error> {
        if config.interval == 0 {
            return Err(Error::InvalidConfig("Interval must be > 0".to_string()));
        }
        let instance = self.repo.get(&config.service, config.instance_id)?;
        let conn = self.factory.make(&instance.dsn);

        let (tick_tx, tick_rx) = mpsc::channel(1);
        let sync = SyncChan::new();
        self.spawn_monitor(sync.handle(), conn, tick_rx);
        // An unsynced subscription delivers one immediate tick, so a
        // fresh install reports its configuration right away instead of
        // waiting out the first (hourly) boundary.
        let sub = self.clock.add(tick_tx, config.interval, false);

        state.sync = Some(sync);
        state.tick_sub = Some(sub);
        state.config = Some(config.clone());
        state.running = true;
        self.running.store(true, Ordering::Release);
        *self.config_mirror.lock().expect("sysconfig mirror lock") = Some(config);
        Ok(())
    }

    async fn stop_monitor(&self, state: &mut State) {
        if let Some(sub) = state.tick_sub.take() {
            self.clock.remove(sub);
        }
        if let Some(mut sync) = state.sync.take() {
            sync.stop();
            sync.wait().await;
        }
        state.running = false;
        self.running.store(false, Ordering::Release);
    }

    fn spawn_monitor(
        &self,
        handle: SyncHandle,
        conn: Arc<dyn Connector>,
        mut tick_rx: mpsc::Receiver<DateTime<Utc>>,
    ) {
        let logger = self.logger.clone();
        let status = Arc::clone(&self.status);
        let spool = Arc::clone(&self.spool);
        tokio::spawn(async move {
            let _guard = handle.done_on_drop();
            status.update("sysconfig", "Running");
            loop {
                tokio::select! {
                    _ = handle.stopped() => {
                        conn.close().await;
                        status.update("sysconfig", "Stopped");
                        handle.graceful();
                        return;
                    }
                    tick = tick_rx.recv() => {
                        let Some(tick) = tick else {
                            handle.graceful();
                            return;
                        };
                        status.update("sysconfig", "Collecting");
                        if let Err(e) = snapshot(&conn, &spool, &logger, tick).await {
                            logger.warn(format!("sysconfig snapshot failed: {e}"));
                        }
                        status.update("sysconfig", "Running");
                    }
                }
            }
        });
    }
}

/// Connect, read the variable set, spool it, disconnect.
async fn snapshot(
    conn: &Arc<dyn Connector>,
    spool: &Arc<dyn Spooler>,
    logger: &Logger,
    tick: DateTime<Utc>,
) -> Result<(), Error> {
    conn.connect(1).await?;
    let result = async {
        let settings = conn.global_variables().await?;
        let report = Report {
            ts: tick.timestamp(),
            system: "mysql".to_string(),
            settings,
        };
        let value = serde_json::to_value(&report)?;
        match tokio::time::timeout(SPOOL_TIMEOUT, spool.write("sysconfig", value)).await {
            Ok(result) => result,
            Err(_) => {
                logger.debug("Lost sysconfig report; spool timeout".to_string());
                Ok(())
            }
        }
    }
    .await;
    conn.close().await;
    result
}

impl ServiceManager for Manager {
    fn start(&self) -> crate::BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.running {
                return Err(Error::ServiceIsRunning {
                    service: "sysconfig".to_string(),
                });
            }
            let config: Config = match self.basedir.read_config("sysconfig") {
                Ok(config) => config,
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.logger.info("Not enabled");
                    return Ok(());
                }
                Err(e) => {
                    self.logger.error(format!("Read sysconfig config: {e}"));
                    return Ok(());
                }
            };
            if let Err(e) = self.start_monitor(&mut state, config).await {
                self.logger.error(format!("Start sysconfig: {e}"));
            } else {
                self.logger.info("Started");
            }
            Ok(())
        })
    }

    fn stop(&self) -> crate::BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if !state.running {
                return Ok(());
            }
            self.stop_monitor(&mut state).await;
            self.logger.info("Stopped");
            Ok(())
        })
    }

    fn status(&self) -> HashMap<String, String> {
        self.status.all()
    }

    fn handle(&self, cmd: Cmd) -> crate::BoxFuture<'_, Reply> {
        Box::pin(async move {
            match cmd.cmd.as_str() {
                "StartService" => {
                    let mut state = self.state.lock().await;
                    if state.running {
                        return cmd.err(Error::ServiceIsRunning {
                            service: "sysconfig".to_string(),
                        });
                    }
                    match serde_json::from_value::<Config>(cmd.data.clone()) {
                        Ok(config) => match self.start_monitor(&mut state, config).await {
                            Ok(()) => {
                                let persisted = state.config.clone().expect("config set");
                                match self.basedir.write_config("sysconfig", &persisted) {
                                    Ok(()) => cmd.ok(),
                                    Err(e) => cmd.err(e),
                                }
                            }
                            Err(e) => cmd.err(e),
                        },
                        Err(e) => cmd.err(e.into()),
                    }
                }
                "StopService" => {
                    let mut state = self.state.lock().await;
                    if !state.running {
                        return cmd.ok();
                    }
                    self.stop_monitor(&mut state).await;
                    match self.basedir.remove_config("sysconfig") {
                        Ok(()) => cmd.ok(),
                        Err(e) => cmd.err(e),
                    }
                }
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
        let config = self
            .config_mirror
            .lock()
            .expect("sysconfig mirror lock")
            .clone();
        let Some(config) = config else {
            return (Vec::new(), Vec::new());
        };
        match serde_json::to_string(&config) {
            Ok(json) => (
                vec![AgentConfigResource {
                    internal_service: "sysconfig".to_string(),
                    config: json,
                    running: self.running.load(Ordering::Acquire),
                }],
                Vec::new(),
            ),
            Err(e) => (Vec::new(), vec![e.into()]),
        }
    }
}
