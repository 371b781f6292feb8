//! Metric monitor (mm): tick-driven `SHOW GLOBAL STATUS` collection.
//!
//! Each tick flattens the server's status counters into one `Collection`
//! and hands it to the spooler under a 500ms deadline. Connection loss is
//! survived with capped-backoff reconnects; ticks that arrive while
//! disconnected collect nothing.

use crate::backoff::Backoff;
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
const RECONNECT_MAX_WAIT: Duration = Duration::from_secs(5);

fn default_interval() -> u64 {
    60
}

/// Metric monitor config, persisted as `config/mm.conf`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub service: String,
    pub instance_id: u32,
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Status variables to report; empty means every numeric one.
    #[serde(default)]
    pub status: Vec<String>,
}

/// One flattened metric sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
}

/// One tick's worth of metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub start_ts: i64,
    pub metrics: Vec<Metric>,
}

/// Flattens status rows into prefixed numeric metrics. Non-numeric
/// values are skipped; the filter (when non-empty) is matched
/// case-insensitively.
pub fn collect_metrics(
    rows: &[(String, String)],
    instance_name: &str,
    filter: &[String],
) -> Vec<Metric> {
    let prefix = if instance_name.is_empty() {
        "mysql/".to_string()
    } else {
        format!("mysql/{instance_name}/")
    };
    let wanted: Vec<String> = filter.iter().map(|s| s.to_lowercase()).collect();
    rows.iter()
        .filter_map(|(name, value)| {
            if !wanted.is_empty() && !wanted.contains(&name.to_lowercase()) {
                return None;
            }
            let value: f64 = value.parse().ok()?;
            Some(Metric {
                name: format!("{prefix}{name}"),
                value,
            })
        })
        .collect()
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
            status: Arc::new(Status::new(&["mm"])),
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
        self.spawn_monitor(
            sync.handle(),
            config.clone(),
            instance.name.clone(),
            conn,
            tick_rx,
        );
        let sub = self.clock.add(tick_tx, config.interval, true);

        state.sync = Some(sync);
        state.tick_sub = Some(sub);
        state.config = Some(config.clone());
        state.running = true;
        self.running.store(true, Ordering::Release);
        *self.config_mirror.lock().expect("mm mirror lock") = Some(config);
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
        config: Config,
        instance_name: String,
        conn: Arc<dyn Connector>,
        mut tick_rx: mpsc::Receiver<DateTime<Utc>>,
    ) {
        let logger = self.logger.clone();
        let status = Arc::clone(&self.status);
        let spool = Arc::clone(&self.spool);
        tokio::spawn(async move {
            let _guard = handle.done_on_drop();
            let (conn_tx, mut conn_rx) = mpsc::channel::<bool>(1);
            spawn_connect(Arc::clone(&conn), conn_tx.clone());
            status.update("mm", "Connecting to MySQL");
            let mut connected = false;
            loop {
                tokio::select! {
                    _ = handle.stopped() => {
                        conn.close().await;
                        status.update("mm", "Stopped");
                        handle.graceful();
                        return;
                    }
                    Some(up) = conn_rx.recv() => {
                        connected = up;
                        if up {
                            status.update("mm", "Running");
                        } else {
                            status.update("mm", "Connecting to MySQL");
                            spawn_connect(Arc::clone(&conn), conn_tx.clone());
                        }
                    }
                    tick = tick_rx.recv() => {
                        let Some(tick) = tick else {
                            handle.graceful();
                            return;
                        };
                        if !connected {
                            logger.debug("not connected, tick skipped");
                            continue;
                        }
                        let rows = match conn.global_status().await {
                            Ok(rows) => rows,
                            Err(e) => {
                                logger.warn(format!("SHOW GLOBAL STATUS failed: {e}"));
                                connected = false;
                                spawn_connect(Arc::clone(&conn), conn_tx.clone());
                                continue;
                            }
                        };
                        let metrics = collect_metrics(&rows, &instance_name, &config.status);
                        if metrics.is_empty() {
                            logger.debug("no metrics");
                            continue;
                        }
                        let collection = Collection {
                            start_ts: tick.timestamp(),
                            metrics,
                        };
                        match serde_json::to_value(&collection) {
                            Ok(value) => {
                                match tokio::time::timeout(
                                    SPOOL_TIMEOUT,
                                    spool.write("mm", value),
                                )
                                .await
                                {
                                    Ok(Ok(())) => {}
                                    Ok(Err(e)) => logger.warn(format!("Lost metrics: {e}")),
                                    Err(_) => logger.debug(
                                        "Lost metrics; timeout spooling after 500ms".to_string(),
                                    ),
                                }
                            }
                            Err(e) => logger.error(format!("cannot serialize metrics: {e}")),
                        }
                    }
                }
            }
        });
    }
}

/// Connect task: retries with capped backoff until it succeeds, then
/// reports on the connected channel and exits.
fn spawn_connect(conn: Arc<dyn Connector>, conn_tx: mpsc::Sender<bool>) {
    tokio::spawn(async move {
        let mut backoff = Backoff::new(RECONNECT_MAX_WAIT);
        loop {
            tokio::time::sleep(backoff.wait()).await;
            if conn.connect(1).await.is_ok() {
                let _ = conn_tx.send(true).await;
                return;
            }
        }
    });
}

impl ServiceManager for Manager {
    fn start(&self) -> crate::BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.running {
                return Err(Error::ServiceIsRunning {
                    service: "mm".to_string(),
                });
            }
            let config: Config = match self.basedir.read_config("mm") {
                Ok(config) => config,
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.logger.info("Not enabled");
                    return Ok(());
                }
                Err(e) => {
                    self.logger.error(format!("Read mm config: {e}"));
                    return Ok(());
                }
            };
            if let Err(e) = self.start_monitor(&mut state, config).await {
                self.logger.error(format!("Start mm: {e}"));
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
                            service: "mm".to_string(),
                        });
                    }
                    match serde_json::from_value::<Config>(cmd.data.clone()) {
                        Ok(config) => match self.start_monitor(&mut state, config).await {
                            Ok(()) => {
                                let persisted = state.config.clone().expect("config set");
                                match self.basedir.write_config("mm", &persisted) {
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
                    match self.basedir.remove_config("mm") {
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
        let config = self.config_mirror.lock().expect("mm mirror lock").clone();
        let Some(config) = config else {
            return (Vec::new(), Vec::new());
        };
        match serde_json::to_string(&config) {
            Ok(json) => (
                vec![AgentConfigResource {
                    internal_service: "mm".to_string(),
                    config: json,
                    running: self.running.load(Ordering::Acquire),
                }],
                Vec::new(),
            ),
            Err(e) => (Vec::new(), vec![e.into()]),
        }
    }
}
