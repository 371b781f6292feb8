//! QAN lifecycle and the run loop.
//!
//! States: Stopped → Starting → Running → Stopping → Stopped.
//! Reconfigure is stop + start; `SetConfig` is intentionally unsupported.
//!
//! Transient per-tick failures (connect, SQL, rotation, spool) are logged
//! and the pipeline continues at the next tick. Only `Stop` ends it.

use super::interval::{FilenameFunc, IntervalIter, IntervalIterFactory};
use super::worker::WorkerFactory;
use super::{make_report, validate_config, Config, Interval, Job, COLLECT_FROM_PERFSCHEMA,
            COLLECT_FROM_SLOWLOG};
use crate::basedir::Basedir;
use crate::error::Error;
use crate::instance::{MysqlInstance, Repo};
use crate::log::Logger;
use crate::mrm::{self, RestartMonitor};
use crate::mysql::{ConnectionFactory, Connector, VarValue};
use crate::proto::{AgentConfigResource, Cmd, Reply};
use crate::service::ServiceManager;
use crate::spool::Spooler;
use crate::status::Status;
use crate::syncchan::{SyncChan, SyncHandle};
use crate::ticker;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Deadline for handing a report to the spooler.
const SPOOL_TIMEOUT: Duration = Duration::from_millis(500);

/// Supervisory margin on top of a worker's configured run time.
const WORKER_GRACE: Duration = Duration::from_secs(10);

/// If the first aligned tick is further away than this, synthesize an
/// immediate tick so the first (partial) interval is not wasted.
const MAX_FIRST_TICK_WAIT_SECS: f64 = 60.0;

struct WorkerEntry {
    worker: Arc<dyn super::Worker>,
    interval: Interval,
}

type WorkerMap = Arc<std::sync::Mutex<HashMap<String, WorkerEntry>>>;

/// Lifecycle state, guarded by one async lock. The agent serializes
/// mutating commands, so contention here is start/stop vs. status reads,
/// and status reads go through the mirrors below instead.
struct State {
    config: Option<Config>,
    running: bool,
    sync: Option<SyncChan>,
    tick_sub: Option<ticker::SubId>,
    tick_tx: Option<mpsc::Sender<DateTime<Utc>>>,
    restart_sub: Option<(String, mrm::SubId)>,
    conn: Option<Arc<dyn Connector>>,
    instance: Option<MysqlInstance>,
    iter: Option<Box<dyn IntervalIter>>,
}

pub struct Manager {
    logger: Logger,
    basedir: Basedir,
    factory: Arc<dyn ConnectionFactory>,
    clock: Arc<dyn ticker::Manager>,
    iter_factory: Arc<dyn IntervalIterFactory>,
    worker_factory: Arc<dyn WorkerFactory>,
    spool: Arc<dyn Spooler>,
    repo: Arc<Repo>,
    mrm: Arc<dyn RestartMonitor>,
    status: Arc<Status>,
    state: tokio::sync::Mutex<State>,
    workers: WorkerMap,
    // Mirrors for the synchronous status/get_config paths.
    running: AtomicBool,
    tick_sub_mirror: std::sync::Mutex<Option<ticker::SubId>>,
    config_mirror: std::sync::Mutex<Option<Config>>,
}

impl Manager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        logger: Logger,
        basedir: Basedir,
        factory: Arc<dyn ConnectionFactory>,
        clock: Arc<dyn ticker::Manager>,
        iter_factory: Arc<dyn IntervalIterFactory>,
        worker_factory: Arc<dyn WorkerFactory>,
        spool: Arc<dyn Spooler>,
        repo: Arc<Repo>,
        mrm: Arc<dyn RestartMonitor>,
    ) -> Arc<Self> {
        Arc::new(Manager {
            logger,
            basedir,
            factory,
            clock,
            iter_factory,
            worker_factory,
            spool,
            repo,
            mrm,
            status: Arc::new(Status::new(&[
                "qan",
                "qan-parser",
                "qan-last-interval",
                "qan-next-interval",
            ])),
            state: tokio::sync::Mutex::new(State {
                config: None,
                running: false,
                sync: None,
                tick_sub: None,
                tick_tx: None,
                restart_sub: None,
                conn: None,
                instance: None,
                iter: None,
            }),
            workers: Arc::new(std::sync::Mutex::new(HashMap::new())),
            running: AtomicBool::new(false),
            tick_sub_mirror: std::sync::Mutex::new(None),
            config_mirror: std::sync::Mutex::new(None),
        })
    }

    // ------------------------------------------------------------------------
    // Start / stop sequences
    // ------------------------------------------------------------------------

    /// The start sequence of spec lifecycle: validate, resolve instance,
    /// subscribe MRM, enable collection upstream, start the iterator and
    /// the run loop, subscribe to the clock.
    async fn start_pipeline(&self, state: &mut State, mut config: Config) -> Result<(), Error> {
        validate_config(&mut config)?;

        // The MySQL instance is owned by the manager and only ever
        // mutated here, under the state lock.
        let instance = self.repo.get(&config.service, config.instance_id)?;
        let conn = self.factory.make(&instance.dsn);

        let (restart_id, restart_rx) = self.mrm.add(conn.dsn())?;

        // Enable the slow log or performance schema.
        if let Err(e) = configure_mysql(&conn, &config.start).await {
            self.mrm.remove(conn.dsn(), restart_id);
            return Err(e);
        }

        // Interval iterator fed by our tick channel.
        let (tick_tx, tick_rx) = mpsc::channel(1);
        let filename_func = if config.collect_from == COLLECT_FROM_SLOWLOG {
            Some(slow_log_filename_func(Arc::clone(&conn)))
        } else {
            None
        };
        let mut iter = self
            .iter_factory
            .make(&config.collect_from, filename_func, tick_rx);
        let interval_rx = iter
            .interval_chan()
            .ok_or_else(|| Error::InvalidConfig("iterator channel already taken".to_string()))?;
        iter.start();

        let sync = SyncChan::new();
        self.spawn_run_loop(sync.handle(), config.clone(), interval_rx, restart_rx, Arc::clone(&conn));

        let sub = self.clock.add(tick_tx.clone(), config.interval, true);
        let eta = self.clock.eta(sub);
        if eta > MAX_FIRST_TICK_WAIT_SECS {
            let began = ticker::began(config.interval, Utc::now().timestamp());
            self.logger
                .info(format!("First interval began at {began}"));
            let _ = tick_tx.try_send(began);
        } else {
            self.logger
                .info(format!("First interval begins in {eta:.1} seconds"));
        }

        state.restart_sub = Some((conn.dsn().to_string(), restart_id));
        state.sync = Some(sync);
        state.tick_sub = Some(sub);
        state.tick_tx = Some(tick_tx);
        state.conn = Some(conn);
        state.instance = Some(instance);
        state.iter = Some(iter);
        state.config = Some(config.clone());
        state.running = true;

        self.running.store(true, Ordering::Release);
        *self.tick_sub_mirror.lock().expect("qan mirror lock") = Some(sub);
        *self.config_mirror.lock().expect("qan mirror lock") = Some(config);
        Ok(())
    }

    /// Unwinds everything `start_pipeline` set up, then disables
    /// collection upstream.
    async fn stop_pipeline(&self, state: &mut State) -> Result<(), Error> {
        if let Some(iter) = state.iter.take() {
            iter.stop();
        }
        if let Some(sub) = state.tick_sub.take() {
            self.clock.remove(sub);
        }
        state.tick_tx = None;
        if let Some((dsn, id)) = state.restart_sub.take() {
            self.mrm.remove(&dsn, id);
        }
        if let Some(mut sync) = state.sync.take() {
            sync.stop();
            sync.wait().await;
        }
        let result = match (&state.conn, &state.config) {
            (Some(conn), Some(config)) => configure_mysql(conn, &config.stop).await,
            _ => Ok(()),
        };
        state.conn = None;
        state.instance = None;
        state.running = false;

        self.running.store(false, Ordering::Release);
        *self.tick_sub_mirror.lock().expect("qan mirror lock") = None;
        result
    }

    // ------------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------------

    fn spawn_run_loop(
        &self,
        handle: SyncHandle,
        config: Config,
        mut interval_rx: mpsc::Receiver<Interval>,
        mut restart_rx: mpsc::Receiver<bool>,
        conn: Arc<dyn Connector>,
    ) {
        let logger = self.logger.clone();
        let status = Arc::clone(&self.status);
        let workers = Arc::clone(&self.workers);
        let worker_factory = Arc::clone(&self.worker_factory);
        let factory = Arc::clone(&self.factory);
        let spool = Arc::clone(&self.spool);
        tokio::spawn(async move {
            let _guard = handle.done_on_drop();
            status.update("qan-parser", "Starting");
            let (done_tx, mut done_rx) = mpsc::channel::<String>(config.max_workers + 2);
            let mut last_ts: Option<DateTime<Utc>> = None;
            let mut old_slow_logs: HashMap<String, usize> = HashMap::new();
            loop {
                let running = workers.lock().expect("qan workers lock").len();
                status.update(
                    "qan-parser",
                    &format!("Idle ({} of {} running)", running, config.max_workers),
                );
                tokio::select! {
                    interval = interval_rx.recv() => {
                        let Some(interval) = interval else {
                            handle.graceful();
                            status.update("qan-parser", "Stopped");
                            return;
                        };
                        handle_interval(
                            interval,
                            &config,
                            &logger,
                            &status,
                            &workers,
                            &worker_factory,
                            &factory,
                            &spool,
                            &conn,
                            &done_tx,
                            &mut old_slow_logs,
                        )
                        .await;
                    }
                    Some(name) = done_rx.recv() => {
                        reap_worker(
                            &name,
                            &config,
                            &logger,
                            &status,
                            &workers,
                            &mut last_ts,
                            &mut old_slow_logs,
                        )
                        .await;
                    }
                    Some(_) = restart_rx.recv() => {
                        logger.info("MySQL restarted, re-enabling collection");
                        if let Err(e) = configure_mysql(&conn, &config.start).await {
                            // Next tick retries implicitly; nothing fatal.
                            logger.warn(format!(
                                "Failed to configure MySQL after restart: {e}"
                            ));
                        }
                    }
                    _ = handle.stopped() => {
                        handle.graceful();
                        status.update("qan-parser", "Stopped");
                        return;
                    }
                }
            }
        });
    }
}

// ----------------------------------------------------------------------------
// Run-loop helpers (free functions: the loop owns copies, not the manager)
// ----------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn handle_interval(
    mut interval: Interval,
    config: &Config,
    logger: &Logger,
    status: &Arc<Status>,
    workers: &WorkerMap,
    worker_factory: &Arc<dyn WorkerFactory>,
    factory: &Arc<dyn ConnectionFactory>,
    spool: &Arc<dyn Spooler>,
    conn: &Arc<dyn Connector>,
    done_tx: &mpsc::Sender<String>,
    old_slow_logs: &mut HashMap<String, usize>,
) {
    let running = workers.lock().expect("qan workers lock").len();
    if running >= config.max_workers {
        logger.warn("All workers busy, interval dropped");
        return;
    }

    if config.collect_from == COLLECT_FROM_SLOWLOG
        && config.max_slow_log_size > 0
        && interval.end_offset >= config.max_slow_log_size
    {
        logger.info("Rotating slow log");
        status.update("qan-parser", "Rotating slow log");
        if let Err(e) =
            rotate_slow_log(config, &mut interval, conn, workers, old_slow_logs).await
        {
            logger.error(format!("slow log rotation failed: {e}"));
        }
    }

    status.update("qan-parser", "Running worker");
    let job = Job {
        id: interval.number.to_string(),
        slow_log_file: interval.filename.clone(),
        start_offset: interval.start_offset,
        end_offset: interval.end_offset,
        run_time: Duration::from_secs(config.worker_run_time),
        example_queries: config.example_queries,
    };

    // Perfschema workers get their own connector; the manager's stays
    // reserved for rotation and reconfiguration.
    let worker_conn = if config.collect_from == COLLECT_FROM_PERFSCHEMA {
        Some(factory.make(conn.dsn()))
    } else {
        None
    };
    let name = format!("qan-worker-{}", interval.number);
    let worker = worker_factory.make(&config.collect_from, &name, worker_conn);
    workers.lock().expect("qan workers lock").insert(
        name.clone(),
        WorkerEntry {
            worker: Arc::clone(&worker),
            interval: interval.clone(),
        },
    );

    let logger = logger.clone();
    let spool = Arc::clone(spool);
    let config = config.clone();
    let done_tx = done_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = worker.set_up(&interval) {
            logger.error(format!("{name} setup: {e}"));
            let _ = done_tx.send(name).await;
            return;
        }
        let started = Instant::now();
        let deadline = job.run_time + WORKER_GRACE;
        let run = tokio::spawn({
            let worker = Arc::clone(&worker);
            let job = job.clone();
            async move { worker.run(&job).await }
        });
        match tokio::time::timeout(deadline, run).await {
            Err(_) => {
                logger.error(format!("{name} exceeded run time, result dropped"));
            }
            Ok(Err(join_err)) if join_err.is_panic() => {
                logger.error(format!("QAN worker for {interval} crashed"));
            }
            Ok(Err(_)) => {}
            Ok(Ok(Err(e))) => {
                logger.error(format!("{name}: {e}"));
            }
            Ok(Ok(Ok(mut result))) => {
                result.run_time = started.elapsed().as_secs_f64();
                let report = make_report(&config, &interval, result);
                match serde_json::to_value(&report) {
                    Ok(value) => {
                        match tokio::time::timeout(SPOOL_TIMEOUT, spool.write("qan", value)).await
                        {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => logger.warn(format!("Lost report: {e}")),
                            Err(_) => logger.debug("Lost report: spool timeout".to_string()),
                        }
                    }
                    Err(e) => logger.error(format!("cannot serialize report: {e}")),
                }
            }
        }
        worker.cleanup();
        // Always reap, including after panic or timeout.
        let _ = done_tx.send(name).await;
    });
}

async fn reap_worker(
    name: &str,
    config: &Config,
    logger: &Logger,
    status: &Arc<Status>,
    workers: &WorkerMap,
    last_ts: &mut Option<DateTime<Utc>>,
    old_slow_logs: &mut HashMap<String, usize>,
) {
    status.update("qan-parser", "Reaping worker");
    let entry = workers.lock().expect("qan workers lock").remove(name);
    if let Some(entry) = entry {
        if last_ts.map_or(true, |t| entry.interval.start_time > t) {
            status.update(
                "qan-last-interval",
                &format!(
                    "{} to {}",
                    entry.interval.start_time.format("%Y-%m-%d %H:%M:%S"),
                    entry.interval.stop_time.format("%H:%M:%S UTC")
                ),
            );
            *last_ts = Some(entry.interval.start_time);
        }
    }

    if config.collect_from != COLLECT_FROM_SLOWLOG {
        return;
    }
    // Old rotated logs become deletable once every worker active at
    // rotation time has finished. The counter is a lower bound; never
    // unlink a file an active interval still references.
    let active_files: HashSet<String> = workers
        .lock()
        .expect("qan workers lock")
        .values()
        .filter_map(|e| e.interval.filename.clone())
        .collect();
    let mut removed = Vec::new();
    for (file, count) in old_slow_logs.iter_mut() {
        if *count > 1 {
            *count -= 1;
            continue;
        }
        if active_files.contains(file) {
            continue;
        }
        status.update("qan-parser", &format!("Removing old slow log {file}"));
        match tokio::fs::remove_file(&file).await {
            Ok(()) => {
                logger.info(format!("Removed {file}"));
                removed.push(file.clone());
            }
            Err(e) => logger.warn(format!("cannot remove {file}: {e}")),
        }
    }
    for file in removed {
        old_slow_logs.remove(&file);
    }
}

/// Pause logging upstream, rename the file, resume logging, and point the
/// interval at the renamed file so the current worker parses the rest of
/// it.
async fn rotate_slow_log(
    config: &Config,
    interval: &mut Interval,
    conn: &Arc<dyn Connector>,
    workers: &WorkerMap,
    old_slow_logs: &mut HashMap<String, usize>,
) -> Result<(), Error> {
    let old_file = interval
        .filename
        .clone()
        .ok_or_else(|| Error::InvalidConfig("rotation without a slow log file".to_string()))?;

    conn.connect(2).await?;
    let result = async {
        conn.set(&config.stop).await?;
        let new_file = format!("{}-{}", old_file, Utc::now().timestamp());
        tokio::fs::rename(&old_file, &new_file).await?;
        conn.set(&config.start).await?;

        interval.filename = Some(new_file.clone());
        if let Ok(meta) = tokio::fs::metadata(&new_file).await {
            interval.end_offset = meta.len();
        }
        if config.remove_old_slow_logs {
            let running = workers.lock().expect("qan workers lock").len();
            old_slow_logs.insert(new_file, running + 1);
        }
        Ok(())
    }
    .await;
    conn.close().await;
    result
}

/// Connect, apply mutations, disconnect.
async fn configure_mysql(conn: &Arc<dyn Connector>, vars: &[VarValue]) -> Result<(), Error> {
    conn.connect(2).await?;
    let result = conn.set(vars).await;
    conn.close().await;
    result
}

/// Resolves the slow-log path from the server, making relative paths
/// absolute under the datadir.
fn slow_log_filename_func(conn: Arc<dyn Connector>) -> FilenameFunc {
    Arc::new(move || {
        let conn = Arc::clone(&conn);
        Box::pin(async move {
            conn.connect(1).await?;
            let result = async {
                let datadir = conn.global_var("datadir").await?;
                let file = conn.global_var("slow_query_log_file").await?;
                Ok(abs_data_file(&datadir, &file))
            }
            .await;
            conn.close().await;
            result
        })
    })
}

fn abs_data_file(datadir: &str, filename: &str) -> String {
    let path = Path::new(filename);
    if path.is_absolute() {
        filename.to_string()
    } else {
        Path::new(datadir)
            .join(filename)
            .to_string_lossy()
            .into_owned()
    }
}

// ----------------------------------------------------------------------------
// ServiceManager
// ----------------------------------------------------------------------------

impl ServiceManager for Manager {
    /// Boot-time start from the persisted config. A missing or invalid
    /// config disables the service without failing agent startup.
    fn start(&self) -> crate::BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.running {
                return Err(Error::ServiceIsRunning {
                    service: "qan".to_string(),
                });
            }
            self.status.update("qan", "Starting");
            let config: Config = match self.basedir.read_config("qan") {
                Ok(config) => config,
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.logger.info("Not enabled");
                    self.status.update("qan", "Stopped");
                    return Ok(());
                }
                Err(e) => {
                    self.logger.error(format!("Read qan config: {e}"));
                    self.status.update("qan", "Stopped");
                    return Ok(());
                }
            };
            if let Err(e) = self.start_pipeline(&mut state, config).await {
                self.logger.error(format!("Start qan: {e}"));
                self.status.update("qan", "Stopped");
                return Ok(());
            }
            self.logger.info("Started");
            self.status.update("qan", "Running");
            Ok(())
        })
    }

    fn stop(&self) -> crate::BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if !state.running {
                return Ok(());
            }
            self.status.update("qan", "Stopping");
            if let Err(e) = self.stop_pipeline(&mut state).await {
                self.logger.error(format!("Stop qan: {e}"));
            }
            self.logger.info("Stopped");
            self.status.update("qan", "Stopped");
            Ok(())
        })
    }

    fn status(&self) -> HashMap<String, String> {
        if self.running.load(Ordering::Acquire) {
            let eta = self
                .tick_sub_mirror
                .lock()
                .expect("qan mirror lock")
                .map(|sub| self.clock.eta(sub))
                .unwrap_or(0.0);
            self.status
                .update("qan-next-interval", &format!("{eta:.1}s"));
        } else {
            self.status.update("qan-next-interval", "");
        }
        let mut worker_status = HashMap::new();
        for entry in self.workers.lock().expect("qan workers lock").values() {
            worker_status.insert(entry.worker.name().to_string(), entry.worker.status());
        }
        self.status.merge(worker_status)
    }

    fn handle(&self, cmd: Cmd) -> crate::BoxFuture<'_, Reply> {
        Box::pin(async move {
            self.status.update_cmd("qan", "Handling", &cmd);
            let reply = match cmd.cmd.as_str() {
                "StartService" => {
                    let mut state = self.state.lock().await;
                    if state.running {
                        cmd.err(Error::ServiceIsRunning {
                            service: "qan".to_string(),
                        })
                    } else {
                        match serde_json::from_value::<Config>(cmd.data.clone()) {
                            Ok(config) => match self.start_pipeline(&mut state, config).await {
                                Ok(()) => {
                                    // Persist so the agent restarts qan on
                                    // its next boot.
                                    let persisted = state.config.clone().expect("config set");
                                    match self.basedir.write_config("qan", &persisted) {
                                        Ok(()) => cmd.ok(),
                                        Err(e) => cmd.err(e),
                                    }
                                }
                                Err(e) => cmd.err(e),
                            },
                            Err(e) => cmd.err(e.into()),
                        }
                    }
                }
                "StopService" => {
                    let mut state = self.state.lock().await;
                    if !state.running {
                        cmd.ok()
                    } else {
                        let mut errs = Vec::new();
                        if let Err(e) = self.stop_pipeline(&mut state).await {
                            errs.push(e);
                        }
                        if let Err(e) = self.basedir.remove_config("qan") {
                            errs.push(e);
                        }
                        cmd.reply(None, errs)
                    }
                }
                "GetConfig" => {
                    let (configs, errs) = self.get_config();
                    cmd.reply(Some(serde_json::json!(configs)), errs)
                }
                // SetConfig does not work by design: reconfigure by
                // stopping and starting with the new config.
                other => cmd.err(Error::UnknownCmd {
                    cmd: other.to_string(),
                }),
            };
            self.status.update("qan", if self.running.load(Ordering::Acquire) {
                "Running"
            } else {
                "Stopped"
            });
            reply
        })
    }

    fn get_config(&self) -> (Vec<AgentConfigResource>, Vec<Error>) {
        let config = self.config_mirror.lock().expect("qan mirror lock").clone();
        let Some(config) = config else {
            return (Vec::new(), Vec::new());
        };
        match serde_json::to_string(&config) {
            Ok(json) => (
                vec![AgentConfigResource {
                    internal_service: "qan".to_string(),
                    config: json,
                    running: self.running.load(Ordering::Acquire),
                }],
                Vec::new(),
            ),
            Err(e) => (Vec::new(), vec![e.into()]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abs_data_file_joins_relative() {
        assert_eq!(
            abs_data_file("/var/lib/mysql", "slow.log"),
            "/var/lib/mysql/slow.log"
        );
    }

    #[test]
    fn test_abs_data_file_keeps_absolute() {
        assert_eq!(
            abs_data_file("/var/lib/mysql", "/tmp/slow.log"),
            "/tmp/slow.log"
        );
    }
}
