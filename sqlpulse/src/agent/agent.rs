//! The agent supervisor run loop and its two handler tasks.
//!
//! ```text
//!                 ┌──────────────────────────────────────────┐
//!   transport ──▶ │ run loop: route by cmd                   │
//!                 │   Restart/Stop/Abort     handled inline  │
//!                 │   Status      ──▶ statusChan (size 10)   │
//!                 │   everything  ──▶ cmdChan    (size 10)   │
//!                 │ crash respawn (≤ 3), reconnect           │
//!                 └───────┬──────────────────────┬───────────┘
//!                         ▼                      ▼
//!                  cmdHandler (serial)   statusHandler (concurrent)
//! ```
//!
//! Mutating commands are serialized: handling two `StartService`s at once
//! would corrupt service state, so `cmdChan` is first-come-first-served.
//! Status requests bypass that queue so the operator can always see what
//! a busy agent is doing.

use super::config::Config;
use super::{ApiConnector, Updater};
use crate::basedir::Basedir;
use crate::error::Error;
use crate::log::Logger;
use crate::proto::{AgentConfigResource, Cmd, Reply, VersionInfo};
use crate::service::Registry;
use crate::status::Status;
use crate::syncchan::{SyncChan, SyncHandle};
use crate::transport::{AgentLink, Client};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use crate::VERSION;

pub const CMD_QUEUE_SIZE: usize = 10;
pub const STATUS_QUEUE_SIZE: usize = 10;
/// Handler crashes tolerated before the supervisor stops respawning.
pub const MAX_ERRORS: usize = 3;

const REPLY_TIMEOUT: Duration = Duration::from_secs(20);
const CMD_TIMEOUT: Duration = Duration::from_secs(20);
const UPDATE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Shared by the run loop and both handler tasks.
struct Inner {
    config: RwLock<Config>,
    basedir: Basedir,
    logger: Logger,
    client: Arc<dyn Client>,
    api: Arc<dyn ApiConnector>,
    services: Registry,
    updater: Arc<dyn Updater>,
    status: Status,
    status_tx: mpsc::Sender<Cmd>,
    cmd_tx: mpsc::Sender<Cmd>,
    reply_tx: mpsc::Sender<Reply>,
}

pub struct Agent {
    inner: Arc<Inner>,
    cmd_rx_transport: mpsc::Receiver<Cmd>,
    connect_rx: mpsc::Receiver<bool>,
    error_rx: mpsc::Receiver<Error>,
    // Queue receivers survive handler crashes: a respawned handler locks
    // the same receiver the dead one held.
    cmd_rx: Arc<Mutex<mpsc::Receiver<Cmd>>>,
    status_rx: Arc<Mutex<mpsc::Receiver<Cmd>>>,
    cmd_sync: SyncChan,
    status_sync: SyncChan,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        basedir: Basedir,
        logger: Logger,
        client: Arc<dyn Client>,
        link: AgentLink,
        api: Arc<dyn ApiConnector>,
        services: Registry,
        updater: Arc<dyn Updater>,
    ) -> Agent {
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_QUEUE_SIZE);
        let (status_tx, status_rx) = mpsc::channel(STATUS_QUEUE_SIZE);
        let inner = Arc::new(Inner {
            config: RwLock::new(config),
            basedir,
            logger,
            client,
            api,
            services,
            updater,
            status: Status::new(&["agent", "agent-cmd-handler"]),
            status_tx,
            cmd_tx,
            reply_tx: link.reply_tx,
        });
        Agent {
            inner,
            cmd_rx_transport: link.cmd_rx,
            connect_rx: link.connect_rx,
            error_rx: link.error_rx,
            cmd_rx: Arc::new(Mutex::new(cmd_rx)),
            status_rx: Arc::new(Mutex::new(status_rx)),
            cmd_sync: SyncChan::new(),
            status_sync: SyncChan::new(),
        }
    }

    /// The sole process-level loop. Returns after `Stop` or `Restart`.
    pub async fn run(mut self) -> Result<(), Error> {
        let inner = Arc::clone(&self.inner);
        let logger = inner.logger.clone();

        inner.client.connect();
        spawn_cmd_handler(
            Arc::clone(&inner),
            Arc::clone(&self.cmd_rx),
            self.cmd_sync.handle(),
        );
        spawn_status_handler(
            Arc::clone(&inner),
            Arc::clone(&self.status_rx),
            self.status_sync.handle(),
        );

        let mut cmd_handler_errors = 0;
        let mut status_handler_errors = 0;
        logger.info("Started");

        loop {
            inner.status.update("agent", "Idle");
            tokio::select! {
                cmd = self.cmd_rx_transport.recv() => {
                    let Some(cmd) = cmd else {
                        logger.warn("transport command channel closed");
                        return Ok(());
                    };
                    if cmd.cmd == "Abort" {
                        // Operator escape hatch: die loudly, on purpose.
                        panic!("Abort: {cmd}");
                    }
                    match cmd.cmd.as_str() {
                        "Restart" => {
                            inner.status.update_cmd("agent", "Restarting", &cmd);
                            match restart_self(&inner, &cmd) {
                                Ok(()) => {
                                    reply(&inner, cmd.ok()).await;
                                    return Ok(());
                                }
                                Err(e) => {
                                    reply(&inner, cmd.err(e)).await;
                                }
                            }
                        }
                        "Stop" => {
                            logger.info(format!("Stopping {cmd}"));
                            inner.status.update_cmd("agent", "Stopping", &cmd);
                            self.shutdown().await;
                            reply(&inner, cmd.ok()).await;
                            logger.info("Stopped");
                            inner.status.update_cmd("agent", "Stopped", &cmd);
                            return Ok(());
                        }
                        "Status" => {
                            inner.status.update_cmd("agent", "Queueing", &cmd);
                            if inner.status_tx.try_send(cmd.clone()).is_err() {
                                let full = Error::QueueFull {
                                    cmd: cmd.cmd.clone(),
                                    name: "statusQueue".to_string(),
                                    size: STATUS_QUEUE_SIZE,
                                };
                                reply(&inner, cmd.err(full)).await;
                            }
                        }
                        _ => {
                            inner.status.update_cmd("agent", "Queueing", &cmd);
                            if inner.cmd_tx.try_send(cmd.clone()).is_err() {
                                let full = Error::QueueFull {
                                    cmd: cmd.cmd.clone(),
                                    name: "cmdQueue".to_string(),
                                    size: CMD_QUEUE_SIZE,
                                };
                                reply(&inner, cmd.err(full)).await;
                            }
                        }
                    }
                }
                _ = self.cmd_sync.crashed() => {
                    cmd_handler_errors += 1;
                    if cmd_handler_errors < MAX_ERRORS {
                        logger.error("cmd handler crashed, restarting");
                        spawn_cmd_handler(
                            Arc::clone(&inner),
                            Arc::clone(&self.cmd_rx),
                            self.cmd_sync.handle(),
                        );
                    } else {
                        logger.fatal("Too many cmd handler errors");
                    }
                }
                _ = self.status_sync.crashed() => {
                    status_handler_errors += 1;
                    if status_handler_errors < MAX_ERRORS {
                        logger.error("status handler crashed, restarting");
                        spawn_status_handler(
                            Arc::clone(&inner),
                            Arc::clone(&self.status_rx),
                            self.status_sync.handle(),
                        );
                    } else {
                        logger.fatal("Too many status handler errors");
                    }
                }
                Some(err) = self.error_rx.recv() => {
                    logger.warn(format!("transport: {err}"));
                }
                Some(connected) = self.connect_rx.recv() => {
                    if connected {
                        logger.info("Connected to API");
                        cmd_handler_errors = 0;
                        status_handler_errors = 0;
                    } else {
                        logger.warn("Lost connection to API");
                        inner.client.connect();
                    }
                }
            }
        }
    }

    /// Cooperative shutdown: cmd handler first (no more mutations), then
    /// every service except `"log"` (so teardown errors still ship), then
    /// the status handler.
    async fn shutdown(&mut self) {
        let inner = &self.inner;
        let cmd = Cmd::new(0, "agent", "Stop", serde_json::Value::Null);

        inner.logger.info("Stopping cmd handler");
        inner
            .status
            .update_cmd("agent", "Stopping cmd handler", &cmd);
        self.cmd_sync.stop();
        self.cmd_sync.wait().await;

        for (name, manager) in inner.services.iter() {
            if name == "log" {
                continue;
            }
            inner.logger.info(format!("Stopping {name}"));
            inner
                .status
                .update_cmd("agent", &format!("Stopping {name}"), &cmd);
            if let Err(e) = manager.stop().await {
                inner.logger.warn(format!("Stop {name}: {e}"));
            }
        }

        inner.logger.info("Stopping status handler");
        inner
            .status
            .update_cmd("agent", "Stopping status handler", &cmd);
        self.status_sync.stop();
        self.status_sync.wait().await;
    }
}

// ============================================================================
// Command handler (serial)
// ============================================================================

fn spawn_cmd_handler(
    inner: Arc<Inner>,
    cmd_rx: Arc<Mutex<mpsc::Receiver<Cmd>>>,
    handle: SyncHandle,
) {
    tokio::spawn(async move {
        let _guard = handle.done_on_drop();
        loop {
            inner.status.update("agent-cmd-handler", "Idle");
            let cmd = {
                let mut rx = cmd_rx.lock().await;
                tokio::select! {
                    _ = handle.stopped() => {
                        inner.status.update("agent-cmd-handler", "Stopped");
                        handle.graceful();
                        return;
                    }
                    cmd = rx.recv() => {
                        let Some(cmd) = cmd else {
                            handle.graceful();
                            return;
                        };
                        cmd
                    }
                }
            };
            inner.status.update_cmd("agent-cmd-handler", "Handling", &cmd);

            if cmd.cmd == "Reconnect" && cmd.service == "agent" {
                // No reply, deliberately: a reply cannot cross from the
                // old session to the new one. The successful reconnect
                // is the reply. Disconnecting here makes the run loop
                // observe ConnectChan(false) and drive the reconnect.
                inner.client.disconnect();
                continue;
            }

            // Run the handler in a child task so a stuck command cannot
            // stall the queue past its deadline.
            let child = tokio::spawn({
                let inner = Arc::clone(&inner);
                let cmd = cmd.clone();
                async move {
                    if cmd.service == "agent" {
                        handle_agent_cmd(&inner, cmd).await
                    } else if let Some(manager) = inner.services.get(&cmd.service) {
                        manager.handle(cmd).await
                    } else {
                        let service = cmd.service.clone();
                        cmd.err(Error::UnknownService { service })
                    }
                }
            });
            let deadline = if cmd.cmd == "Update" {
                UPDATE_TIMEOUT
            } else {
                CMD_TIMEOUT
            };
            let out = match tokio::time::timeout(deadline, child).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(join_err)) if join_err.is_panic() => {
                    // Surface the handler's panic as our own crash so the
                    // supervisor counts it against the error budget.
                    std::panic::resume_unwind(join_err.into_panic());
                }
                Ok(Err(_)) => continue,
                // The orphaned handler keeps running; its eventual reply
                // is dropped. Tolerated by design.
                Err(_) => cmd.err(Error::CmdTimeout {
                    cmd: cmd.cmd.clone(),
                }),
            };
            reply(&inner, out).await;
        }
    });
}

async fn reply(inner: &Inner, reply: Reply) {
    match tokio::time::timeout(REPLY_TIMEOUT, inner.reply_tx.send(reply)).await {
        Ok(Ok(())) => {}
        _ => inner.logger.warn("Failed to send reply"),
    }
}

/// Handles a command whose `service` is `"agent"`.
async fn handle_agent_cmd(inner: &Inner, cmd: Cmd) -> Reply {
    inner.status.update_cmd("agent-cmd-handler", "Handling", &cmd);
    inner.logger.info(format!("Running {cmd}"));

    let (data, errs): (Option<serde_json::Value>, Vec<Error>) = match cmd.cmd.as_str() {
        "StartService" => match service_lifecycle(inner, &cmd, true).await {
            Ok(()) => (None, Vec::new()),
            Err(e) => (None, vec![e]),
        },
        "StopService" => match service_lifecycle(inner, &cmd, false).await {
            Ok(()) => (None, Vec::new()),
            Err(e) => (None, vec![e]),
        },
        "GetConfig" => {
            let (configs, errs) = agent_config(inner);
            (Some(json!(configs)), errs)
        }
        "GetAllConfigs" => {
            let (mut configs, mut errs) = agent_config(inner);
            for (_, manager) in inner.services.iter() {
                let (mut service_configs, mut service_errs) = manager.get_config();
                configs.append(&mut service_configs);
                errs.append(&mut service_errs);
            }
            (Some(json!(configs)), errs)
        }
        "SetConfig" => set_config(inner, &cmd).await,
        "Update" => {
            inner.status.update_cmd("agent-cmd-handler", "Update", &cmd);
            let version = cmd.data.as_str().unwrap_or_default().to_string();
            if version.is_empty() {
                (
                    None,
                    vec![Error::InvalidConfig("invalid version: ''".to_string())],
                )
            } else {
                match inner.updater.update(&version).await {
                    Ok(()) => (None, Vec::new()),
                    Err(e) => (None, vec![e]),
                }
            }
        }
        "Version" => {
            let info = VersionInfo {
                running: VERSION.to_string(),
                installed: None,
            };
            (Some(json!(info)), Vec::new())
        }
        other => (
            None,
            vec![Error::UnknownCmd {
                cmd: other.to_string(),
            }],
        ),
    };

    for err in &errs {
        inner.logger.error(err.to_string());
    }
    inner.logger.info(format!("Done running {cmd}"));
    cmd.reply(data, errs)
}

/// `StartService`/`StopService` routed at the agent: the payload names
/// the target service.
async fn service_lifecycle(inner: &Inner, cmd: &Cmd, start: bool) -> Result<(), Error> {
    let data: crate::proto::ServiceData = serde_json::from_value(cmd.data.clone())?;
    let manager = inner
        .services
        .get(&data.name)
        .ok_or_else(|| Error::UnknownService {
            service: data.name.clone(),
        })?;
    if start {
        manager.start().await
    } else {
        manager.stop().await
    }
}

fn agent_config(inner: &Inner) -> (Vec<AgentConfigResource>, Vec<Error>) {
    let mut config = inner.config.read().expect("agent config lock").clone();
    // Links are internal plumbing, not part of the visible config.
    config.links.clear();
    match serde_json::to_string(&config) {
        Ok(json) => (
            vec![AgentConfigResource {
                internal_service: "agent".to_string(),
                config: json,
                running: true,
            }],
            Vec::new(),
        ),
        Err(e) => (Vec::new(), vec![e.into()]),
    }
}

/// Applies ApiKey/ApiHostname deltas. A missing field means "keep
/// current". Successful mutations persist even when others fail.
async fn set_config(inner: &Inner, cmd: &Cmd) -> (Option<serde_json::Value>, Vec<Error>) {
    inner.status.update_cmd("agent-cmd-handler", "SetConfig", cmd);
    let new: Config = match serde_json::from_value(cmd.data.clone()) {
        Ok(c) => c,
        Err(e) => return (None, vec![e.into()]),
    };
    let mut final_config = inner.config.read().expect("agent config lock").clone();
    let mut errs = Vec::new();

    if !new.api_key.is_empty() && new.api_key != final_config.api_key {
        inner.logger.warn("Changing API key");
        match inner
            .api
            .connect(
                &inner.api.hostname(),
                &new.api_key,
                &inner.api.agent_uuid(),
            )
            .await
        {
            Ok(()) => final_config.api_key = new.api_key.clone(),
            Err(e) => errs.push(Error::Transport(format!("api.connect:ApiKey: {e}"))),
        }
    }

    if !new.api_hostname.is_empty() && new.api_hostname != final_config.api_hostname {
        inner.logger.warn(format!(
            "Changing API host from {} to {}",
            final_config.api_hostname, new.api_hostname
        ));
        match inner
            .api
            .connect(
                &new.api_hostname,
                &inner.api.api_key(),
                &inner.api.agent_uuid(),
            )
            .await
        {
            Ok(()) => final_config.api_hostname = new.api_hostname.clone(),
            Err(e) => errs.push(Error::Transport(format!("api.connect:ApiHostname: {e}"))),
        }
    }

    // Persist what stuck; a stale file just means the old config after a
    // restart.
    if let Err(e) = inner.basedir.write_config("agent", &final_config) {
        errs.push(e);
    }

    *inner.config.write().expect("agent config lock") = final_config.clone();
    (Some(json!(final_config)), errs)
}

/// Restart: take the start-lock, write a script that re-execs this
/// binary with identical argv and cwd, and spawn it detached. The new
/// process waits on the lock until this one exits.
fn restart_self(inner: &Inner, cmd: &Cmd) -> Result<(), Error> {
    inner.basedir.make_start_lock()?;
    let cwd = std::env::current_dir()?;
    let argv: Vec<String> = std::env::args().collect();
    let script = format!(
        "#!/bin/sh\n\
         # Written by sqlpulse in response to this Restart command:\n\
         # {}\n\
         # It is safe to delete.\n\
         cd {}\n\
         {} {} >> {}/sqlpulse.log 2>&1 &\n",
        cmd,
        cwd.display(),
        argv[0],
        argv[1..].join(" "),
        inner.basedir.log_dir().display(),
    );
    let path = inner.basedir.start_script();
    std::fs::write(&path, script)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o754))?;
    }
    std::process::Command::new(&path).spawn()?;
    Ok(())
}

// ============================================================================
// Status handler (concurrent with the command handler)
// ============================================================================

fn spawn_status_handler(
    inner: Arc<Inner>,
    status_rx: Arc<Mutex<mpsc::Receiver<Cmd>>>,
    handle: SyncHandle,
) {
    tokio::spawn(async move {
        let _guard = handle.done_on_drop();
        // No "agent-status-handler" status entry: asking the status
        // handler how the status handler is doing is circular.
        loop {
            let cmd = {
                let mut rx = status_rx.lock().await;
                tokio::select! {
                    _ = handle.stopped() => {
                        handle.graceful();
                        return;
                    }
                    cmd = rx.recv() => {
                        let Some(cmd) = cmd else {
                            handle.graceful();
                            return;
                        };
                        cmd
                    }
                }
            };
            let out = match cmd.service.as_str() {
                "" => cmd.reply(Some(json!(all_status(&inner))), Vec::new()),
                "agent" => cmd.reply(Some(json!(agent_status(&inner))), Vec::new()),
                name => match inner.services.get(name) {
                    Some(manager) => cmd.reply(Some(json!(manager.status())), Vec::new()),
                    None => {
                        let service = name.to_string();
                        cmd.err(Error::UnknownService { service })
                    }
                },
            };
            reply(&inner, out).await;
        }
    });
}

fn agent_status(inner: &Inner) -> HashMap<String, String> {
    inner.status.merge(inner.client.status())
}

fn all_status(inner: &Inner) -> HashMap<String, String> {
    let mut status = agent_status(inner);
    for (_, manager) in inner.services.iter() {
        for (k, v) in manager.status() {
            status.insert(k, v);
        }
    }
    status
}
