//! Agent wiring: builds every subsystem from the basedir and runs the
//! supervisor until it returns.

use crate::error::CliError;
use sqlpulse::agent::{self, Agent, NullApi, NullUpdater};
use sqlpulse::basedir::Basedir;
use sqlpulse::instance::Repo;
use sqlpulse::log::{self, LogConfig, Relay};
use sqlpulse::mysql::PoolConnectionFactory;
use sqlpulse::service::Registry;
use sqlpulse::spool::DiskSpooler;
use sqlpulse::ticker::Clock;
use sqlpulse::transport::ChannelClient;
use sqlpulse::{mm, mrm, qan, sysconfig};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Keep alive for the lifetime of the process; dropping it flushes the
/// file writer.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Dual console/file tracing output, filtered by `RUST_LOG` (default
/// `info`).
pub fn init_logging(basedir: &Basedir) -> Result<LoggingGuard, CliError> {
    let file_appender =
        tracing_appender::rolling::never(basedir.log_dir(), "sqlpulse.log");
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false);
    let stdout_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stdout);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/// Builds and runs the agent. Returns when the agent handles `Stop` or
/// `Restart`.
///
/// The websocket transport belongs to deployment builds; this runner
/// wires the in-memory loopback client, so the agent runs offline:
/// services collect and spool locally, and the command surface is
/// reachable only from inside the process.
pub async fn run_agent(basedir_path: &str) -> Result<(), CliError> {
    let basedir = Basedir::init(basedir_path)?;
    let config = agent::load_config(&basedir).map_err(|e| {
        CliError::Config(format!(
            "cannot load {}/config/agent.conf: {e}",
            basedir_path
        ))
    })?;

    // Log relay on its own transport session, like every deployment.
    let (log_client, log_link, _log_remote) = ChannelClient::new("log");
    let log_config: LogConfig = basedir.read_config("log").unwrap_or_default();
    let (relay, relay_handle) = Relay::new(
        Some(log_client as Arc<dyn sqlpulse::transport::Client>),
        Some(log_link.connect_rx),
        log_config.level,
        log_config.file.clone(),
        true,
    );
    tokio::spawn(relay.run());

    let clock = Arc::new(Clock::new());
    let factory = Arc::new(PoolConnectionFactory);
    let repo = Arc::new(Repo::new(basedir.clone()));
    let spool = DiskSpooler::new(basedir.clone());

    let mrm_monitor = mrm::Monitor::new(
        relay_handle.logger("mrm"),
        factory.clone(),
        clock.clone(),
    );
    let qan_manager = qan::Manager::new(
        relay_handle.logger("qan"),
        basedir.clone(),
        factory.clone(),
        clock.clone(),
        Arc::new(qan::RealIntervalIterFactory {
            logger: relay_handle.logger("qan-iter"),
        }),
        Arc::new(qan::RealWorkerFactory::new(relay_handle.clone())),
        spool.clone(),
        repo.clone(),
        mrm_monitor.clone(),
    );
    let mm_manager = mm::Manager::new(
        relay_handle.logger("mm"),
        basedir.clone(),
        factory.clone(),
        clock.clone(),
        spool.clone(),
        repo.clone(),
    );
    let sysconfig_manager = sysconfig::Manager::new(
        relay_handle.logger("sysconfig"),
        basedir.clone(),
        factory.clone(),
        clock.clone(),
        spool.clone(),
        repo.clone(),
    );
    let log_manager = Arc::new(log::Manager::new(relay_handle.clone(), log_config));

    let mut services = Registry::new();
    services.add("log", log_manager);
    services.add("mrm", mrm_monitor.clone());
    services.add("qan", qan_manager.clone());
    services.add("mm", mm_manager.clone());
    services.add("sysconfig", sysconfig_manager.clone());

    // Boot every service from its persisted config. "Not enabled" is a
    // normal outcome, not an error.
    for (name, manager) in services.iter() {
        if let Err(e) = manager.start().await {
            warn!(service = name, "start failed: {e}");
        }
    }

    // Restart hand-off: a previous process's start-lock is stale once we
    // are running.
    basedir.remove_start_lock()?;

    let (client, link, _remote) = ChannelClient::new("cmd");
    let agent = Agent::new(
        config,
        basedir,
        relay_handle.logger("agent"),
        client,
        link,
        Arc::new(NullApi::new(
            agent::DEFAULT_API_HOSTNAME,
            "offline",
            "offline",
        )),
        services,
        Arc::new(NullUpdater),
    );
    info!(version = sqlpulse::VERSION, "sqlpulse agent starting");
    agent.run().await?;
    Ok(())
}
