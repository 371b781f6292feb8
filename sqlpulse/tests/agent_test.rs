//! Supervisor integration tests over the in-memory transport.

use serde_json::{json, Value};
use sqlpulse::agent::{self, Agent, NullApi, NullUpdater};
use sqlpulse::basedir::Basedir;
use sqlpulse::instance::{MysqlInstance, Repo};
use sqlpulse::log::Logger;
use sqlpulse::mrm;
use sqlpulse::mysql::mock::{MockConnectionFactory, MockConnector};
use sqlpulse::mysql::VarValue;
use sqlpulse::proto::{Cmd, Reply};
use sqlpulse::qan;
use sqlpulse::service::Registry;
use sqlpulse::spool::MemSpooler;
use sqlpulse::ticker;
use sqlpulse::transport::{ChannelClient, Client, RemoteSide};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const DSN: &str = "mysql://agent:pw@db1:3306/";

/// Scriptable clock: remembers subscriptions, reports a fixed ETA.
struct FakeClock {
    eta: f64,
    subs: Mutex<Vec<mpsc::Sender<chrono::DateTime<chrono::Utc>>>>,
}

impl FakeClock {
    fn new(eta: f64) -> Arc<Self> {
        Arc::new(FakeClock {
            eta,
            subs: Mutex::new(Vec::new()),
        })
    }
}

impl ticker::Manager for FakeClock {
    fn add(
        &self,
        tx: mpsc::Sender<chrono::DateTime<chrono::Utc>>,
        _period: u64,
        _sync: bool,
    ) -> ticker::SubId {
        let mut subs = self.subs.lock().unwrap();
        subs.push(tx);
        subs.len() as ticker::SubId
    }

    fn remove(&self, _id: ticker::SubId) {}

    fn eta(&self, _id: ticker::SubId) -> f64 {
        self.eta
    }
}

struct Harness {
    remote: RemoteSide,
    conn: Arc<MockConnector>,
    _tmp: tempfile::TempDir,
}

fn test_logger(name: &str) -> Logger {
    let (tx, mut rx) = mpsc::channel(256);
    // Drain in the background so the channel never fills.
    tokio::spawn(async move { while rx.recv().await.is_some() {} });
    Logger::new(tx, name)
}

/// Builds an agent with a real QAN manager over mocks and spawns its run
/// loop.
fn start_agent() -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let basedir = Basedir::init(tmp.path()).unwrap();

    let repo = Arc::new(Repo::new(basedir.clone()));
    repo.update(
        "mysql",
        &MysqlInstance {
            id: 1,
            name: "db1".to_string(),
            dsn: DSN.to_string(),
        },
    )
    .unwrap();

    let factory = MockConnectionFactory::new();
    let conn = MockConnector::new(DSN);
    conn.push_uptime(1000);
    factory.insert(DSN, Arc::clone(&conn));

    let clock = FakeClock::new(10.0);
    let mrm_monitor = mrm::Monitor::new(test_logger("mrm"), factory.clone(), clock.clone());
    // Workers log through a relay handle; the relay itself is not needed
    // here, so its entries go nowhere.
    let (_relay, relay_handle) = sqlpulse::log::Relay::new(
        None,
        None,
        sqlpulse::proto::LogLevel::Debug,
        None,
        true,
    );

    let qan_manager = qan::Manager::new(
        test_logger("qan"),
        basedir.clone(),
        factory.clone(),
        clock.clone(),
        Arc::new(qan::RealIntervalIterFactory {
            logger: test_logger("qan-iter"),
        }),
        Arc::new(qan::RealWorkerFactory::new(relay_handle)),
        MemSpooler::new(),
        repo,
        mrm_monitor,
    );

    let mut services = Registry::new();
    services.add("qan", qan_manager);

    let (client, link, remote) = ChannelClient::new("cmd");
    client.connect();
    let agent = Agent::new(
        agent::Config {
            api_hostname: agent::DEFAULT_API_HOSTNAME.to_string(),
            api_key: "key".to_string(),
            agent_uuid: "uuid-1".to_string(),
            ..Default::default()
        },
        basedir,
        test_logger("agent"),
        client,
        link,
        Arc::new(NullApi::new(agent::DEFAULT_API_HOSTNAME, "key", "uuid-1")),
        services,
        Arc::new(NullUpdater),
    );
    tokio::spawn(agent.run());

    Harness {
        remote,
        conn,
        _tmp: tmp,
    }
}

async fn roundtrip(harness: &mut Harness, cmd: Cmd) -> Reply {
    harness.remote.cmd_tx.send(cmd).await.unwrap();
    timeout(Duration::from_secs(5), harness.remote.reply_rx.recv())
        .await
        .expect("reply within deadline")
        .expect("transport open")
}

fn qan_config() -> Value {
    json!({
        "service": "mysql",
        "instance_id": 1,
        "collect_from": "perfschema",
        "interval": 60,
        "max_workers": 1,
        "worker_run_time": 10,
        "start": [{"name": "performance_schema", "value": "ON"}],
        "stop": [{"name": "performance_schema", "value": "OFF"}],
    })
}

#[tokio::test]
async fn test_status_reply_contains_agent_keys() {
    let mut harness = start_agent();
    let reply = roundtrip(&mut harness, Cmd::new(1, "", "Status", Value::Null)).await;
    assert_eq!(reply.id, 1);
    assert!(reply.is_ok(), "unexpected error: {}", reply.error);
    let status = reply.data.as_object().unwrap();
    assert!(status.contains_key("agent"));
    assert!(status.contains_key("agent-cmd-handler"));
}

#[tokio::test]
async fn test_start_service_twice_reports_running() {
    let mut harness = start_agent();
    let first = roundtrip(
        &mut harness,
        Cmd::new(2, "qan", "StartService", qan_config()),
    )
    .await;
    assert_eq!(first.error, "", "first start should succeed");

    let second = roundtrip(
        &mut harness,
        Cmd::new(3, "qan", "StartService", qan_config()),
    )
    .await;
    assert!(
        second.error.contains("qan is running"),
        "got: {}",
        second.error
    );

    // Start mutations were applied exactly once.
    let sets = harness.conn.set_calls();
    assert_eq!(
        sets[0],
        vec![VarValue::new("performance_schema", "ON")]
    );
}

#[tokio::test]
async fn test_unknown_service_is_an_error() {
    let mut harness = start_agent();
    let reply = roundtrip(
        &mut harness,
        Cmd::new(4, "rds-metrics", "StartService", Value::Null),
    )
    .await;
    assert!(reply.error.contains("unknown service"));
}

#[tokio::test]
async fn test_unknown_agent_cmd_is_an_error() {
    let mut harness = start_agent();
    let reply = roundtrip(&mut harness, Cmd::new(5, "agent", "Dance", Value::Null)).await;
    assert!(reply.error.contains("unknown command: Dance"));
}

#[tokio::test]
async fn test_version_reports_running_version() {
    let mut harness = start_agent();
    let reply = roundtrip(&mut harness, Cmd::new(6, "agent", "Version", Value::Null)).await;
    assert!(reply.is_ok());
    assert_eq!(reply.data["running"], sqlpulse::VERSION);
}

#[tokio::test]
async fn test_set_config_applies_api_key_delta() {
    let mut harness = start_agent();
    let reply = roundtrip(
        &mut harness,
        Cmd::new(7, "agent", "SetConfig", json!({"api_key": "new-key"})),
    )
    .await;
    assert!(reply.is_ok(), "unexpected error: {}", reply.error);
    assert_eq!(reply.data["api_key"], "new-key");
    // Missing fields mean "keep current".
    assert_eq!(reply.data["agent_uuid"], "uuid-1");
}

#[tokio::test]
async fn test_get_all_configs_includes_agent_and_services() {
    let mut harness = start_agent();
    // Enable qan so it has a config to report.
    let started = roundtrip(
        &mut harness,
        Cmd::new(8, "qan", "StartService", qan_config()),
    )
    .await;
    assert!(started.is_ok());

    let reply = roundtrip(
        &mut harness,
        Cmd::new(9, "agent", "GetAllConfigs", Value::Null),
    )
    .await;
    assert!(reply.is_ok());
    let configs = reply.data.as_array().unwrap();
    let names: Vec<&str> = configs
        .iter()
        .map(|c| c["internal_service"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"agent"));
    assert!(names.contains(&"qan"));
}

#[tokio::test]
async fn test_reconnect_produces_no_reply() {
    let mut harness = start_agent();
    harness
        .remote
        .cmd_tx
        .send(Cmd::new(10, "agent", "Reconnect", Value::Null))
        .await
        .unwrap();
    // No reply by design; the successful reconnect is the reply.
    let got = timeout(Duration::from_millis(300), harness.remote.reply_rx.recv()).await;
    assert!(got.is_err(), "Reconnect must not produce a reply");
}

#[tokio::test]
async fn test_stop_replies_then_stops_services() {
    let mut harness = start_agent();
    let started = roundtrip(
        &mut harness,
        Cmd::new(11, "qan", "StartService", qan_config()),
    )
    .await;
    assert!(started.is_ok());

    let reply = roundtrip(&mut harness, Cmd::new(12, "agent", "Stop", Value::Null)).await;
    assert!(reply.is_ok());

    // Shutdown applied qan's Stop mutations: ON at start, OFF at stop.
    let sets = harness.conn.set_calls();
    assert_eq!(
        sets.last().unwrap(),
        &vec![VarValue::new("performance_schema", "OFF")]
    );
}

#[tokio::test]
async fn test_every_cmd_gets_exactly_one_reply() {
    let mut harness = start_agent();
    for id in 1..=5u64 {
        let reply = roundtrip(&mut harness, Cmd::new(id, "", "Status", Value::Null)).await;
        assert_eq!(reply.id, id, "replies correlate by id, in order");
    }
}
