//! End-to-end QAN pipeline: injected ticks through the interval iterator,
//! a mock perfschema upstream, and the report landing in the spooler.

use chrono::{TimeZone, Utc};
use serde_json::json;
use sqlpulse::basedir::Basedir;
use sqlpulse::instance::{MysqlInstance, Repo};
use sqlpulse::log::{Logger, Relay};
use sqlpulse::mrm::{self, RestartMonitor};
use sqlpulse::mysql::mock::{MockConnectionFactory, MockConnector};
use sqlpulse::mysql::{DigestRow, VarValue};
use sqlpulse::proto::{Cmd, LogLevel};
use sqlpulse::qan;
use sqlpulse::service::ServiceManager;
use sqlpulse::spool::MemSpooler;
use sqlpulse::ticker;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const DSN: &str = "mysql://agent:pw@db1:3306/";

struct FakeClock {
    subs: Mutex<Vec<mpsc::Sender<chrono::DateTime<chrono::Utc>>>>,
}

impl FakeClock {
    fn new() -> Arc<Self> {
        Arc::new(FakeClock {
            subs: Mutex::new(Vec::new()),
        })
    }

    async fn tick(&self, unix: i64) {
        let subs = self.subs.lock().unwrap().clone();
        for tx in subs {
            let _ = tx.send(Utc.timestamp_opt(unix, 0).unwrap()).await;
        }
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
        5.0
    }
}

/// Restart monitor whose notifications the test fires by hand.
struct FakeMrm {
    tx: Mutex<Option<mpsc::Sender<bool>>>,
}

impl FakeMrm {
    fn new() -> Arc<Self> {
        Arc::new(FakeMrm {
            tx: Mutex::new(None),
        })
    }

    async fn fire_restart(&self) {
        let tx = self.tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            tx.send(true).await.unwrap();
        }
    }
}

impl RestartMonitor for FakeMrm {
    fn add(
        &self,
        _dsn: &str,
    ) -> Result<(mrm::SubId, mpsc::Receiver<bool>), sqlpulse::error::Error> {
        let (tx, rx) = mpsc::channel(5);
        *self.tx.lock().unwrap() = Some(tx);
        Ok((1, rx))
    }

    fn remove(&self, _dsn: &str, _id: mrm::SubId) {
        self.tx.lock().unwrap().take();
    }
}

fn test_logger(name: &str) -> Logger {
    let (tx, mut rx) = mpsc::channel(256);
    tokio::spawn(async move { while rx.recv().await.is_some() {} });
    Logger::new(tx, name)
}

fn digest_row() -> DigestRow {
    DigestRow {
        digest: "0123456789abcdef0123456789ABCDEF01234567".to_string(),
        digest_text: "SELECT 1".to_string(),
        count_star: 3,
        sum_timer_wait: 3_000_000_000_000,
        min_timer_wait: 1_000_000_000_000,
        avg_timer_wait: 1_000_000_000_000,
        max_timer_wait: 2_000_000_000_000,
        sum_lock_time: 0,
        sum_rows_affected: 0,
        sum_rows_sent: 3,
        sum_rows_examined: 3,
        sum_created_tmp_disk_tables: 0,
        sum_created_tmp_tables: 0,
        sum_select_full_join: 0,
        sum_select_scan: 0,
        sum_sort_merge_passes: 0,
        first_seen: Utc::now(),
        last_seen: Utc::now(),
    }
}

struct Pipeline {
    manager: Arc<qan::Manager>,
    clock: Arc<FakeClock>,
    mrm: Arc<FakeMrm>,
    conn: Arc<MockConnector>,
    spool: Arc<MemSpooler>,
    _tmp: tempfile::TempDir,
}

fn build_pipeline() -> Pipeline {
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
    conn.set_digest_rows(vec![digest_row()]);
    factory.insert(DSN, Arc::clone(&conn));

    let clock = FakeClock::new();
    let mrm = FakeMrm::new();
    let spool = MemSpooler::new();
    let (_relay, relay_handle) = Relay::new(None, None, LogLevel::Debug, None, true);

    let manager = qan::Manager::new(
        test_logger("qan"),
        basedir,
        factory.clone(),
        clock.clone(),
        Arc::new(qan::RealIntervalIterFactory {
            logger: test_logger("qan-iter"),
        }),
        Arc::new(qan::RealWorkerFactory::new(relay_handle)),
        spool.clone(),
        repo,
        mrm.clone(),
    );
    Pipeline {
        manager,
        clock,
        mrm,
        conn,
        spool,
        _tmp: tmp,
    }
}

fn start_cmd() -> Cmd {
    Cmd::new(
        1,
        "qan",
        "StartService",
        json!({
            "service": "mysql",
            "instance_id": 1,
            "collect_from": "perfschema",
            "interval": 60,
            "max_workers": 1,
            "worker_run_time": 10,
            "start": [{"name": "performance_schema", "value": "ON"}],
            "stop": [{"name": "performance_schema", "value": "OFF"}],
        }),
    )
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_two_ticks_produce_one_report() {
    let pipeline = build_pipeline();
    let reply = pipeline.manager.handle(start_cmd()).await;
    assert!(reply.is_ok(), "start failed: {}", reply.error);

    // First tick primes the iterator, second closes the interval.
    pipeline.clock.tick(60).await;
    pipeline.clock.tick(120).await;

    wait_for("qan report", || !pipeline.spool.reports().is_empty()).await;
    let reports = pipeline.spool.reports();
    let (service, report) = &reports[0];
    assert_eq!(service, "qan");
    assert_eq!(report["service"], "mysql");
    assert_eq!(report["collect_from"], "perfschema");
    assert_eq!(report["class"][0]["id"], "0123456789ABCDEF");
    let qt = &report["class"][0]["metrics"]["time_metrics"]["Query_time"];
    assert_eq!(qt["cnt"], 3);
    assert!((qt["sum"].as_f64().unwrap() - 3.0).abs() < 1e-9);
    assert_eq!(report["global"]["total_queries"], 1);
    assert_eq!(report["global"]["unique_queries"], 1);

    // The digest table was truncated so the next interval sees only new
    // aggregates.
    assert!(pipeline.conn.truncate_count() >= 1);
}

#[tokio::test]
async fn test_restart_notification_reapplies_start_mutations() {
    let pipeline = build_pipeline();
    let reply = pipeline.manager.handle(start_cmd()).await;
    assert!(reply.is_ok());
    let sets_before = pipeline.conn.set_calls().len();

    pipeline.mrm.fire_restart().await;

    wait_for("re-applied mutations", || {
        pipeline.conn.set_calls().len() > sets_before
    })
    .await;
    let sets = pipeline.conn.set_calls();
    assert_eq!(
        sets.last().unwrap(),
        &vec![VarValue::new("performance_schema", "ON")]
    );
}

#[tokio::test]
async fn test_stop_applies_stop_mutations_and_unsubscribes() {
    let pipeline = build_pipeline();
    let started = pipeline.manager.handle(start_cmd()).await;
    assert!(started.is_ok());

    let stopped = pipeline
        .manager
        .handle(Cmd::new(2, "qan", "StopService", serde_json::Value::Null))
        .await;
    assert!(stopped.is_ok(), "stop failed: {}", stopped.error);

    let sets = pipeline.conn.set_calls();
    assert_eq!(
        sets.last().unwrap(),
        &vec![VarValue::new("performance_schema", "OFF")]
    );
    assert!(
        pipeline.mrm.tx.lock().unwrap().is_none(),
        "restart subscription removed"
    );

    // A stopped pipeline ignores further ticks.
    pipeline.clock.tick(180).await;
    pipeline.clock.tick(240).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(pipeline.spool.reports().is_empty());
}

#[tokio::test]
async fn test_get_config_reports_running_state() {
    let pipeline = build_pipeline();
    let (configs, errs) = pipeline.manager.get_config();
    assert!(configs.is_empty());
    assert!(errs.is_empty());

    pipeline.manager.handle(start_cmd()).await;
    let (configs, _) = pipeline.manager.get_config();
    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0].internal_service, "qan");
    assert!(configs[0].running);
}
