//! Scriptable connector for tests.
//!
//! Uptime values are scripted as a queue; `SET GLOBAL` calls and
//! connect/close counts are recorded for assertions. The mock never
//! touches the network.

use super::{Connector, ConnectionFactory, DigestRow, VarValue};
use crate::error::Error;
use crate::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Script {
    uptimes: VecDeque<i64>,
    global_vars: HashMap<String, String>,
    global_status: Vec<(String, String)>,
    global_variables: Vec<(String, String)>,
    digest_rows: Vec<DigestRow>,
}

/// In-memory [`Connector`].
pub struct MockConnector {
    dsn: String,
    script: Mutex<Script>,
    set_calls: Mutex<Vec<Vec<VarValue>>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
    truncates: AtomicUsize,
    fail_connect: AtomicBool,
}

impl MockConnector {
    pub fn new(dsn: &str) -> Arc<Self> {
        Arc::new(MockConnector {
            dsn: dsn.to_string(),
            script: Mutex::new(Script::default()),
            set_calls: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            truncates: AtomicUsize::new(0),
            fail_connect: AtomicBool::new(false),
        })
    }

    /// Queues uptime values returned by successive `uptime()` calls.
    /// The last value repeats once the queue drains.
    pub fn push_uptime(&self, uptime: i64) {
        self.script.lock().unwrap().uptimes.push_back(uptime);
    }

    pub fn set_global_var(&self, name: &str, value: &str) {
        self.script
            .lock()
            .unwrap()
            .global_vars
            .insert(name.to_string(), value.to_string());
    }

    pub fn set_global_status(&self, rows: Vec<(String, String)>) {
        self.script.lock().unwrap().global_status = rows;
    }

    pub fn set_global_variables(&self, rows: Vec<(String, String)>) {
        self.script.lock().unwrap().global_variables = rows;
    }

    pub fn set_digest_rows(&self, rows: Vec<DigestRow>) {
        self.script.lock().unwrap().digest_rows = rows;
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::Release);
    }

    /// Every `set()` call observed, in order.
    pub fn set_calls(&self) -> Vec<Vec<VarValue>> {
        self.set_calls.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Acquire)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::Acquire)
    }

    pub fn truncate_count(&self) -> usize {
        self.truncates.load(Ordering::Acquire)
    }
}

impl Connector for MockConnector {
    fn dsn(&self) -> &str {
        &self.dsn
    }

    fn connect(&self, _tries: u32) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            if self.fail_connect.load(Ordering::Acquire) {
                return Err(Error::Sql("mock connect refused".to_string()));
            }
            self.connects.fetch_add(1, Ordering::AcqRel);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closes.fetch_add(1, Ordering::AcqRel);
        })
    }

    fn set(&self, vars: &[VarValue]) -> BoxFuture<'_, Result<(), Error>> {
        let vars = vars.to_vec();
        Box::pin(async move {
            self.set_calls.lock().unwrap().push(vars);
            Ok(())
        })
    }

    fn uptime(&self) -> BoxFuture<'_, Result<i64, Error>> {
        Box::pin(async move {
            let mut script = self.script.lock().unwrap();
            match script.uptimes.len() {
                0 => Err(Error::Sql("mock has no uptime scripted".to_string())),
                1 => Ok(*script.uptimes.front().unwrap()),
                _ => Ok(script.uptimes.pop_front().unwrap()),
            }
        })
    }

    fn global_var(&self, name: &str) -> BoxFuture<'_, Result<String, Error>> {
        let name = name.to_string();
        Box::pin(async move {
            Ok(self
                .script
                .lock()
                .unwrap()
                .global_vars
                .get(&name)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn global_status(&self) -> BoxFuture<'_, Result<Vec<(String, String)>, Error>> {
        Box::pin(async move { Ok(self.script.lock().unwrap().global_status.clone()) })
    }

    fn global_variables(&self) -> BoxFuture<'_, Result<Vec<(String, String)>, Error>> {
        Box::pin(async move { Ok(self.script.lock().unwrap().global_variables.clone()) })
    }

    fn digest_rows(&self) -> BoxFuture<'_, Result<Vec<DigestRow>, Error>> {
        Box::pin(async move { Ok(self.script.lock().unwrap().digest_rows.clone()) })
    }

    fn truncate_digests(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            self.truncates.fetch_add(1, Ordering::AcqRel);
            Ok(())
        })
    }
}

/// Factory handing out pre-built mocks by DSN, falling back to fresh
/// empty mocks for unknown DSNs.
pub struct MockConnectionFactory {
    connectors: Mutex<HashMap<String, Arc<MockConnector>>>,
}

impl MockConnectionFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(MockConnectionFactory {
            connectors: Mutex::new(HashMap::new()),
        })
    }

    /// Registers the mock returned for `dsn`.
    pub fn insert(&self, dsn: &str, conn: Arc<MockConnector>) {
        self.connectors
            .lock()
            .unwrap()
            .insert(dsn.to_string(), conn);
    }
}

impl ConnectionFactory for MockConnectionFactory {
    fn make(&self, dsn: &str) -> Arc<dyn Connector> {
        let mut connectors = self.connectors.lock().unwrap();
        Arc::clone(
            connectors
                .entry(dsn.to_string())
                .or_insert_with(|| MockConnector::new(dsn)),
        ) as Arc<dyn Connector>
    }
}
