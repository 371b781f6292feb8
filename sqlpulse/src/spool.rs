//! Report spooler: the sink for serialized telemetry reports.
//!
//! The spool is lossy by contract; producers attach short deadlines to
//! `write` and drop the report when the spool is saturated. Nothing here
//! retries: a lost report is lost.

use crate::basedir::Basedir;
use crate::error::Error;
use crate::BoxFuture;
use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Sink for one serialized report under a service name.
pub trait Spooler: Send + Sync {
    fn write(&self, service: &str, report: Value) -> BoxFuture<'_, Result<(), Error>>;
}

/// Writes each report as a JSON file under `data/<service>/`, named by
/// timestamp plus a sequence number so two reports in the same millisecond
/// do not collide.
pub struct DiskSpooler {
    basedir: Basedir,
    seq: AtomicU64,
}

impl DiskSpooler {
    pub fn new(basedir: Basedir) -> Arc<Self> {
        Arc::new(DiskSpooler {
            basedir,
            seq: AtomicU64::new(0),
        })
    }
}

impl Spooler for DiskSpooler {
    fn write(&self, service: &str, report: Value) -> BoxFuture<'_, Result<(), Error>> {
        let service = service.to_string();
        Box::pin(async move {
            let dir = self.basedir.data_dir().join(&service);
            tokio::fs::create_dir_all(&dir).await?;
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            let name = format!("{}_{:06}.json", Utc::now().format("%Y%m%d%H%M%S%3f"), seq);
            let bytes = serde_json::to_vec(&report)?;
            tokio::fs::write(dir.join(&name), bytes).await?;
            debug!(service = %service, file = %name, "report spooled");
            Ok(())
        })
    }
}

/// Discards every report. For tests that do not care about output.
pub struct NullSpooler;

impl Spooler for NullSpooler {
    fn write(&self, _service: &str, _report: Value) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async { Ok(()) })
    }
}

/// Captures reports in memory for assertions.
pub struct MemSpooler {
    reports: Mutex<Vec<(String, Value)>>,
}

impl MemSpooler {
    pub fn new() -> Arc<Self> {
        Arc::new(MemSpooler {
            reports: Mutex::new(Vec::new()),
        })
    }

    pub fn reports(&self) -> Vec<(String, Value)> {
        self.reports.lock().unwrap().clone()
    }
}

impl Spooler for MemSpooler {
    fn write(&self, service: &str, report: Value) -> BoxFuture<'_, Result<(), Error>> {
        let service = service.to_string();
        Box::pin(async move {
            self.reports.lock().unwrap().push((service, report));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_disk_spooler_writes_under_service_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let basedir = Basedir::init(tmp.path()).unwrap();
        let spool = DiskSpooler::new(basedir.clone());
        spool
            .write("qan", json!({"interval": 1}))
            .await
            .unwrap();
        spool
            .write("qan", json!({"interval": 2}))
            .await
            .unwrap();
        let entries: Vec<_> = std::fs::read_dir(basedir.data_dir().join("qan"))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_mem_spooler_captures_in_order() {
        let spool = MemSpooler::new();
        spool.write("mm", json!(1)).await.unwrap();
        spool.write("sysconfig", json!(2)).await.unwrap();
        let reports = spool.reports();
        assert_eq!(reports[0].0, "mm");
        assert_eq!(reports[1].0, "sysconfig");
    }
}
