//! The worker contract shared by the slowlog and perfschema variants.

use super::{Interval, Job, WorkerResult};
use crate::error::Error;
use crate::log::RelayHandle;
use crate::mysql::Connector;
use crate::BoxFuture;
use std::sync::Arc;

/// Produces one [`WorkerResult`] per interval.
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    /// One-line status for the agent status surface.
    fn status(&self) -> String;

    /// Prepares for one interval. Most workers have nothing to prepare.
    fn set_up(&self, _interval: &Interval) -> Result<(), Error> {
        Ok(())
    }

    /// Processes one job. A worker mid-statement cannot be cancelled; it
    /// finishes the statement and the manager enforces the outer deadline.
    fn run<'a>(&'a self, job: &'a Job) -> BoxFuture<'a, Result<WorkerResult, Error>>;

    /// Requests an early stop of the current run. Advisory: the run still
    /// finishes its current statement.
    fn stop(&self) {}

    /// Releases per-interval resources after the run.
    fn cleanup(&self) {}
}

/// Builds the worker variant for a `collect_from` value. Perfschema
/// workers get a fresh connector per interval; slowlog workers need none.
pub trait WorkerFactory: Send + Sync {
    fn make(
        &self,
        collect_from: &str,
        name: &str,
        conn: Option<Arc<dyn Connector>>,
    ) -> Arc<dyn Worker>;
}

/// The production factory.
pub struct RealWorkerFactory {
    relay: RelayHandle,
}

impl RealWorkerFactory {
    pub fn new(relay: RelayHandle) -> Self {
        RealWorkerFactory { relay }
    }
}

impl WorkerFactory for RealWorkerFactory {
    fn make(
        &self,
        collect_from: &str,
        name: &str,
        conn: Option<Arc<dyn Connector>>,
    ) -> Arc<dyn Worker> {
        match collect_from {
            super::COLLECT_FROM_PERFSCHEMA => Arc::new(super::PerfschemaWorker::new(
                self.relay.logger(name),
                name,
                conn.expect("perfschema worker requires a connector"),
            )),
            _ => Arc::new(super::SlowLogWorker::new(self.relay.logger(name), name)),
        }
    }
}
