//! Query analytics (QAN): the interval → worker → report pipeline.
//!
//! ```text
//! clock ticks ──▶ interval iterator ──▶ manager run loop
//!                                          │ admission (≤ max_workers)
//!                                          ▼
//!                                    worker task (slowlog | perfschema)
//!                                          │ one WorkerResult per interval
//!                                          ▼
//!                                    report ──▶ spooler (lossy, 500ms)
//! ```
//!
//! The manager also coordinates slow-log rotation with the upstream
//! server and re-applies the enable mutations when MRM reports a restart.

mod event;
mod fingerprint;
mod interval;
mod manager;
mod perfschema;
mod slowlog;
mod worker;

pub use event::{BoolStats, GlobalClass, Metrics, NumberStats, QueryClass, QueryEvent, TimeStats};
pub use fingerprint::{checksum, Fingerprinter};
pub use interval::{FilenameFunc, IntervalIter, IntervalIterFactory, RealIntervalIterFactory};
pub use manager::Manager;
pub use perfschema::PerfschemaWorker;
pub use slowlog::{SlowLogParser, SlowLogWorker};
pub use worker::{RealWorkerFactory, Worker, WorkerFactory};

use crate::error::Error;
use crate::mysql::VarValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const COLLECT_FROM_SLOWLOG: &str = "slowlog";
pub const COLLECT_FROM_PERFSCHEMA: &str = "perfschema";

/// QAN service config, persisted as `config/qan.conf`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub service: String,
    pub instance_id: u32,
    /// `"slowlog"` or `"perfschema"`; unset means slowlog (configs
    /// predating perfschema support have no such field).
    #[serde(default)]
    pub collect_from: String,
    /// Seconds between intervals.
    pub interval: u64,
    pub max_workers: usize,
    /// Seconds a worker may spend on one interval.
    pub worker_run_time: u64,
    /// Rotation threshold in bytes; zero disables rotation.
    #[serde(default)]
    pub max_slow_log_size: u64,
    #[serde(default)]
    pub remove_old_slow_logs: bool,
    #[serde(default)]
    pub example_queries: bool,
    /// `SET GLOBAL` mutations applied at enable time.
    pub start: Vec<VarValue>,
    /// `SET GLOBAL` mutations applied at disable time.
    pub stop: Vec<VarValue>,
}

/// Validates bounds and applies the slowlog default. Mutates
/// `collect_from` in place when unset.
pub fn validate_config(config: &mut Config) -> Result<(), Error> {
    if config.collect_from.is_empty() {
        config.collect_from = COLLECT_FROM_SLOWLOG.to_string();
    }
    if config.collect_from != COLLECT_FROM_SLOWLOG
        && config.collect_from != COLLECT_FROM_PERFSCHEMA
    {
        return Err(Error::InvalidConfig(format!(
            "invalid CollectFrom: '{}', expected 'perfschema' or 'slowlog'",
            config.collect_from
        )));
    }
    if config.start.is_empty() {
        return Err(Error::InvalidConfig("Start array is empty".to_string()));
    }
    if config.stop.is_empty() {
        return Err(Error::InvalidConfig("Stop array is empty".to_string()));
    }
    if config.max_workers < 1 {
        return Err(Error::InvalidConfig("MaxWorkers must be > 0".to_string()));
    }
    if config.max_workers > 4 {
        return Err(Error::InvalidConfig("MaxWorkers must be <= 4".to_string()));
    }
    if config.interval == 0 {
        return Err(Error::InvalidConfig("Interval must be > 0".to_string()));
    }
    if config.interval > 3600 {
        return Err(Error::InvalidConfig(
            "Interval must be <= 3600 (1 hour)".to_string(),
        ));
    }
    if config.worker_run_time == 0 {
        return Err(Error::InvalidConfig(
            "WorkerRunTime must be > 0".to_string(),
        ));
    }
    if config.worker_run_time > 1200 {
        return Err(Error::InvalidConfig(
            "WorkerRunTime must be <= 1200 (20 minutes)".to_string(),
        ));
    }
    Ok(())
}

/// One bounded window of query activity: time-bounded for perfschema,
/// byte-offset-bounded for slowlog.
#[derive(Debug, Clone, Default)]
pub struct Interval {
    /// Monotonic per pipeline run.
    pub number: u64,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
    pub filename: Option<String>,
    pub start_offset: u64,
    pub end_offset: u64,
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filename {
            Some(file) => write!(
                f,
                "interval {} {} [{}..{}]",
                self.number, file, self.start_offset, self.end_offset
            ),
            None => write!(
                f,
                "interval {} {} to {}",
                self.number, self.start_time, self.stop_time
            ),
        }
    }
}

/// What one worker is asked to do for one interval.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub slow_log_file: Option<String>,
    pub start_offset: u64,
    pub end_offset: u64,
    pub run_time: Duration,
    pub example_queries: bool,
}

/// Immutable output of one worker run.
#[derive(Debug, Clone, Default)]
pub struct WorkerResult {
    pub global: GlobalClass,
    pub classes: Vec<QueryClass>,
    /// Wall-clock seconds the run took; stamped by the manager.
    pub run_time: f64,
}

/// The spooled report: config identity, interval bounds, and the
/// aggregates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub service: String,
    pub instance_id: u32,
    pub collect_from: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub run_time: f64,
    pub global: GlobalClass,
    pub class: Vec<QueryClass>,
}

/// Builds the report for one completed interval.
pub fn make_report(config: &Config, interval: &Interval, result: WorkerResult) -> Report {
    Report {
        service: config.service.clone(),
        instance_id: config.instance_id,
        collect_from: config.collect_from.clone(),
        start_ts: interval.start_time,
        end_ts: interval.stop_time,
        run_time: result.run_time,
        global: result.global,
        class: result.classes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn valid_config() -> Config {
        Config {
            service: "mysql".to_string(),
            instance_id: 1,
            collect_from: String::new(),
            interval: 60,
            max_workers: 2,
            worker_run_time: 55,
            max_slow_log_size: 0,
            remove_old_slow_logs: false,
            example_queries: false,
            start: vec![VarValue::new("slow_query_log", "ON")],
            stop: vec![VarValue::new("slow_query_log", "OFF")],
        }
    }

    #[test]
    fn test_collect_from_defaults_to_slowlog() {
        let mut config = valid_config();
        validate_config(&mut config).unwrap();
        assert_eq!(config.collect_from, COLLECT_FROM_SLOWLOG);
    }

    #[test]
    fn test_collect_from_rejects_unknown() {
        let mut config = valid_config();
        config.collect_from = "generallog".to_string();
        assert!(validate_config(&mut config).is_err());
    }

    #[test]
    fn test_start_stop_must_be_non_empty() {
        let mut config = valid_config();
        config.start.clear();
        assert!(validate_config(&mut config).is_err());
        let mut config = valid_config();
        config.stop.clear();
        assert!(validate_config(&mut config).is_err());
    }

    #[test]
    fn test_max_workers_bounds_inclusive() {
        for workers in [1, 4] {
            let mut config = valid_config();
            config.max_workers = workers;
            assert!(validate_config(&mut config).is_ok(), "{workers} is valid");
        }
        for workers in [0, 5] {
            let mut config = valid_config();
            config.max_workers = workers;
            assert!(validate_config(&mut config).is_err(), "{workers} is invalid");
        }
        // The upper-bound message names the actual bound.
        let mut config = valid_config();
        config.max_workers = 5;
        let err = validate_config(&mut config).unwrap_err();
        assert!(err.to_string().contains("<= 4"));
    }

    #[test]
    fn test_interval_bounds() {
        for (value, ok) in [(1, true), (3600, true), (0, false), (3601, false)] {
            let mut config = valid_config();
            config.interval = value;
            assert_eq!(validate_config(&mut config).is_ok(), ok, "interval {value}");
        }
    }

    #[test]
    fn test_worker_run_time_bounds() {
        for (value, ok) in [(1, true), (1200, true), (0, false), (1201, false)] {
            let mut config = valid_config();
            config.worker_run_time = value;
            assert_eq!(
                validate_config(&mut config).is_ok(),
                ok,
                "worker_run_time {value}"
            );
        }
    }

    #[test]
    fn test_make_report_carries_interval_bounds() {
        let mut config = valid_config();
        validate_config(&mut config).unwrap();
        let interval = Interval {
            number: 3,
            start_time: Utc::now(),
            stop_time: Utc::now(),
            ..Default::default()
        };
        let mut result = WorkerResult::default();
        result.run_time = 1.25;
        let report = make_report(&config, &interval, result);
        assert_eq!(report.service, "mysql");
        assert_eq!(report.start_ts, interval.start_time);
        assert!((report.run_time - 1.25).abs() < 1e-9);
    }
}
