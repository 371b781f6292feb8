//! Query-class aggregates.
//!
//! A *class* is the set of queries sharing a normalized fingerprint; a
//! *global class* aggregates every class in one interval. Slow-log events
//! accumulate into classes one at a time and are finalized once the
//! stream ends; perfschema rows arrive pre-aggregated and skip both
//! steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One parsed query event from a slow log.
#[derive(Debug, Clone, Default)]
pub struct QueryEvent {
    /// Byte offset of the event in its file.
    pub offset: u64,
    pub ts: Option<DateTime<Utc>>,
    pub query: String,
    pub db: String,
    /// Seconds.
    pub query_time: f64,
    /// Seconds.
    pub lock_time: f64,
    pub rows_sent: u64,
    pub rows_examined: u64,
    pub rows_affected: u64,
}

/// Statistics over a time-valued metric, in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeStats {
    pub cnt: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

impl TimeStats {
    fn add(&mut self, value: f64) {
        if self.cnt == 0 || value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
        self.cnt += 1;
        self.sum += value;
    }

    fn finalize(&mut self) {
        if self.cnt > 0 {
            self.avg = self.sum / self.cnt as f64;
        }
    }
}

/// Statistics over an integer-valued metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NumberStats {
    pub cnt: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
    pub avg: u64,
}

impl NumberStats {
    fn add(&mut self, value: u64) {
        if self.cnt == 0 || value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
        self.cnt += 1;
        self.sum += value;
    }

    fn finalize(&mut self) {
        if self.cnt > 0 {
            self.avg = self.sum / self.cnt;
        }
    }
}

/// Statistics over a boolean metric: of `cnt` observations,
/// `true_count` were true.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoolStats {
    pub cnt: u64,
    #[serde(rename = "true")]
    pub true_count: u64,
}

/// The metric set carried by every class. BTreeMaps keep report output
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(rename = "time_metrics")]
    pub time: BTreeMap<String, TimeStats>,
    #[serde(rename = "number_metrics")]
    pub number: BTreeMap<String, NumberStats>,
    #[serde(rename = "bool_metrics")]
    pub bools: BTreeMap<String, BoolStats>,
}

impl Metrics {
    fn add_event(&mut self, event: &QueryEvent) {
        self.time
            .entry("Query_time".to_string())
            .or_default()
            .add(event.query_time);
        self.time
            .entry("Lock_time".to_string())
            .or_default()
            .add(event.lock_time);
        self.number
            .entry("Rows_sent".to_string())
            .or_default()
            .add(event.rows_sent);
        self.number
            .entry("Rows_examined".to_string())
            .or_default()
            .add(event.rows_examined);
        self.number
            .entry("Rows_affected".to_string())
            .or_default()
            .add(event.rows_affected);
    }

    fn finalize(&mut self) {
        for stats in self.time.values_mut() {
            stats.finalize();
        }
        for stats in self.number.values_mut() {
            stats.finalize();
        }
    }

    /// Folds `other` into self (used when aggregating classes into the
    /// global class).
    fn merge(&mut self, other: &Metrics) {
        for (name, stats) in &other.time {
            let mine = self.time.entry(name.clone()).or_default();
            if mine.cnt == 0 || stats.min < mine.min {
                mine.min = stats.min;
            }
            if stats.max > mine.max {
                mine.max = stats.max;
            }
            mine.cnt += stats.cnt;
            mine.sum += stats.sum;
        }
        for (name, stats) in &other.number {
            let mine = self.number.entry(name.clone()).or_default();
            if mine.cnt == 0 || stats.min < mine.min {
                mine.min = stats.min;
            }
            if stats.max > mine.max {
                mine.max = stats.max;
            }
            mine.cnt += stats.cnt;
            mine.sum += stats.sum;
        }
        for (name, stats) in &other.bools {
            let mine = self.bools.entry(name.clone()).or_default();
            mine.cnt += stats.cnt;
            mine.true_count += stats.true_count;
        }
    }
}

/// Per-fingerprint aggregate. `id` is the 16-hex-digit uppercase class
/// checksum.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryClass {
    pub id: String,
    pub fingerprint: String,
    pub total_queries: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
    pub metrics: Metrics,
}

impl QueryClass {
    pub fn new(id: String, fingerprint: String) -> Self {
        QueryClass {
            id,
            fingerprint,
            ..Default::default()
        }
    }

    pub fn add_event(&mut self, event: &QueryEvent, keep_example: bool) {
        self.total_queries += 1;
        self.metrics.add_event(event);
        if keep_example && self.example.is_none() {
            self.example = Some(event.query.clone());
        }
    }

    pub fn finalize(&mut self) {
        self.metrics.finalize();
    }
}

/// Aggregate over all classes in one interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalClass {
    pub total_queries: u64,
    pub unique_queries: u64,
    pub metrics: Metrics,
}

impl GlobalClass {
    pub fn new() -> Self {
        GlobalClass::default()
    }

    /// Streams one event in (slow-log path).
    pub fn add_event(&mut self, event: &QueryEvent) {
        self.total_queries += 1;
        self.metrics.add_event(event);
    }

    /// Folds one pre-aggregated class in (perfschema path).
    pub fn add_class(&mut self, class: &QueryClass) {
        self.unique_queries += 1;
        self.total_queries += class.total_queries;
        self.metrics.merge(&class.metrics);
    }

    pub fn finalize(&mut self, unique_queries: u64) {
        self.unique_queries = unique_queries;
        self.metrics.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(query_time: f64, rows_sent: u64) -> QueryEvent {
        QueryEvent {
            query: "SELECT 1".to_string(),
            query_time,
            lock_time: query_time / 10.0,
            rows_sent,
            rows_examined: rows_sent * 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_time_stats_min_max_avg() {
        let mut class = QueryClass::new("ABCD".into(), "select ?".into());
        class.add_event(&event(0.1, 1), false);
        class.add_event(&event(0.3, 3), false);
        class.finalize();
        let qt = &class.metrics.time["Query_time"];
        assert_eq!(qt.cnt, 2);
        assert!((qt.sum - 0.4).abs() < 1e-9);
        assert!((qt.min - 0.1).abs() < 1e-9);
        assert!((qt.max - 0.3).abs() < 1e-9);
        assert!((qt.avg - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_first_event_sets_min() {
        let mut class = QueryClass::new("ABCD".into(), "select ?".into());
        class.add_event(&event(5.0, 10), false);
        let qt = &class.metrics.time["Query_time"];
        assert!((qt.min - 5.0).abs() < 1e-9, "min must not stick at zero");
    }

    #[test]
    fn test_example_kept_only_when_asked() {
        let mut with = QueryClass::new("A".into(), "select ?".into());
        with.add_event(&event(0.1, 1), true);
        assert_eq!(with.example.as_deref(), Some("SELECT 1"));

        let mut without = QueryClass::new("B".into(), "select ?".into());
        without.add_event(&event(0.1, 1), false);
        assert!(without.example.is_none());
    }

    #[test]
    fn test_global_add_class_merges_metrics() {
        let mut a = QueryClass::new("A".into(), "select a".into());
        a.add_event(&event(0.2, 1), false);
        let mut b = QueryClass::new("B".into(), "select b".into());
        b.add_event(&event(0.4, 2), false);

        let mut global = GlobalClass::new();
        global.add_class(&a);
        global.add_class(&b);
        assert_eq!(global.unique_queries, 2);
        assert_eq!(global.total_queries, 2);
        let qt = &global.metrics.time["Query_time"];
        assert_eq!(qt.cnt, 2);
        assert!((qt.sum - 0.6).abs() < 1e-9);
        assert!((qt.min - 0.2).abs() < 1e-9);
        assert!((qt.max - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_global_finalize_sets_unique() {
        let mut global = GlobalClass::new();
        global.add_event(&event(0.1, 1));
        global.add_event(&event(0.2, 1));
        global.finalize(1);
        assert_eq!(global.total_queries, 2);
        assert_eq!(global.unique_queries, 1);
        assert!((global.metrics.time["Query_time"].avg - 0.15).abs() < 1e-9);
    }
}
