//! Perfschema worker: digest-table snapshot → pre-aggregated classes.
//!
//! Each row of `events_statements_summary_by_digest` is already a query
//! class, so a run is collect → truncate → unit-convert. Truncating after
//! the read means the next interval observes only new aggregates.

use super::event::{BoolStats, GlobalClass, Metrics, NumberStats, QueryClass, TimeStats};
use super::{Job, Worker, WorkerResult};
use crate::error::Error;
use crate::log::Logger;
use crate::mysql::{Connector, DigestRow};
use crate::status::Status;
use crate::BoxFuture;
use std::sync::Arc;

/// Picoseconds → seconds.
const PICO: f64 = 1e-12;

pub struct PerfschemaWorker {
    logger: Logger,
    name: String,
    conn: Arc<dyn Connector>,
    status: Status,
}

impl PerfschemaWorker {
    pub fn new(logger: Logger, name: &str, conn: Arc<dyn Connector>) -> Self {
        PerfschemaWorker {
            logger,
            name: name.to_string(),
            conn,
            status: Status::new(&[name]),
        }
    }

    /// Converts one snapshot into a result. Pure: the same row set always
    /// produces the same result.
    pub fn prepare_result(rows: &[DigestRow]) -> WorkerResult {
        let mut global = GlobalClass::new();
        let mut classes = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(class_id) = class_id(&row.digest) else {
                continue;
            };
            let cnt = row.count_star;
            let mut metrics = Metrics::default();
            metrics.time.insert(
                "Query_time".to_string(),
                TimeStats {
                    cnt,
                    sum: row.sum_timer_wait as f64 * PICO,
                    min: row.min_timer_wait as f64 * PICO,
                    max: row.max_timer_wait as f64 * PICO,
                    avg: row.avg_timer_wait as f64 * PICO,
                },
            );
            metrics.time.insert(
                "Lock_time".to_string(),
                TimeStats {
                    cnt,
                    sum: row.sum_lock_time as f64 * PICO,
                    ..Default::default()
                },
            );
            for (name, sum) in [
                ("Rows_affected", row.sum_rows_affected),
                ("Rows_sent", row.sum_rows_sent),
                ("Rows_examined", row.sum_rows_examined),
                ("Merge_passes", row.sum_sort_merge_passes),
            ] {
                metrics.number.insert(
                    name.to_string(),
                    NumberStats {
                        cnt,
                        sum,
                        ..Default::default()
                    },
                );
            }
            for (name, true_count) in [
                ("Tmp_table_on_disk", row.sum_created_tmp_disk_tables),
                ("Tmp_table", row.sum_created_tmp_tables),
                ("Full_join", row.sum_select_full_join),
                ("Full_scan", row.sum_select_scan),
            ] {
                metrics.bools.insert(
                    name.to_string(),
                    BoolStats {
                        cnt,
                        true_count,
                    },
                );
            }
            let mut class = QueryClass::new(class_id, row.digest_text.clone());
            class.total_queries = cnt;
            class.metrics = metrics;
            global.add_class(&class);
            classes.push(class);
        }
        // Every row is one unique class; the global counts reflect class
        // count, not statement count.
        let n = classes.len() as u64;
        global.total_queries = n;
        global.unique_queries = n;
        WorkerResult {
            global,
            classes,
            run_time: 0.0,
        }
    }
}

/// Class id: uppercase of digest character positions 16..31 (0-based,
/// inclusive-exclusive) — the historical `pt-query-digest` scheme.
fn class_id(digest: &str) -> Option<String> {
    digest.get(16..32).map(|s| s.to_uppercase())
}

impl Worker for PerfschemaWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> String {
        self.status.get(&self.name)
    }

    fn run<'a>(&'a self, _job: &'a Job) -> BoxFuture<'a, Result<WorkerResult, Error>> {
        Box::pin(async move {
            self.status.update(
                &self.name,
                "SELECT performance_schema.events_statements_summary_by_digest",
            );
            let rows = self.conn.digest_rows().await?;
            self.status.update(
                &self.name,
                "TRUNCATE performance_schema.events_statements_summary_by_digest",
            );
            self.conn.truncate_digests().await?;
            self.status.update(&self.name, "Preparing result");
            self.logger
                .debug(format!("{} digest rows collected", rows.len()));
            let result = Self::prepare_result(&rows);
            self.status.update(&self.name, "Done");
            Ok(result)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row() -> DigestRow {
        DigestRow {
            digest: "0123456789abcdef0123456789ABCDEF01234567".to_string(),
            digest_text: "SELECT 1".to_string(),
            count_star: 3,
            sum_timer_wait: 3_000_000_000_000,
            min_timer_wait: 1_000_000_000_000,
            avg_timer_wait: 1_000_000_000_000,
            max_timer_wait: 2_000_000_000_000,
            sum_lock_time: 500_000_000_000,
            sum_rows_affected: 0,
            sum_rows_sent: 3,
            sum_rows_examined: 9,
            sum_created_tmp_disk_tables: 0,
            sum_created_tmp_tables: 1,
            sum_select_full_join: 0,
            sum_select_scan: 2,
            sum_sort_merge_passes: 0,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn test_class_id_is_digest_slice_uppercased() {
        let result = PerfschemaWorker::prepare_result(&[row()]);
        assert_eq!(result.classes[0].id, "0123456789ABCDEF");
    }

    #[test]
    fn test_picosecond_scaling() {
        let result = PerfschemaWorker::prepare_result(&[row()]);
        let qt = &result.classes[0].metrics.time["Query_time"];
        assert_eq!(qt.cnt, 3);
        assert!((qt.sum - 3.0).abs() < 1e-9);
        assert!((qt.min - 1.0).abs() < 1e-9);
        assert!((qt.max - 2.0).abs() < 1e-9);
        assert!((qt.avg - 1.0).abs() < 1e-9);
        let lt = &result.classes[0].metrics.time["Lock_time"];
        assert!((lt.sum - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_bool_metrics_carry_count_star() {
        let result = PerfschemaWorker::prepare_result(&[row()]);
        let full_scan = &result.classes[0].metrics.bools["Full_scan"];
        assert_eq!(full_scan.cnt, 3);
        assert_eq!(full_scan.true_count, 2);
    }

    #[test]
    fn test_global_counts_are_class_counts() {
        let mut second = row();
        second.digest = "fedcba9876543210fedcba9876543210ffffffff".to_string();
        let result = PerfschemaWorker::prepare_result(&[row(), second]);
        assert_eq!(result.global.total_queries, 2);
        assert_eq!(result.global.unique_queries, 2);
    }

    #[test]
    fn test_result_is_pure_function_of_rows() {
        let rows = vec![row()];
        let a = PerfschemaWorker::prepare_result(&rows);
        let b = PerfschemaWorker::prepare_result(&rows);
        assert_eq!(a.classes, b.classes);
        assert_eq!(a.global, b.global);
    }

    #[test]
    fn test_short_digest_row_is_skipped() {
        let mut bad = row();
        bad.digest = "tooshort".to_string();
        let result = PerfschemaWorker::prepare_result(&[bad]);
        assert!(result.classes.is_empty());
        assert_eq!(result.global.total_queries, 0);
    }
}
