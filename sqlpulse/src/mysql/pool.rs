//! Production connector over a `sqlx` MySQL pool.

use super::{Connector, ConnectionFactory, DigestRow, VarValue};
use crate::error::Error;
use crate::BoxFuture;
use chrono::{DateTime, Utc};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

const DIGEST_QUERY: &str = "SELECT \
    DIGEST, DIGEST_TEXT, COUNT_STAR, \
    SUM_TIMER_WAIT, MIN_TIMER_WAIT, AVG_TIMER_WAIT, \
    MAX_TIMER_WAIT, SUM_LOCK_TIME, SUM_ROWS_AFFECTED, \
    SUM_ROWS_SENT, SUM_ROWS_EXAMINED, SUM_CREATED_TMP_DISK_TABLES, \
    SUM_CREATED_TMP_TABLES, SUM_SELECT_FULL_JOIN, SUM_SELECT_SCAN, \
    SUM_SORT_MERGE_PASSES, FIRST_SEEN, LAST_SEEN \
    FROM performance_schema.events_statements_summary_by_digest";

/// Lazy pooled connector: the pool is opened by `connect` and dropped by
/// `close`.
pub struct PoolConnector {
    dsn: String,
    pool: RwLock<Option<MySqlPool>>,
}

impl PoolConnector {
    pub fn new(dsn: &str) -> Self {
        PoolConnector {
            dsn: dsn.to_string(),
            pool: RwLock::new(None),
        }
    }

    async fn pool(&self) -> Result<MySqlPool, Error> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Sql("not connected".to_string()))
    }

    async fn name_value_rows(&self, query: &str) -> Result<Vec<(String, String)>, Error> {
        let pool = self.pool().await?;
        let rows = sqlx::query(query).fetch_all(&pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get(0)?;
            let value: String = row.try_get(1).unwrap_or_default();
            out.push((name, value));
        }
        Ok(out)
    }
}

fn digest_row(row: &MySqlRow) -> Result<Option<DigestRow>, Error> {
    // NULL digest is the catch-all row for statements beyond the digest
    // table's limit; it carries no class identity, so skip it.
    let digest: Option<String> = row.try_get("DIGEST")?;
    let Some(digest) = digest else { return Ok(None) };
    let digest_text: Option<String> = row.try_get("DIGEST_TEXT")?;
    let first_seen: DateTime<Utc> = row.try_get("FIRST_SEEN")?;
    let last_seen: DateTime<Utc> = row.try_get("LAST_SEEN")?;
    Ok(Some(DigestRow {
        digest,
        digest_text: digest_text.unwrap_or_default(),
        count_star: row.try_get("COUNT_STAR")?,
        sum_timer_wait: row.try_get("SUM_TIMER_WAIT")?,
        min_timer_wait: row.try_get("MIN_TIMER_WAIT")?,
        avg_timer_wait: row.try_get("AVG_TIMER_WAIT")?,
        max_timer_wait: row.try_get("MAX_TIMER_WAIT")?,
        sum_lock_time: row.try_get("SUM_LOCK_TIME")?,
        sum_rows_affected: row.try_get("SUM_ROWS_AFFECTED")?,
        sum_rows_sent: row.try_get("SUM_ROWS_SENT")?,
        sum_rows_examined: row.try_get("SUM_ROWS_EXAMINED")?,
        sum_created_tmp_disk_tables: row.try_get("SUM_CREATED_TMP_DISK_TABLES")?,
        sum_created_tmp_tables: row.try_get("SUM_CREATED_TMP_TABLES")?,
        sum_select_full_join: row.try_get("SUM_SELECT_FULL_JOIN")?,
        sum_select_scan: row.try_get("SUM_SELECT_SCAN")?,
        sum_sort_merge_passes: row.try_get("SUM_SORT_MERGE_PASSES")?,
        first_seen,
        last_seen,
    }))
}

impl Connector for PoolConnector {
    fn dsn(&self) -> &str {
        &self.dsn
    }

    fn connect(&self, tries: u32) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let mut last_err = Error::Sql("no connect attempts".to_string());
            for attempt in 0..tries.max(1) {
                if attempt > 0 {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                match MySqlPoolOptions::new()
                    .max_connections(2)
                    .acquire_timeout(Duration::from_secs(5))
                    .connect(&self.dsn)
                    .await
                {
                    Ok(pool) => {
                        debug!(dsn = %super::redact_dsn(&self.dsn), "connected");
                        *self.pool.write().await = Some(pool);
                        return Ok(());
                    }
                    Err(e) => last_err = e.into(),
                }
            }
            Err(last_err)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(pool) = self.pool.write().await.take() {
                pool.close().await;
            }
        })
    }

    fn set(&self, vars: &[VarValue]) -> BoxFuture<'_, Result<(), Error>> {
        let vars = vars.to_vec();
        Box::pin(async move {
            let pool = self.pool().await?;
            for var in &vars {
                let stmt = format!("SET GLOBAL {} = ?", var.name);
                sqlx::query(&stmt).bind(&var.value).execute(&pool).await?;
            }
            Ok(())
        })
    }

    fn uptime(&self) -> BoxFuture<'_, Result<i64, Error>> {
        Box::pin(async move {
            let pool = self.pool().await?;
            let row = sqlx::query("SHOW GLOBAL STATUS LIKE 'Uptime'")
                .fetch_one(&pool)
                .await?;
            let value: String = row.try_get(1)?;
            value
                .parse::<i64>()
                .map_err(|e| Error::Sql(format!("bad uptime value {value:?}: {e}")))
        })
    }

    fn global_var(&self, name: &str) -> BoxFuture<'_, Result<String, Error>> {
        let name = name.to_string();
        Box::pin(async move {
            let pool = self.pool().await?;
            let row = sqlx::query("SHOW GLOBAL VARIABLES LIKE ?")
                .bind(&name)
                .fetch_optional(&pool)
                .await?;
            match row {
                Some(row) => Ok(row.try_get(1)?),
                None => Ok(String::new()),
            }
        })
    }

    fn global_status(&self) -> BoxFuture<'_, Result<Vec<(String, String)>, Error>> {
        Box::pin(self.name_value_rows("SHOW GLOBAL STATUS"))
    }

    fn global_variables(&self) -> BoxFuture<'_, Result<Vec<(String, String)>, Error>> {
        Box::pin(self.name_value_rows("SHOW GLOBAL VARIABLES"))
    }

    fn digest_rows(&self) -> BoxFuture<'_, Result<Vec<DigestRow>, Error>> {
        Box::pin(async move {
            let pool = self.pool().await?;
            let rows = sqlx::query(DIGEST_QUERY).fetch_all(&pool).await?;
            let mut out = Vec::with_capacity(rows.len());
            for row in &rows {
                if let Some(parsed) = digest_row(row)? {
                    out.push(parsed);
                }
            }
            Ok(out)
        })
    }

    fn truncate_digests(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let pool = self.pool().await?;
            sqlx::query("TRUNCATE performance_schema.events_statements_summary_by_digest")
                .execute(&pool)
                .await?;
            Ok(())
        })
    }
}

/// Factory for [`PoolConnector`]s.
pub struct PoolConnectionFactory;

impl ConnectionFactory for PoolConnectionFactory {
    fn make(&self, dsn: &str) -> Arc<dyn Connector> {
        Arc::new(PoolConnector::new(dsn))
    }
}
