//! Slowlog worker: streams parsed events from a byte-offset window of the
//! slow-log file and aggregates them into classes.

use super::event::{GlobalClass, QueryClass, QueryEvent};
use super::fingerprint::{checksum, Fingerprinter};
use super::{Job, Worker, WorkerResult};
use crate::error::Error;
use crate::log::Logger;
use crate::status::Status;
use crate::BoxFuture;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::time::Instant;

// ============================================================================
// Parser
// ============================================================================

/// Streaming parser over the MySQL slow-log text format.
///
/// An event is a block of `#` header lines followed by the statement
/// text. `event.offset` is the byte offset of the event's first header
/// line, which is what offset-bounded intervals compare against.
pub struct SlowLogParser<R: BufRead> {
    reader: R,
    offset: u64,
    pending: Option<(String, u64)>,
}

impl<R: BufRead> SlowLogParser<R> {
    pub fn new(reader: R, start_offset: u64) -> Self {
        SlowLogParser {
            reader,
            offset: start_offset,
            pending: None,
        }
    }

    fn next_line(&mut self) -> Result<Option<(String, u64)>, Error> {
        if let Some(pending) = self.pending.take() {
            return Ok(Some(pending));
        }
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        let at = self.offset;
        self.offset += n as u64;
        Ok(Some((line, at)))
    }

    /// Returns the next complete event, or `None` at end of file.
    pub fn next_event(&mut self) -> Result<Option<QueryEvent>, Error> {
        let mut event: Option<QueryEvent> = None;
        let mut query = String::new();
        loop {
            let Some((line, at)) = self.next_line()? else {
                break;
            };
            let trimmed = line.trim_end();
            if trimmed.starts_with('#') {
                if !query.is_empty() {
                    // Header of the next event: push the line back and
                    // finish this one.
                    self.pending = Some((line, at));
                    break;
                }
                let event = event.get_or_insert_with(|| QueryEvent {
                    offset: at,
                    ..Default::default()
                });
                parse_header(trimmed, event);
            } else if let Some(rest) = trimmed.strip_prefix("use ") {
                if let Some(e) = event.as_mut() {
                    e.db = rest.trim_end_matches(';').to_string();
                }
            } else if let Some(rest) = trimmed.strip_prefix("SET timestamp=") {
                if let Some(e) = event.as_mut() {
                    if let Ok(unix) = rest.trim_end_matches(';').parse::<i64>() {
                        e.ts = Utc.timestamp_opt(unix, 0).single();
                    }
                }
            } else if event.is_some() {
                if !query.is_empty() {
                    query.push('\n');
                }
                query.push_str(trimmed);
            }
            // Anything before the first header block (file preamble,
            // server banner) is skipped because `event` is still None.
        }
        match event {
            Some(mut e) if !query.is_empty() => {
                e.query = query;
                Ok(Some(e))
            }
            _ => Ok(None),
        }
    }
}

fn parse_header(line: &str, event: &mut QueryEvent) {
    if let Some(rest) = line.strip_prefix("# Time: ") {
        event.ts = parse_time(rest.trim());
        return;
    }
    if line.starts_with("# User@Host:") {
        return;
    }
    // Attribute lines: "# Query_time: 0.000255  Lock_time: 0.000047 ..."
    let mut tokens = line.trim_start_matches('#').split_whitespace();
    while let Some(token) = tokens.next() {
        let Some(key) = token.strip_suffix(':') else {
            continue;
        };
        let Some(value) = tokens.next() else { break };
        match key {
            "Query_time" => event.query_time = value.parse().unwrap_or(0.0),
            "Lock_time" => event.lock_time = value.parse().unwrap_or(0.0),
            "Rows_sent" => event.rows_sent = value.parse().unwrap_or(0),
            "Rows_examined" => event.rows_examined = value.parse().unwrap_or(0),
            "Rows_affected" => event.rows_affected = value.parse().unwrap_or(0),
            _ => {}
        }
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    // 5.7+: ISO8601 with zone. Older servers: "140907 13:24:16".
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%y%m%d %H:%M:%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

// ============================================================================
// Worker
// ============================================================================

pub struct SlowLogWorker {
    logger: Logger,
    name: String,
    status: Status,
}

impl SlowLogWorker {
    pub fn new(logger: Logger, name: &str) -> Self {
        SlowLogWorker {
            logger,
            name: name.to_string(),
            status: Status::new(&[name]),
        }
    }
}

/// Parses `[start_offset, end_offset]` of the file and aggregates.
/// Runs on a blocking thread: parsing is CPU- and file-bound.
fn parse_interval(job: &Job) -> Result<WorkerResult, Error> {
    let path = job
        .slow_log_file
        .as_deref()
        .ok_or_else(|| Error::InvalidConfig("slowlog job without a filename".to_string()))?;
    let mut file = File::open(path)?;
    if job.start_offset > 0 {
        file.seek(SeekFrom::Start(job.start_offset))?;
    }
    let mut parser = SlowLogParser::new(BufReader::new(file), job.start_offset);
    let fingerprinter = Fingerprinter::new();
    let mut global = GlobalClass::new();
    let mut classes: BTreeMap<String, QueryClass> = BTreeMap::new();
    let started = Instant::now();

    while let Some(event) = parser.next_event()? {
        if event.offset > job.end_offset {
            break;
        }
        if started.elapsed() >= job.run_time {
            break;
        }
        global.add_event(&event);
        let fingerprint = fingerprinter.fingerprint(&event.query);
        let class_id = checksum(&fingerprint);
        classes
            .entry(class_id.clone())
            .or_insert_with(|| QueryClass::new(class_id, fingerprint))
            .add_event(&event, job.example_queries);
    }

    for class in classes.values_mut() {
        class.finalize();
    }
    global.finalize(classes.len() as u64);
    Ok(WorkerResult {
        global,
        classes: classes.into_values().collect(),
        run_time: 0.0,
    })
}

impl Worker for SlowLogWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> String {
        self.status.get(&self.name)
    }

    fn run<'a>(&'a self, job: &'a Job) -> BoxFuture<'a, Result<WorkerResult, Error>> {
        Box::pin(async move {
            self.status.update(
                &self.name,
                &format!(
                    "Parsing {} [{}..{}]",
                    job.slow_log_file.as_deref().unwrap_or("?"),
                    job.start_offset,
                    job.end_offset
                ),
            );
            let job = job.clone();
            let result = tokio::task::spawn_blocking(move || parse_interval(&job))
                .await
                .map_err(|e| Error::Sql(format!("slowlog parse task failed: {e}")))??;
            self.logger.debug(format!(
                "{} events in {} classes",
                result.global.total_queries,
                result.classes.len()
            ));
            self.status.update(&self.name, "Done");
            Ok(result)
        })
    }
}
