//! Interval iterators: turn clock ticks into bounded work windows.
//!
//! The perfschema iterator emits time-bounded intervals; the slowlog
//! iterator tracks the current slow-log file and emits byte-offset
//! windows. Both prime on their first tick — the first interval spans
//! tick one to tick two.

use super::Interval;
use crate::error::Error;
use crate::log::Logger;
use crate::BoxFuture;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Resolves the current slow-log path from the upstream server.
pub type FilenameFunc =
    Arc<dyn Fn() -> BoxFuture<'static, Result<String, Error>> + Send + Sync>;

/// One interval per tick, delivered on `interval_chan`.
pub trait IntervalIter: Send {
    fn start(&mut self);
    fn stop(&self);
    /// Takes the interval receiver. Yields `None` after the first call.
    fn interval_chan(&mut self) -> Option<mpsc::Receiver<Interval>>;
}

/// Builds the iterator variant for a `collect_from` value.
pub trait IntervalIterFactory: Send + Sync {
    fn make(
        &self,
        collect_from: &str,
        filename_func: Option<FilenameFunc>,
        tick_rx: mpsc::Receiver<DateTime<Utc>>,
    ) -> Box<dyn IntervalIter>;
}

/// The production factory.
pub struct RealIntervalIterFactory {
    pub logger: Logger,
}

impl IntervalIterFactory for RealIntervalIterFactory {
    fn make(
        &self,
        collect_from: &str,
        filename_func: Option<FilenameFunc>,
        tick_rx: mpsc::Receiver<DateTime<Utc>>,
    ) -> Box<dyn IntervalIter> {
        match collect_from {
            super::COLLECT_FROM_PERFSCHEMA => {
                Box::new(TimeIntervalIter::new(self.logger.clone(), tick_rx))
            }
            _ => Box::new(FileIntervalIter::new(
                self.logger.clone(),
                filename_func.expect("slowlog iterator requires a filename func"),
                tick_rx,
            )),
        }
    }
}

// ============================================================================
// Perfschema: time-bounded intervals
// ============================================================================

/// Emits `[previous tick, this tick]` windows.
pub struct TimeIntervalIter {
    logger: Logger,
    tick_rx: Option<mpsc::Receiver<DateTime<Utc>>>,
    tx: mpsc::Sender<Interval>,
    rx: Option<mpsc::Receiver<Interval>>,
    stop: CancellationToken,
}

impl TimeIntervalIter {
    pub fn new(logger: Logger, tick_rx: mpsc::Receiver<DateTime<Utc>>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        TimeIntervalIter {
            logger,
            tick_rx: Some(tick_rx),
            tx,
            rx: Some(rx),
            stop: CancellationToken::new(),
        }
    }
}

impl IntervalIter for TimeIntervalIter {
    fn start(&mut self) {
        let Some(mut tick_rx) = self.tick_rx.take() else { return };
        let tx = self.tx.clone();
        let stop = self.stop.clone();
        let logger = self.logger.clone();
        tokio::spawn(async move {
            let mut number: u64 = 0;
            let mut last_tick: Option<DateTime<Utc>> = None;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    tick = tick_rx.recv() => {
                        let Some(tick) = tick else { return };
                        if let Some(start) = last_tick {
                            number += 1;
                            let interval = Interval {
                                number,
                                start_time: start,
                                stop_time: tick,
                                ..Default::default()
                            };
                            if tx.try_send(interval).is_err() {
                                logger.warn("interval dropped, pipeline busy");
                            }
                        }
                        last_tick = Some(tick);
                    }
                }
            }
        });
    }

    fn stop(&self) {
        self.stop.cancel();
    }

    fn interval_chan(&mut self) -> Option<mpsc::Receiver<Interval>> {
        self.rx.take()
    }
}

// ============================================================================
// Slowlog: byte-offset intervals
// ============================================================================

/// Tracks the slow-log file and emits `[last offset, current size]`
/// windows. A new or externally-rotated file restarts at offset zero.
pub struct FileIntervalIter {
    logger: Logger,
    filename_func: FilenameFunc,
    tick_rx: Option<mpsc::Receiver<DateTime<Utc>>>,
    tx: mpsc::Sender<Interval>,
    rx: Option<mpsc::Receiver<Interval>>,
    stop: CancellationToken,
}

impl FileIntervalIter {
    pub fn new(
        logger: Logger,
        filename_func: FilenameFunc,
        tick_rx: mpsc::Receiver<DateTime<Utc>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1);
        FileIntervalIter {
            logger,
            filename_func,
            tick_rx: Some(tick_rx),
            tx,
            rx: Some(rx),
            stop: CancellationToken::new(),
        }
    }
}

impl IntervalIter for FileIntervalIter {
    fn start(&mut self) {
        let Some(mut tick_rx) = self.tick_rx.take() else { return };
        let tx = self.tx.clone();
        let stop = self.stop.clone();
        let logger = self.logger.clone();
        let filename_func = Arc::clone(&self.filename_func);
        tokio::spawn(async move {
            let mut number: u64 = 0;
            let mut cur_file: Option<String> = None;
            let mut cur_offset: u64 = 0;
            let mut last_tick: Option<DateTime<Utc>> = None;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    tick = tick_rx.recv() => {
                        let Some(tick) = tick else { return };
                        let filename = match (filename_func)().await {
                            Ok(f) => f,
                            Err(e) => {
                                logger.warn(format!("cannot resolve slow log file: {e}"));
                                continue;
                            }
                        };
                        let size = tokio::fs::metadata(&filename)
                            .await
                            .map(|m| m.len())
                            .unwrap_or(0);
                        let changed = cur_file.as_deref() != Some(filename.as_str());
                        if changed || size < cur_offset {
                            // New file, or the file was truncated or
                            // rotated out from under us.
                            cur_offset = 0;
                        }
                        if let Some(start) = last_tick {
                            number += 1;
                            let interval = Interval {
                                number,
                                start_time: start,
                                stop_time: tick,
                                filename: Some(filename.clone()),
                                start_offset: cur_offset,
                                end_offset: size,
                            };
                            if tx.try_send(interval).is_err() {
                                logger.warn("interval dropped, pipeline busy");
                            }
                        }
                        cur_file = Some(filename);
                        cur_offset = size;
                        last_tick = Some(tick);
                    }
                }
            }
        });
    }

    fn stop(&self) {
        self.stop.cancel();
    }

    fn interval_chan(&mut self) -> Option<mpsc::Receiver<Interval>> {
        self.rx.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    fn test_logger() -> Logger {
        let (tx, _rx) = mpsc::channel(64);
        Logger::new(tx, "iter-test")
    }

    fn tick(secs: i64) -> DateTime<Utc> {
        chrono::TimeZone::timestamp_opt(&Utc, secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_time_iter_primes_on_first_tick() {
        let (tick_tx, tick_rx) = mpsc::channel(4);
        let mut iter = TimeIntervalIter::new(test_logger(), tick_rx);
        let mut intervals = iter.interval_chan().unwrap();
        iter.start();

        tick_tx.send(tick(60)).await.unwrap();
        tick_tx.send(tick(120)).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(1), intervals.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.number, 1);
        assert_eq!(first.start_time, tick(60));
        assert_eq!(first.stop_time, tick(120));
        iter.stop();
    }

    #[tokio::test]
    async fn test_time_iter_numbers_are_monotonic() {
        let (tick_tx, tick_rx) = mpsc::channel(8);
        let mut iter = TimeIntervalIter::new(test_logger(), tick_rx);
        let mut intervals = iter.interval_chan().unwrap();
        iter.start();
        for s in [0, 60, 120, 180] {
            tick_tx.send(tick(s)).await.unwrap();
            // Let the iterator task drain the tick before the next one so
            // the bounded interval channel doesn't overflow.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mut numbers = Vec::new();
        while let Ok(Some(i)) =
            tokio::time::timeout(Duration::from_millis(200), intervals.recv()).await
        {
            numbers.push(i.number);
            if numbers.len() == 3 {
                break;
            }
        }
        assert_eq!(numbers, vec![1, 2, 3]);
        iter.stop();
    }

    #[tokio::test]
    async fn test_file_iter_tracks_offsets() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("slow.log");
        std::fs::write(&path, b"0123456789").unwrap();
        let path_str = path.to_str().unwrap().to_string();

        let filename_func: FilenameFunc = {
            let path = path_str.clone();
            Arc::new(move || {
                let path = path.clone();
                Box::pin(async move { Ok(path) })
            })
        };
        let (tick_tx, tick_rx) = mpsc::channel(4);
        let mut iter = FileIntervalIter::new(test_logger(), filename_func, tick_rx);
        let mut intervals = iter.interval_chan().unwrap();
        iter.start();

        // First tick primes at offset 10.
        tick_tx.send(tick(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Grow the file, next tick emits [10..24].
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"more slow queries!").unwrap();
        drop(f);
        tick_tx.send(tick(120)).await.unwrap();

        let interval = tokio::time::timeout(Duration::from_secs(1), intervals.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(interval.filename.as_deref(), Some(path_str.as_str()));
        assert_eq!(interval.start_offset, 10);
        assert_eq!(interval.end_offset, 28);
        iter.stop();
    }
}
