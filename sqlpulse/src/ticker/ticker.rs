//! The single-period aligned ticker.

use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Returns the boundary at or before `now_unix` for the given period:
/// the greatest multiple of `period_secs` that is `<= now_unix`.
pub fn began(period_secs: u64, now_unix: i64) -> DateTime<Utc> {
    let period = period_secs as i64;
    let boundary = (now_unix / period) * period;
    Utc.timestamp_opt(boundary, 0).unwrap()
}

/// Returns the sleep until the next boundary strictly after `now_ms`
/// (Unix milliseconds), plus the boundary timestamp itself.
pub fn until_next(period_secs: u64, now_ms: i64) -> (Duration, DateTime<Utc>) {
    let period_ms = period_secs as i64 * 1000;
    let next_ms = (now_ms / period_ms + 1) * period_ms;
    let wait = Duration::from_millis((next_ms - now_ms) as u64);
    let boundary = Utc.timestamp_millis_opt(next_ms).unwrap();
    (wait, boundary)
}

/// Periodic timer aligned to wall-clock multiples of its period.
///
/// `tick_chan()` hands out the single consumer side; `start()` spawns the
/// timer task. The channel holds one tick: a consumer that falls behind
/// misses boundaries rather than stalling the timer.
pub struct Ticker {
    period_secs: u64,
    stop: CancellationToken,
    tx: mpsc::Sender<DateTime<Utc>>,
    rx: Option<mpsc::Receiver<DateTime<Utc>>>,
}

impl Ticker {
    pub fn new(period_secs: u64) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Ticker {
            period_secs,
            stop: CancellationToken::new(),
            tx,
            rx: Some(rx),
        }
    }

    pub fn period_secs(&self) -> u64 {
        self.period_secs
    }

    /// Takes the tick receiver. Yields `None` after the first call.
    pub fn tick_chan(&mut self) -> Option<mpsc::Receiver<DateTime<Utc>>> {
        self.rx.take()
    }

    /// Spawns the timer task.
    pub fn start(&self) {
        let period = self.period_secs;
        let tx = self.tx.clone();
        let stop = self.stop.clone();
        tokio::spawn(async move {
            debug!(period, "ticker started");
            loop {
                let (wait, boundary) = until_next(period, Utc::now().timestamp_millis());
                tokio::select! {
                    _ = stop.cancelled() => {
                        debug!(period, "ticker stopped");
                        return;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
                let _ = tx.try_send(boundary);
            }
        });
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
