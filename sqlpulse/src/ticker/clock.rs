//! The clock: a single-writer ticker multiplexer.
//!
//! One upstream [`Ticker`] task exists per distinct period, spawned when
//! the first subscriber of that period arrives and torn down when the last
//! one leaves. Fan-out sends are `try_send`: a slow consumer loses ticks,
//! it never stalls the fan-out.

use super::ticker::{until_next, Ticker};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Identifies one subscription for `remove`/`eta`.
pub type SubId = u64;

/// Tick subscription surface, as consumed by QAN and the monitors.
/// A trait so tests can drive subscribers with hand-injected ticks.
pub trait Manager: Send + Sync {
    /// Subscribes `tx` to aligned ticks every `period_secs`. When `sync`
    /// is false, one immediate (unaligned) tick is delivered on top of the
    /// aligned stream.
    fn add(&self, tx: mpsc::Sender<DateTime<Utc>>, period_secs: u64, sync: bool) -> SubId;

    /// Drops the subscription. The upstream ticker stops when its last
    /// subscriber is removed.
    fn remove(&self, id: SubId);

    /// Seconds until the next tick for this subscription's period.
    fn eta(&self, id: SubId) -> f64;
}

type SubMap = Arc<Mutex<HashMap<SubId, mpsc::Sender<DateTime<Utc>>>>>;

struct PeriodEntry {
    stop: CancellationToken,
    subs: SubMap,
}

struct Inner {
    periods: HashMap<u64, PeriodEntry>,
    period_of: HashMap<SubId, u64>,
}

/// The production clock.
pub struct Clock {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            inner: Mutex::new(Inner {
                periods: HashMap::new(),
                period_of: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    fn spawn_fan_out(period_secs: u64, subs: SubMap) -> CancellationToken {
        let mut ticker = Ticker::new(period_secs);
        let mut tick_rx = ticker.tick_chan().expect("fresh ticker");
        ticker.start();
        let stop = CancellationToken::new();
        let token = stop.clone();
        tokio::spawn(async move {
            // Moving the ticker in keeps its timer task alive for the
            // lifetime of the fan-out.
            let _ticker = ticker;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(period = period_secs, "clock fan-out stopped");
                        return;
                    }
                    tick = tick_rx.recv() => {
                        let Some(tick) = tick else { return };
                        let subs = subs.lock().expect("clock subs lock");
                        for tx in subs.values() {
                            if tx.try_send(tick).is_err() {
                                warn!(period = period_secs, "tick dropped, subscriber busy");
                            }
                        }
                    }
                }
            }
        });
        stop
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager for Clock {
    fn add(&self, tx: mpsc::Sender<DateTime<Utc>>, period_secs: u64, sync: bool) -> SubId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if !sync {
            let _ = tx.try_send(Utc::now());
        }
        let mut inner = self.inner.lock().expect("clock lock");
        let entry = inner.periods.entry(period_secs).or_insert_with(|| {
            let subs: SubMap = Arc::new(Mutex::new(HashMap::new()));
            let stop = Clock::spawn_fan_out(period_secs, Arc::clone(&subs));
            PeriodEntry { stop, subs }
        });
        entry.subs.lock().expect("clock subs lock").insert(id, tx);
        inner.period_of.insert(id, period_secs);
        debug!(sub = id, period = period_secs, "clock subscription added");
        id
    }

    fn remove(&self, id: SubId) {
        let mut inner = self.inner.lock().expect("clock lock");
        let Some(period) = inner.period_of.remove(&id) else {
            return;
        };
        let empty = if let Some(entry) = inner.periods.get(&period) {
            let mut subs = entry.subs.lock().expect("clock subs lock");
            subs.remove(&id);
            subs.is_empty()
        } else {
            false
        };
        if empty {
            if let Some(entry) = inner.periods.remove(&period) {
                entry.stop.cancel();
                debug!(period, "last subscriber left, ticker torn down");
            }
        }
    }

    fn eta(&self, id: SubId) -> f64 {
        let inner = self.inner.lock().expect("clock lock");
        let Some(&period) = inner.period_of.get(&id) else {
            return 0.0;
        };
        let (wait, _) = until_next(period, Utc::now().timestamp_millis());
        wait.as_secs_f64()
    }
}
