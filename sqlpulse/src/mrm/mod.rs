//! MySQL restart monitor (MRM).
//!
//! Polls `Uptime` for every registered DSN on a fixed cadence and fans a
//! restart notification out to subscribers. The detection rule compares
//! observed uptime against what an uninterrupted server must have
//! accumulated:
//!
//! ```text
//! expected = last_uptime + (now - last_check)
//! current < expected  =>  the server restarted
//! ```
//!
//! which stays correct even when the monitor could not reach the server
//! for longer than the new uptime (a plain `current < last` check would
//! miss that restart).

use crate::error::Error;
use crate::log::Logger;
use crate::mysql::{redact_dsn, ConnectionFactory, Connector};
use crate::proto::{AgentConfigResource, Cmd, Reply};
use crate::service::ServiceManager;
use crate::status::Status;
use crate::syncchan::SyncChan;
use crate::ticker;
use crate::BoxFuture;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;

/// Poll cadence, in seconds.
pub const POLL_PERIOD_SECS: u64 = 1;

/// Subscriber channel capacity. Notifications are try_send; a subscriber
/// five notifications behind starts losing them.
const SUBSCRIBER_CHAN_SIZE: usize = 5;

/// Identifies one subscription for `remove`.
pub type SubId = u64;

/// Restart-notification surface as consumed by QAN. A trait so tests can
/// hand QAN a scripted monitor.
pub trait RestartMonitor: Send + Sync {
    /// Subscribes to restart notifications for `dsn`. Polling for a DSN
    /// begins with its first subscriber.
    fn add(&self, dsn: &str) -> Result<(SubId, mpsc::Receiver<bool>), Error>;

    /// Unsubscribes. Polling for a DSN stops when its last subscriber
    /// leaves.
    fn remove(&self, dsn: &str, id: SubId);
}

/// Pure detection rule; see the module docs for the reasoning.
pub fn restarted(last_uptime: i64, elapsed: i64, current_uptime: i64) -> bool {
    current_uptime < last_uptime + elapsed
}

struct Instance {
    conn: Arc<dyn Connector>,
    last_uptime: i64,
    last_check: DateTime<Utc>,
    seeded: bool,
    subscribers: HashMap<SubId, mpsc::Sender<bool>>,
}

/// The monitor. Registered as the `"mrm"` service so its lifecycle and
/// status travel with every other service.
pub struct Monitor {
    logger: Logger,
    factory: Arc<dyn ConnectionFactory>,
    clock: Arc<dyn ticker::Manager>,
    instances: Arc<RwLock<HashMap<String, Instance>>>,
    next_id: AtomicU64,
    status: Arc<Status>,
    sync: Mutex<Option<SyncChan>>,
    tick_sub: Mutex<Option<ticker::SubId>>,
}

impl Monitor {
    pub fn new(
        logger: Logger,
        factory: Arc<dyn ConnectionFactory>,
        clock: Arc<dyn ticker::Manager>,
    ) -> Arc<Self> {
        Arc::new(Monitor {
            logger,
            factory,
            clock,
            instances: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            status: Arc::new(Status::new(&["mrm"])),
            sync: Mutex::new(None),
            tick_sub: Mutex::new(None),
        })
    }

    /// One poll pass over every registered instance.
    async fn poll(
        logger: &Logger,
        instances: &Arc<RwLock<HashMap<String, Instance>>>,
    ) {
        // Snapshot connectors without holding the lock across SQL.
        let conns: Vec<(String, Arc<dyn Connector>)> = {
            let map = instances.read().expect("mrm lock");
            map.iter()
                .map(|(dsn, i)| (dsn.clone(), Arc::clone(&i.conn)))
                .collect()
        };
        for (dsn, conn) in conns {
            let uptime = match conn.uptime().await {
                Ok(v) => v,
                Err(e) => {
                    logger.debug(format!("uptime poll failed for {}: {e}", redact_dsn(&dsn)));
                    // Try to re-establish for the next pass.
                    let _ = conn.connect(1).await;
                    continue;
                }
            };
            let now = Utc::now();
            let notify: Vec<mpsc::Sender<bool>> = {
                let mut map = instances.write().expect("mrm lock");
                let Some(instance) = map.get_mut(&dsn) else { continue };
                let was_seeded = instance.seeded;
                let elapsed = now.timestamp() - instance.last_check.timestamp();
                let last = instance.last_uptime;
                instance.last_uptime = uptime;
                instance.last_check = now;
                instance.seeded = true;
                if was_seeded && restarted(last, elapsed, uptime) {
                    instance.subscribers.values().cloned().collect()
                } else {
                    Vec::new()
                }
            };
            if !notify.is_empty() {
                logger.warn(format!("MySQL restart detected: {}", redact_dsn(&dsn)));
                for tx in notify {
                    if tx.try_send(true).is_err() {
                        logger.warn("unable to notify subscriber".to_string());
                    }
                }
            }
        }
    }
}

impl RestartMonitor for Monitor {
    fn add(&self, dsn: &str) -> Result<(SubId, mpsc::Receiver<bool>), Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHAN_SIZE);
        let mut map = self.instances.write().expect("mrm lock");
        let instance = map.entry(dsn.to_string()).or_insert_with(|| Instance {
            conn: self.factory.make(dsn),
            last_uptime: 0,
            last_check: Utc::now(),
            seeded: false,
            subscribers: HashMap::new(),
        });
        instance.subscribers.insert(id, tx);
        self.logger
            .debug(format!("watching {} for restarts", redact_dsn(dsn)));
        Ok((id, rx))
    }

    fn remove(&self, dsn: &str, id: SubId) {
        let mut map = self.instances.write().expect("mrm lock");
        if let Some(instance) = map.get_mut(dsn) {
            instance.subscribers.remove(&id);
            if instance.subscribers.is_empty() {
                map.remove(dsn);
                self.logger
                    .debug(format!("stopped watching {}", redact_dsn(dsn)));
            }
        }
    }
}

impl ServiceManager for Monitor {
    fn start(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let mut sync_slot = self.sync.lock().expect("mrm sync lock");
            if sync_slot.is_some() {
                return Err(Error::ServiceIsRunning {
                    service: "mrm".to_string(),
                });
            }
            let sync = SyncChan::new();
            let handle = sync.handle();
            let (tick_tx, mut tick_rx) = mpsc::channel(1);
            let sub = self.clock.add(tick_tx, POLL_PERIOD_SECS, true);
            *self.tick_sub.lock().expect("mrm tick lock") = Some(sub);

            let logger = self.logger.clone();
            let instances = Arc::clone(&self.instances);
            let status = Arc::clone(&self.status);
            tokio::spawn(async move {
                let _guard = handle.done_on_drop();
                status.update("mrm", "Running");
                loop {
                    tokio::select! {
                        _ = handle.stopped() => {
                            handle.graceful();
                            status.update("mrm", "Stopped");
                            return;
                        }
                        tick = tick_rx.recv() => {
                            if tick.is_none() {
                                handle.graceful();
                                return;
                            }
                            Monitor::poll(&logger, &instances).await;
                        }
                    }
                }
            });
            *sync_slot = Some(sync);
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let sync = self.sync.lock().expect("mrm sync lock").take();
            let Some(mut sync) = sync else { return Ok(()) };
            if let Some(sub) = self.tick_sub.lock().expect("mrm tick lock").take() {
                self.clock.remove(sub);
            }
            sync.stop();
            sync.wait().await;
            Ok(())
        })
    }

    fn status(&self) -> HashMap<String, String> {
        let count = self.instances.read().expect("mrm lock").len();
        let mut map = self.status.all();
        map.insert("mrm-instances".to_string(), count.to_string());
        map
    }

    fn handle(&self, cmd: Cmd) -> BoxFuture<'_, Reply> {
        Box::pin(async move {
            cmd.err(Error::UnknownCmd {
                cmd: cmd.cmd.clone(),
            })
        })
    }

    fn get_config(&self) -> (Vec<AgentConfigResource>, Vec<Error>) {
        (Vec::new(), Vec::new())
    }
}
