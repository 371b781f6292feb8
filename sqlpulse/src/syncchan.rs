//! Stop/Wait/Done/Crash rendezvous between a supervisor and one worker task.
//!
//! The supervisor holds a [`SyncChan`]; the worker task holds a cloned
//! [`SyncHandle`]. Shutdown is a two-step `stop()` + `wait()`. A worker
//! that terminates without first calling `graceful()` is reported on the
//! crash channel instead of the done channel, which is how crash-respawn
//! supervision observes unexpected exits.
//!
//! The crash signal must fire even when the worker task unwinds from a
//! panic, so workers arm a [`DoneGuard`] whose `Drop` delivers the signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Supervisor half of the rendezvous.
pub struct SyncChan {
    stop: CancellationToken,
    graceful: Arc<AtomicBool>,
    done_rx: mpsc::Receiver<()>,
    crash_rx: mpsc::Receiver<()>,
    handle: SyncHandle,
}

/// Worker half. Cloneable so a respawned worker can reuse the same
/// rendezvous (crash counters live in the supervisor).
#[derive(Clone)]
pub struct SyncHandle {
    stop: CancellationToken,
    graceful: Arc<AtomicBool>,
    done_tx: mpsc::Sender<()>,
    crash_tx: mpsc::Sender<()>,
}

impl SyncChan {
    pub fn new() -> Self {
        let stop = CancellationToken::new();
        let graceful = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel(1);
        let (crash_tx, crash_rx) = mpsc::channel(1);
        let handle = SyncHandle {
            stop: stop.clone(),
            graceful: Arc::clone(&graceful),
            done_tx,
            crash_tx,
        };
        SyncChan {
            stop,
            graceful,
            done_rx,
            crash_rx,
            handle,
        }
    }

    /// Handle for the worker task.
    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    /// Requests the worker to exit. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Blocks until the worker delivers a graceful done.
    pub async fn wait(&mut self) {
        let _ = self.done_rx.recv().await;
    }

    /// Resolves when the worker exits without a graceful marker. Use as a
    /// `select!` arm in a supervision loop.
    pub async fn crashed(&mut self) {
        let _ = self.crash_rx.recv().await;
    }

    /// Whether the worker marked a clean exit.
    pub fn is_graceful(&self) -> bool {
        self.graceful.load(Ordering::Acquire)
    }
}

impl Default for SyncChan {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncHandle {
    /// Resolves when the supervisor has requested a stop.
    pub async fn stopped(&self) {
        self.stop.cancelled().await;
    }

    /// Non-blocking check of the stop request.
    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Marks the upcoming exit as clean.
    pub fn graceful(&self) {
        self.graceful.store(true, Ordering::Release);
    }

    /// Signals termination: done when graceful, crash otherwise. The
    /// channels hold one slot, so a respawn racing an unconsumed signal
    /// does not block.
    pub fn done(&self) {
        if self.graceful.load(Ordering::Acquire) {
            let _ = self.done_tx.try_send(());
        } else {
            let _ = self.crash_tx.try_send(());
        }
    }

    /// Arms a guard that calls [`done`](Self::done) when dropped, including
    /// during a panic unwind.
    pub fn done_on_drop(&self) -> DoneGuard {
        DoneGuard {
            handle: self.clone(),
        }
    }
}

/// Delivers the done/crash signal when dropped.
pub struct DoneGuard {
    handle: SyncHandle,
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.handle.done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_graceful_stop_wait() {
        let mut sync = SyncChan::new();
        let handle = sync.handle();
        let task = tokio::spawn(async move {
            let _guard = handle.done_on_drop();
            handle.stopped().await;
            handle.graceful();
        });
        sync.stop();
        timeout(Duration::from_secs(1), sync.wait())
            .await
            .expect("worker should deliver done");
        assert!(sync.is_graceful());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_without_graceful_is_crash() {
        let mut sync = SyncChan::new();
        let handle = sync.handle();
        let task = tokio::spawn(async move {
            let _guard = handle.done_on_drop();
            // Exit immediately without graceful().
        });
        timeout(Duration::from_secs(1), sync.crashed())
            .await
            .expect("crash channel should fire");
        assert!(!sync.is_graceful());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_panic_unwind_delivers_crash() {
        let mut sync = SyncChan::new();
        let handle = sync.handle();
        let task = tokio::spawn(async move {
            let _guard = handle.done_on_drop();
            panic!("worker bug");
        });
        timeout(Duration::from_secs(1), sync.crashed())
            .await
            .expect("crash channel should fire on panic");
        assert!(task.await.unwrap_err().is_panic());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let sync = SyncChan::new();
        sync.stop();
        sync.stop();
        assert!(sync.handle().is_stopping());
    }
}
