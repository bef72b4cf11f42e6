use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

// ---------------------------------------------------------------------------
// CancelToken — cooperative cancellation for waits and loops
// ---------------------------------------------------------------------------

/// Broadcast-based cancellation token.
///
/// Long-running operations (dependency polls, Ralph iterations, cooldown
/// sleeps) `select!` against [`CancelToken::cancelled`] so a caller can bound
/// their wall-clock exposure. Clones share the same state.
///
/// ```ignore
/// let cancel = CancelToken::new();
///
/// tokio::select! {
///     _ = cancel.cancelled() => { /* unwind */ }
///     _ = do_work() => {}
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CancelToken {
    /// Broadcast sender that wakes every waiter.
    trigger: broadcast::Sender<()>,
    /// Atomic flag for cheap polling.
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        Self {
            trigger,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check whether cancellation has been requested (non-blocking).
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            debug!("cancellation requested");
            let _ = self.trigger.send(());
        }
    }

    /// Resolve once cancellation is requested.
    ///
    /// Resolves immediately when the token is already cancelled, so late
    /// subscribers never miss the signal.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let mut rx = self.trigger.subscribe();
        // Re-check after subscribing: cancel() may have fired in between.
        if self.is_cancelled() {
            return;
        }
        let _ = rx.recv().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
