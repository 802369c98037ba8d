//! Cooperative cancellation and pausing

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Default)]
struct Flag {
    set: AtomicBool,
    changed: Notify,
}

impl Flag {
    fn store(&self, value: bool) {
        self.set.store(value, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    fn load(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    /// Resolve once the flag equals `value`.
    async fn wait_for(&self, value: bool) {
        loop {
            // The future is registered before the check so a concurrent
            // `store` cannot slip between them.
            let changed = self.changed.notified();
            if self.load() == value {
                return;
            }
            changed.await;
        }
    }
}

/// Cancellation signal shared between the runner and one job.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<Flag>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load()
    }

    /// Resolves when `cancel` has been called.
    pub async fn cancelled(&self) {
        self.flag.wait_for(true).await;
    }
}

/// Pause switch checked between download chunks.
#[derive(Clone, Default)]
pub struct PauseGate {
    flag: Arc<Flag>,
}

impl PauseGate {
    pub fn pause(&self) {
        self.flag.store(true);
    }

    pub fn resume(&self) {
        self.flag.store(false);
    }

    pub fn is_paused(&self) -> bool {
        self.flag.load()
    }

    /// Park while paused. Returns `false` if cancelled while parked.
    pub async fn wait_until_resumed(&self, cancel: &CancelToken) -> bool {
        if !self.is_paused() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = self.flag.wait_for(false) => !cancel.is_cancelled(),
        }
    }
}

/// Everything a job's suspension points need to check.
#[derive(Clone, Default)]
pub struct Control {
    pub cancel: CancelToken,
    pub pause: PauseGate,
}
