//! Process lifecycle: suppress idle termination while work is in flight.
//!
//! The helper and service processes are launched on demand and exit after an
//! idle period. Anything that must not be interrupted (a live mount, an open
//! connection, a request in progress) holds a [`TerminationGuard`]. The server
//! run loop watches [`ProcessLifecycle::idle_changed`] and only starts its idle
//! timer once the count drops to zero.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

/// Saturating count of reasons not to exit.
#[derive(Debug)]
pub struct ProcessLifecycle {
    count: Mutex<u64>,
    idle_tx: watch::Sender<bool>,
}

impl Default for ProcessLifecycle {
    fn default() -> Self {
        let (idle_tx, _) = watch::channel(true);
        Self {
            count: Mutex::new(0),
            idle_tx,
        }
    }
}

impl ProcessLifecycle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add one reason to stay alive.
    pub fn suppress_termination(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_add(1);
        if *count == 1 {
            self.idle_tx.send_replace(false);
        }
        tracing::trace!(count = *count, "termination suppressed");
    }

    /// Remove one reason to stay alive. Below zero is a no-op.
    pub fn allow_termination(&self) {
        let mut count = self.count.lock();
        if *count == 0 {
            tracing::debug!("allow_termination with no outstanding suppression");
            return;
        }
        *count -= 1;
        if *count == 0 {
            self.idle_tx.send_replace(true);
        }
        tracing::trace!(count = *count, "termination allowed");
    }

    /// Scoped suppression, released on drop.
    pub fn guard(self: &Arc<Self>) -> TerminationGuard {
        self.suppress_termination();
        TerminationGuard {
            lifecycle: Arc::clone(self),
        }
    }

    pub fn outstanding(&self) -> u64 {
        *self.count.lock()
    }

    pub fn is_idle_eligible(&self) -> bool {
        self.outstanding() == 0
    }

    /// Receiver that flips to `true` whenever the count reaches zero.
    pub fn idle_changed(&self) -> watch::Receiver<bool> {
        self.idle_tx.subscribe()
    }
}

/// RAII form of [`ProcessLifecycle::suppress_termination`].
#[must_use = "dropping the guard immediately re-allows termination"]
#[derive(Debug)]
pub struct TerminationGuard {
    lifecycle: Arc<ProcessLifecycle>,
}

impl Drop for TerminationGuard {
    fn drop(&mut self) {
        self.lifecycle.allow_termination();
    }
}
