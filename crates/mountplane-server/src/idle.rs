//! Idle exit: resolve once the process has had nothing to do for a while.

use std::time::Duration;

use mountplane_kernel::ProcessLifecycle;

/// Wait until no termination guard has been held for `timeout`.
///
/// Any guard acquired during the countdown (a new connection, a mount) resets
/// it. Returns immediately if the lifecycle is dropped.
pub async fn wait_for_idle(lifecycle: &ProcessLifecycle, timeout: Duration) {
    let mut idle = lifecycle.idle_changed();
    loop {
        // Wait for the count to reach zero.
        while !*idle.borrow_and_update() {
            if idle.changed().await.is_err() {
                return;
            }
        }

        tracing::debug!(?timeout, "idle countdown started");
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                if lifecycle.is_idle_eligible() {
                    tracing::info!(?timeout, "idle timeout reached");
                    return;
                }
            }
            changed = idle.changed() => {
                if changed.is_err() {
                    return;
                }
                tracing::debug!("idle countdown cancelled");
            }
        }
    }
}
