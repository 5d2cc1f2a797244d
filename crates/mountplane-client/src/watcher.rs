//! Mirror the helper's mount state into a local [`MountEventBus`].
//!
//! The helper's bus lives in another process. A UI that wants `mount.*`
//! events polls the helper and republishes transitions on its own bus, where
//! they are delivered on its own designated thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mountplane_kernel::MountEventBus;
use mountplane_types::MountEvent;

use crate::rpc::{RpcClient, RpcError};

/// Background poller publishing `Mounted` / `Unmounted` on state changes.
///
/// Stops when dropped, on [`stop`](Self::stop), or when the helper hangs up.
pub struct MountWatcher {
    cancel: CancellationToken,
    connected: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl MountWatcher {
    /// Start polling `client` every `interval`.
    pub fn spawn(client: Arc<RpcClient>, bus: MountEventBus, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let connected = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(watch(
            client,
            bus,
            interval,
            cancel.clone(),
            Arc::clone(&connected),
        ));
        Self {
            cancel,
            connected,
            task: Some(task),
        }
    }

    /// Last observed `connected` value.
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop polling and wait for the task to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("watcher task failed: {e}");
            }
        }
    }
}

impl Drop for MountWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn watch(
    client: Arc<RpcClient>,
    bus: MountEventBus,
    interval: Duration,
    cancel: CancellationToken,
    connected: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let now = match client.connected().await {
            Ok(now) => now,
            Err(RpcError::Closed) => {
                log::info!("helper went away, watcher stopping");
                break;
            }
            Err(e) => {
                log::warn!("watcher poll failed: {e}");
                continue;
            }
        };
        connected.store(now, Ordering::Release);

        if now != last {
            let event = if now {
                MountEvent::Mounted
            } else {
                MountEvent::Unmounted
            };
            let seq = bus.publish(None, event);
            tracing::debug!(connected = now, seq, "watcher observed transition");
            last = now;
        }
    }
}
