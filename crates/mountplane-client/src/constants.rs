//! Client configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

use std::time::Duration;

/// Timeout for connect + handshake. A helper that is being launched on demand
/// needs a moment to bind its socket.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default poll interval for [`rendezvous`](crate::rendezvous).
pub const RENDEZVOUS_INTERVAL: Duration = Duration::from_millis(250);

/// Default poll interval for [`MountWatcher`](crate::MountWatcher).
pub const WATCH_INTERVAL: Duration = Duration::from_secs(1);
