//! Server configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

use std::time::Duration;

/// Exit status of a run loop that ended normally (idle or signalled).
///
/// `EX_TEMPFAIL`: the activation supervisor reads it as "respawn on demand",
/// distinct from a crash.
pub const SERVICE_SHUTDOWN_STATUS: u8 = 75;

/// Exit status after a peer asked the helper to kill its mount.
pub const KILLED_STATUS: u8 = 1;

/// How long a process with no guards and no connections lingers before exiting.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Peers must complete the handshake within this window.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for a single transport connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Directory under the runtime dir that holds every mountplane socket.
pub const SOCKET_DIR_NAME: &str = "mountplane";

/// Socket file name for the mount helper.
pub const HELPER_SOCKET: &str = "helper.sock";

/// Socket file name for the service.
pub const SERVICE_SOCKET: &str = "service.sock";

/// Socket file name for the foreground app.
pub const APP_SOCKET: &str = "app.sock";

/// Reply to `Ping`.
pub const PING_REPLY: &str = "ack";

/// Env var overriding the socket path.
pub const ENV_SOCKET: &str = "MOUNTPLANE_SOCKET";

/// Env var overriding the idle timeout, in seconds.
pub const ENV_IDLE_SECS: &str = "MOUNTPLANE_IDLE_SECS";
