//! Application configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

use std::time::Duration;

/// Directory for the log file; `/tmp` when unset.
pub const ENV_LOG_DIR: &str = "MOUNTPLANE_LOG_DIR";

/// Log file name inside the log directory.
pub const LOG_FILE: &str = "mountctl.log";

/// How long `fetch --wait` polls the broker before giving up.
pub const DEFAULT_RENDEZVOUS_DEADLINE: Duration = Duration::from_secs(30);

/// Default remote port for `create`.
pub const DEFAULT_PORT: u16 = 22;
