//! mountplane server library
//!
//! The export surface of the helper and service processes: a Unix-socket
//! listener with an interface handshake, the request dispatcher bound to the
//! process-wide supervisor and broker, diagnostics forwarding to the app,
//! configuration, and the idle-exit wait.

pub mod config;
pub mod constants;
pub mod forward;
pub mod idle;
pub mod listener;
pub mod rpc;

pub use config::{ConfigError, ServerConfig, ServerRole, TransportKind};
pub use forward::DiagnosticsForwarder;
pub use idle::wait_for_idle;
pub use listener::{ConnectionInfo, RequestHandler, Responder, RpcListener};
pub use rpc::{Dispatcher, exports};
