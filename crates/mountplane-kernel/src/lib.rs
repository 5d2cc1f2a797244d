//! # mountplane-kernel
//!
//! The mount-control core shared by every mountplane process.
//!
//! - [`SharedMountState`]: one mount's fields behind a single lock
//! - [`MountSupervisor`]: the actor that owns the mount and drives
//!   `create → connect → disconnect`
//! - [`EndpointBroker`]: rendezvous slots for peer endpoints
//! - [`MountEventBus`]: typed pub/sub delivered on one designated thread
//! - [`ProcessLifecycle`]: termination guards for idle-exit processes
//! - [`MountTransport`]: the seam to the remote filesystem protocol
//! - [`DiagnosticsHub`]: transport errors and log lines for forwarding

pub mod broker;
pub mod bus;
pub mod diagnostics;
pub mod error;
pub mod lifecycle;
pub mod state;
pub mod supervisor;
pub mod transport;

pub use broker::EndpointBroker;
pub use bus::{BusError, DeliveryPump, MountEventBus, Subscription, matches_pattern};
pub use diagnostics::DiagnosticsHub;
pub use error::{SupervisorError, SupervisorResult};
pub use lifecycle::{ProcessLifecycle, TerminationGuard};
pub use state::{MountState, SharedMountState};
pub use supervisor::MountSupervisor;
pub use transport::{
    ConnectScript, MemoryTransport, MountTransport, TcpTransport, TransportError,
};
