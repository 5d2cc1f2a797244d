//! Shared vocabulary for the mountplane processes.
//!
//! This crate is the leaf everything else builds on: typed IDs, mount
//! configuration, endpoints, bus events, and the socket wire protocol. It has
//! **no internal mountplane dependencies**.
//!
//! # Key Types
//!
//! |-------------------|----------------------------------------------|
//! | Type              | Purpose                                      |
//! |-------------------|----------------------------------------------|
//! | [`MountId`]       | Which mount (fresh per `create`)             |
//! | [`MountConfig`]   | Mountpoint, label, credentials               |
//! | [`MountPhase`]    | Created / Connecting / Connected / ...       |
//! | [`MountDetails`]  | User-visible mount description               |
//! | [`Endpoint`]      | Passable handle to a listening peer          |
//! | [`PeerRole`]      | Which peer relationship an endpoint serves   |
//! | [`MountEvent`]    | What observers on the event bus receive      |
//! | [`Diagnostic`]    | Transport error or log line for the app      |
//! | [`Request`]       | An RPC operation                             |
//! | [`Reply`]         | Its single answer                            |
//! |-------------------|----------------------------------------------|

pub mod diagnostic;
pub mod endpoint;
pub mod event;
pub mod ids;
pub mod mount;
pub mod wire;

pub use diagnostic::{Diagnostic, DiagnosticStream, LogLevel};
pub use endpoint::{Endpoint, Interface, PeerRole};
pub use event::{Envelope, HasSubject, MountEvent};
pub use ids::{EndpointId, MountId, ObserverId};
pub use mount::{
    Credentials, MountConfig, MountDetails, MountPhase, Secret, is_valid_mountpoint,
    normalize_mountpoint,
};
pub use wire::{
    ErrorKind, Hello, HelloReply, PROTOCOL_VERSION, Reply, Request, RequestFrame, TraceCarrier,
    WireError,
};
