//! Supervisor error types.

use std::path::PathBuf;

use mountplane_types::{ErrorKind, MountPhase};

use crate::transport::TransportError;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    /// No mount has been created yet.
    #[error("no mount has been created")]
    NotCreated,

    #[error("cannot {op} while {phase}")]
    InvalidTransition { op: &'static str, phase: MountPhase },

    /// `create` while a connection is live or in flight.
    #[error("mount is {0}; disconnect before creating a new one")]
    MountBusy(MountPhase),

    /// Empty, relative, or the filesystem root.
    #[error("invalid mountpoint {0:?}")]
    InvalidMountpoint(PathBuf),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A pending connect was abandoned by `disconnect`.
    #[error("connect cancelled by disconnect")]
    Cancelled,

    #[error("supervisor shut down")]
    Shutdown,
}

impl SupervisorError {
    /// Coarse classification carried on the wire.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotCreated | Self::InvalidTransition { .. } => ErrorKind::InvalidStateTransition,
            Self::MountBusy(_) => ErrorKind::MountBusy,
            Self::InvalidMountpoint(_) => ErrorKind::MalformedRequest,
            Self::Transport(_) | Self::Cancelled => ErrorKind::TransportFailure,
            Self::Shutdown => ErrorKind::Internal,
        }
    }
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
