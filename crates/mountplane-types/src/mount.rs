//! Mount configuration and the shared vocabulary for mount state.
//!
//! [`MountConfig`] is what a caller hands to `create`: everything needed to
//! reach the remote filesystem and where to attach it locally. The secret part
//! of [`Credentials`] never appears in `Debug` output, so configs can be put in
//! tracing fields without leaking passwords.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::ids::MountId;

/// A password or token that must never be logged.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Access the secret for handing to a transport.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Who connects and where to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub secret: Secret,
    pub host: String,
    pub port: u16,
}

impl Credentials {
    pub fn new(user: impl Into<String>, secret: Secret, host: impl Into<String>, port: u16) -> Self {
        Self {
            user: user.into(),
            secret,
            host: host.into(),
            port,
        }
    }

    /// `host:port`, suitable for socket connects and log lines.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Everything `create` needs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    pub mountpoint: PathBuf,
    pub label: String,
    pub credentials: Credentials,
}

impl MountConfig {
    pub fn new(
        mountpoint: impl Into<PathBuf>,
        label: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            mountpoint: normalize_mountpoint(mountpoint.into()),
            label: label.into(),
            credentials,
        }
    }
}

/// Strip trailing slashes, keeping a lone `/`. Does not make a path absolute.
pub fn normalize_mountpoint(path: impl AsRef<Path>) -> PathBuf {
    let s = path.as_ref().to_string_lossy();
    let trimmed = s.trim_end_matches('/');
    if trimmed.is_empty() && s.starts_with('/') {
        PathBuf::from("/")
    } else {
        PathBuf::from(trimmed)
    }
}

/// A mountpoint must be absolute and must not be the filesystem root.
pub fn is_valid_mountpoint(path: &Path) -> bool {
    path.is_absolute() && path.parent().is_some()
}

/// Lifecycle phase of an initialized mount.
///
/// `Uninitialized` is not a phase: it is the absence of a mount, which the
/// supervisor represents as `None`.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum MountPhase {
    /// Configured, never connected.
    Created,
    /// A connect is in flight.
    Connecting,
    /// The transport reported success and no disconnect has happened since.
    Connected,
    /// Torn down, or the last connect failed after a previous disconnect.
    Disconnected,
}

impl MountPhase {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    pub fn is_connecting(self) -> bool {
        self == Self::Connecting
    }

    /// Connecting or connected: a transport session may exist.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

/// The user-visible description of a mount, carried by
/// `MountDetailsChanged` events and returned by status queries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountDetails {
    pub id: MountId,
    pub mountpoint: PathBuf,
    pub label: String,
    pub use_cache: bool,
    pub icon: Option<PathBuf>,
    pub phase: MountPhase,
}
