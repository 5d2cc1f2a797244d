//! Server configuration: RON file, then environment, then CLI flags.
//!
//! ```ron
//! (
//!     socket_dir: Some("~/.local/run/mountplane"),
//!     idle_timeout_secs: 60,
//!     transport: Tcp,
//!     connect_timeout_secs: 10,
//! )
//! ```
//!
//! Every field is optional; missing fields take the defaults in
//! [`constants`](crate::constants).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use mountplane_types::Interface;

use crate::constants::{
    APP_SOCKET, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDLE_TIMEOUT, ENV_IDLE_SECS, ENV_SOCKET,
    HELPER_SOCKET, SERVICE_SOCKET, SOCKET_DIR_NAME,
};

/// Error type for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Which process this is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ServerRole {
    /// On-demand helper that owns the mount.
    Helper,
    /// Long-lived service that brokers endpoints.
    Service,
}

impl ServerRole {
    pub fn interface(self) -> Interface {
        match self {
            Self::Helper => Interface::MountHelper,
            Self::Service => Interface::Service,
        }
    }

    pub fn service_name(self) -> &'static str {
        match self {
            Self::Helper => "mountplane-helper",
            Self::Service => "mountplane-service",
        }
    }
}

/// Which [`MountTransport`](mountplane_kernel::MountTransport) the helper uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum TransportKind {
    /// In-process transport that always succeeds. For dry runs.
    Memory,
    /// TCP reachability of `host:port` stands in for a session.
    #[default]
    Tcp,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory holding the sockets. `None` = runtime dir.
    pub socket_dir: Option<PathBuf>,
    /// Explicit socket path, overriding `socket_dir`.
    pub socket: Option<PathBuf>,
    pub idle_timeout_secs: u64,
    pub transport: TransportKind,
    pub connect_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_dir: None,
            socket: None,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT.as_secs(),
            transport: TransportKind::default(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
        }
    }
}

impl ServerConfig {
    /// Parse a RON document.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        let mut config: Self = ron::from_str(text)?;
        config.expand_paths();
        Ok(config)
    }

    /// Load from a RON file, `~` expanded.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let expanded = expand(path);
        let text = std::fs::read_to_string(&expanded).map_err(|source| ConfigError::Io {
            path: expanded.clone(),
            source,
        })?;
        Self::from_ron(&text)
    }

    /// Load `path` if given, otherwise defaults; then apply the environment.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env_with(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Apply `MOUNTPLANE_SOCKET` / `MOUNTPLANE_IDLE_SECS` from `lookup`.
    pub fn apply_env_with(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(socket) = lookup(ENV_SOCKET).filter(|s| !s.is_empty()) {
            self.socket = Some(expand(Path::new(&socket)));
        }
        if let Some(value) = lookup(ENV_IDLE_SECS) {
            self.idle_timeout_secs = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: ENV_IDLE_SECS,
                value,
            })?;
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        self.socket_dir = self.socket_dir.as_deref().map(expand);
        self.socket = self.socket.as_deref().map(expand);
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Directory the sockets live in.
    pub fn socket_dir(&self) -> PathBuf {
        self.socket_dir.clone().unwrap_or_else(default_socket_dir)
    }

    /// Socket path this process listens on for `interface`.
    pub fn socket_path(&self, interface: Interface) -> PathBuf {
        if let Some(socket) = &self.socket {
            return socket.clone();
        }
        socket_path_in(&self.socket_dir(), interface)
    }
}

/// `<runtime dir>/mountplane`, falling back to the temp dir.
pub fn default_socket_dir() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(SOCKET_DIR_NAME)
}

/// Conventional socket path for `interface` inside `dir`.
pub fn socket_path_in(dir: &Path, interface: Interface) -> PathBuf {
    let name = match interface {
        Interface::MountHelper => HELPER_SOCKET,
        Interface::Service => SERVICE_SOCKET,
        Interface::App => APP_SOCKET,
    };
    dir.join(name)
}

fn expand(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&text).as_ref())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.idle_timeout(), DEFAULT_IDLE_TIMEOUT);
        assert_eq!(config.transport, TransportKind::Tcp);
        assert!(
            config
                .socket_path(Interface::MountHelper)
                .ends_with("mountplane/helper.sock")
        );
    }

    #[test]
    fn test_partial_ron() {
        let config = ServerConfig::from_ron("(idle_timeout_secs: 5, transport: Memory)").unwrap();
        assert_eq!(config.idle_timeout_secs, 5);
        assert_eq!(config.transport, TransportKind::Memory);
        assert_eq!(config.connect_timeout(), DEFAULT_CONNECT_TIMEOUT);
    }

    #[test]
    fn test_bad_ron() {
        assert!(matches!(
            ServerConfig::from_ron("(idle_timeout_secs: \"soon\")"),
            Err(ConfigError::Ron(_))
        ));
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.ron");
        std::fs::write(&path, "(socket_dir: Some(\"/run/mp\"))").unwrap();
        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.socket_path(Interface::Service), PathBuf::from("/run/mp/service.sock"));
    }

    #[test]
    fn test_missing_file() {
        let err = ServerConfig::load(Path::new("/nonexistent/mountplane.ron")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_SOCKET, "/tmp/custom.sock"),
            (ENV_IDLE_SECS, " 7 "),
        ]
        .into_iter()
        .collect();
        let mut config = ServerConfig::default();
        config
            .apply_env_with(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.socket_path(Interface::App), PathBuf::from("/tmp/custom.sock"));
        assert_eq!(config.idle_timeout_secs, 7);
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut config = ServerConfig::default();
        let err = config
            .apply_env_with(|k| (k == ENV_IDLE_SECS).then(|| "never".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: ENV_IDLE_SECS, .. }));
    }
}
