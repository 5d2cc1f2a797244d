//! Passable endpoints and the interfaces they speak.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::ids::EndpointId;

/// Which operation set a listener exports.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Interface {
    /// The on-demand helper that owns the mount.
    MountHelper,
    /// The long-lived service process; brokers endpoints only.
    Service,
    /// The foreground UI process.
    App,
}

/// Names a peer relationship in the endpoint broker.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum PeerRole {
    ForegroundApp,
    FinderExtension,
}

/// An opaque handle a peer can use to open a connection to the publisher.
///
/// Created once by a listener at process start and never mutated; the broker
/// only stores and hands out copies.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: EndpointId,
    pub interface: Interface,
    /// Unix socket path the publisher listens on.
    pub address: PathBuf,
}

impl Endpoint {
    pub fn new(interface: Interface, address: impl Into<PathBuf>) -> Self {
        Self {
            id: EndpointId::new(),
            interface,
            address: address.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse() {
        assert_eq!("foreground_app".parse::<PeerRole>().unwrap(), PeerRole::ForegroundApp);
        assert_eq!(PeerRole::FinderExtension.to_string(), "finder_extension");
        assert!("nope".parse::<PeerRole>().is_err());
    }

    #[test]
    fn test_endpoint_ids_differ() {
        let a = Endpoint::new(Interface::App, "/tmp/a.sock");
        let b = Endpoint::new(Interface::App, "/tmp/a.sock");
        assert_ne!(a, b);
        assert_eq!(a.address, b.address);
    }
}
