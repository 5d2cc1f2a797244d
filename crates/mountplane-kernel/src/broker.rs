//! Endpoint broker: one passable endpoint per peer relationship.
//!
//! The service process publishes the endpoint of whoever registered for a
//! [`PeerRole`]; other processes fetch it to open a direct connection. Fetching
//! never blocks and an absent endpoint is a normal answer, so callers poll
//! (see the client's `rendezvous`).

use std::collections::HashMap;

use parking_lot::RwLock;

use mountplane_types::{Endpoint, PeerRole};

#[derive(Debug, Default)]
pub struct EndpointBroker {
    slots: RwLock<HashMap<PeerRole, Endpoint>>,
}

impl EndpointBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `endpoint` for `role`, replacing any previous one.
    pub fn publish(&self, role: PeerRole, endpoint: Endpoint) {
        let previous = self.slots.write().insert(role, endpoint.clone());
        match previous {
            Some(old) if old.id != endpoint.id => tracing::info!(
                %role,
                old = %old.id,
                new = %endpoint.id,
                "broker.publish replaced endpoint"
            ),
            Some(_) => tracing::debug!(%role, "broker.publish republished same endpoint"),
            None => tracing::info!(%role, endpoint = %endpoint.id, "broker.publish"),
        }
    }

    /// The current endpoint for `role`, if one has been published.
    pub fn fetch(&self, role: PeerRole) -> Option<Endpoint> {
        self.slots.read().get(&role).cloned()
    }

    /// Remove the endpoint for `role`. Returns what was stored.
    pub fn withdraw(&self, role: PeerRole) -> Option<Endpoint> {
        let removed = self.slots.write().remove(&role);
        if removed.is_some() {
            tracing::info!(%role, "broker.withdraw");
        }
        removed
    }
}
