//! Wait for a peer to publish its endpoint.

use std::time::Duration;

use tokio::time::Instant;

use mountplane_types::{Endpoint, PeerRole};

use crate::rpc::{RpcClient, RpcError};

/// Poll the broker for `role` every `interval` until an endpoint shows up.
///
/// Fails with [`RpcError::Timeout`] once `deadline` has elapsed without one.
/// Any other RPC error ends the wait immediately.
pub async fn rendezvous(
    client: &RpcClient,
    role: PeerRole,
    interval: Duration,
    deadline: Duration,
) -> Result<Endpoint, RpcError> {
    let until = Instant::now() + deadline;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if let Some(endpoint) = client.get_peer_endpoint(role).await? {
            log::debug!("rendezvous with {role} after {attempts} attempt(s)");
            return Ok(endpoint);
        }
        let now = Instant::now();
        if now >= until {
            log::info!("no {role} endpoint after {attempts} attempt(s)");
            return Err(RpcError::Timeout);
        }
        tokio::time::sleep(interval.min(until - now)).await;
    }
}
