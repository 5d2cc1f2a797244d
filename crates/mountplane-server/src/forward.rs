//! Forwarding helper diagnostics to the foreground app.
//!
//! A peer asks for a [`DiagnosticStream`] to be sent to an App endpoint. Each
//! stream has at most one sink; asking again replaces it. A sink lives until
//! the app hangs up or the forwarder is dropped.

use dashmap::DashMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use mountplane_client::{RpcClient, RpcError};
use mountplane_kernel::DiagnosticsHub;
use mountplane_types::{Diagnostic, DiagnosticStream, Endpoint};

pub struct DiagnosticsForwarder {
    hub: DiagnosticsHub,
    sinks: DashMap<DiagnosticStream, CancellationToken>,
}

impl DiagnosticsForwarder {
    pub fn new(hub: DiagnosticsHub) -> Self {
        Self {
            hub,
            sinks: DashMap::new(),
        }
    }

    /// Send `stream` to `endpoint` from now on, replacing any previous sink.
    pub fn forward(&self, stream: DiagnosticStream, endpoint: Endpoint) {
        // Subscribe before spawning so nothing reported meanwhile is lost.
        let rx = self.hub.subscribe();
        let cancel = CancellationToken::new();
        if let Some(previous) = self.sinks.insert(stream, cancel.clone()) {
            previous.cancel();
        }
        let span = tracing::info_span!("diagnostics.forward", %stream, endpoint = %endpoint.id);
        tokio::spawn(run_sink(stream, endpoint, rx, cancel).instrument(span));
    }

    /// Whether `stream` currently has a live sink.
    pub fn is_forwarding(&self, stream: DiagnosticStream) -> bool {
        self.sinks
            .get(&stream)
            .is_some_and(|cancel| !cancel.is_cancelled())
    }
}

impl Drop for DiagnosticsForwarder {
    fn drop(&mut self) {
        for sink in self.sinks.iter() {
            sink.value().cancel();
        }
    }
}

async fn run_sink(
    stream: DiagnosticStream,
    endpoint: Endpoint,
    mut rx: broadcast::Receiver<Diagnostic>,
    cancel: CancellationToken,
) {
    let connected = tokio::select! {
        _ = cancel.cancelled() => return,
        connected = RpcClient::connect_endpoint(&endpoint) => connected,
    };
    let client = match connected {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(error = %e, path = %endpoint.address.display(), "diagnostics sink unreachable");
            cancel.cancel();
            return;
        }
    };
    tracing::debug!("diagnostics sink attached");

    loop {
        let diagnostic = tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(diagnostic) => diagnostic,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "diagnostics sink lagging");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };
        if !stream.carries(&diagnostic) {
            continue;
        }
        match client.report_diagnostic(diagnostic).await {
            Ok(()) => {}
            Err(RpcError::Closed) => {
                tracing::debug!("diagnostics sink hung up");
                break;
            }
            Err(e) => tracing::warn!(error = %e, "diagnostic not delivered"),
        }
    }
    cancel.cancel();
}
