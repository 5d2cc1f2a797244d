//! Fan-out of transport diagnostics.
//!
//! The supervisor reports into a [`DiagnosticsHub`]; every forwarding sink
//! holds its own receiver. A slow sink lags and drops lines rather than
//! holding up the supervisor.

use tokio::sync::broadcast;

use mountplane_types::Diagnostic;

/// Lines buffered per receiver before it starts lagging.
pub const DIAGNOSTICS_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct DiagnosticsHub {
    tx: broadcast::Sender<Diagnostic>,
}

impl Default for DiagnosticsHub {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(DIAGNOSTICS_CAPACITY);
        Self { tx }
    }
}

impl DiagnosticsHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nobody listening is normal.
    pub fn report(&self, diagnostic: Diagnostic) {
        let _ = self.tx.send(diagnostic);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Diagnostic> {
        self.tx.subscribe()
    }

    pub fn sinks(&self) -> usize {
        self.tx.receiver_count()
    }
}
