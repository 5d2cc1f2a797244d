//! Unix-socket RPC client for mountplane
//!
//! Provides a typed interface to the helper, service, and app endpoints.
//! One [`RpcClient`] multiplexes any number of concurrent calls over a single
//! connection: each call gets a fresh id and the reader task routes replies
//! back by id, so replies may arrive in any order.
//!
//! ```text
//!   call() ──insert(id, oneshot)──▶ pending ◀──remove(id)── reader task
//!     │                                                        ▲
//!     └──── writer (Mutex) ──frame──▶ socket ──frame───────────┘
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

use mountplane_types::wire::{self, WireError};
use mountplane_types::{
    Diagnostic, DiagnosticStream, Endpoint, ErrorKind, Hello, HelloReply, Interface, PeerRole,
    Reply, Request, RequestFrame, TraceCarrier,
};

use crate::ConnectError;
use crate::constants::CONNECT_TIMEOUT;

type Pending = DashMap<u64, oneshot::Sender<Reply>>;

/// Id of the handshake frame. Calls start at 1.
const HELLO_ID: u64 = 0;

/// RPC client wrapper
///
/// Holds one connection to one interface. `Send + Sync`; share it behind an
/// `Arc` to issue calls from several tasks at once.
pub struct RpcClient {
    interface: Interface,
    path: PathBuf,
    writer: Mutex<OwnedWriteHalf>,
    pending: Arc<Pending>,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("interface", &self.interface)
            .field("path", &self.path)
            .field("in_flight", &self.pending.len())
            .finish()
    }
}

impl RpcClient {
    /// Connect to `path` and handshake as `interface`.
    pub async fn connect_unix(path: &Path, interface: Interface) -> Result<Self, ConnectError> {
        match tokio::time::timeout(CONNECT_TIMEOUT, Self::connect_inner(path, interface)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout),
        }
    }

    /// Connect to a published endpoint.
    pub async fn connect_endpoint(endpoint: &Endpoint) -> Result<Self, ConnectError> {
        Self::connect_unix(&endpoint.address, endpoint.interface).await
    }

    async fn connect_inner(path: &Path, interface: Interface) -> Result<Self, ConnectError> {
        let stream = UnixStream::connect(path).await?;
        let (mut reader, mut writer) = stream.into_split();

        wire::send(&mut writer, HELLO_ID, &Hello::new(interface)).await?;
        let Some((_, payload)) = wire::read_frame(&mut reader).await? else {
            return Err(ConnectError::Rejected("connection closed during handshake".into()));
        };
        match wire::decode::<HelloReply>(&payload)? {
            HelloReply::Accepted => {}
            HelloReply::Rejected { reason } => return Err(ConnectError::Rejected(reason)),
        }
        log::debug!("connected to {} ({})", path.display(), interface);

        let pending: Arc<Pending> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_replies(reader, Arc::clone(&pending), Arc::clone(&closed)));

        Ok(Self {
            interface,
            path: path.to_path_buf(),
            writer: Mutex::new(writer),
            pending,
            closed,
            next_id: AtomicU64::new(HELLO_ID + 1),
            reader,
        })
    }

    pub fn interface(&self) -> Interface {
        self.interface
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the server has hung up.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send one request and wait for its reply.
    ///
    /// `Reply::Failed` comes back as [`RpcError::Remote`].
    pub async fn call(&self, request: Request) -> Result<Reply, RpcError> {
        let method = request.name();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        if self.is_closed() {
            self.pending.remove(&id);
            return Err(RpcError::Closed);
        }

        let (traceparent, tracestate) = mountplane_telemetry::inject_trace_context();
        let frame = RequestFrame {
            trace: TraceCarrier {
                traceparent,
                tracestate,
            },
            request,
        };

        let sent = {
            let mut writer = self.writer.lock().await;
            wire::send(&mut *writer, id, &frame).await
        };
        if let Err(e) = sent {
            self.pending.remove(&id);
            return Err(e.into());
        }
        tracing::trace!(id, method, "rpc sent");

        match rx.await.map_err(|_| RpcError::Closed)? {
            Reply::Failed { kind, message } => Err(RpcError::Remote { kind, message }),
            reply => Ok(reply),
        }
    }

    async fn call_done(&self, request: Request) -> Result<(), RpcError> {
        let method = request.name();
        match self.call(request).await? {
            Reply::Done => Ok(()),
            other => Err(unexpected(method, other)),
        }
    }

    async fn call_bool(&self, request: Request) -> Result<bool, RpcError> {
        let method = request.name();
        match self.call(request).await? {
            Reply::Bool(value) => Ok(value),
            other => Err(unexpected(method, other)),
        }
    }

    // ── Mount lifecycle ──────────────────────────────────────────────────

    /// Create (or replace) the helper's mount.
    pub async fn create(
        &self,
        mountpoint: impl Into<PathBuf>,
        label: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Result<(), RpcError> {
        self.call_done(Request::Create {
            mountpoint: mountpoint.into(),
            label: label.into(),
            user: user.into(),
            password: password.into(),
            host: host.into(),
            port,
        })
        .await
    }

    /// Start a connection; resolves when the transport does.
    pub async fn connect(&self) -> Result<(), RpcError> {
        self.call_done(Request::Connect).await
    }

    pub async fn disconnect(&self) -> Result<(), RpcError> {
        self.call_done(Request::Disconnect).await
    }

    /// Tell the helper to tear down and exit.
    pub async fn kill_mount(&self) -> Result<(), RpcError> {
        match self.call_done(Request::KillMount).await {
            // The helper may be gone before its reply lands.
            Err(RpcError::Closed) => Ok(()),
            other => other,
        }
    }

    // ── State ────────────────────────────────────────────────────────────

    pub async fn set_icon(&self, path: impl Into<PathBuf>) -> Result<(), RpcError> {
        self.call_done(Request::SetIcon { path: path.into() }).await
    }

    pub async fn set_use_cache(&self, enabled: bool) -> Result<(), RpcError> {
        self.call_done(Request::SetUseCache { enabled }).await
    }

    pub async fn set_mountpoint(&self, path: impl Into<PathBuf>) -> Result<(), RpcError> {
        self.call_done(Request::SetMountpoint { path: path.into() }).await
    }

    pub async fn set_fingerprints(&self, fingerprints: Vec<String>) -> Result<(), RpcError> {
        self.call_done(Request::SetFingerprints { fingerprints }).await
    }

    pub async fn use_cache(&self) -> Result<bool, RpcError> {
        self.call_bool(Request::UseCache).await
    }

    pub async fn connected(&self) -> Result<bool, RpcError> {
        self.call_bool(Request::Connected).await
    }

    pub async fn connecting(&self) -> Result<bool, RpcError> {
        self.call_bool(Request::Connecting).await
    }

    pub async fn mounted(&self) -> Result<bool, RpcError> {
        self.call_bool(Request::Mounted).await
    }

    pub async fn mounting(&self) -> Result<bool, RpcError> {
        self.call_bool(Request::Mounting).await
    }

    /// Have the helper send `stream` diagnostics to an App `endpoint`.
    pub async fn forward_diagnostics(
        &self,
        stream: DiagnosticStream,
        endpoint: Endpoint,
    ) -> Result<(), RpcError> {
        self.call_done(Request::ForwardDiagnostics { stream, endpoint })
            .await
    }

    /// Ask the foreground app whether it shows a mount (App interface).
    pub async fn get_mount_state(&self) -> Result<bool, RpcError> {
        self.call_bool(Request::GetMountState).await
    }

    /// Ask the foreground app to connect or disconnect (App interface).
    pub async fn toggle_mount_state(&self) -> Result<(), RpcError> {
        self.call_done(Request::ToggleMountState).await
    }

    /// Deliver one diagnostic to the foreground app (App interface).
    pub async fn report_diagnostic(&self, diagnostic: Diagnostic) -> Result<(), RpcError> {
        self.call_done(Request::ReportDiagnostic { diagnostic })
            .await
    }

    // ── Endpoint broker ──────────────────────────────────────────────────

    /// Fetch the endpoint published for `role`. `None` is normal.
    pub async fn get_peer_endpoint(&self, role: PeerRole) -> Result<Option<Endpoint>, RpcError> {
        match self.call(Request::GetPeerEndpoint { role }).await? {
            Reply::Endpoint(endpoint) => Ok(endpoint),
            other => Err(unexpected("get_peer_endpoint", other)),
        }
    }

    pub async fn publish_peer_endpoint(
        &self,
        role: PeerRole,
        endpoint: Endpoint,
    ) -> Result<bool, RpcError> {
        self.call_bool(Request::PublishPeerEndpoint { role, endpoint })
            .await
    }

    /// Remove the endpoint for `role`. Returns whether one was present.
    pub async fn withdraw_peer_endpoint(&self, role: PeerRole) -> Result<bool, RpcError> {
        self.call_bool(Request::WithdrawPeerEndpoint { role }).await
    }

    // ── Liveness ─────────────────────────────────────────────────────────

    pub async fn ping(&self) -> Result<String, RpcError> {
        match self.call(Request::Ping).await? {
            Reply::Text(text) => Ok(text),
            other => Err(unexpected("ping", other)),
        }
    }

    pub async fn protocol_version(&self) -> Result<u32, RpcError> {
        match self.call(Request::ProtocolVersion).await? {
            Reply::Version(version) => Ok(version),
            other => Err(unexpected("protocol_version", other)),
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn unexpected(method: &'static str, reply: Reply) -> RpcError {
    RpcError::UnexpectedReply {
        method,
        reply: format!("{reply:?}"),
    }
}

async fn read_replies(mut reader: OwnedReadHalf, pending: Arc<Pending>, closed: Arc<AtomicBool>) {
    loop {
        let (id, payload) = match wire::read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::debug!("server closed connection");
                break;
            }
            Err(e) => {
                log::warn!("reply read failed: {e}");
                break;
            }
        };
        let reply = match wire::decode::<Reply>(&payload) {
            Ok(reply) => reply,
            Err(e) => Reply::failed(ErrorKind::MalformedRequest, format!("undecodable reply: {e}")),
        };
        match pending.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(reply);
            }
            None => log::warn!("reply for unknown id {id}"),
        }
    }
    // Callers that raced the close see the flag; the rest see their sender dropped.
    closed.store(true, Ordering::Release);
    pending.clear();
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("connection closed")]
    Closed,
    #[error("{kind}: {message}")]
    Remote { kind: ErrorKind, message: String },
    #[error("unexpected reply to {method}: {reply}")]
    UnexpectedReply { method: &'static str, reply: String },
    #[error("timed out")]
    Timeout,
}

impl RpcError {
    /// The remote error kind, if the server answered with a failure.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Remote { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
