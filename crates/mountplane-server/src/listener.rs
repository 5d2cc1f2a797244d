//! Unix-socket listener: accept policy, handshake, and per-connection tasks.
//!
//! Socket file permissions are the OS authentication: the socket is created
//! owner-only and every peer that can open it is accepted. A peer must then
//! say which [`Interface`] it expects and which protocol version it speaks;
//! anything else is rejected with a reason and the connection closed.
//!
//! ```text
//!   accept ─▶ handshake ─▶ reader task ──frame──▶ spawn(handler.handle(req, Responder))
//!                              │                               │
//!                              └──── writer task ◀── (id, Reply) ┘
//! ```
//!
//! Each connection holds a [`TerminationGuard`] for as long as it is open.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::{UnixListener, UnixStream};
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use mountplane_kernel::ProcessLifecycle;
use mountplane_types::wire::{self, WireError};
use mountplane_types::{
    Endpoint, ErrorKind, Hello, HelloReply, Interface, PROTOCOL_VERSION, Reply, Request,
    RequestFrame, TraceCarrier,
};

use crate::constants::HANDSHAKE_TIMEOUT;

// ============================================================================
// Responder
// ============================================================================

/// Completion handle for one request.
///
/// Consumed by [`send`](Self::send). Dropping it unsent replies
/// `Failed { kind: Internal }`, so the peer always gets exactly one answer.
#[must_use = "a Responder must be answered"]
pub struct Responder {
    id: u64,
    tx: Option<mpsc::UnboundedSender<(u64, Reply)>>,
}

impl Responder {
    pub fn new(id: u64, tx: mpsc::UnboundedSender<(u64, Reply)>) -> Self {
        Self { id, tx: Some(tx) }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn send(mut self, reply: Reply) {
        if let Some(tx) = self.tx.take() {
            // Receiver gone means the peer hung up; nobody is waiting.
            let _ = tx.send((self.id, reply));
        }
    }

    pub fn fail(self, kind: ErrorKind, message: impl Into<String>) {
        self.send(Reply::failed(kind, message));
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            tracing::warn!(id = self.id, "responder dropped without a reply");
            let _ = tx.send((
                self.id,
                Reply::failed(ErrorKind::Internal, "request dropped without a reply"),
            ));
        }
    }
}

// ============================================================================
// Handler seam
// ============================================================================

/// Serves the requests of one interface.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    fn interface(&self) -> Interface;

    /// Handle one decoded request. Must answer through `responder`.
    async fn handle(&self, request: Request, trace: TraceCarrier, responder: Responder);
}

// ============================================================================
// Listener
// ============================================================================

/// What the registry knows about an open connection.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub opened: Instant,
    pub requests: u64,
}

pub struct RpcListener {
    listener: UnixListener,
    path: PathBuf,
    endpoint: Endpoint,
    handler: Arc<dyn RequestHandler>,
    lifecycle: Arc<ProcessLifecycle>,
    connections: Arc<DashMap<u64, ConnectionInfo>>,
    next_conn: AtomicU64,
}

impl RpcListener {
    /// Bind `path`, replacing a stale socket file, owner-only permissions.
    pub fn bind(
        path: &Path,
        handler: Arc<dyn RequestHandler>,
        lifecycle: Arc<ProcessLifecycle>,
    ) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(path)?;
        restrict_permissions(path)?;

        let endpoint = Endpoint::new(handler.interface(), path);
        tracing::info!(
            path = %path.display(),
            interface = %handler.interface(),
            endpoint = %endpoint.id,
            "listening"
        );

        Ok(Self {
            listener,
            path: path.to_path_buf(),
            endpoint,
            handler,
            lifecycle,
            connections: Arc::new(DashMap::new()),
            next_conn: AtomicU64::new(1),
        })
    }

    /// The passable endpoint for this listener.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Accept until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, _addr)) => {
                    let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
                    let connection = Connection {
                        id: conn_id,
                        interface: self.handler.interface(),
                        handler: Arc::clone(&self.handler),
                        connections: Arc::clone(&self.connections),
                        shutdown: shutdown.child_token(),
                    };
                    let guard = self.lifecycle.guard();
                    self.connections.insert(
                        conn_id,
                        ConnectionInfo {
                            opened: Instant::now(),
                            requests: 0,
                        },
                    );
                    tokio::spawn(async move {
                        connection.serve(stream).await;
                        drop(guard);
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept error");
                }
            }
        }
        tracing::info!(path = %self.path.display(), "listener stopped");
    }
}

impl Drop for RpcListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), error = %e, "socket cleanup failed");
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

// ============================================================================
// Connection
// ============================================================================

struct Connection {
    id: u64,
    interface: Interface,
    handler: Arc<dyn RequestHandler>,
    connections: Arc<DashMap<u64, ConnectionInfo>>,
    shutdown: CancellationToken,
}

impl Connection {
    async fn serve(self, stream: UnixStream) {
        let (mut reader, mut writer) = stream.into_split();

        match tokio::time::timeout(HANDSHAKE_TIMEOUT, self.handshake(&mut reader, &mut writer)).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                self.connections.remove(&self.id);
                return;
            }
            Ok(Err(e)) => {
                tracing::debug!(conn = self.id, error = %e, "handshake failed");
                self.connections.remove(&self.id);
                return;
            }
            Err(_) => {
                tracing::warn!(conn = self.id, "handshake timed out");
                self.connections.remove(&self.id);
                return;
            }
        }
        tracing::debug!(conn = self.id, interface = %self.interface, "connection accepted");

        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_replies(writer, reply_rx, self.id));

        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                frame = wire::read_frame(&mut reader) => frame,
            };
            let (id, payload) = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(conn = self.id, error = %e, "read error, closing");
                    break;
                }
            };
            if let Some(mut info) = self.connections.get_mut(&self.id) {
                info.requests += 1;
            }

            let responder = Responder::new(id, reply_tx.clone());
            let frame: RequestFrame = match wire::decode(&payload) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(conn = self.id, id, error = %e, "malformed request");
                    responder.fail(ErrorKind::MalformedRequest, e.to_string());
                    continue;
                }
            };

            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                handler.handle(frame.request, frame.trace, responder).await;
            });
        }

        // In-flight handlers hold senders; the writer drains until they finish.
        drop(reply_tx);
        if let Err(e) = writer_task.await {
            tracing::warn!(conn = self.id, error = %e, "writer task failed");
        }
        self.connections.remove(&self.id);
        tracing::debug!(conn = self.id, "connection closed");
    }

    async fn handshake(
        &self,
        reader: &mut tokio::net::unix::OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
    ) -> Result<bool, WireError> {
        let Some((id, payload)) = wire::read_frame(reader).await? else {
            return Ok(false);
        };

        let verdict = match wire::decode::<Hello>(&payload) {
            Ok(hello) if hello.interface != self.interface => Err(format!(
                "this endpoint serves {}, not {}",
                self.interface, hello.interface
            )),
            Ok(hello) if hello.protocol_version != PROTOCOL_VERSION => Err(format!(
                "protocol version {} unsupported, expected {}",
                hello.protocol_version, PROTOCOL_VERSION
            )),
            Ok(_) => Ok(()),
            Err(e) => Err(format!("malformed hello: {e}")),
        };

        match verdict {
            Ok(()) => {
                wire::send(writer, id, &HelloReply::Accepted).await?;
                Ok(true)
            }
            Err(reason) => {
                tracing::warn!(conn = self.id, %reason, "connection rejected");
                wire::send(writer, id, &HelloReply::Rejected { reason }).await?;
                Ok(false)
            }
        }
    }
}

async fn write_replies(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<(u64, Reply)>,
    conn: u64,
) {
    while let Some((id, reply)) = rx.recv().await {
        if let Err(e) = wire::send(&mut writer, id, &reply).await {
            tracing::debug!(conn, id, error = %e, "reply write failed");
            break;
        }
    }
}
