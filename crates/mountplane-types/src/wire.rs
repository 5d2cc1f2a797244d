//! Wire protocol between mount-control processes.
//!
//! # Framing
//!
//! ```text
//! +----------------+----------------+---------------------+
//! | len: u32 BE    | id: u64 BE     | postcard payload    |
//! +----------------+----------------+---------------------+
//!   len = 8 + payload length, at most MAX_FRAME_SIZE
//! ```
//!
//! The first frame on a connection is always a [`Hello`] from the client, answered
//! by a [`HelloReply`] with the same id. After that the client sends
//! [`RequestFrame`]s and the server answers each with exactly one [`Reply`]
//! carrying the request's id. Replies may arrive out of order.
//!
//! Framing and payload decoding are split so a server can read a frame whose
//! payload is garbage and still answer that id with `MalformedRequest`.

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strum::{Display, IntoStaticStr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::diagnostic::{Diagnostic, DiagnosticStream};
use crate::endpoint::{Endpoint, Interface, PeerRole};

/// Bumped whenever a request or reply variant changes shape.
pub const PROTOCOL_VERSION: u32 = 2;

/// Largest accepted frame, header excluded.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

const ID_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),
}

// ============================================================================
// Handshake
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub interface: Interface,
    pub protocol_version: u32,
}

impl Hello {
    pub fn new(interface: Interface) -> Self {
        Self {
            interface,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HelloReply {
    Accepted,
    Rejected { reason: String },
}

// ============================================================================
// Requests
// ============================================================================

/// W3C trace context riding along with a request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceCarrier {
    pub traceparent: String,
    pub tracestate: String,
}

/// A request as sent on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub trace: TraceCarrier,
    pub request: Request,
}

impl RequestFrame {
    pub fn new(request: Request) -> Self {
        Self {
            trace: TraceCarrier::default(),
            request,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Request {
    // Mount lifecycle
    Create {
        mountpoint: PathBuf,
        label: String,
        user: String,
        password: String,
        host: String,
        port: u16,
    },
    Connect,
    Disconnect,
    /// Tear down and exit the helper process.
    KillMount,

    // Pure state mutations
    SetIcon { path: PathBuf },
    SetUseCache { enabled: bool },
    SetMountpoint { path: PathBuf },
    SetFingerprints { fingerprints: Vec<String> },

    // Queries
    UseCache,
    Connected,
    Connecting,
    Mounted,
    Mounting,

    /// Send helper diagnostics on `stream` to `endpoint` (an App endpoint).
    ForwardDiagnostics {
        stream: DiagnosticStream,
        endpoint: Endpoint,
    },

    // Endpoint broker
    GetPeerEndpoint { role: PeerRole },
    PublishPeerEndpoint { role: PeerRole, endpoint: Endpoint },
    WithdrawPeerEndpoint { role: PeerRole },

    // Liveness
    Ping,
    ProtocolVersion,

    // Exported by the foreground app
    GetMountState,
    ToggleMountState,
    ReportDiagnostic { diagnostic: Diagnostic },
}

impl Request {
    /// Short name for spans and log lines. Never includes arguments.
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

// ============================================================================
// Replies
// ============================================================================

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    InvalidStateTransition,
    TransportFailure,
    MalformedRequest,
    MountBusy,
    Unsupported,
    Internal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Done,
    Bool(bool),
    Endpoint(Option<Endpoint>),
    Text(String),
    Version(u32),
    Failed { kind: ErrorKind, message: String },
}

impl Reply {
    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            message: message.into(),
        }
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Encode a payload into a frame body ready for [`write_frame`].
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    Ok(postcard::to_stdvec(value)?)
}

/// Decode a frame body produced by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    Ok(postcard::from_bytes(bytes)?)
}

/// Write one frame.
pub async fn write_frame<W>(writer: &mut W, id: u64, payload: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(payload.len()));
    }
    let len = (ID_LEN + payload.len()) as u32;
    let mut buf = Vec::with_capacity(4 + len as usize);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<(u64, Vec<u8>)>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len < ID_LEN {
        return Err(WireError::FrameTooShort(len));
    }
    if len - ID_LEN > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(len - ID_LEN));
    }

    let mut id_buf = [0u8; ID_LEN];
    reader.read_exact(&mut id_buf).await?;
    let mut payload = vec![0u8; len - ID_LEN];
    reader.read_exact(&mut payload).await?;

    Ok(Some((u64::from_be_bytes(id_buf), payload)))
}

/// Encode and write a typed message.
pub async fn send<W, T>(writer: &mut W, id: u64, value: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = encode(value)?;
    write_frame(writer, id, &payload).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let frame = RequestFrame::new(Request::SetUseCache { enabled: true });
        send(&mut a, 42, &frame).await.unwrap();

        let (id, payload) = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(id, 42);
        let parsed: RequestFrame = decode(&payload).unwrap();
        assert_eq!(parsed, frame);
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_header_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_FRAME_SIZE + ID_LEN + 1) as u32;
        a.write_all(&len.to_be_bytes()).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(WireError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_short_header_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&3u32.to_be_bytes()).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(WireError::FrameTooShort(3))
        ));
    }

    #[test]
    fn test_garbage_payload_fails_decode() {
        let result: Result<RequestFrame, _> = decode(&[0xff, 0xff, 0xff, 0xff, 0xff]);
        assert!(result.is_err());
    }

    #[test]
    fn test_request_names() {
        assert_eq!(Request::Connect.name(), "connect");
        assert_eq!(
            Request::GetPeerEndpoint { role: PeerRole::ForegroundApp }.name(),
            "get_peer_endpoint"
        );
        assert_eq!(ErrorKind::MountBusy.to_string(), "mount_busy");
        assert_eq!(Request::KillMount.name(), "kill_mount");
        assert_eq!(Request::ToggleMountState.name(), "toggle_mount_state");
    }
}
