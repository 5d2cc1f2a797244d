//! MountTransport: the seam to the remote filesystem protocol.
//!
//! Connection, authentication, and encryption belong to an external SDK. The
//! supervisor only needs "connect this config" and "tear it down", both of
//! which may take arbitrarily long and must never run under the state lock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{Notify, oneshot};

use mountplane_types::MountConfig;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect to {authority} failed: {reason}")]
    ConnectFailed { authority: String, reason: String },

    #[error("connect to {0} timed out")]
    Timeout(String),

    #[error("teardown failed: {0}")]
    TeardownFailed(String),

    #[error("transport closed")]
    Closed,
}

/// Something that can bring a remote filesystem session up and down.
///
/// A transport holds at most one session. A successful `connect` replaces
/// whatever session it held and must release the replaced one, since the
/// supervisor can only ask for "the current session" to be torn down.
#[async_trait]
pub trait MountTransport: Send + Sync {
    /// Establish a session for `config`, presenting `fingerprints` as the
    /// trusted host keys.
    async fn connect(
        &self,
        config: &MountConfig,
        fingerprints: &[String],
    ) -> Result<(), TransportError>;

    /// Tear down the current session, if any.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

// ============================================================================
// Memory transport
// ============================================================================

/// How the next connect on a [`MemoryTransport`] resolves.
#[derive(Debug)]
pub enum ConnectScript {
    Succeed,
    Fail(String),
    /// Hold the connect open until the test resolves it.
    Manual(oneshot::Receiver<Result<(), String>>),
}

#[derive(Debug, Default)]
struct MemoryInner {
    script: VecDeque<ConnectScript>,
    connects: u32,
    disconnects: u32,
    session_open: bool,
    fail_teardown: bool,
    teardown_delay: Option<Duration>,
}

/// Scriptable in-process transport for tests and dry runs.
///
/// With an empty script every connect succeeds immediately.
#[derive(Debug, Default, Clone)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryInner>>,
    connect_started: Arc<Notify>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, script: ConnectScript) {
        self.inner.lock().script.push_back(script);
    }

    /// Queue a connect that waits for the returned sender.
    pub fn push_manual(&self) -> oneshot::Sender<Result<(), String>> {
        let (tx, rx) = oneshot::channel();
        self.push(ConnectScript::Manual(rx));
        tx
    }

    pub fn fail_teardown(&self, fail: bool) {
        self.inner.lock().fail_teardown = fail;
    }

    /// Make every teardown take `delay` before it completes.
    pub fn slow_teardown(&self, delay: Duration) {
        self.inner.lock().teardown_delay = Some(delay);
    }

    pub fn connects(&self) -> u32 {
        self.inner.lock().connects
    }

    pub fn disconnects(&self) -> u32 {
        self.inner.lock().disconnects
    }

    pub fn session_open(&self) -> bool {
        self.inner.lock().session_open
    }

    /// Resolves once a connect call has begun.
    pub async fn connect_started(&self) {
        self.connect_started.notified().await;
    }
}

#[async_trait]
impl MountTransport for MemoryTransport {
    async fn connect(
        &self,
        config: &MountConfig,
        _fingerprints: &[String],
    ) -> Result<(), TransportError> {
        let script = {
            let mut inner = self.inner.lock();
            inner.connects += 1;
            inner.script.pop_front().unwrap_or(ConnectScript::Succeed)
        };
        self.connect_started.notify_one();

        let outcome = match script {
            ConnectScript::Succeed => Ok(()),
            ConnectScript::Fail(reason) => Err(reason),
            ConnectScript::Manual(rx) => rx.await.unwrap_or_else(|_| Err("abandoned".into())),
        };

        match outcome {
            Ok(()) => {
                self.inner.lock().session_open = true;
                Ok(())
            }
            Err(reason) => Err(TransportError::ConnectFailed {
                authority: config.credentials.authority(),
                reason,
            }),
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let delay = self.inner.lock().teardown_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.inner.lock();
        inner.disconnects += 1;
        inner.session_open = false;
        if inner.fail_teardown {
            return Err(TransportError::TeardownFailed("scripted".into()));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ============================================================================
// TCP transport
// ============================================================================

/// Opens a TCP connection to `host:port` and holds it as the session.
///
/// Stands in for the remote filesystem SDK: a mount is "connected" while the
/// remote end accepts and the socket stays open.
#[derive(Debug)]
pub struct TcpTransport {
    timeout: Duration,
    session: tokio::sync::Mutex<Option<TcpStream>>,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            session: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl MountTransport for TcpTransport {
    async fn connect(
        &self,
        config: &MountConfig,
        fingerprints: &[String],
    ) -> Result<(), TransportError> {
        let authority = config.credentials.authority();
        tracing::debug!(
            %authority,
            user = %config.credentials.user,
            fingerprints = fingerprints.len(),
            "transport.connect"
        );

        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&authority))
            .await
            .map_err(|_| TransportError::Timeout(authority.clone()))?
            .map_err(|e| TransportError::ConnectFailed {
                authority: authority.clone(),
                reason: e.to_string(),
            })?;

        let replaced = self.session.lock().await.replace(stream);
        if let Some(mut old) = replaced {
            use tokio::io::AsyncWriteExt;

            tracing::debug!(%authority, "replacing previous session");
            if let Err(e) = old.shutdown().await {
                tracing::debug!(error = %e, "closing replaced session");
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        use tokio::io::AsyncWriteExt;

        if let Some(mut stream) = self.session.lock().await.take() {
            stream
                .shutdown()
                .await
                .map_err(|e| TransportError::TeardownFailed(e.to_string()))?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}
