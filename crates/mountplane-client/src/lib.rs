//! mountplane RPC client library
//!
//! Typed client for the helper, service, and app endpoints, plus the two
//! polling loops a UI process needs: [`rendezvous`] to wait for a peer's
//! endpoint and [`MountWatcher`] to mirror helper state into a local bus.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use mountplane_client::RpcClient;
//! use mountplane_types::Interface;
//!
//! let helper = RpcClient::connect_unix("/run/user/1000/mountplane/helper.sock".as_ref(), Interface::MountHelper).await?;
//! helper.create("/Volumes/Work", "Work", "alice", "hunter2", "files.example.com", 22).await?;
//! helper.connect().await?;
//! assert!(helper.connected().await?);
//! # Ok(())
//! # }
//! ```

pub mod constants;
pub mod rendezvous;
pub mod rpc;
pub mod watcher;

pub use rendezvous::rendezvous;
pub use rpc::{RpcClient, RpcError};
pub use watcher::MountWatcher;

use mountplane_types::wire::WireError;

/// Connect to an endpoint via Unix socket.
pub async fn connect_unix(
    path: impl AsRef<std::path::Path>,
    interface: mountplane_types::Interface,
) -> Result<RpcClient, ConnectError> {
    RpcClient::connect_unix(path.as_ref(), interface).await
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("handshake rejected: {0}")]
    Rejected(String),
    #[error("connect timed out")]
    Timeout,
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted in-process server for exercising the client alone.

    use std::path::PathBuf;
    use std::sync::Arc;

    use tokio::net::{UnixListener, UnixStream};
    use tokio_util::sync::CancellationToken;

    use mountplane_types::wire;
    use mountplane_types::{Hello, HelloReply, Interface, Reply, Request, RequestFrame};

    use crate::RpcClient;

    type Handler = Arc<dyn Fn(Request) -> Reply + Send + Sync>;

    pub struct FakeServer {
        interface: Interface,
        pub path: PathBuf,
        cancel: CancellationToken,
        _dir: tempfile::TempDir,
    }

    impl FakeServer {
        pub fn start(
            interface: Interface,
            handler: impl Fn(Request) -> Reply + Send + Sync + 'static,
        ) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("fake.sock");
            let listener = UnixListener::bind(&path).unwrap();
            let cancel = CancellationToken::new();
            let handler: Handler = Arc::new(handler);

            let token = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let stream = tokio::select! {
                        _ = token.cancelled() => break,
                        accepted = listener.accept() => accepted.unwrap().0,
                    };
                    tokio::spawn(serve(stream, interface, Arc::clone(&handler), token.clone()));
                }
            });

            Self {
                interface,
                path,
                cancel,
                _dir: dir,
            }
        }

        pub async fn client(&self) -> RpcClient {
            RpcClient::connect_unix(&self.path, self.interface)
                .await
                .unwrap()
        }

        /// Close the listener and every open connection.
        pub fn shutdown(&self) {
            self.cancel.cancel();
        }
    }

    impl Drop for FakeServer {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    async fn serve(
        stream: UnixStream,
        interface: Interface,
        handler: Handler,
        cancel: CancellationToken,
    ) {
        let (mut reader, mut writer) = stream.into_split();
        let Ok(Some((id, payload))) = wire::read_frame(&mut reader).await else {
            return;
        };
        let hello: Hello = wire::decode(&payload).unwrap();
        if hello.interface != interface {
            let reason = format!("wants {}", hello.interface);
            let _ = wire::send(&mut writer, id, &HelloReply::Rejected { reason }).await;
            return;
        }
        wire::send(&mut writer, id, &HelloReply::Accepted).await.unwrap();

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return,
                frame = wire::read_frame(&mut reader) => frame,
            };
            let Ok(Some((id, payload))) = frame else {
                return;
            };
            let request: RequestFrame = wire::decode(&payload).unwrap();
            let reply = handler(request.request);
            if wire::send(&mut writer, id, &reply).await.is_err() {
                return;
            }
        }
    }
}
