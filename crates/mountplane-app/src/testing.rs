//! An in-process mount helper for exercising commands.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use mountplane_client::RpcClient;
use mountplane_kernel::{EndpointBroker, MemoryTransport, MountSupervisor, ProcessLifecycle};
use mountplane_server::config::socket_path_in;
use mountplane_server::{Dispatcher, RpcListener};
use mountplane_types::Interface;

pub struct LocalHelper {
    pub transport: MemoryTransport,
    pub supervisor: MountSupervisor,
    path: PathBuf,
    kill: CancellationToken,
    cancel: CancellationToken,
    dir: tempfile::TempDir,
}

impl LocalHelper {
    pub fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let lifecycle = ProcessLifecycle::new();
        let supervisor = MountSupervisor::spawn(
            Arc::new(transport.clone()),
            Arc::clone(&lifecycle),
            None,
        );
        let dispatcher = Dispatcher::helper(supervisor.clone(), Arc::new(EndpointBroker::new()));
        let kill = dispatcher.kill_switch();
        let path = socket_path_in(dir.path(), Interface::MountHelper);
        let listener = RpcListener::bind(&path, Arc::new(dispatcher), lifecycle).unwrap();

        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move { listener.run(cancel).await });
        }
        Self {
            transport,
            supervisor,
            path,
            kill,
            cancel,
            dir,
        }
    }

    pub async fn client(&self) -> RpcClient {
        RpcClient::connect_unix(&self.path, Interface::MountHelper)
            .await
            .unwrap()
    }

    pub fn socket_dir(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Whether a peer sent `KillMount`.
    pub fn killed(&self) -> bool {
        self.kill.is_cancelled()
    }

    /// Create a mount through a fresh connection.
    pub async fn create(&self) {
        self.client()
            .await
            .create("/Volumes/Test", "Test", "alice", "secret", "host.example.com", 22)
            .await
            .unwrap();
    }
}

impl Drop for LocalHelper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
