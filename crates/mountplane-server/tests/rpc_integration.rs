//! Integration tests for mountplane RPC over Unix sockets
//!
//! Each test binds real listeners in a temp dir and talks to them with the
//! real client. The helper uses a scriptable in-memory transport.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use mountplane_client::{ConnectError, RpcClient, RpcError, rendezvous};
use mountplane_kernel::{ConnectScript, EndpointBroker, MemoryTransport, MountSupervisor, ProcessLifecycle};
use mountplane_server::config::socket_path_in;
use mountplane_server::{Dispatcher, RequestHandler, Responder, RpcListener};
use mountplane_types::wire;
use mountplane_types::{
    Diagnostic, DiagnosticStream, Endpoint, ErrorKind, Hello, HelloReply, Interface,
    PROTOCOL_VERSION, PeerRole, Reply, Request, TraceCarrier,
};

/// A running listener plus the handles a test needs to poke at it.
struct TestServer {
    path: PathBuf,
    lifecycle: Arc<ProcessLifecycle>,
    transport: MemoryTransport,
    /// Tripped by `KillMount`.
    kill: CancellationToken,
    cancel: CancellationToken,
    _dir: tempfile::TempDir,
}

impl TestServer {
    fn start(interface: Interface) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path_in(dir.path(), interface);
        let lifecycle = ProcessLifecycle::new();
        let transport = MemoryTransport::new();
        let broker = Arc::new(EndpointBroker::new());

        let dispatcher = match interface {
            Interface::MountHelper => {
                let supervisor = MountSupervisor::spawn(
                    Arc::new(transport.clone()),
                    Arc::clone(&lifecycle),
                    None,
                );
                Dispatcher::helper(supervisor, broker)
            }
            Interface::Service => Dispatcher::service(broker),
            Interface::App => panic!("no app dispatcher in the server crate"),
        };
        let kill = dispatcher.kill_switch();
        let handler: Arc<dyn RequestHandler> = Arc::new(dispatcher);

        let listener = RpcListener::bind(&path, handler, Arc::clone(&lifecycle)).unwrap();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move { listener.run(token).await });

        Self {
            path,
            lifecycle,
            transport,
            kill,
            cancel,
            _dir: dir,
        }
    }

    async fn client(&self, interface: Interface) -> RpcClient {
        RpcClient::connect_unix(&self.path, interface).await.unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn create(client: &RpcClient) -> Result<(), RpcError> {
    client
        .create("/Volumes/Work", "Work", "alice", "hunter2", "files.example.com", 22)
        .await
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

// ============================================================================
// Mount lifecycle
// ============================================================================

#[tokio::test]
async fn test_create_connect_disconnect() {
    let server = TestServer::start(Interface::MountHelper);
    let client = server.client(Interface::MountHelper).await;

    assert!(!client.connected().await.unwrap());
    create(&client).await.unwrap();
    assert!(!client.connected().await.unwrap());

    client.connect().await.unwrap();
    assert!(client.connected().await.unwrap());
    assert!(client.mounted().await.unwrap());
    assert!(!client.connecting().await.unwrap());
    assert!(server.transport.session_open());

    client.disconnect().await.unwrap();
    assert!(!client.connected().await.unwrap());
    assert!(eventually(|| !server.transport.session_open()).await);
}

#[tokio::test]
async fn test_calls_before_create_are_harmless() {
    let server = TestServer::start(Interface::MountHelper);
    let client = server.client(Interface::MountHelper).await;

    client.connect().await.unwrap();
    client.disconnect().await.unwrap();
    client.set_use_cache(true).await.unwrap();
    assert!(!client.use_cache().await.unwrap());
    assert!(!client.connected().await.unwrap());
    assert_eq!(server.transport.connects(), 0);
}

#[tokio::test]
async fn test_state_mutations_visible_to_other_connections() {
    let server = TestServer::start(Interface::MountHelper);
    let writer = server.client(Interface::MountHelper).await;
    let reader = server.client(Interface::MountHelper).await;

    create(&writer).await.unwrap();
    writer.set_use_cache(true).await.unwrap();
    writer.set_icon("/tmp/icon.png").await.unwrap();
    writer.set_mountpoint("/Volumes/Renamed/").await.unwrap();
    writer
        .set_fingerprints(vec!["SHA256:abc".into()])
        .await
        .unwrap();

    assert!(reader.use_cache().await.unwrap());
}

#[tokio::test]
async fn test_queries_answer_while_connect_pending() {
    let server = TestServer::start(Interface::MountHelper);
    let client = Arc::new(server.client(Interface::MountHelper).await);
    create(&client).await.unwrap();

    let release = server.transport.push_manual();
    let pending = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.connect().await })
    };
    server.transport.connect_started().await;

    // Same connection: these replies overtake the pending connect.
    assert!(client.connecting().await.unwrap());
    assert!(!client.connected().await.unwrap());
    assert_eq!(client.ping().await.unwrap(), "ack");

    release.send(Ok(())).unwrap();
    pending.await.unwrap().unwrap();
    assert!(client.connected().await.unwrap());
}

#[tokio::test]
async fn test_connect_failure_reports_transport_failure() {
    let server = TestServer::start(Interface::MountHelper);
    let client = server.client(Interface::MountHelper).await;
    create(&client).await.unwrap();

    server.transport.push(ConnectScript::Fail("host unreachable".into()));
    let err = client.connect().await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::TransportFailure));
    assert!(!client.connected().await.unwrap());
    assert!(!client.connecting().await.unwrap());

    // A later attempt is unaffected.
    client.connect().await.unwrap();
    assert!(client.connected().await.unwrap());
}

#[tokio::test]
async fn test_disconnect_cancels_pending_connect() {
    let server = TestServer::start(Interface::MountHelper);
    let client = Arc::new(server.client(Interface::MountHelper).await);
    create(&client).await.unwrap();

    let release = server.transport.push_manual();
    let pending = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.connect().await })
    };
    server.transport.connect_started().await;

    client.disconnect().await.unwrap();
    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::TransportFailure));

    // The late success must not resurrect the mount.
    let _ = release.send(Ok(()));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!client.connected().await.unwrap());
    assert!(eventually(|| !server.transport.session_open()).await);
}

#[tokio::test]
async fn test_create_while_connected_is_busy() {
    let server = TestServer::start(Interface::MountHelper);
    let client = server.client(Interface::MountHelper).await;
    create(&client).await.unwrap();
    client.connect().await.unwrap();

    let err = create(&client).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::MountBusy));
    assert!(client.connected().await.unwrap());
}

// ============================================================================
// Handshake and framing
// ============================================================================

#[tokio::test]
async fn test_wrong_interface_rejected() {
    let server = TestServer::start(Interface::Service);
    let err = RpcClient::connect_unix(&server.path, Interface::MountHelper)
        .await
        .unwrap_err();
    match err {
        ConnectError::Rejected(reason) => assert!(reason.contains("service")),
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_wrong_version_rejected() {
    let server = TestServer::start(Interface::Service);
    let mut stream = UnixStream::connect(&server.path).await.unwrap();
    let hello = Hello {
        interface: Interface::Service,
        protocol_version: PROTOCOL_VERSION + 1,
    };
    wire::send(&mut stream, 0, &hello).await.unwrap();
    let (_, payload) = wire::read_frame(&mut stream).await.unwrap().unwrap();
    assert!(matches!(
        wire::decode::<HelloReply>(&payload).unwrap(),
        HelloReply::Rejected { .. }
    ));
    assert!(wire::read_frame(&mut stream).await.unwrap().is_none());
}

#[tokio::test]
async fn test_malformed_payload_gets_reply() {
    let server = TestServer::start(Interface::Service);
    let mut stream = UnixStream::connect(&server.path).await.unwrap();
    wire::send(&mut stream, 0, &Hello::new(Interface::Service))
        .await
        .unwrap();
    let (_, payload) = wire::read_frame(&mut stream).await.unwrap().unwrap();
    assert_eq!(wire::decode::<HelloReply>(&payload).unwrap(), HelloReply::Accepted);

    wire::write_frame(&mut stream, 77, &[0xff, 0xfe, 0xfd])
        .await
        .unwrap();
    let (id, payload) = wire::read_frame(&mut stream).await.unwrap().unwrap();
    assert_eq!(id, 77);
    assert!(matches!(
        wire::decode::<Reply>(&payload).unwrap(),
        Reply::Failed { kind: ErrorKind::MalformedRequest, .. }
    ));
}

#[tokio::test]
async fn test_unexported_operation_unsupported() {
    let server = TestServer::start(Interface::Service);
    let client = server.client(Interface::Service).await;
    let err = client.connect().await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Unsupported));
    let err = client.get_mount_state().await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Unsupported));
    assert_eq!(client.protocol_version().await.unwrap(), PROTOCOL_VERSION);
}

// ============================================================================
// Broker
// ============================================================================

#[tokio::test]
async fn test_broker_across_connections() {
    let server = TestServer::start(Interface::Service);
    let app = server.client(Interface::Service).await;
    let extension = server.client(Interface::Service).await;
    let role = PeerRole::ForegroundApp;

    assert_eq!(extension.get_peer_endpoint(role).await.unwrap(), None);

    let first = Endpoint::new(Interface::App, "/tmp/app-1.sock");
    let second = Endpoint::new(Interface::App, "/tmp/app-2.sock");
    assert!(app.publish_peer_endpoint(role, first).await.unwrap());
    assert!(app.publish_peer_endpoint(role, second.clone()).await.unwrap());
    assert_eq!(extension.get_peer_endpoint(role).await.unwrap(), Some(second));
    assert_eq!(
        extension
            .get_peer_endpoint(PeerRole::FinderExtension)
            .await
            .unwrap(),
        None
    );

    assert!(app.withdraw_peer_endpoint(role).await.unwrap());
    assert!(!app.withdraw_peer_endpoint(role).await.unwrap());
    assert_eq!(extension.get_peer_endpoint(role).await.unwrap(), None);
}

#[tokio::test]
async fn test_rendezvous_after_late_publish() {
    let server = TestServer::start(Interface::Service);
    let waiter = server.client(Interface::Service).await;
    let publisher = server.client(Interface::Service).await;
    let endpoint = Endpoint::new(Interface::App, "/tmp/app.sock");

    let wait = tokio::spawn(async move {
        rendezvous(
            &waiter,
            PeerRole::ForegroundApp,
            Duration::from_millis(5),
            Duration::from_secs(5),
        )
        .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    publisher
        .publish_peer_endpoint(PeerRole::ForegroundApp, endpoint.clone())
        .await
        .unwrap();

    assert_eq!(wait.await.unwrap().unwrap(), endpoint);
}

// ============================================================================
// Process lifecycle
// ============================================================================

#[tokio::test]
async fn test_connections_hold_termination_guard() {
    let server = TestServer::start(Interface::Service);
    assert!(server.lifecycle.is_idle_eligible());

    let client = server.client(Interface::Service).await;
    client.ping().await.unwrap();
    assert!(!server.lifecycle.is_idle_eligible());

    drop(client);
    let lifecycle = Arc::clone(&server.lifecycle);
    assert!(eventually(move || lifecycle.is_idle_eligible()).await);
}

#[tokio::test]
async fn test_connected_mount_holds_guard_after_hangup() {
    let server = TestServer::start(Interface::MountHelper);
    let client = server.client(Interface::MountHelper).await;
    create(&client).await.unwrap();
    client.connect().await.unwrap();
    drop(client);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!server.lifecycle.is_idle_eligible());

    let client = server.client(Interface::MountHelper).await;
    client.disconnect().await.unwrap();
    drop(client);
    let lifecycle = Arc::clone(&server.lifecycle);
    assert!(eventually(move || lifecycle.is_idle_eligible()).await);
}

// ============================================================================
// Helper extras
// ============================================================================

#[tokio::test]
async fn test_empty_mountpoint_rejected() {
    let server = TestServer::start(Interface::MountHelper);
    let client = server.client(Interface::MountHelper).await;

    let err = client
        .create("", "Nowhere", "alice", "hunter2", "files.example.com", 22)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::MalformedRequest));
    assert_eq!(server.lifecycle.outstanding(), 1, "only the connection holds a guard");

    create(&client).await.unwrap();
    let err = client.set_mountpoint("").await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::MalformedRequest));
}

#[tokio::test]
async fn test_mounting_while_connect_pending() {
    let server = TestServer::start(Interface::MountHelper);
    let client = Arc::new(server.client(Interface::MountHelper).await);
    create(&client).await.unwrap();
    let resolve = server.transport.push_manual();

    let pending = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.connect().await })
    };
    server.transport.connect_started().await;
    assert!(client.mounting().await.unwrap());
    assert!(!client.mounted().await.unwrap());

    resolve.send(Ok(())).unwrap();
    pending.await.unwrap().unwrap();
    assert!(!client.mounting().await.unwrap());
}

#[tokio::test]
async fn test_kill_mount_answers_then_trips() {
    let server = TestServer::start(Interface::MountHelper);
    let client = server.client(Interface::MountHelper).await;
    create(&client).await.unwrap();
    client.connect().await.unwrap();

    client.kill_mount().await.unwrap();
    assert!(eventually(|| server.kill.is_cancelled()).await);
}

/// Records what the helper forwards to the app.
#[derive(Default)]
struct DiagnosticSink {
    seen: Mutex<Vec<Diagnostic>>,
}

#[async_trait]
impl RequestHandler for DiagnosticSink {
    fn interface(&self) -> Interface {
        Interface::App
    }

    async fn handle(&self, request: Request, _trace: TraceCarrier, responder: Responder) {
        match request {
            Request::ReportDiagnostic { diagnostic } => {
                self.seen.lock().push(diagnostic);
                responder.send(Reply::Done);
            }
            _ => responder.fail(ErrorKind::Unsupported, "sink"),
        }
    }
}

#[tokio::test]
async fn test_connect_failure_forwarded_to_app() {
    let server = TestServer::start(Interface::MountHelper);
    let client = server.client(Interface::MountHelper).await;

    let app_dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(DiagnosticSink::default());
    let app = RpcListener::bind(
        &socket_path_in(app_dir.path(), Interface::App),
        Arc::clone(&sink) as Arc<dyn RequestHandler>,
        ProcessLifecycle::new(),
    )
    .unwrap();
    let app_endpoint = app.endpoint().clone();
    let app_cancel = CancellationToken::new();
    {
        let token = app_cancel.clone();
        tokio::spawn(async move { app.run(token).await });
    }

    client
        .forward_diagnostics(DiagnosticStream::Errors, app_endpoint)
        .await
        .unwrap();
    create(&client).await.unwrap();
    server.transport.push(ConnectScript::Fail("host key mismatch".into()));
    assert!(client.connect().await.is_err());

    assert!(eventually(|| !sink.seen.lock().is_empty()).await);
    let seen = sink.seen.lock().clone();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].is_error());
    assert!(seen[0].message().contains("host key mismatch"));

    // Only app endpoints take diagnostics.
    let err = client
        .forward_diagnostics(
            DiagnosticStream::Logs,
            Endpoint::new(Interface::Service, app_dir.path().join("service.sock")),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::MalformedRequest));
    app_cancel.cancel();
}
