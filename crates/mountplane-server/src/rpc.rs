//! Request dispatch for the helper and service interfaces.
//!
//! One [`Dispatcher`] is built in `main` around the process-wide supervisor and
//! broker; every accepted connection shares it, so every peer sees one state.
//!
//! Commands issued before `create` are answered `Done` without effect and
//! queries answer `false`: a peer can never crash or hang the helper by
//! calling things out of order.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use mountplane_kernel::{EndpointBroker, MountSupervisor, SupervisorError};
use mountplane_types::{
    Credentials, ErrorKind, Interface, MountConfig, PROTOCOL_VERSION, Reply, Request, Secret,
    TraceCarrier,
};

use crate::constants::PING_REPLY;
use crate::forward::DiagnosticsForwarder;
use crate::listener::{RequestHandler, Responder};

/// Whether `interface` exports `request`.
pub fn exports(interface: Interface, request: &Request) -> bool {
    use Request::*;
    match request {
        Ping | ProtocolVersion => true,
        GetPeerEndpoint { .. } | PublishPeerEndpoint { .. } | WithdrawPeerEndpoint { .. } => {
            matches!(interface, Interface::MountHelper | Interface::Service)
        }
        Create { .. } | Connect | Disconnect | KillMount | SetIcon { .. } | SetUseCache { .. }
        | SetMountpoint { .. } | SetFingerprints { .. } | UseCache | Connected | Connecting
        | Mounted | Mounting | ForwardDiagnostics { .. } => interface == Interface::MountHelper,
        GetMountState | ToggleMountState | ReportDiagnostic { .. } => interface == Interface::App,
    }
}

/// Extract the remote trace and name the span after the method.
fn request_span(trace: &TraceCarrier, name: &'static str) -> tracing::Span {
    let parent = mountplane_telemetry::extract_trace_context(&trace.traceparent, &trace.tracestate);
    tracing::info_span!(parent: &parent, "rpc", method = name)
}

/// Map a supervisor command result onto the wire.
fn command_reply(op: &'static str, result: Result<(), SupervisorError>) -> Reply {
    match result {
        Ok(()) => Reply::Done,
        Err(SupervisorError::NotCreated) => {
            tracing::debug!(op, "command before create ignored");
            Reply::Done
        }
        Err(SupervisorError::InvalidTransition { phase, .. }) => {
            tracing::debug!(op, %phase, "command ignored in current phase");
            Reply::Done
        }
        Err(e) => Reply::failed(e.kind(), e.to_string()),
    }
}

pub struct Dispatcher {
    interface: Interface,
    /// `None` for the service, which owns no mount.
    supervisor: Option<MountSupervisor>,
    broker: Arc<EndpointBroker>,
    forwarder: Option<DiagnosticsForwarder>,
    /// Cancelled by `KillMount`; the run loop exits on it.
    kill: CancellationToken,
}

impl Dispatcher {
    pub fn helper(supervisor: MountSupervisor, broker: Arc<EndpointBroker>) -> Self {
        let forwarder = DiagnosticsForwarder::new(supervisor.diagnostics().clone());
        Self {
            interface: Interface::MountHelper,
            supervisor: Some(supervisor),
            broker,
            forwarder: Some(forwarder),
            kill: CancellationToken::new(),
        }
    }

    pub fn service(broker: Arc<EndpointBroker>) -> Self {
        Self {
            interface: Interface::Service,
            supervisor: None,
            broker,
            forwarder: None,
            kill: CancellationToken::new(),
        }
    }

    pub fn broker(&self) -> &Arc<EndpointBroker> {
        &self.broker
    }

    /// Cancelled once a peer sends `KillMount`.
    pub fn kill_switch(&self) -> CancellationToken {
        self.kill.clone()
    }

    async fn dispatch(&self, request: Request) -> Reply {
        match request {
            Request::Ping => Reply::Text(PING_REPLY.to_string()),
            Request::ProtocolVersion => Reply::Version(PROTOCOL_VERSION),

            Request::GetPeerEndpoint { role } => {
                let endpoint = self.broker.fetch(role);
                tracing::debug!(%role, present = endpoint.is_some(), "broker.fetch");
                Reply::Endpoint(endpoint)
            }
            Request::PublishPeerEndpoint { role, endpoint } => {
                self.broker.publish(role, endpoint);
                Reply::Bool(true)
            }
            Request::WithdrawPeerEndpoint { role } => {
                Reply::Bool(self.broker.withdraw(role).is_some())
            }

            other => match &self.supervisor {
                Some(supervisor) => self.dispatch_mount(supervisor, other).await,
                None => Reply::failed(ErrorKind::Unsupported, "no mount on this endpoint"),
            },
        }
    }

    async fn dispatch_mount(&self, supervisor: &MountSupervisor, request: Request) -> Reply {
        match request {
            Request::Create {
                mountpoint,
                label,
                user,
                password,
                host,
                port,
            } => {
                let config = MountConfig::new(
                    mountpoint,
                    label,
                    Credentials::new(user, Secret::new(password), host, port),
                );
                match supervisor.create(config).await {
                    Ok(_) => Reply::Done,
                    Err(e) => Reply::failed(e.kind(), e.to_string()),
                }
            }
            Request::Connect => {
                let span = mount_span(supervisor, "connect");
                command_reply("connect", supervisor.connect().instrument(span).await)
            }
            Request::Disconnect => {
                let span = mount_span(supervisor, "disconnect");
                command_reply("disconnect", supervisor.disconnect().instrument(span).await)
            }
            // Teardown happens on the run loop's shutdown path.
            Request::KillMount => {
                tracing::warn!(mount = ?supervisor.mount_id(), "kill requested");
                Reply::Done
            }
            Request::SetIcon { path } => {
                command_reply("set_icon", supervisor.set_icon(Some(path)).await)
            }
            Request::SetUseCache { enabled } => {
                command_reply("set_use_cache", supervisor.set_use_cache(enabled).await)
            }
            Request::SetMountpoint { path } => {
                command_reply("set_mountpoint", supervisor.set_mountpoint(path).await)
            }
            Request::SetFingerprints { fingerprints } => command_reply(
                "set_fingerprints",
                supervisor.set_fingerprints(fingerprints).await,
            ),

            Request::UseCache => Reply::Bool(supervisor.use_cache()),
            Request::Connected => Reply::Bool(supervisor.connected()),
            Request::Connecting => Reply::Bool(supervisor.connecting()),
            Request::Mounted => Reply::Bool(supervisor.mounted()),
            Request::Mounting => Reply::Bool(supervisor.mounting()),

            Request::ForwardDiagnostics { stream, endpoint } => {
                if endpoint.interface != Interface::App {
                    return Reply::failed(
                        ErrorKind::MalformedRequest,
                        format!("diagnostics go to an app endpoint, not {}", endpoint.interface),
                    );
                }
                match &self.forwarder {
                    Some(forwarder) => {
                        tracing::info!(%stream, endpoint = %endpoint.id, "forwarding diagnostics");
                        forwarder.forward(stream, endpoint);
                        Reply::Done
                    }
                    None => Reply::failed(ErrorKind::Unsupported, "no diagnostics here"),
                }
            }

            // Filtered by `exports` before dispatch.
            Request::Ping
            | Request::ProtocolVersion
            | Request::GetPeerEndpoint { .. }
            | Request::PublishPeerEndpoint { .. }
            | Request::WithdrawPeerEndpoint { .. }
            | Request::GetMountState
            | Request::ToggleMountState
            | Request::ReportDiagnostic { .. } => {
                Reply::failed(ErrorKind::Unsupported, "not a mount operation")
            }
        }
    }
}

fn mount_span(supervisor: &MountSupervisor, name: &'static str) -> tracing::Span {
    let id = supervisor.mount_id().map(|id| *id.as_bytes()).unwrap_or([0u8; 16]);
    mountplane_telemetry::mount_root_span(&id, name)
}

#[async_trait]
impl RequestHandler for Dispatcher {
    fn interface(&self) -> Interface {
        self.interface
    }

    async fn handle(&self, request: Request, trace: TraceCarrier, responder: Responder) {
        let name = request.name();
        if !exports(self.interface, &request) {
            tracing::debug!(method = name, interface = %self.interface, "unsupported request");
            responder.fail(
                ErrorKind::Unsupported,
                format!("{} does not export {name}", self.interface),
            );
            return;
        }

        let kill = matches!(request, Request::KillMount);
        let span = request_span(&trace, name);
        let reply = self.dispatch(request).instrument(span).await;
        responder.send(reply);
        // After the reply is queued, so the peer still gets its answer.
        if kill {
            self.kill.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use mountplane_kernel::{MemoryTransport, ProcessLifecycle};
    use mountplane_types::{DiagnosticStream, Endpoint, PeerRole};

    use super::*;

    fn helper() -> Dispatcher {
        let supervisor = MountSupervisor::spawn(
            Arc::new(MemoryTransport::new()),
            ProcessLifecycle::new(),
            None,
        );
        Dispatcher::helper(supervisor, Arc::new(EndpointBroker::new()))
    }

    fn create() -> Request {
        Request::Create {
            mountpoint: "/Volumes/Test".into(),
            label: "Test".into(),
            user: "alice".into(),
            password: "secret".into(),
            host: "host.example.com".into(),
            port: 22,
        }
    }

    #[test]
    fn test_export_table() {
        assert!(exports(Interface::MountHelper, &Request::Connect));
        assert!(!exports(Interface::Service, &Request::Connect));
        assert!(exports(
            Interface::Service,
            &Request::GetPeerEndpoint { role: PeerRole::ForegroundApp }
        ));
        assert!(!exports(Interface::MountHelper, &Request::GetMountState));
        assert!(exports(Interface::App, &Request::GetMountState));
        assert!(exports(Interface::App, &Request::Ping));
        assert!(!exports(Interface::App, &Request::UseCache));
        assert!(exports(Interface::MountHelper, &Request::KillMount));
        assert!(exports(Interface::MountHelper, &Request::Mounting));
        assert!(!exports(Interface::Service, &Request::KillMount));
        assert!(exports(Interface::App, &Request::ToggleMountState));
        assert!(!exports(Interface::MountHelper, &Request::ToggleMountState));
    }

    #[tokio::test]
    async fn test_before_create_is_safe() {
        let d = helper();
        assert_eq!(d.dispatch(Request::UseCache).await, Reply::Bool(false));
        assert_eq!(d.dispatch(Request::Connected).await, Reply::Bool(false));
        assert_eq!(d.dispatch(Request::Connect).await, Reply::Done);
        assert_eq!(d.dispatch(Request::Disconnect).await, Reply::Done);
        assert_eq!(
            d.dispatch(Request::SetUseCache { enabled: true }).await,
            Reply::Done
        );
        assert_eq!(d.dispatch(Request::UseCache).await, Reply::Bool(false));
    }

    #[tokio::test]
    async fn test_lifecycle_over_dispatch() {
        let d = helper();
        assert_eq!(d.dispatch(create()).await, Reply::Done);
        assert_eq!(d.dispatch(Request::Connect).await, Reply::Done);
        assert_eq!(d.dispatch(Request::Connected).await, Reply::Bool(true));
        assert_eq!(d.dispatch(Request::Mounted).await, Reply::Bool(true));
        assert_eq!(d.dispatch(Request::Connecting).await, Reply::Bool(false));

        let busy = d.dispatch(create()).await;
        assert!(matches!(busy, Reply::Failed { kind: ErrorKind::MountBusy, .. }));

        assert_eq!(d.dispatch(Request::Disconnect).await, Reply::Done);
        assert_eq!(d.dispatch(Request::Connected).await, Reply::Bool(false));
    }

    #[tokio::test]
    async fn test_create_with_empty_mountpoint_is_malformed() {
        let d = helper();
        let request = Request::Create {
            mountpoint: "".into(),
            label: "Empty".into(),
            user: "alice".into(),
            password: "secret".into(),
            host: "host.example.com".into(),
            port: 22,
        };
        assert!(matches!(
            d.dispatch(request).await,
            Reply::Failed { kind: ErrorKind::MalformedRequest, .. }
        ));
        assert_eq!(d.dispatch(create()).await, Reply::Done);
        assert!(matches!(
            d.dispatch(Request::SetMountpoint { path: "".into() }).await,
            Reply::Failed { kind: ErrorKind::MalformedRequest, .. }
        ));
    }

    #[tokio::test]
    async fn test_mounting_tracks_connecting() {
        let transport = MemoryTransport::new();
        let supervisor = MountSupervisor::spawn(
            Arc::new(transport.clone()),
            ProcessLifecycle::new(),
            None,
        );
        let d = Arc::new(Dispatcher::helper(supervisor, Arc::new(EndpointBroker::new())));
        assert_eq!(d.dispatch(Request::Mounting).await, Reply::Bool(false));
        assert_eq!(d.dispatch(create()).await, Reply::Done);

        let resolve = transport.push_manual();
        let pending = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.dispatch(Request::Connect).await })
        };
        transport.connect_started().await;
        assert_eq!(d.dispatch(Request::Mounting).await, Reply::Bool(true));
        resolve.send(Ok(())).unwrap();
        assert_eq!(pending.await.unwrap(), Reply::Done);
        assert_eq!(d.dispatch(Request::Mounting).await, Reply::Bool(false));
    }

    #[tokio::test]
    async fn test_kill_answers_then_trips_switch() {
        let d = helper();
        let kill = d.kill_switch();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        d.handle(Request::KillMount, TraceCarrier::default(), Responder::new(9, tx))
            .await;
        assert_eq!(rx.recv().await.unwrap(), (9, Reply::Done));
        assert!(kill.is_cancelled());
    }

    #[tokio::test]
    async fn test_forward_diagnostics_needs_app_endpoint() {
        let d = helper();
        let reply = d
            .dispatch(Request::ForwardDiagnostics {
                stream: DiagnosticStream::Errors,
                endpoint: Endpoint::new(Interface::Service, "/tmp/service.sock"),
            })
            .await;
        assert!(matches!(reply, Reply::Failed { kind: ErrorKind::MalformedRequest, .. }));

        let service = Dispatcher::service(Arc::new(EndpointBroker::new()));
        assert!(!exports(
            service.interface(),
            &Request::ForwardDiagnostics {
                stream: DiagnosticStream::Logs,
                endpoint: Endpoint::new(Interface::App, "/tmp/app.sock"),
            }
        ));
    }

    #[tokio::test]
    async fn test_broker_over_dispatch() {
        let d = Dispatcher::service(Arc::new(EndpointBroker::new()));
        let role = PeerRole::ForegroundApp;
        assert_eq!(
            d.dispatch(Request::GetPeerEndpoint { role }).await,
            Reply::Endpoint(None)
        );
        let endpoint = Endpoint::new(Interface::App, "/tmp/app.sock");
        assert_eq!(
            d.dispatch(Request::PublishPeerEndpoint { role, endpoint: endpoint.clone() })
                .await,
            Reply::Bool(true)
        );
        assert_eq!(
            d.dispatch(Request::GetPeerEndpoint { role }).await,
            Reply::Endpoint(Some(endpoint))
        );
    }

    #[tokio::test]
    async fn test_ping_and_version() {
        let d = Dispatcher::service(Arc::new(EndpointBroker::new()));
        assert_eq!(d.dispatch(Request::Ping).await, Reply::Text("ack".into()));
        assert_eq!(
            d.dispatch(Request::ProtocolVersion).await,
            Reply::Version(PROTOCOL_VERSION)
        );
    }
}
