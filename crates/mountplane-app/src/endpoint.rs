//! The App interface this process exports while `serve-app` runs.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::Instrument;

use mountplane_client::{RpcClient, RpcError};
use mountplane_kernel::MountEventBus;
use mountplane_server::constants::PING_REPLY;
use mountplane_server::{RequestHandler, Responder, exports};
use mountplane_types::{
    Diagnostic, ErrorKind, Interface, LogLevel, MountEvent, PROTOCOL_VERSION, Reply, Request,
    TraceCarrier,
};

use crate::view::MountView;

/// Answers peers (the Finder extension, the helper) from the local view.
pub struct AppHandler {
    view: Arc<MountView>,
    bus: MountEventBus,
    /// `None` when no helper was reachable at startup.
    helper: Option<Arc<RpcClient>>,
}

impl AppHandler {
    pub fn new(view: Arc<MountView>, bus: MountEventBus, helper: Option<Arc<RpcClient>>) -> Self {
        Self { view, bus, helper }
    }

    async fn reply(&self, request: Request) -> Reply {
        match request {
            Request::Ping => Reply::Text(PING_REPLY.to_string()),
            Request::ProtocolVersion => Reply::Version(PROTOCOL_VERSION),
            Request::GetMountState => Reply::Bool(self.view.mounted()),
            Request::ToggleMountState => self.toggle().await,
            Request::ReportDiagnostic { diagnostic } => {
                log_diagnostic(&diagnostic);
                self.bus.publish(None, MountEvent::Diagnostic(diagnostic));
                Reply::Done
            }
            other => Reply::failed(
                ErrorKind::Unsupported,
                format!("app does not export {}", other.name()),
            ),
        }
    }

    /// Disconnect a mounted helper, connect an unmounted one.
    async fn toggle(&self) -> Reply {
        let Some(helper) = &self.helper else {
            return Reply::failed(ErrorKind::Unsupported, "no mount helper attached");
        };
        let result = match helper.mounted().await {
            Ok(true) => helper.disconnect().await,
            Ok(false) => helper.connect().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Reply::Done,
            Err(RpcError::Remote { kind, message }) => Reply::Failed { kind, message },
            Err(e) => Reply::failed(ErrorKind::Internal, e.to_string()),
        }
    }
}

fn log_diagnostic(diagnostic: &Diagnostic) {
    match diagnostic {
        Diagnostic::Error { message, kind } => tracing::warn!(%kind, "helper: {message}"),
        Diagnostic::Log {
            message,
            module,
            level,
        } => match level {
            LogLevel::Error => tracing::error!(%module, "helper: {message}"),
            LogLevel::Warn => tracing::warn!(%module, "helper: {message}"),
            LogLevel::Info => tracing::info!(%module, "helper: {message}"),
            LogLevel::Debug => tracing::debug!(%module, "helper: {message}"),
        },
    }
}

#[async_trait]
impl RequestHandler for AppHandler {
    fn interface(&self) -> Interface {
        Interface::App
    }

    async fn handle(&self, request: Request, trace: TraceCarrier, responder: Responder) {
        let name = request.name();
        if !exports(Interface::App, &request) {
            tracing::debug!(method = name, "unsupported request");
        }
        let parent =
            mountplane_telemetry::extract_trace_context(&trace.traceparent, &trace.tracestate);
        let span = tracing::info_span!(parent: &parent, "rpc", method = name);
        responder.send(self.reply(request).instrument(span).await);
    }
}
