//! mountplane server binary
//!
//! Runs either the on-demand mount helper or the long-lived endpoint service
//! on a Unix socket. Both exit with status 75 once idle; a helper told to
//! kill its mount exits with status 1.
//!
//! ## Usage
//!
//! ```bash
//! # Mount helper on the default socket
//! mountplane-server helper
//!
//! # Service with a config file and a short idle timeout
//! mountplane-server service --config ~/.config/mountplane/server.ron --idle-secs 10
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use mountplane_kernel::{
    EndpointBroker, MemoryTransport, MountEventBus, MountSupervisor, MountTransport,
    ProcessLifecycle, Subscription, TcpTransport,
};
use mountplane_server::constants::{KILLED_STATUS, SERVICE_SHUTDOWN_STATUS};
use mountplane_server::{Dispatcher, RequestHandler, RpcListener, ServerConfig, ServerRole, TransportKind};

#[derive(Parser, Debug)]
#[command(name = "mountplane-server")]
#[command(about = "Mount helper and endpoint service for mountplane")]
struct Args {
    /// Which process to run
    #[arg(value_enum)]
    role: ServerRole,

    /// RON config file
    #[arg(long, env = "MOUNTPLANE_CONFIG")]
    config: Option<PathBuf>,

    /// Socket path, overriding the config and MOUNTPLANE_SOCKET
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Seconds without activity before exiting
    #[arg(long)]
    idle_secs: Option<u64>,

    /// Session transport for the helper
    #[arg(long, value_enum)]
    transport: Option<TransportKind>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));

    #[cfg(feature = "telemetry")]
    let _otel_guard = if mountplane_telemetry::otel_enabled() {
        match mountplane_telemetry::otel_layer(args.role.service_name()) {
            Ok((otel_layer, guard)) => {
                registry.with(otel_layer).init();
                Some(guard)
            }
            Err(e) => {
                registry.init();
                tracing::warn!(error = %e, "OTel export disabled");
                None
            }
        }
    } else {
        registry.init();
        None
    };
    #[cfg(not(feature = "telemetry"))]
    registry.init();

    match run(args).await {
        Ok(status) => ExitCode::from(status),
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns the exit status.
async fn run(args: Args) -> Result<u8> {
    let mut config = ServerConfig::resolve(args.config.as_deref()).context("loading config")?;
    if let Some(socket) = args.socket {
        config.socket = Some(socket);
    }
    if let Some(secs) = args.idle_secs {
        config.idle_timeout_secs = secs;
    }
    if let Some(transport) = args.transport {
        config.transport = transport;
    }

    let lifecycle = ProcessLifecycle::new();
    let broker = Arc::new(EndpointBroker::new());

    let mut event_log = None;
    let mut kill = CancellationToken::new();
    let (handler, supervisor): (Arc<dyn RequestHandler>, Option<MountSupervisor>) = match args.role {
        ServerRole::Helper => {
            let transport: Arc<dyn MountTransport> = match config.transport {
                TransportKind::Memory => Arc::new(MemoryTransport::new()),
                TransportKind::Tcp => Arc::new(TcpTransport::new(config.connect_timeout())),
            };
            tracing::info!(transport = transport.name(), "helper starting");
            let (events, subscription) = spawn_event_log()?;
            event_log = Some(subscription);
            let supervisor = MountSupervisor::spawn(transport, Arc::clone(&lifecycle), Some(events));
            let dispatcher = Dispatcher::helper(supervisor.clone(), broker);
            kill = dispatcher.kill_switch();
            (Arc::new(dispatcher), Some(supervisor))
        }
        ServerRole::Service => {
            tracing::info!("service starting");
            (Arc::new(Dispatcher::service(broker)), None)
        }
    };

    let path = config.socket_path(args.role.interface());
    let listener = RpcListener::bind(&path, handler, Arc::clone(&lifecycle))
        .with_context(|| format!("binding {}", path.display()))?;

    let shutdown = CancellationToken::new();
    let mut status = SERVICE_SHUTDOWN_STATUS;
    tokio::select! {
        _ = listener.run(shutdown.clone()) => {}
        _ = mountplane_server::wait_for_idle(&lifecycle, config.idle_timeout()) => {
            tracing::info!("exiting on idle");
        }
        _ = kill.cancelled() => {
            tracing::warn!("mount killed by peer");
            status = KILLED_STATUS;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
        }
    }
    shutdown.cancel();

    if let Some(supervisor) = supervisor {
        if let Err(e) = supervisor.shutdown().await {
            tracing::warn!(error = %e, "supervisor shutdown");
        }
    }
    drop(event_log);
    Ok(status)
}

/// Log every mount event from a dedicated delivery thread.
fn spawn_event_log() -> Result<(MountEventBus, Subscription)> {
    let (bus, pump) = MountEventBus::new();
    std::thread::Builder::new()
        .name("mount-events".into())
        .spawn(move || {
            if let Err(e) = pump.run() {
                tracing::error!(error = %e, "event delivery stopped");
            }
        })
        .context("spawning event thread")?;

    let observer = mountplane_types::ObserverId::new();
    let subscription = bus
        .subscribe(observer, "mount.*", |envelope| {
            tracing::info!(
                mount = ?envelope.mount.map(|id| id.short()),
                seq = envelope.seq,
                event = ?envelope.event,
                "mount event"
            );
        })
        .context("subscribing event log")?;
    Ok((bus, subscription))
}
