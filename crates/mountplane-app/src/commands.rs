//! One async function per subcommand.
//!
//! Anything that consumes bus events drives the [`DeliveryPump`] from the
//! task `main` blocks on, which keeps delivery on the main thread.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;

use mountplane_client::{MountWatcher, RpcClient, rendezvous};
use mountplane_kernel::{DeliveryPump, MountEventBus, ProcessLifecycle};
use mountplane_server::RpcListener;
use mountplane_server::config::{default_socket_dir, socket_path_in};
use mountplane_types::{
    DiagnosticStream, HasSubject, Interface, MountEvent, ObserverId, PeerRole, normalize_mountpoint,
};

use crate::cli::{Cli, Command};
use crate::constants::DEFAULT_RENDEZVOUS_DEADLINE;
use crate::endpoint::AppHandler;
use crate::view::MountView;

/// Where the well-known sockets live.
#[derive(Clone, Debug)]
pub struct Sockets {
    dir: PathBuf,
}

impl Sockets {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir: dir.unwrap_or_else(default_socket_dir),
        }
    }

    pub fn path(&self, interface: Interface) -> PathBuf {
        socket_path_in(&self.dir, interface)
    }

    async fn open(&self, interface: Interface) -> Result<RpcClient> {
        let path = self.path(interface);
        RpcClient::connect_unix(&path, interface)
            .await
            .with_context(|| format!("connecting to {interface} at {}", path.display()))
    }
}

/// Phase word for a pair of helper flags.
pub fn phase_name(connected: bool, connecting: bool) -> &'static str {
    match (connected, connecting) {
        (true, _) => "connected",
        (false, true) => "connecting",
        (false, false) => "disconnected",
    }
}

/// Status lines as printed by `mountctl status`.
pub fn describe_status(connected: bool, connecting: bool, mounted: bool, use_cache: bool) -> String {
    let phase = phase_name(connected, connecting);
    format!("phase:     {phase}\nmounted:   {mounted}\nuse_cache: {use_cache}")
}

/// Default label: the mountpoint's last component.
pub fn default_label(mountpoint: &Path) -> String {
    normalize_mountpoint(mountpoint)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mount".to_string())
}

pub async fn run(cli: Cli, pump: DeliveryPump, bus: MountEventBus) -> Result<()> {
    let sockets = Sockets::new(cli.socket_dir);

    match cli.command {
        Command::Create {
            mountpoint,
            label,
            user,
            password,
            host,
            port,
            connect,
        } => {
            let helper = sockets.open(Interface::MountHelper).await?;
            let label = label.unwrap_or_else(|| default_label(&mountpoint));
            helper
                .create(mountpoint, label, user, password, host, port)
                .await
                .context("create")?;
            if connect {
                println!("{}", connect_and_report(&helper).await?);
            }
        }
        Command::Connect => {
            let helper = sockets.open(Interface::MountHelper).await?;
            println!("{}", connect_and_report(&helper).await?);
        }
        Command::Disconnect => {
            let helper = sockets.open(Interface::MountHelper).await?;
            helper.disconnect().await.context("disconnect")?;
        }
        Command::Kill => {
            let helper = sockets.open(Interface::MountHelper).await?;
            helper.kill_mount().await.context("kill")?;
        }
        Command::Toggle => {
            let app = sockets.open(Interface::App).await?;
            app.toggle_mount_state().await.context("toggle")?;
        }
        Command::Status => {
            let helper = sockets.open(Interface::MountHelper).await?;
            let (connected, connecting, mounted, use_cache) = tokio::try_join!(
                helper.connected(),
                helper.connecting(),
                helper.mounted(),
                helper.use_cache(),
            )?;
            println!("{}", describe_status(connected, connecting, mounted, use_cache));
        }
        Command::Cache { enabled } => {
            let helper = sockets.open(Interface::MountHelper).await?;
            helper.set_use_cache(enabled).await?;
        }
        Command::Icon { path } => {
            let helper = sockets.open(Interface::MountHelper).await?;
            helper.set_icon(path).await?;
        }
        Command::Mountpoint { path } => {
            let helper = sockets.open(Interface::MountHelper).await?;
            helper.set_mountpoint(path).await?;
        }
        Command::Fingerprints { fingerprints } => {
            let helper = sockets.open(Interface::MountHelper).await?;
            helper.set_fingerprints(fingerprints).await?;
        }
        Command::Watch { interval_ms } => {
            watch(&sockets, pump, bus, Duration::from_millis(interval_ms)).await?;
        }
        Command::Publish { role, socket } => {
            let service = sockets.open(Interface::Service).await?;
            let endpoint = mountplane_types::Endpoint::new(interface_for(role), socket);
            service.publish_peer_endpoint(role, endpoint.clone()).await?;
            println!("{}", endpoint.id);
        }
        Command::Fetch { role, wait } => {
            let service = sockets.open(Interface::Service).await?;
            let endpoint = if wait {
                Some(
                    rendezvous(
                        &service,
                        role,
                        mountplane_client::constants::RENDEZVOUS_INTERVAL,
                        DEFAULT_RENDEZVOUS_DEADLINE,
                    )
                    .await
                    .with_context(|| format!("waiting for {role}"))?,
                )
            } else {
                service.get_peer_endpoint(role).await?
            };
            match endpoint {
                Some(endpoint) => println!("{} {}", endpoint.interface, endpoint.address.display()),
                None => bail!("no endpoint published for {role}"),
            }
        }
        Command::Withdraw { role } => {
            let service = sockets.open(Interface::Service).await?;
            if !service.withdraw_peer_endpoint(role).await? {
                log::info!("nothing published for {role}");
            }
        }
        Command::ServeApp {
            socket,
            email,
            interval_ms,
        } => {
            serve_app(
                &sockets,
                socket,
                email,
                pump,
                bus,
                Duration::from_millis(interval_ms),
            )
            .await?;
        }
    }
    Ok(())
}

/// Connect, then report the phase the helper actually ended up in.
///
/// A connect while one is already pending or established is answered without
/// effect, so the reply alone does not mean "connected".
async fn connect_and_report(helper: &RpcClient) -> Result<&'static str> {
    helper.connect().await.context("connect")?;
    let (connected, connecting) = tokio::try_join!(helper.connected(), helper.connecting())?;
    Ok(phase_name(connected, connecting))
}

/// The interface a peer in `role` exports.
fn interface_for(role: PeerRole) -> Interface {
    match role {
        PeerRole::ForegroundApp | PeerRole::FinderExtension => Interface::App,
    }
}

/// Deliver bus events until interrupted or the watcher gives up.
async fn deliver_until_done(pump: &mut DeliveryPump, watcher: Option<&MountWatcher>) -> Result<()> {
    let mut check = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted");
                return Ok(());
            }
            delivered = pump.pump_next() => {
                if !delivered? {
                    return Ok(());
                }
            }
            _ = check.tick() => {
                if watcher.is_some_and(|w| !w.is_running()) {
                    log::info!("helper went away");
                    return Ok(());
                }
            }
        }
    }
}

async fn watch(
    sockets: &Sockets,
    mut pump: DeliveryPump,
    bus: MountEventBus,
    interval: Duration,
) -> Result<()> {
    let helper = Arc::new(sockets.open(Interface::MountHelper).await?);
    let _printer = bus.subscribe(ObserverId::new(), "mount.*", |envelope| {
        println!("{:>4} {}", envelope.seq, envelope.event.subject());
    })?;

    let watcher = MountWatcher::spawn(helper, bus.clone(), interval);
    deliver_until_done(&mut pump, Some(&watcher)).await?;
    watcher.stop().await;
    Ok(())
}

async fn serve_app(
    sockets: &Sockets,
    socket: Option<PathBuf>,
    email: Option<String>,
    mut pump: DeliveryPump,
    bus: MountEventBus,
    interval: Duration,
) -> Result<()> {
    let view = MountView::new();
    let _view_subs = view.attach(&bus)?;

    let helper = match sockets.open(Interface::MountHelper).await {
        Ok(helper) => Some(Arc::new(helper)),
        Err(e) => {
            log::warn!("not watching the mount: {e:#}");
            None
        }
    };

    let path = socket.unwrap_or_else(|| sockets.path(Interface::App));
    let handler = Arc::new(AppHandler::new(Arc::clone(&view), bus.clone(), helper.clone()));
    let listener = RpcListener::bind(&path, handler, ProcessLifecycle::new())
        .with_context(|| format!("binding {}", path.display()))?;
    let endpoint = listener.endpoint().clone();

    let cancel = CancellationToken::new();
    let listener_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { listener.run(cancel).await })
    };

    let service = sockets.open(Interface::Service).await?;
    service
        .publish_peer_endpoint(PeerRole::ForegroundApp, endpoint.clone())
        .await
        .context("publishing app endpoint")?;
    tracing::info!(endpoint = %endpoint.id, path = %path.display(), "app endpoint published");

    bus.publish(None, MountEvent::ClientConfigured(endpoint.id.to_hex()));
    bus.publish(
        None,
        MountEvent::UserConfigured(email.unwrap_or_else(whoami::username)),
    );

    if let Some(helper) = &helper {
        for stream in [DiagnosticStream::Errors, DiagnosticStream::Logs] {
            if let Err(e) = helper.forward_diagnostics(stream, endpoint.clone()).await {
                log::warn!("helper will not forward {stream}: {e}");
            }
        }
    }
    let watcher = helper.map(|helper| MountWatcher::spawn(helper, bus.clone(), interval));

    deliver_until_done(&mut pump, watcher.as_ref()).await?;

    if let Err(e) = service.withdraw_peer_endpoint(PeerRole::ForegroundApp).await {
        log::warn!("withdraw failed: {e}");
    }
    if let Some(watcher) = watcher {
        watcher.stop().await;
    }
    cancel.cancel();
    if let Err(e) = listener_task.await {
        log::warn!("listener task failed: {e}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LocalHelper;

    #[test]
    fn test_socket_paths() {
        let sockets = Sockets::new(Some(PathBuf::from("/run/mp")));
        assert_eq!(
            sockets.path(Interface::MountHelper),
            PathBuf::from("/run/mp/helper.sock")
        );
        assert_eq!(sockets.path(Interface::App), PathBuf::from("/run/mp/app.sock"));
    }

    #[test]
    fn test_default_label() {
        assert_eq!(default_label(Path::new("/Volumes/Work/")), "Work");
        assert_eq!(default_label(Path::new("/")), "mount");
    }

    #[tokio::test]
    async fn test_connect_reports_observed_phase() {
        let helper = LocalHelper::start();
        helper.create().await;
        let resolve = helper.transport.push_manual();

        let first = helper.client().await;
        let pending = tokio::spawn(async move { first.connect().await });
        helper.transport.connect_started().await;

        let second = helper.client().await;
        assert_eq!(connect_and_report(&second).await.unwrap(), "connecting");

        resolve.send(Ok(())).unwrap();
        pending.await.unwrap().unwrap();
        assert_eq!(connect_and_report(&second).await.unwrap(), "connected");
        assert_eq!(helper.transport.connects(), 1);
    }

    #[tokio::test]
    async fn test_kill_command_trips_helper() {
        let helper = LocalHelper::start();
        let cli = Cli {
            socket_dir: Some(helper.socket_dir()),
            command: Command::Kill,
        };
        let (bus, pump) = MountEventBus::new();
        run(cli, pump, bus).await.unwrap();
        assert!(helper.killed());
    }

    #[test]
    fn test_describe_status() {
        let text = describe_status(false, true, false, true);
        assert!(text.contains("phase:     connecting"));
        assert!(text.contains("use_cache: true"));
        assert!(describe_status(true, true, true, false).contains("connected"));
    }

    #[tokio::test]
    async fn test_status_against_missing_helper() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli {
            socket_dir: Some(dir.path().to_path_buf()),
            command: Command::Status,
        };
        let (bus, pump) = MountEventBus::new();
        let err = run(cli, pump, bus).await.unwrap_err();
        assert!(format!("{err:#}").contains("helper.sock"));
    }
}
