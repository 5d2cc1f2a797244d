//! MountSupervisor: owns the process's one mount and drives its lifecycle.
//!
//! All mutation goes through a single actor task, so transitions on a mount are
//! totally ordered. Transport I/O never runs inside the actor: a connect is
//! spawned and reports back through the same channel tagged with the epoch it
//! started under. Anything that bumped the epoch in the meantime (a
//! disconnect, another connect) makes the outcome stale, and a stale success
//! is torn down instead of resurrecting `connected`.
//!
//! ```text
//!   MountSupervisor (Clone)     mpsc      SupervisorActor (tokio task)
//!   ┌─────────────────────┐  ────────▶  ┌──────────────────────────────┐
//!   │ .create()/.connect()│             │ SharedMountState slot        │
//!   │ .set_*()            │  ◀────────  │ termination guards           │
//!   │ queries read slot   │   oneshot   │ epoch-checked connect tasks  │
//!   └─────────────────────┘             └──────────────────────────────┘
//! ```
//!
//! Queries (`connected`, `use_cache`, ...) read the shared slot directly and
//! never wait on the actor.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

use mountplane_types::{
    Diagnostic, ErrorKind, LogLevel, MountConfig, MountDetails, MountEvent, MountId, MountPhase,
    is_valid_mountpoint, normalize_mountpoint,
};

use crate::bus::MountEventBus;
use crate::diagnostics::DiagnosticsHub;
use crate::error::{SupervisorError, SupervisorResult};
use crate::lifecycle::{ProcessLifecycle, TerminationGuard};
use crate::state::{MountState, SharedMountState};
use crate::transport::{MountTransport, TransportError};

type Slot = Arc<RwLock<Option<Arc<SharedMountState>>>>;
type Reply<T> = oneshot::Sender<SupervisorResult<T>>;

// ============================================================================
// Commands (internal)
// ============================================================================

enum Command {
    Create {
        config: MountConfig,
        reply: Reply<MountId>,
    },
    Connect {
        reply: Reply<()>,
    },
    ConnectResolved {
        mount: MountId,
        epoch: u64,
        outcome: Result<(), TransportError>,
        _op_guard: TerminationGuard,
    },
    Disconnect {
        reply: Reply<()>,
    },
    SetIcon {
        path: Option<PathBuf>,
        reply: Reply<()>,
    },
    SetUseCache {
        enabled: bool,
        reply: Reply<()>,
    },
    SetMountpoint {
        path: PathBuf,
        reply: Reply<()>,
    },
    SetFingerprints {
        fingerprints: Vec<String>,
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

// ============================================================================
// MountSupervisor (public handle)
// ============================================================================

/// Handle to the process-wide mount supervisor.
///
/// Clone freely; every clone talks to the same actor and the same state.
#[derive(Clone)]
pub struct MountSupervisor {
    tx: mpsc::UnboundedSender<Command>,
    slot: Slot,
    events: Option<MountEventBus>,
    diagnostics: DiagnosticsHub,
}

impl std::fmt::Debug for MountSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountSupervisor")
            .field("mount", &self.current().map(|s| s.id()))
            .finish()
    }
}

impl MountSupervisor {
    /// Spawn the supervisor actor on the current tokio runtime.
    pub fn spawn(
        transport: Arc<dyn MountTransport>,
        lifecycle: Arc<ProcessLifecycle>,
        events: Option<MountEventBus>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let slot: Slot = Arc::new(RwLock::new(None));
        let diagnostics = DiagnosticsHub::new();
        let actor = SupervisorActor {
            slot: Arc::clone(&slot),
            transport,
            lifecycle,
            events: events.clone(),
            diagnostics: diagnostics.clone(),
            tx: tx.downgrade(),
            mount_guard: None,
            in_flight: None,
            last_teardown: None,
        };
        tokio::spawn(actor.run(rx));
        Self {
            tx,
            slot,
            events,
            diagnostics,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> SupervisorResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| SupervisorError::Shutdown)?;
        rx.await.map_err(|_| SupervisorError::Shutdown)?
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Install a fresh mount, replacing an idle one.
    pub async fn create(&self, config: MountConfig) -> SupervisorResult<MountId> {
        self.request(|reply| Command::Create { config, reply }).await
    }

    /// Connect the current mount. Resolves when the transport does.
    pub async fn connect(&self) -> SupervisorResult<()> {
        self.request(|reply| Command::Connect { reply }).await
    }

    /// Force the mount to `Disconnected` and tear the session down.
    pub async fn disconnect(&self) -> SupervisorResult<()> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Disconnect if needed and forget the mount, credentials included.
    ///
    /// Resolves once every pending transport teardown has finished.
    pub async fn shutdown(&self) -> SupervisorResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    // ── State mutations ──────────────────────────────────────────────────

    pub async fn set_icon(&self, path: Option<PathBuf>) -> SupervisorResult<()> {
        self.request(|reply| Command::SetIcon { path, reply }).await
    }

    pub async fn set_use_cache(&self, enabled: bool) -> SupervisorResult<()> {
        self.request(|reply| Command::SetUseCache { enabled, reply })
            .await
    }

    pub async fn set_mountpoint(&self, path: PathBuf) -> SupervisorResult<()> {
        self.request(|reply| Command::SetMountpoint { path, reply })
            .await
    }

    pub async fn set_fingerprints(&self, fingerprints: Vec<String>) -> SupervisorResult<()> {
        self.request(|reply| Command::SetFingerprints {
            fingerprints,
            reply,
        })
        .await
    }

    // ── Queries (never wait on the actor) ────────────────────────────────

    fn current(&self) -> Option<Arc<SharedMountState>> {
        self.slot.read().clone()
    }

    pub fn use_cache(&self) -> bool {
        self.current().is_some_and(|s| s.use_cache())
    }

    pub fn connected(&self) -> bool {
        self.current().is_some_and(|s| s.connected())
    }

    pub fn connecting(&self) -> bool {
        self.current().is_some_and(|s| s.connecting())
    }

    /// Alias of [`connected`](Self::connected), the app-facing name.
    pub fn mounted(&self) -> bool {
        self.connected()
    }

    /// Alias of [`connecting`](Self::connecting).
    pub fn mounting(&self) -> bool {
        self.connecting()
    }

    pub fn phase(&self) -> Option<MountPhase> {
        self.current().map(|s| s.phase())
    }

    pub fn mount_id(&self) -> Option<MountId> {
        self.current().map(|s| s.id())
    }

    pub fn snapshot(&self) -> Option<MountState> {
        self.current().map(|s| s.snapshot())
    }

    pub fn details(&self) -> Option<MountDetails> {
        self.current().map(|s| s.details())
    }

    pub fn events(&self) -> Option<&MountEventBus> {
        self.events.as_ref()
    }

    /// Transport errors and log lines, for forwarding to the app.
    pub fn diagnostics(&self) -> &DiagnosticsHub {
        &self.diagnostics
    }
}

// ============================================================================
// SupervisorActor (internal)
// ============================================================================

struct InFlight {
    epoch: u64,
    previous: MountPhase,
    reply: Reply<()>,
}

struct SupervisorActor {
    slot: Slot,
    transport: Arc<dyn MountTransport>,
    lifecycle: Arc<ProcessLifecycle>,
    events: Option<MountEventBus>,
    diagnostics: DiagnosticsHub,
    /// Weak so the actor exits once every handle is dropped.
    tx: mpsc::WeakUnboundedSender<Command>,
    /// Held from create (or reconnect) until disconnect.
    mount_guard: Option<TerminationGuard>,
    in_flight: Option<InFlight>,
    /// Next connect waits for this so a teardown never lands on a fresh session.
    /// Shutdown answers only after it.
    last_teardown: Option<JoinHandle<()>>,
}

impl SupervisorActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            self.handle_command(cmd);
        }
        tracing::debug!("supervisor shutting down: channel closed");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Create { config, reply } => {
                let _ = reply.send(self.create(config));
            }
            Command::Connect { reply } => self.connect(reply),
            Command::ConnectResolved {
                mount,
                epoch,
                outcome,
                _op_guard,
            } => self.connect_resolved(mount, epoch, outcome),
            Command::Disconnect { reply } => {
                let _ = reply.send(self.disconnect());
            }
            Command::SetIcon { path, reply } => {
                let _ = reply.send(self.mutate("set_icon", |s| s.icon = path));
            }
            Command::SetUseCache { enabled, reply } => {
                let _ = reply.send(self.mutate("set_use_cache", |s| s.use_cache = enabled));
            }
            Command::SetMountpoint { path, reply } => {
                let path = normalize_mountpoint(path);
                let result = if is_valid_mountpoint(&path) {
                    self.mutate("set_mountpoint", |s| s.mountpoint = path)
                } else {
                    tracing::warn!(path = %path.display(), "set_mountpoint rejected");
                    Err(SupervisorError::InvalidMountpoint(path))
                };
                let _ = reply.send(result);
            }
            Command::SetFingerprints {
                fingerprints,
                reply,
            } => {
                let result = match self.current() {
                    Some(state) => {
                        tracing::debug!(count = fingerprints.len(), "mount.set_fingerprints");
                        state.set_fingerprints(fingerprints);
                        Ok(())
                    }
                    None => Err(SupervisorError::NotCreated),
                };
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => self.shutdown(reply),
        }
    }

    fn current(&self) -> Option<Arc<SharedMountState>> {
        self.slot.read().clone()
    }

    fn publish(&self, mount: Option<MountId>, event: MountEvent) {
        if let Some(bus) = &self.events {
            bus.publish(mount, event);
        }
    }

    #[tracing::instrument(skip_all, name = "mount.create", fields(mountpoint = %config.mountpoint.display(), label = %config.label))]
    fn create(&mut self, config: MountConfig) -> SupervisorResult<MountId> {
        if !is_valid_mountpoint(&config.mountpoint) {
            tracing::warn!("create rejected: invalid mountpoint");
            return Err(SupervisorError::InvalidMountpoint(config.mountpoint));
        }
        if let Some(current) = self.current() {
            let phase = current.phase();
            if phase.is_active() {
                tracing::warn!(mount = %current.id(), %phase, "create rejected: mount is active");
                return Err(SupervisorError::MountBusy(phase));
            }
        }

        let state = Arc::new(SharedMountState::new(config));
        let id = state.id();
        let replaced = self.slot.write().replace(Arc::clone(&state));
        // New guard first, then the old one drops: the count never touches zero.
        self.mount_guard = Some(self.lifecycle.guard());

        match replaced {
            Some(old) => tracing::info!(mount = %id, replaced = %old.id(), "mount created, replacing idle mount"),
            None => tracing::info!(mount = %id, "mount created"),
        }
        self.publish(Some(id), MountEvent::MountDetailsChanged(state.details()));
        Ok(id)
    }

    fn connect(&mut self, reply: Reply<()>) {
        let Some(state) = self.current() else {
            let _ = reply.send(Err(SupervisorError::NotCreated));
            return;
        };

        let previous = state.phase();
        if previous.is_active() {
            let _ = reply.send(Err(SupervisorError::InvalidTransition {
                op: "connect",
                phase: previous,
            }));
            return;
        }

        let (id, epoch, config, fingerprints) = state.update(|s| {
            s.phase = MountPhase::Connecting;
            s.epoch += 1;
            (s.id, s.epoch, s.config(), s.fingerprints.clone())
        });
        if self.mount_guard.is_none() {
            self.mount_guard = Some(self.lifecycle.guard());
        }
        self.in_flight = Some(InFlight {
            epoch,
            previous,
            reply,
        });

        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let op_guard = self.lifecycle.guard();
        let transport = Arc::clone(&self.transport);
        let pending_teardown = self.last_teardown.take();
        let span = tracing::info_span!("transport.connect", mount = %id, epoch, transport = transport.name());

        tracing::info!(mount = %id, epoch, from = %previous, "mount connecting");
        tokio::spawn(
            async move {
                if let Some(teardown) = pending_teardown {
                    let _ = teardown.await;
                }
                let outcome = transport.connect(&config, &fingerprints).await;
                let _ = tx.send(Command::ConnectResolved {
                    mount: id,
                    epoch,
                    outcome,
                    _op_guard: op_guard,
                });
            }
            .instrument(span),
        );
    }

    fn connect_resolved(&mut self, mount: MountId, epoch: u64, outcome: Result<(), TransportError>) {
        let state = self.current().filter(|s| s.id() == mount);
        let current = state.as_ref().is_some_and(|s| s.epoch() == epoch);

        if !current {
            match outcome {
                Ok(()) => {
                    let active = self.current().is_some_and(|s| s.phase().is_active());
                    if active {
                        // The transport holds one session, so the newer attempt replaces this one.
                        tracing::warn!(%mount, epoch, "stale connect success ignored; a newer attempt owns the session");
                    } else {
                        tracing::warn!(%mount, epoch, "stale connect success ignored; tearing down");
                        self.spawn_teardown();
                    }
                }
                Err(e) => tracing::debug!(%mount, epoch, error = %e, "stale connect failure ignored"),
            }
            return;
        }

        let Some(state) = state else {
            return;
        };
        let in_flight = self.in_flight.take().filter(|f| f.epoch == epoch);

        match outcome {
            Ok(()) => {
                state.set_phase(MountPhase::Connected);
                tracing::info!(%mount, epoch, "mount connected");
                self.report_log(LogLevel::Info, "mount connected");
                self.publish(Some(mount), MountEvent::Mounted);
                if let Some(f) = in_flight {
                    let _ = f.reply.send(Ok(()));
                }
            }
            Err(e) => {
                let previous = in_flight
                    .as_ref()
                    .map(|f| f.previous)
                    .unwrap_or(MountPhase::Disconnected);
                state.set_phase(previous);
                if previous == MountPhase::Disconnected {
                    self.mount_guard = None;
                }
                tracing::warn!(%mount, epoch, error = %e, "mount connect failed");
                self.diagnostics
                    .report(Diagnostic::error(ErrorKind::TransportFailure, e.to_string()));
                if let Some(f) = in_flight {
                    let _ = f.reply.send(Err(SupervisorError::Transport(e)));
                }
            }
        }
    }

    #[tracing::instrument(skip_all, name = "mount.disconnect")]
    fn disconnect(&mut self) -> SupervisorResult<()> {
        let Some(state) = self.current() else {
            return Err(SupervisorError::NotCreated);
        };

        let (id, was) = state.update(|s| {
            let was = s.phase;
            s.phase = MountPhase::Disconnected;
            s.epoch += 1;
            (s.id, was)
        });

        if let Some(f) = self.in_flight.take() {
            let _ = f.reply.send(Err(SupervisorError::Cancelled));
        }

        if was.is_active() {
            // Teardown takes its guard before the mount guard goes.
            self.spawn_teardown();
            self.mount_guard = None;
            tracing::info!(mount = %id, from = %was, "mount disconnected");
            self.report_log(LogLevel::Info, "mount disconnected");
            self.publish(Some(id), MountEvent::Unmounted);
        } else {
            self.mount_guard = None;
            tracing::debug!(mount = %id, from = %was, "disconnect on idle mount");
        }
        Ok(())
    }

    fn shutdown(&mut self, reply: Reply<()>) {
        let result = match self.current() {
            Some(_) => self.disconnect(),
            None => Ok(()),
        };
        // Drops the credentials along with the state.
        if let Some(old) = self.slot.write().take() {
            tracing::info!(mount = %old.id(), "mount released");
        }

        let pending = self.last_teardown.take();
        self.last_teardown = Some(tokio::spawn(async move {
            if let Some(teardown) = pending {
                let _ = teardown.await;
            }
            let _ = reply.send(result);
        }));
    }

    fn spawn_teardown(&mut self) {
        let transport = Arc::clone(&self.transport);
        let diagnostics = self.diagnostics.clone();
        let op_guard = self.lifecycle.guard();
        let previous = self.last_teardown.take();
        self.last_teardown = Some(tokio::spawn(
            async move {
                let _op_guard = op_guard;
                if let Some(previous) = previous {
                    let _ = previous.await;
                }
                if let Err(e) = transport.disconnect().await {
                    tracing::warn!(error = %e, "transport teardown failed");
                    diagnostics.report(Diagnostic::error(ErrorKind::TransportFailure, e.to_string()));
                }
            }
            .instrument(tracing::info_span!("transport.disconnect")),
        ));
    }

    fn report_log(&self, level: LogLevel, message: &str) {
        self.diagnostics
            .report(Diagnostic::log(level, self.transport.name(), message));
    }

    fn mutate(
        &mut self,
        op: &'static str,
        f: impl FnOnce(&mut MountState),
    ) -> SupervisorResult<()> {
        let Some(state) = self.current() else {
            return Err(SupervisorError::NotCreated);
        };
        let details = state.update(|s| {
            f(s);
            s.details()
        });
        tracing::debug!(mount = %details.id, op, "mount details changed");
        self.publish(Some(details.id), MountEvent::MountDetailsChanged(details));
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
