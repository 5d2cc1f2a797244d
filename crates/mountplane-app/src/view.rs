//! What the foreground process believes about the mount.
//!
//! Fed only from the local bus, so every field changes on the delivery
//! thread. Other threads (the App endpoint's handlers) read it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use mountplane_kernel::{BusError, MountEventBus, Subscription};
use mountplane_types::{Diagnostic, Envelope, MountEvent, ObserverId};

#[derive(Debug, Default)]
pub struct MountView {
    mounted: AtomicBool,
    transitions: AtomicU64,
    last_seq: AtomicU64,
    client_id: RwLock<Option<String>>,
    user: RwLock<Option<String>>,
    last_error: RwLock<Option<String>>,
}

impl MountView {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    /// Number of mounted/unmounted transitions seen.
    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::Acquire)
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq.load(Ordering::Acquire)
    }

    pub fn client_id(&self) -> Option<String> {
        self.client_id.read().clone()
    }

    pub fn user(&self) -> Option<String> {
        self.user.read().clone()
    }

    /// Most recent transport error the helper forwarded.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn apply(&self, envelope: &Envelope) {
        self.last_seq.store(envelope.seq, Ordering::Release);
        match &envelope.event {
            MountEvent::Mounted => self.set_mounted(true),
            MountEvent::Unmounted => self.set_mounted(false),
            MountEvent::MountDetailsChanged(details) => {
                self.set_mounted(details.phase.is_connected());
            }
            MountEvent::ClientConfigured(id) => *self.client_id.write() = Some(id.clone()),
            MountEvent::UserConfigured(email) => *self.user.write() = Some(email.clone()),
            MountEvent::Diagnostic(Diagnostic::Error { message, .. }) => {
                *self.last_error.write() = Some(message.clone());
            }
            MountEvent::Diagnostic(Diagnostic::Log { .. }) => {}
        }
    }

    fn set_mounted(&self, mounted: bool) {
        if self.mounted.swap(mounted, Ordering::AcqRel) != mounted {
            self.transitions.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Subscribe to every mount and app subject on `bus`.
    ///
    /// The view stays attached while the returned subscriptions live.
    pub fn attach(self: &Arc<Self>, bus: &MountEventBus) -> Result<Vec<Subscription>, BusError> {
        let observer = ObserverId::new();
        ["mount.*", "app.*"]
            .into_iter()
            .map(|pattern| {
                let view = Arc::clone(self);
                bus.subscribe(observer, pattern, move |envelope| view.apply(envelope))
            })
            .collect()
    }
}
