//! MountEventBus: typed pub/sub that delivers on one designated thread.
//!
//! Publishers may live on any thread (the supervisor actor, a watcher task, a
//! CLI command). Observers are UI-ish code that must only ever run on one
//! thread, so delivery is split from publishing:
//!
//! ```text
//!   publish() (any thread)          queue            DeliveryPump (one thread)
//!   ┌──────────────────────┐  ───────────────▶  ┌──────────────────────────┐
//!   │ snapshot subscribers │   Envelope + the   │ pump(): drain, no block  │
//!   │ assign seq, enqueue  │   matched targets  │ run(): block until closed│
//!   └──────────────────────┘                    └──────────────────────────┘
//! ```
//!
//! # Pattern Matching
//!
//! Subjects are dot-separated tokens (`mount.mounted`). Patterns use NATS-style
//! wildcards:
//! - `*` matches exactly one token: `mount.*` matches `mount.mounted` but not `mount.a.b`
//! - `>` matches one or more tokens (only at end): `app.>` matches `app.user_configured`
//!
//! Subscribers are snapshotted at publish time: a subscriber added afterwards
//! does not see the event, and one dropped before delivery is skipped. There is
//! no replay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::ThreadId;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use mountplane_types::{Envelope, HasSubject, MountEvent, MountId, ObserverId};

/// Errors from bus registration and delivery.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BusError {
    #[error("observer {observer} already subscribed to {pattern}")]
    DuplicateSubscription {
        observer: ObserverId,
        pattern: String,
    },
    #[error("delivery pump used off its designated thread")]
    WrongThread,
}

// ============================================================================
// Pattern Matching
// ============================================================================

/// Check if a subject matches a pattern.
pub fn matches_pattern(pattern: &str, subject: &str) -> bool {
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();
    let subject_tokens: Vec<&str> = subject.split('.').collect();

    let mut pi = 0;
    let mut si = 0;

    while pi < pattern_tokens.len() && si < subject_tokens.len() {
        match pattern_tokens[pi] {
            // `>` must be last and swallows the remaining (at least one) tokens
            ">" => return pi == pattern_tokens.len() - 1,
            "*" => {
                pi += 1;
                si += 1;
            }
            token => {
                if token != subject_tokens[si] {
                    return false;
                }
                pi += 1;
                si += 1;
            }
        }
    }

    pi == pattern_tokens.len() && si == subject_tokens.len()
}

// ============================================================================
// Bus
// ============================================================================

type Callback = Box<dyn Fn(&Envelope) + Send + Sync>;

struct Subscriber {
    observer: ObserverId,
    pattern: String,
    alive: AtomicBool,
    callback: Callback,
}

struct Delivery {
    envelope: Envelope,
    targets: Vec<Arc<Subscriber>>,
}

struct BusInner {
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    /// Sequence counter and sender under one lock so queue order matches seq order.
    queue: Mutex<(u64, mpsc::UnboundedSender<Delivery>)>,
    delivery_thread: Arc<OnceLock<ThreadId>>,
}

/// Cheap-to-clone publish/subscribe handle.
#[derive(Clone)]
pub struct MountEventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for MountEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountEventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl MountEventBus {
    /// Create a bus and the pump that must be driven from the delivery thread.
    pub fn new() -> (Self, DeliveryPump) {
        let (tx, rx) = mpsc::unbounded_channel();
        let delivery_thread = Arc::new(OnceLock::new());
        let bus = Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(Vec::new()),
                queue: Mutex::new((0, tx)),
                delivery_thread: Arc::clone(&delivery_thread),
            }),
        };
        let pump = DeliveryPump {
            rx,
            delivery_thread,
        };
        (bus, pump)
    }

    /// Register `callback` for subjects matching `pattern`.
    ///
    /// The returned [`Subscription`] unregisters when dropped.
    pub fn subscribe<F>(
        &self,
        observer: ObserverId,
        pattern: impl Into<String>,
        callback: F,
    ) -> Result<Subscription, BusError>
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let pattern = pattern.into();
        let mut subscribers = self.inner.subscribers.write();
        if subscribers
            .iter()
            .any(|s| s.observer == observer && s.pattern == pattern)
        {
            return Err(BusError::DuplicateSubscription { observer, pattern });
        }
        subscribers.push(Arc::new(Subscriber {
            observer,
            pattern: pattern.clone(),
            alive: AtomicBool::new(true),
            callback: Box::new(callback),
        }));
        tracing::debug!(%observer, %pattern, "bus.subscribe");

        Ok(Subscription {
            bus: Arc::downgrade(&self.inner),
            observer,
            pattern,
        })
    }

    /// Enqueue `event` for every subscriber registered right now.
    ///
    /// Returns immediately with the event's sequence number.
    pub fn publish(&self, mount: Option<MountId>, event: MountEvent) -> u64 {
        let targets: Vec<Arc<Subscriber>> = {
            let subject = event.subject();
            self.inner
                .subscribers
                .read()
                .iter()
                .filter(|s| matches_pattern(&s.pattern, subject))
                .cloned()
                .collect()
        };

        let mut queue = self.inner.queue.lock();
        queue.0 += 1;
        let seq = queue.0;
        let subject = event.subject().to_string();
        let delivery = Delivery {
            envelope: Envelope { mount, seq, event },
            targets,
        };
        if queue.1.send(delivery).is_err() {
            tracing::debug!(%subject, seq, "bus.publish with no delivery pump");
        } else {
            tracing::trace!(%subject, seq, "bus.publish");
        }
        seq
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// True when called on the thread that drives the [`DeliveryPump`].
    pub fn is_delivery_thread(&self) -> bool {
        self.inner.delivery_thread.get() == Some(&std::thread::current().id())
    }

    /// Panic unless called on the delivery thread.
    pub fn assert_delivery_thread(&self) {
        assert!(
            self.is_delivery_thread(),
            "MountEventBus observer ran off the delivery thread"
        );
    }
}

/// Registration handle; unregisters on drop.
#[must_use = "dropping a Subscription unregisters it"]
pub struct Subscription {
    bus: Weak<BusInner>,
    observer: ObserverId,
    pattern: String,
}

impl Subscription {
    pub fn observer(&self) -> ObserverId {
        self.observer
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Explicit form of dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        let mut subscribers = bus.subscribers.write();
        subscribers.retain(|s| {
            let hit = s.observer == self.observer && s.pattern == self.pattern;
            if hit {
                // Deliveries already queued for this subscriber are skipped.
                s.alive.store(false, Ordering::Release);
            }
            !hit
        });
        tracing::debug!(observer = %self.observer, pattern = %self.pattern, "bus.unsubscribe");
    }
}

// ============================================================================
// Delivery
// ============================================================================

/// Drains the bus queue and invokes callbacks, in publish order.
///
/// The first thread to call [`pump`](Self::pump) or [`run`](Self::run) becomes
/// the delivery thread for the life of the bus.
pub struct DeliveryPump {
    rx: mpsc::UnboundedReceiver<Delivery>,
    delivery_thread: Arc<OnceLock<ThreadId>>,
}

impl DeliveryPump {
    fn claim_thread(&self) -> Result<(), BusError> {
        let current = std::thread::current().id();
        let owner = *self.delivery_thread.get_or_init(|| current);
        if owner == current {
            Ok(())
        } else {
            Err(BusError::WrongThread)
        }
    }

    fn deliver(delivery: Delivery) {
        for target in delivery.targets {
            if target.alive.load(Ordering::Acquire) {
                (target.callback)(&delivery.envelope);
            }
        }
    }

    /// Deliver everything queued right now without blocking.
    /// Returns the number of envelopes processed.
    pub fn pump(&mut self) -> Result<usize, BusError> {
        self.claim_thread()?;
        let mut count = 0;
        while let Ok(delivery) = self.rx.try_recv() {
            Self::deliver(delivery);
            count += 1;
        }
        Ok(count)
    }

    /// Block the current thread delivering until every bus handle is dropped.
    ///
    /// Must not be called from inside an async runtime.
    pub fn run(mut self) -> Result<(), BusError> {
        self.claim_thread()?;
        while let Some(delivery) = self.rx.blocking_recv() {
            Self::deliver(delivery);
        }
        tracing::debug!("delivery pump finished: bus closed");
        Ok(())
    }

    /// Wait for the next envelope, deliver it plus anything else queued.
    ///
    /// For a delivery thread that also runs a current-thread runtime. Returns
    /// `Ok(false)` once the bus is closed.
    pub async fn pump_next(&mut self) -> Result<bool, BusError> {
        self.claim_thread()?;
        match self.rx.recv().await {
            Some(delivery) => {
                Self::deliver(delivery);
                self.pump()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
