//! Mount lifecycle events and their bus subjects.
//!
//! Subjects are dot-separated so subscribers can filter with NATS-style
//! patterns (`mount.*`, `app.>`).

use serde::{Deserialize, Serialize};

use crate::diagnostic::Diagnostic;
use crate::ids::MountId;
use crate::mount::MountDetails;

pub const SUBJECT_MOUNTED: &str = "mount.mounted";
pub const SUBJECT_UNMOUNTED: &str = "mount.unmounted";
pub const SUBJECT_DETAILS: &str = "mount.details";
pub const SUBJECT_CLIENT_CONFIGURED: &str = "app.client_configured";
pub const SUBJECT_USER_CONFIGURED: &str = "app.user_configured";
pub const SUBJECT_DIAGNOSTIC: &str = "app.diagnostic";

/// Trait for payloads that know their subject.
pub trait HasSubject {
    fn subject(&self) -> &str;
}

/// Something that happened to a mount or to the app's configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountEvent {
    Mounted,
    Unmounted,
    MountDetailsChanged(MountDetails),
    /// The client id was assigned.
    ClientConfigured(String),
    /// A user account was configured, carries the email.
    UserConfigured(String),
    /// The helper forwarded a transport error or log line.
    Diagnostic(Diagnostic),
}

impl HasSubject for MountEvent {
    fn subject(&self) -> &str {
        match self {
            Self::Mounted => SUBJECT_MOUNTED,
            Self::Unmounted => SUBJECT_UNMOUNTED,
            Self::MountDetailsChanged(_) => SUBJECT_DETAILS,
            Self::ClientConfigured(_) => SUBJECT_CLIENT_CONFIGURED,
            Self::UserConfigured(_) => SUBJECT_USER_CONFIGURED,
            Self::Diagnostic(_) => SUBJECT_DIAGNOSTIC,
        }
    }
}

/// A published event as observers receive it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// The mount the event concerns; `None` for app-level events.
    pub mount: Option<MountId>,
    /// Monotonic per-bus publish sequence number.
    pub seq: u64,
    pub event: MountEvent,
}

impl HasSubject for Envelope {
    fn subject(&self) -> &str {
        self.event.subject()
    }
}
