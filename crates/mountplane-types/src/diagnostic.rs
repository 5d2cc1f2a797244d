//! Transport diagnostics the helper forwards to the foreground app.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::wire::ErrorKind;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
    EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

/// One line from the transport side of a mount.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Diagnostic {
    /// A failure the user should see.
    Error { message: String, kind: ErrorKind },
    Log {
        message: String,
        module: String,
        level: LogLevel,
    },
}

impl Diagnostic {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            kind,
        }
    }

    pub fn log(level: LogLevel, module: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Log {
            message: message.into(),
            module: module.into(),
            level,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Error { message, .. } | Self::Log { message, .. } => message,
        }
    }
}

/// Which diagnostics a forwarding sink receives.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum DiagnosticStream {
    Errors,
    Logs,
}

impl DiagnosticStream {
    pub fn carries(self, diagnostic: &Diagnostic) -> bool {
        match self {
            Self::Errors => diagnostic.is_error(),
            Self::Logs => !diagnostic.is_error(),
        }
    }
}
