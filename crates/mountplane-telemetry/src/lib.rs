//! OpenTelemetry integration for mountplane.
//!
//! Provides OTel tracing layer setup, W3C Trace Context propagation across the
//! Unix-socket boundary between mountplane processes, per-mount root spans, and
//! a sampler that keeps every mount and transport span.
//!
//! # Activation
//!
//! Build with the `telemetry` feature. Export then activates when standard OTel
//! environment variables are set:
//!
//! ```bash
//! # Minimal: OTLP export to localhost:4317
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4317 mountplane-server helper
//!
//! # Full control
//! OTEL_SERVICE_NAME=mountplane-helper \
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://jaeger:4317 \
//! OTEL_TRACES_EXPORTER=otlp \
//! mountplane-server helper
//! ```
//!
//! Set `OTEL_SDK_DISABLED=true` to explicitly disable even when the endpoint is set.
//!
//! Without the feature every function here still exists: propagation yields
//! empty carriers and spans are plain local `tracing` spans.

#[cfg(feature = "telemetry")]
mod otel;

#[cfg(feature = "telemetry")]
pub use otel::{OtelGuard, otel_layer};

/// Errors from telemetry setup.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("failed to build OTLP exporter: {0}")]
    Exporter(String),
}

/// Check whether OTel export should be enabled.
///
/// Returns `true` when standard OTel env vars indicate export is desired:
/// - `OTEL_SDK_DISABLED` is NOT set to `"true"`
/// - AND at least one of:
///   - `OTEL_EXPORTER_OTLP_ENDPOINT` is set
///   - `OTEL_TRACES_EXPORTER` is set (and not `"none"`)
pub fn otel_enabled() -> bool {
    if std::env::var("OTEL_SDK_DISABLED")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
    {
        return false;
    }

    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        return true;
    }

    if let Ok(exporter) = std::env::var("OTEL_TRACES_EXPORTER") {
        return !exporter.eq_ignore_ascii_case("none");
    }

    false
}

/// Inject W3C Trace Context from the current tracing span.
///
/// Returns `(traceparent, tracestate)` to ride inside a request frame.
pub fn inject_trace_context() -> (String, String) {
    #[cfg(feature = "telemetry")]
    {
        otel::inject_trace_context_impl()
    }
    #[cfg(not(feature = "telemetry"))]
    {
        (String::new(), String::new())
    }
}

/// Extract W3C Trace Context and create a child span linked to the remote parent.
pub fn extract_trace_context(traceparent: &str, tracestate: &str) -> tracing::Span {
    #[cfg(feature = "telemetry")]
    {
        otel::extract_trace_context_impl(traceparent, tracestate)
    }
    #[cfg(not(feature = "telemetry"))]
    {
        let _ = (traceparent, tracestate);
        tracing::info_span!("rpc.request")
    }
}

/// Create a span under a mount's long-running trace.
///
/// Every operation on one mount (create, connect, the eventual disconnect)
/// shares a single trace keyed by the mount id bytes. The span name identifies
/// the operation.
///
/// Pass `[0u8; 16]` to get a detached span (no mount trace linkage).
pub fn mount_root_span(mount_id: &[u8; 16], name: &'static str) -> tracing::Span {
    #[cfg(feature = "telemetry")]
    {
        otel::mount_root_span_impl(mount_id, name)
    }
    #[cfg(not(feature = "telemetry"))]
    {
        if *mount_id == [0u8; 16] {
            return tracing::Span::none();
        }
        tracing::info_span!("mount", method = name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_root_span() {
        assert!(mount_root_span(&[0u8; 16], "connect").is_none());
    }

    #[cfg(not(feature = "telemetry"))]
    #[test]
    fn test_inject_without_feature_is_empty() {
        assert_eq!(inject_trace_context(), (String::new(), String::new()));
    }
}
