//! Diagnostics for administrative calls.
//!
//! Telemetry failures never block an administrative call: callers log and
//! drop them.

use thiserror::Error;

#[derive(Debug, Error)]
#[error("telemetry unavailable: {0}")]
pub struct TelemetryError(pub String);

pub trait Telemetry: Send + Sync {
    fn track_trace(&self, message: &str) -> Result<(), TelemetryError>;
    fn track_exception(&self, error: &dyn std::error::Error) -> Result<(), TelemetryError>;
}

/// Forwards telemetry to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn track_trace(&self, message: &str) -> Result<(), TelemetryError> {
        tracing::info!(target: "mwt_admin::telemetry", "{message}");
        Ok(())
    }

    fn track_exception(&self, error: &dyn std::error::Error) -> Result<(), TelemetryError> {
        tracing::error!(target: "mwt_admin::telemetry", error = %error, "exception tracked");
        Ok(())
    }
}

/// Reports telemetry through `telemetry`, swallowing its failures.
pub(crate) fn trace_best_effort(telemetry: &dyn Telemetry, message: &str) {
    if let Err(err) = telemetry.track_trace(message) {
        tracing::warn!(error = %err, "telemetry trace dropped");
    }
}

pub(crate) fn exception_best_effort(telemetry: &dyn Telemetry, error: &dyn std::error::Error) {
    if let Err(err) = telemetry.track_exception(error) {
        tracing::warn!(error = %err, "telemetry exception dropped");
    }
}
