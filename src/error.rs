//! ==============================================================================
//! error.rs - error taxonomy for the sensor host
//! ==============================================================================
//!
//! purpose:
//!     one error enum per subsystem so each caller can decide what is fatal.
//!
//! severity policy:
//!     - ControllerError: construction-time, aborts one controller's startup.
//!     - AcquisitionError: transient, counted by the failure tracker.
//!     - LockError: aborts the current acquisition for one tick only.
//!     - SinkError: logged as an error, the iteration is skipped.
//!     - TickError: contained at the loop boundary unless it is exhaustion.
//!
//! ==============================================================================

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("'{0}' is not a valid device kind")]
    UnknownDeviceKind(String),
    #[error("device {device}: {reason}")]
    InvalidDevice { device: String, reason: String },
    #[error("device {0}: failed to register edge detection: {1}")]
    EdgeSetup(String, String),
    #[error("controller is not running")]
    NotRunning,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {resource}: still held after forced break ({reason})")]
    Contended { resource: String, reason: String },
    #[error("lock {resource}: io error: {source}")]
    Io {
        resource: String,
        #[source]
        source: std::io::Error,
    },
    #[error("lock {resource}: timed out after {waited:?}")]
    Timeout { resource: String, waited: Duration },
}

impl LockError {
    pub fn io(resource: &str, source: std::io::Error) -> Self {
        Self::Io { resource: resource.to_string(), source }
    }
}

/// a read that did not produce a sample. never fatal to the controller.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("sensor returned no reading: {0}")]
    NoReading(String),
    #[error("failed to parse sensor output: {0}")]
    Parse(String),
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("bus lock unavailable: {0}")]
    Lock(#[from] LockError),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response: {0}")]
    Response(String),
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("unknown {kind} id {id}")]
    UnknownTarget { kind: &'static str, id: String },
    #[error("command failed: {0}")]
    Command(String),
    #[error("camera capture failed: {0}")]
    Camera(String),
    #[error("actuator failed: {0}")]
    Actuator(String),
}

/// error escaping one tick body.
#[derive(Debug, Error)]
pub enum TickError {
    #[error("sample sink: {0}")]
    Sink(#[from] SinkError),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

/// EMFILE / ENFILE / ENOMEM are treated as exhaustion, everything else is transient.
pub fn is_exhaustion_io(err: &std::io::Error) -> bool {
    matches!(err.raw_os_error(), Some(12) | Some(23) | Some(24))
        || err.kind() == std::io::ErrorKind::OutOfMemory
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_classification() {
        assert!(is_exhaustion_io(&std::io::Error::from_raw_os_error(24)));
        assert!(!is_exhaustion_io(&std::io::Error::from_raw_os_error(2)));
    }
}
