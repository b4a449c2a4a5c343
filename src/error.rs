//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole capture
//! engine. Using the `thiserror` crate, it provides a centralized and consistent
//! way to handle the different kinds of failure a calibration run can hit.
//!
//! ## Error Hierarchy
//!
//! - **`Config` / `Configuration`**: the settings could not be loaded, or a value
//!   (server address, frame-set string, tolerance) is out of range. These are caught
//!   before any network activity.
//! - **`Transport` / `ShortWrite` / `ExchangeTimeout`**: transport failures while
//!   dialing, writing to or reading from the TheSkyX server. Each names the
//!   operation whose exchange failed, e.g. `get temperature`. A server that closes
//!   the socket without replying is a `Transport` error of kind `UnexpectedEof`.
//! - **`Io`**: any other local I/O failure.
//! - **`Remote` / `MalformedReply` / `NumericParse` / `NotConnected`**: protocol-level
//!   failures. The remote reported an error status, sent a reply without the
//!   `payload|status` delimiter, replied with something that is not a number, or an
//!   operation was attempted on a closed logical session.
//! - **`CoolingTimeout` / `ExposureTimeout`**: one of the bounded poll loops gave up.
//! - **`DriftAbort`**: the camera temperature left the allowed band during capture.
//!   This is a policy decision rather than an instrument fault; use
//!   [`DaqError::is_drift_abort`] to tell it apart.
//! - **`Persistence` / `CorruptState`**: the state file could not be written or read
//!   back. Both are fatal since losing progress would risk duplicate captures.
//!
//! None of these are retried at the layer that raises them. The run stops, the last
//! checkpoint is already on disk, and re-running the capture resumes from it.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Which kind of frame was being captured when a drift abort fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Zero-length readout frame.
    Bias,
    /// Timed exposure with the shutter closed.
    Dark,
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameKind::Bias => write!(f, "bias"),
            FrameKind::Dark => write!(f, "dark"),
        }
    }
}

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{operation}: TheSkyX transport error: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation}: short write to TheSkyX server, wrote {written} of {expected} bytes")]
    ShortWrite {
        operation: &'static str,
        written: usize,
        expected: usize,
    },

    #[error("{operation}: no reply from TheSkyX server within {timeout:?}")]
    ExchangeTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("TheSkyX error: {0}")]
    Remote(String),

    #[error("Malformed reply from TheSkyX server: '{0}'")]
    MalformedReply(String),

    #[error("Error parsing numeric result '{0}'")]
    NumericParse(String),

    #[error("Connection to TheSkyX not open")]
    NotConnected,

    #[error("Timed out waiting for target temperature after {minutes} minutes")]
    CoolingTimeout { minutes: u32 },

    #[error("Timeout waiting for capture to finish after {waited} seconds of polling")]
    ExposureTimeout { waited: u64 },

    #[error("Abandoning {kind} frame capture: temperature {temperature:.1} drifted too far from target {target:.1}")]
    DriftAbort {
        kind: FrameKind,
        temperature: f64,
        target: f64,
    },

    #[error("State file write failed: {0}")]
    Persistence(String),

    #[error("State file is corrupt: {0}")]
    CorruptState(#[from] serde_json::Error),
}

impl DaqError {
    /// True for the designed-for temperature drift abandon, false for real faults.
    pub fn is_drift_abort(&self) -> bool {
        matches!(self, DaqError::DriftAbort { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Remote("camera not connected".to_string());
        assert_eq!(err.to_string(), "TheSkyX error: camera not connected");
    }

    #[test]
    fn test_drift_abort_is_distinguishable() {
        let err = DaqError::DriftAbort {
            kind: FrameKind::Dark,
            temperature: -5.0,
            target: -10.0,
        };
        assert!(err.is_drift_abort());
        assert!(err.to_string().contains("dark frame capture"));
        assert!(!DaqError::ExposureTimeout { waited: 126 }.is_drift_abort());
    }

    #[test]
    fn test_short_write_message() {
        let err = DaqError::ShortWrite {
            operation: "start cooling",
            written: 3,
            expected: 10,
        };
        assert!(err.to_string().starts_with("start cooling:"));
        assert!(err.to_string().contains("wrote 3 of 10"));
    }

    #[test]
    fn test_transport_error_names_operation() {
        let err = DaqError::Transport {
            operation: "get temperature",
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert_eq!(
            err.to_string(),
            "get temperature: TheSkyX transport error: refused"
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
