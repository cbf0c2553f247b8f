//! Error types for the multimeter polling core.
//!
//! Each operation surface gets its own `thiserror` enum so callers can match on
//! exactly the failures that operation can produce:
//!
//! - **`StartError`**: returned by [`PollingScheduler::start`](crate::scheduler::PollingScheduler::start).
//! - **`MeasurementError`**: produced by an [`InstrumentPort`](crate::instrument::InstrumentPort)
//!   when a reading cannot be obtained. `Overload` is a domain condition, the other two
//!   variants are fatal to a polling session.
//! - **`ControlError`**: manual (one-shot) operations and interval updates.
//! - **`ConnectError`**: opening a connection to an instrument address.
//!
//! Configuration errors live next to the configuration loader in [`crate::config`].

use crate::measurement::MeasurementKind;
use thiserror::Error;

/// Why a polling session could not be started.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartError {
    /// A session is Running or Stopping
    #[error("A polling session is already active")]
    AlreadyRunning,

    /// No connection is bound to the scheduler
    #[error("No instrument is connected")]
    NotConnected,

    /// The bound connection was abandoned by a forced stop
    #[error("Instrument connection is unusable after a forced stop; reconnect first")]
    NeedsReconnect,
}

/// Failure to obtain a reading from the instrument.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeasurementError {
    /// I/O failure, timeout or closed connection
    #[error("Transport error: {0}")]
    Transport(String),

    /// The instrument answered with something that is not a reading
    #[error("Malformed response: '{0}'")]
    MalformedResponse(String),

    /// The reading is out of range for the selected function
    #[error("{0} reading is out of range (overload)")]
    Overload(MeasurementKind),
}

impl MeasurementError {
    /// Returns true if the error ends a polling session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, MeasurementError::Overload(_))
    }
}

impl From<std::io::Error> for MeasurementError {
    fn from(err: std::io::Error) -> Self {
        MeasurementError::Transport(err.to_string())
    }
}

/// Failure of a control-surface operation other than `start`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlError {
    /// A polling session currently owns the instrument
    #[error("Operation not permitted while a polling session is active")]
    SessionActive,

    /// No connection is bound to the scheduler
    #[error("No instrument is connected")]
    NotConnected,

    /// The bound connection was abandoned by a forced stop
    #[error("Instrument connection is unusable after a forced stop; reconnect first")]
    NeedsReconnect,

    /// Another request holds the instrument
    #[error("Instrument is busy with another request")]
    Busy,

    /// The handle belongs to a session that has ended
    #[error("Session handle does not refer to the active session")]
    StaleSession,

    /// The instrument call itself failed
    #[error("Measurement failed: {0}")]
    Measurement(#[from] MeasurementError),
}

/// Failure to open an instrument connection.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The address matches none of the supported forms
    #[error("Unsupported instrument address '{0}'")]
    UnsupportedAddress(String),

    /// The connection could not be opened
    #[error("I/O error connecting to '{address}': {source}")]
    Io {
        /// Address that was being opened
        address: String,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// Settings or `*IDN?` failed on an open connection
    #[error("Instrument at '{address}' failed the connection handshake: {source}")]
    Handshake {
        /// Address that was being opened
        address: String,
        /// Failure reported by the instrument
        #[source]
        source: MeasurementError,
    },

    /// An instrument setting is out of range
    #[error("Invalid instrument setting: {0}")]
    InvalidSetting(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MeasurementError::Transport("socket closed".to_string());
        assert_eq!(err.to_string(), "Transport error: socket closed");

        let err = MeasurementError::Overload(MeasurementKind::Resistance);
        assert_eq!(err.to_string(), "Resistance reading is out of range (overload)");
    }

    #[test]
    fn test_overload_is_not_fatal() {
        assert!(!MeasurementError::Overload(MeasurementKind::Resistance).is_fatal());
        assert!(MeasurementError::MalformedResponse("abc".into()).is_fatal());
        assert!(MeasurementError::Transport("timeout".into()).is_fatal());
    }

    #[test]
    fn test_control_error_wraps_measurement() {
        let err: ControlError = MeasurementError::Transport("eof".into()).into();
        assert!(err.to_string().contains("Measurement failed"));
        assert!(matches!(err, ControlError::Measurement(_)));
    }
}
