//! Events delivered from a polling session to the presentation layer.

use super::MeasurementKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Resistance readings at or above this value are the meter's overload marker.
pub const DEFAULT_OVERLOAD_THRESHOLD_OHMS: f64 = 1.0e8;

/// One item of the ordered event stream produced by a polling session.
///
/// `Terminated` is always the last event of a session and is delivered exactly once.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MeasurementEvent {
    /// A valid numeric reading.
    Value {
        /// Function that was measured
        kind: MeasurementKind,
        /// Reading in the unit of `kind`
        value: f64,
        /// When the reading returned
        timestamp: DateTime<Utc>,
    },
    /// The meter reported an out-of-range condition instead of a reading.
    Overload {
        /// Function that was measured
        kind: MeasurementKind,
    },
    /// A session-fatal measurement failure.
    Error {
        /// Human-readable cause
        message: String,
    },
    /// The session has ended; no further events follow for it.
    Terminated,
}

impl MeasurementEvent {
    /// Builds the event for a successful reading.
    ///
    /// Resistance readings at or above `overload_threshold` are reported as
    /// `Overload`; every other reading is a `Value`.
    pub fn from_reading(kind: MeasurementKind, value: f64, overload_threshold: f64) -> Self {
        if kind == MeasurementKind::Resistance && value >= overload_threshold {
            MeasurementEvent::Overload { kind }
        } else {
            MeasurementEvent::Value {
                kind,
                value,
                timestamp: Utc::now(),
            }
        }
    }

    /// True for `Terminated`, the last event of a session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MeasurementEvent::Terminated)
    }
}

impl fmt::Display for MeasurementEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementEvent::Value {
                kind,
                value,
                timestamp,
            } => write!(
                f,
                "[{}] {}: {:.6} {}",
                timestamp.format("%H:%M:%S%.3f"),
                kind,
                value,
                kind.unit()
            ),
            MeasurementEvent::Overload { kind } => write!(f, "{}: OVERLOAD", kind),
            MeasurementEvent::Error { message } => write!(f, "Measurement failed: {}", message),
            MeasurementEvent::Terminated => write!(f, "Scan stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resistance_at_threshold_is_overload() {
        let event = MeasurementEvent::from_reading(
            MeasurementKind::Resistance,
            1.0e8,
            DEFAULT_OVERLOAD_THRESHOLD_OHMS,
        );
        assert_eq!(
            event,
            MeasurementEvent::Overload {
                kind: MeasurementKind::Resistance
            }
        );

        // 9.9E37 is what the meter actually returns on an open input
        let event = MeasurementEvent::from_reading(
            MeasurementKind::Resistance,
            9.9e37,
            DEFAULT_OVERLOAD_THRESHOLD_OHMS,
        );
        assert!(matches!(event, MeasurementEvent::Overload { .. }));
    }

    #[test]
    fn test_resistance_below_threshold_is_value() {
        let event = MeasurementEvent::from_reading(
            MeasurementKind::Resistance,
            4.7e3,
            DEFAULT_OVERLOAD_THRESHOLD_OHMS,
        );
        match event {
            MeasurementEvent::Value { kind, value, .. } => {
                assert_eq!(kind, MeasurementKind::Resistance);
                assert_eq!(value, 4.7e3);
            }
            other => panic!("Expected Value, got {:?}", other),
        }
    }

    #[test]
    fn test_large_voltage_is_not_overload() {
        let event = MeasurementEvent::from_reading(
            MeasurementKind::DcVoltage,
            2.0e8,
            DEFAULT_OVERLOAD_THRESHOLD_OHMS,
        );
        assert!(matches!(event, MeasurementEvent::Value { .. }));
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(MeasurementEvent::Overload {
            kind: MeasurementKind::Resistance,
        })
        .unwrap();
        assert_eq!(json["event"], "overload");
        assert_eq!(json["kind"], "resistance");

        let json = serde_json::to_value(MeasurementEvent::Terminated).unwrap();
        assert_eq!(json["event"], "terminated");
    }

    #[test]
    fn test_display() {
        let event = MeasurementEvent::Error {
            message: "timeout".into(),
        };
        assert_eq!(event.to_string(), "Measurement failed: timeout");
        assert!(MeasurementEvent::Terminated.is_terminal());
    }
}
