//! Poll interval handling.

use std::fmt;
use std::time::Duration;
use tracing::warn;

/// Interval used when a requested interval is not a positive finite number.
pub const DEFAULT_POLL_INTERVAL_SECS: f64 = 1.0;

/// A positive, finite delay between two polling cycles.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct PollInterval(Duration);

impl PollInterval {
    /// Validate a number of seconds. Returns `None` for zero, negative, NaN,
    /// infinite or unrepresentable values.
    pub fn from_secs(secs: f64) -> Option<Self> {
        if !(secs.is_finite() && secs > 0.0) {
            return None;
        }
        Duration::try_from_secs_f64(secs)
            .ok()
            .filter(|d| !d.is_zero())
            .map(PollInterval)
    }

    /// Validate `secs`, falling back to `default` with a warning.
    ///
    /// The caller always learns the interval that is actually in effect.
    pub fn sanitize(secs: f64, default: PollInterval) -> PollInterval {
        match Self::from_secs(secs) {
            Some(interval) => interval,
            None => {
                warn!(
                    "Invalid poll interval {} s; using {} instead",
                    secs, default
                );
                default
            }
        }
    }

    /// The interval as a [`Duration`].
    pub fn as_duration(self) -> Duration {
        self.0
    }

    /// The interval in seconds.
    pub fn as_secs_f64(self) -> f64 {
        self.0.as_secs_f64()
    }
}

impl Default for PollInterval {
    fn default() -> Self {
        PollInterval(Duration::from_secs(1))
    }
}

impl From<PollInterval> for Duration {
    fn from(interval: PollInterval) -> Self {
        interval.0
    }
}

impl fmt::Display for PollInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} s", self.0.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_valid_intervals() {
        assert_eq!(
            PollInterval::from_secs(0.5).unwrap().as_duration(),
            Duration::from_millis(500)
        );
        assert!(PollInterval::from_secs(1e-3).is_some());
        assert_eq!(PollInterval::default().as_secs_f64(), DEFAULT_POLL_INTERVAL_SECS);
    }

    #[test]
    fn test_invalid_intervals() {
        for secs in [0.0, -1.0, f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 1e300] {
            assert!(PollInterval::from_secs(secs).is_none(), "{} accepted", secs);
        }
    }

    #[traced_test]
    #[test]
    fn test_sanitize_clamps_and_warns() {
        let interval = PollInterval::sanitize(-2.0, PollInterval::default());
        assert_eq!(interval, PollInterval::default());
        assert!(logs_contain("Invalid poll interval -2 s"));

        let interval = PollInterval::sanitize(0.25, PollInterval::default());
        assert_eq!(interval.as_duration(), Duration::from_millis(250));
    }
}
