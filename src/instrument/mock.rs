//! A mock multimeter that generates synthetic readings.
use super::InstrumentPort;
use crate::error::MeasurementError;
use crate::measurement::MeasurementKind;
use std::collections::HashMap;
use tracing::info;

/// Reading the meter returns for an open input.
pub const OPEN_INPUT_READING: f64 = 9.9e37;

/// In-process multimeter used by `sim://` addresses and tests.
pub struct MockMultimeter {
    base: HashMap<MeasurementKind, f64>,
    noise: f64,
    phase: f64,
    connected: bool,
}

impl Default for MockMultimeter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMultimeter {
    /// A meter with a fixed, plausible reading for every function.
    pub fn new() -> Self {
        let base = HashMap::from([
            (MeasurementKind::DcVoltage, 1.234567),
            (MeasurementKind::AcVoltage, 0.707107),
            (MeasurementKind::DcCurrent, 1.2e-3),
            (MeasurementKind::AcCurrent, 4.5e-4),
            (MeasurementKind::Resistance, 4.7e3),
        ]);
        Self {
            base,
            noise: 0.0,
            phase: 0.0,
            connected: true,
        }
    }

    /// Build from the profile part of a `sim://` address.
    ///
    /// `open` reports an open resistance input; `noisy` adds ±0.1 % jitter.
    pub fn with_profile(profile: &str) -> Self {
        match profile {
            "open" => Self::new().with_reading(MeasurementKind::Resistance, OPEN_INPUT_READING),
            "noisy" => Self::new().with_noise(1e-3),
            _ => Self::new(),
        }
    }

    /// Override the base reading of one function.
    pub fn with_reading(mut self, kind: MeasurementKind, value: f64) -> Self {
        self.base.insert(kind, value);
        self
    }

    /// Relative amplitude of the deterministic jitter added to each reading.
    pub fn with_noise(mut self, relative: f64) -> Self {
        self.noise = relative;
        self
    }

    fn reading(&mut self, kind: MeasurementKind) -> f64 {
        let base = self.base.get(&kind).copied().unwrap_or(0.0);
        if self.noise == 0.0 || base >= OPEN_INPUT_READING {
            return base;
        }
        self.phase += 0.1;
        // Deterministic jitter keeps the mock reproducible
        base * (1.0 + self.noise * (self.phase * 37.0).sin())
    }

    fn ensure_connected(&self) -> Result<(), MeasurementError> {
        if self.connected {
            Ok(())
        } else {
            Err(MeasurementError::Transport("mock multimeter disconnected".into()))
        }
    }
}

impl InstrumentPort for MockMultimeter {
    fn measure(&mut self, kind: MeasurementKind) -> Result<f64, MeasurementError> {
        self.ensure_connected()?;
        Ok(self.reading(kind))
    }

    fn send_raw(&mut self, command: &str) -> Result<Option<String>, MeasurementError> {
        self.ensure_connected()?;
        if !command.contains('?') {
            return Ok(None);
        }
        let command = command.trim().to_ascii_uppercase();
        if command == "*IDN?" {
            return Ok(Some("MOCK,DMM-34461A,SIM0001,1.0".to_string()));
        }
        if let Some(kind) = MeasurementKind::ALL
            .into_iter()
            .find(|k| k.measure_query() == command)
        {
            return Ok(Some(format!("{:+.8E}", self.reading(kind))));
        }
        Ok(Some("+0,\"No error\"".to_string()))
    }

    fn disconnect(&mut self) -> Result<(), MeasurementError> {
        info!("Disconnecting from mock multimeter.");
        self.connected = false;
        Ok(())
    }
}
