//! SCPI multimeter driver (Keysight 34461A command set).
//!
//! The driver is transport-agnostic: anything that can write a line and read a
//! line back implements [`ScpiTransport`]. [`SocketTransport`](super::SocketTransport)
//! provides the LXI raw-socket variant.

use super::InstrumentPort;
use crate::error::MeasurementError;
use crate::measurement::MeasurementKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Line-oriented, blocking SCPI transport.
pub trait ScpiTransport: Send {
    /// Send a command that produces no response.
    fn write(&mut self, command: &str) -> Result<(), MeasurementError>;

    /// Send a query and return the response line without its terminator.
    fn query(&mut self, command: &str) -> Result<String, MeasurementError>;

    fn close(&mut self) -> Result<(), MeasurementError>;
}

/// DC voltage input impedance setting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputImpedance {
    /// Fixed 10 MΩ on all ranges.
    #[serde(rename = "10M")]
    TenMegaohm,
    /// >10 GΩ on the low ranges, 10 MΩ above.
    #[serde(rename = "AUTO")]
    Auto,
}

impl InputImpedance {
    /// SCPI command selecting this impedance.
    pub fn command(&self) -> &'static str {
        match self {
            InputImpedance::TenMegaohm => "VOLT:DC:IMP:AUTO 0",
            InputImpedance::Auto => "VOLT:DC:IMP:AUTO 1",
        }
    }
}

impl fmt::Display for InputImpedance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputImpedance::TenMegaohm => f.write_str("10M"),
            InputImpedance::Auto => f.write_str("AUTO"),
        }
    }
}

impl FromStr for InputImpedance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "10M" => Ok(InputImpedance::TenMegaohm),
            "AUTO" => Ok(InputImpedance::Auto),
            other => Err(format!("Invalid input impedance '{}'. Use 10M or AUTO", other)),
        }
    }
}

/// Supported integration times in power-line cycles.
pub const SUPPORTED_NPLC: [f64; 5] = [0.02, 0.2, 1.0, 10.0, 100.0];

/// Voltage aperture command for an integration time given in power-line cycles.
///
/// Returns `None` for integration times the meter does not offer.
pub fn aperture_command(nplc: f64) -> Option<&'static str> {
    if !nplc.is_finite() {
        return None;
    }
    match (nplc * 100.0).round() as i64 {
        2 => Some("VOLT:APER 3E-04"),
        20 => Some("VOLT:APER 3E-03"),
        100 => Some("VOLT:APER 2E-02"),
        1000 => Some("VOLT:APER 2E-01"),
        10000 => Some("VOLT:APER 2E+00"),
        _ => None,
    }
}

/// Parse a numeric SCPI reading such as `+1.23456700E+00`.
pub fn parse_reading(response: &str) -> Result<f64, MeasurementError> {
    let trimmed = response.trim();
    trimmed
        .parse::<f64>()
        .map_err(|_| MeasurementError::MalformedResponse(trimmed.to_string()))
}

/// A digital multimeter spoken to over SCPI.
pub struct ScpiMultimeter<T: ScpiTransport> {
    transport: T,
    connected: bool,
}

impl<T: ScpiTransport> ScpiMultimeter<T> {
    /// Wrap an open transport. No commands are sent.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            connected: true,
        }
    }

    /// Apply integration aperture and DC input impedance, if given.
    pub fn apply_settings(
        &mut self,
        nplc: Option<f64>,
        impedance: Option<InputImpedance>,
    ) -> Result<(), MeasurementError> {
        if let Some(nplc) = nplc {
            let command = aperture_command(nplc).ok_or_else(|| {
                MeasurementError::Transport(format!(
                    "unsupported integration time {} PLC (use 0.02/0.2/1/10/100)",
                    nplc
                ))
            })?;
            self.transport()?.write(command)?;
        }
        if let Some(impedance) = impedance {
            self.transport()?.write(impedance.command())?;
        }
        Ok(())
    }

    /// Select a measurement function without triggering a reading.
    pub fn configure(&mut self, kind: MeasurementKind) -> Result<(), MeasurementError> {
        self.transport()?.write(kind.configure_command())
    }

    fn transport(&mut self) -> Result<&mut T, MeasurementError> {
        if self.connected {
            Ok(&mut self.transport)
        } else {
            Err(MeasurementError::Transport("instrument disconnected".into()))
        }
    }
}

impl<T: ScpiTransport> InstrumentPort for ScpiMultimeter<T> {
    fn measure(&mut self, kind: MeasurementKind) -> Result<f64, MeasurementError> {
        let response = self.transport()?.query(kind.measure_query())?;
        let value = parse_reading(&response)?;
        debug!("{} -> {}", kind.measure_query(), value);
        Ok(value)
    }

    fn send_raw(&mut self, command: &str) -> Result<Option<String>, MeasurementError> {
        let transport = self.transport()?;
        if command.contains('?') {
            transport.query(command).map(Some)
        } else {
            transport.write(command).map(|_| None)
        }
    }

    fn return_to_local(&mut self) -> Result<(), MeasurementError> {
        self.transport()?.write("SYST:LOC")
    }

    fn disconnect(&mut self) -> Result<(), MeasurementError> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.transport.close()
    }
}
