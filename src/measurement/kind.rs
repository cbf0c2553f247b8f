//! Measurement functions supported by the multimeter.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A multimeter measurement function, selected once per polling session.
///
/// Each kind maps onto the SCPI subsystem of the 34461A-class meters. AC and DC
/// current are distinct functions and dispatch distinct queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementKind {
    /// DC voltage, volts
    DcVoltage,
    /// AC voltage (true RMS), volts
    AcVoltage,
    /// DC current, amperes
    DcCurrent,
    /// AC current (true RMS), amperes
    AcCurrent,
    /// Two-wire resistance, ohms
    Resistance,
}

impl MeasurementKind {
    /// All measurement kinds, in front-panel order.
    pub const ALL: [MeasurementKind; 5] = [
        MeasurementKind::DcVoltage,
        MeasurementKind::AcVoltage,
        MeasurementKind::DcCurrent,
        MeasurementKind::AcCurrent,
        MeasurementKind::Resistance,
    ];

    /// SCPI query that configures the function and returns one reading.
    pub fn measure_query(&self) -> &'static str {
        match self {
            MeasurementKind::DcVoltage => "MEAS:VOLT:DC?",
            MeasurementKind::AcVoltage => "MEAS:VOLT:AC?",
            MeasurementKind::DcCurrent => "MEAS:CURR:DC?",
            MeasurementKind::AcCurrent => "MEAS:CURR:AC?",
            MeasurementKind::Resistance => "MEAS:RES?",
        }
    }

    /// SCPI command that selects the function without triggering a reading.
    pub fn configure_command(&self) -> &'static str {
        match self {
            MeasurementKind::DcVoltage => "CONF:VOLT:DC",
            MeasurementKind::AcVoltage => "CONF:VOLT:AC",
            MeasurementKind::DcCurrent => "CONF:CURR:DC",
            MeasurementKind::AcCurrent => "CONF:CURR:AC",
            MeasurementKind::Resistance => "CONF:RES",
        }
    }

    /// SI unit of a reading.
    pub fn unit(&self) -> &'static str {
        match self {
            MeasurementKind::DcVoltage | MeasurementKind::AcVoltage => "V",
            MeasurementKind::DcCurrent | MeasurementKind::AcCurrent => "A",
            MeasurementKind::Resistance => "Ω",
        }
    }

    /// Short name used on the command line and in configuration.
    pub fn short_name(&self) -> &'static str {
        match self {
            MeasurementKind::DcVoltage => "dcv",
            MeasurementKind::AcVoltage => "acv",
            MeasurementKind::DcCurrent => "dci",
            MeasurementKind::AcCurrent => "aci",
            MeasurementKind::Resistance => "res",
        }
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MeasurementKind::DcVoltage => "DC voltage",
            MeasurementKind::AcVoltage => "AC voltage",
            MeasurementKind::DcCurrent => "DC current",
            MeasurementKind::AcCurrent => "AC current",
            MeasurementKind::Resistance => "Resistance",
        };
        f.write_str(label)
    }
}

/// Unrecognised measurement kind name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown measurement kind '{0}'. Expected one of: dcv, acv, dci, aci, res")]
pub struct ParseKindError(pub String);

impl FromStr for MeasurementKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dcv" | "dc_voltage" | "volt:dc" => Ok(MeasurementKind::DcVoltage),
            "acv" | "ac_voltage" | "volt:ac" => Ok(MeasurementKind::AcVoltage),
            "dci" | "dc_current" | "curr:dc" => Ok(MeasurementKind::DcCurrent),
            "aci" | "ac_current" | "curr:ac" => Ok(MeasurementKind::AcCurrent),
            "res" | "resistance" | "ohms" => Ok(MeasurementKind::Resistance),
            _ => Err(ParseKindError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ac_and_dc_current_dispatch_distinct_queries() {
        assert_eq!(MeasurementKind::DcCurrent.measure_query(), "MEAS:CURR:DC?");
        assert_eq!(MeasurementKind::AcCurrent.measure_query(), "MEAS:CURR:AC?");
        assert_ne!(
            MeasurementKind::DcCurrent.measure_query(),
            MeasurementKind::AcCurrent.measure_query()
        );
    }

    #[test]
    fn test_parse_short_names() {
        for kind in MeasurementKind::ALL {
            assert_eq!(kind.short_name().parse::<MeasurementKind>(), Ok(kind));
        }
        assert_eq!("OHMS".parse::<MeasurementKind>(), Ok(MeasurementKind::Resistance));
        assert!("frequency".parse::<MeasurementKind>().is_err());
    }

    #[test]
    fn test_units() {
        assert_eq!(MeasurementKind::AcVoltage.unit(), "V");
        assert_eq!(MeasurementKind::DcCurrent.unit(), "A");
        assert_eq!(MeasurementKind::Resistance.unit(), "Ω");
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&MeasurementKind::AcCurrent).unwrap();
        assert_eq!(json, "\"ac_current\"");
    }
}
