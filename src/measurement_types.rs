//! Measurement data types shared between drivers and sequences.

use crate::error::{DaqError, DaqResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether voltage is sensed on the current-carrying leads or on a separate
/// pair (remote sense).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Wiring {
    /// Voltage sensed on the source leads; includes contact resistance
    TwoWire,
    /// Separate sense leads; excludes contact resistance
    #[default]
    FourWire,
}

impl Wiring {
    /// Value for Keithley `rsen` commands
    pub fn remote_sense(self) -> &'static str {
        match self {
            Wiring::TwoWire => "off",
            Wiring::FourWire => "on",
        }
    }
}

/// Voltmeter range selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VoltageRange {
    /// Instrument picks the range per reading
    #[default]
    Auto,
    /// Fixed upper range in volts
    Fixed(f64),
}

impl VoltageRange {
    /// Keithley range command for the given SCPI function prefix (e.g. `sens:volt`).
    pub fn command(self, function: &str) -> String {
        match self {
            VoltageRange::Auto => format!("{}:rang:auto on", function),
            VoltageRange::Fixed(volts) => format!("{}:rang {}", function, volts),
        }
    }
}

/// One source-and-measure reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeReading {
    /// Sourced current in amps
    pub current: f64,
    /// Measured voltage in volts
    pub voltage: f64,
}

impl ProbeReading {
    /// V / I in ohms.
    ///
    /// A zero current reading cannot give a resistance and is an error.
    pub fn resistance(&self) -> DaqResult<f64> {
        if self.current == 0.0 {
            return Err(DaqError::Instrument(format!(
                "zero probe current (voltage {} V)",
                self.voltage
            )));
        }
        Ok(self.voltage / self.current)
    }
}

/// Readings with per-reading timestamps in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Seconds, relative to the start of the acquisition
    pub time: Vec<f64>,
    /// Readings
    pub values: Vec<f64>,
}

impl TimeSeries {
    /// Number of readings
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there are no readings
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A Keithley 2401 buffer dump: voltage, current and timestamp per point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepBuffer {
    /// Seconds since the buffer timestamp reference
    pub time: Vec<f64>,
    /// Measured voltage
    pub voltage: Vec<f64>,
    /// Sourced current
    pub current: Vec<f64>,
}

/// Parsed `*IDN?` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Manufacturer
    pub manufacturer: String,
    /// Model
    pub model: String,
    /// Serial number
    pub serial: String,
    /// Firmware revision
    pub firmware: String,
}

impl Identity {
    /// Parse the four comma-separated `*IDN?` fields.
    ///
    /// Missing trailing fields are left empty; some instruments omit the
    /// firmware revision.
    pub fn parse(response: &str) -> DaqResult<Self> {
        let mut fields = response.trim().splitn(4, ',').map(|f| f.trim().to_string());
        let manufacturer = fields
            .next()
            .filter(|f| !f.is_empty())
            .ok_or_else(|| DaqError::parse(response, "empty identification"))?;

        Ok(Self {
            manufacturer,
            model: fields.next().unwrap_or_default(),
            serial: fields.next().unwrap_or_default(),
            firmware: fields.next().unwrap_or_default(),
        })
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (s/n {}, fw {})",
            self.manufacturer, self.model, self.serial, self.firmware
        )
    }
}
