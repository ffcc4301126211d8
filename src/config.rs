//! Lab configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/lab.toml` (or a path given on the command line)
//! 2. Environment variables prefixed with `RUST_INSTRUMENTS_`, nested keys
//!    separated by `__` (e.g. `RUST_INSTRUMENTS_APPLICATION__LOG_LEVEL=debug`)
//!
//! A missing file is not an error; every section has defaults.
//!
//! # Example
//! ```no_run
//! use rust_instruments::config::LabConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LabConfig::load()?;
//! config.validate()?;
//! for instrument in config.enabled_instruments() {
//!     println!("{} ({})", instrument.id, instrument.r#type);
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{DaqError, DaqResult};
use crate::hardware::capabilities::Capability;
use crate::hardware::keithley_2461;
use crate::hardware::resource::{Parity, SerialSettings};
use crate::logging::{parse_log_level, OutputFormat};
use crate::sequences::four_wire::FourWireConfig;
use crate::sequences::hall_pulse::HallPulseConfig;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/lab.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "RUST_INSTRUMENTS_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Instrument definitions
    #[serde(default)]
    pub instruments: Vec<InstrumentDefinition>,
    /// Four-wire sweep parameters
    #[serde(default)]
    pub four_wire: Option<FourWireConfig>,
    /// Pulsed measurement parameters
    #[serde(default)]
    pub hall_pulse: Option<HallPulseConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: OutputFormat,
    /// Directory for result files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_name() -> String {
    "rust_instruments".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_enabled() -> bool {
    true
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
            output_dir: default_output_dir(),
        }
    }
}

/// Supported instrument models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    /// Keithley 2000 multimeter
    Keithley2000,
    /// Keithley 2401 source meter
    Keithley2401,
    /// Keithley 2461 source meter
    Keithley2461,
    /// Contact switch box
    Switchbox,
    /// SR830 lock-in amplifier
    Sr830,
    /// Lakeshore 336 temperature controller
    Lakeshore336,
    /// Rigol DS1000Z oscilloscope
    #[serde(rename = "rigol_ds1000z")]
    RigolDs1000z,
}

impl InstrumentKind {
    /// Line settings used when the definition gives none
    pub fn default_serial_settings(self) -> SerialSettings {
        use crate::hardware::{keithley_2000, keithley_2401, lakeshore_336, sr830, switchbox};
        match self {
            InstrumentKind::Keithley2000 => SerialSettings::new(keithley_2000::BAUD_RATE),
            InstrumentKind::Keithley2401 => SerialSettings::new(keithley_2401::BAUD_RATE),
            InstrumentKind::Switchbox => SerialSettings::new(switchbox::BAUD_RATE),
            InstrumentKind::Sr830 => SerialSettings::new(sr830::BAUD_RATE),
            InstrumentKind::Lakeshore336 => SerialSettings::new(lakeshore_336::BAUD_RATE)
                .with_data_bits(7)
                .with_parity(Parity::Odd),
            InstrumentKind::Keithley2461 | InstrumentKind::RigolDs1000z => {
                SerialSettings::default()
            }
        }
    }

    /// Resource used when the definition gives none
    pub fn default_resource(self) -> Option<&'static str> {
        match self {
            InstrumentKind::Keithley2461 => Some(keithley_2461::DEFAULT_RESOURCE),
            _ => None,
        }
    }

    /// Capabilities sequences can use
    pub fn capabilities(self) -> &'static [Capability] {
        match self {
            InstrumentKind::Keithley2000 => &[Capability::BufferedVoltmeter],
            InstrumentKind::Keithley2401 => &[Capability::ProbeSource, Capability::PulseSource],
            InstrumentKind::Keithley2461 => &[
                Capability::ProbeSource,
                Capability::PulseSource,
                Capability::BufferedSource,
            ],
            InstrumentKind::Switchbox => &[Capability::SwitchMatrix],
            InstrumentKind::Sr830 | InstrumentKind::Lakeshore336 | InstrumentKind::RigolDs1000z => &[],
        }
    }
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstrumentKind::Keithley2000 => "Keithley 2000",
            InstrumentKind::Keithley2401 => "Keithley 2401",
            InstrumentKind::Keithley2461 => "Keithley 2461",
            InstrumentKind::Switchbox => "switch box",
            InstrumentKind::Sr830 => "SR830",
            InstrumentKind::Lakeshore336 => "Lakeshore 336",
            InstrumentKind::RigolDs1000z => "Rigol DS1000Z",
        };
        f.write_str(name)
    }
}

/// Instrument definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Unique instrument identifier
    pub id: String,
    /// Instrument model
    pub r#type: InstrumentKind,
    /// Resource string (`COM3`, `/dev/ttyUSB0`, `USB0::...::INSTR`, ...)
    #[serde(default)]
    pub resource: Option<String>,
    /// Whether this instrument is connected
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Baud rate override for serial resources
    #[serde(default)]
    pub baud_rate: Option<u32>,
    /// Response timeout override in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl InstrumentDefinition {
    /// Definition with the model's defaults
    pub fn new(id: impl Into<String>, kind: InstrumentKind, resource: Option<&str>) -> Self {
        Self {
            id: id.into(),
            r#type: kind,
            resource: resource.map(str::to_string),
            enabled: true,
            baud_rate: None,
            timeout_ms: None,
        }
    }

    /// Configured resource, or the model's default
    pub fn resource(&self) -> DaqResult<&str> {
        self.resource
            .as_deref()
            .or_else(|| self.r#type.default_resource())
            .ok_or_else(|| {
                DaqError::Configuration(format!("instrument '{}' has no resource", self.id))
            })
    }

    /// Line settings with the baud rate override applied
    pub fn serial_settings(&self) -> SerialSettings {
        let mut settings = self.r#type.default_serial_settings();
        if let Some(baud_rate) = self.baud_rate {
            settings.baud_rate = baud_rate;
        }
        settings
    }

    /// Timeout override
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl LabConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment
    pub fn load() -> DaqResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment
    pub fn load_from<P: AsRef<Path>>(path: P) -> DaqResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> DaqResult<()> {
        parse_log_level(&self.application.log_level).map_err(DaqError::Configuration)?;

        let mut ids = HashSet::new();
        for instrument in &self.instruments {
            if instrument.id.trim().is_empty() {
                return Err(DaqError::Configuration(
                    "instrument id must not be empty".to_string(),
                ));
            }
            if !ids.insert(instrument.id.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate instrument ID: {}",
                    instrument.id
                )));
            }
            if instrument.enabled {
                instrument.resource()?;
            }
        }

        if let Some(four_wire) = &self.four_wire {
            four_wire.validate().map_err(DaqError::Configuration)?;
            self.require("four_wire.switch", &four_wire.switch, &[Capability::SwitchMatrix])?;
            self.require("four_wire.source", &four_wire.source, &[Capability::ProbeSource])?;
        }

        if let Some(hall) = &self.hall_pulse {
            hall.validate().map_err(DaqError::Configuration)?;
            self.require("hall_pulse.switch", &hall.switch, &[Capability::SwitchMatrix])?;
            self.require(
                "hall_pulse.source",
                &hall.source,
                &[Capability::PulseSource, Capability::BufferedSource],
            )?;
            self.require(
                "hall_pulse.voltmeter",
                &hall.voltmeter,
                &[Capability::BufferedVoltmeter],
            )?;
        }

        Ok(())
    }

    /// All enabled instruments
    pub fn enabled_instruments(&self) -> Vec<&InstrumentDefinition> {
        self.instruments.iter().filter(|inst| inst.enabled).collect()
    }

    /// Enabled instrument with `id`
    pub fn instrument(&self, id: &str) -> Option<&InstrumentDefinition> {
        self.instruments
            .iter()
            .find(|inst| inst.enabled && inst.id == id)
    }

    fn require(&self, field: &str, id: &str, needed: &[Capability]) -> DaqResult<()> {
        let instrument = self.instrument(id).ok_or_else(|| {
            DaqError::Configuration(format!(
                "{} refers to '{}', which is not an enabled instrument",
                field, id
            ))
        })?;
        let offered = instrument.r#type.capabilities();
        if let Some(missing) = needed.iter().find(|c| !offered.contains(c)) {
            return Err(DaqError::Configuration(format!(
                "{}: '{}' ({}) is not a {}",
                field, id, instrument.r#type, missing
            )));
        }
        Ok(())
    }
}
