//! Four-wire resistance sweep
//!
//! Steps the switch box through a list of terminal assignments (by default
//! the `I+=A, I-=E, V1+=B, V1-=D` pattern rotated through all eight
//! contacts) and takes one DC probe reading per assignment:
//!
//! 1. Route the assignment, wait `switch_settle_ms`
//! 2. Turn the probe current on, wait `probe_settle_ms`
//! 3. Read (current, voltage), R = V / I
//! 4. Turn the probe current off, also when the reading failed
//!
//! # Configuration
//!
//! ```toml
//! [four_wire]
//! switch = "switchbox"
//! source = "k2461"
//! current = 1e-3
//! wiring = "four_wire"
//! base_assignment = "I+=A, I-=E, V1+=B, V1-=D"
//! ```

use super::assignment::Assignment;
use crate::hardware::capabilities::{ProbeSource, SwitchMatrix};
use crate::hardware::keithley_2461;
use crate::measurement_types::Wiring;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Typed configuration for the four-wire sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FourWireConfig {
    /// Instrument id of the switch box
    #[serde(default = "default_switch")]
    pub switch: String,

    /// Instrument id of the probe current source
    #[serde(default = "default_source")]
    pub source: String,

    /// Probe current in amps
    #[serde(default = "default_current")]
    pub current: f64,

    /// Integration time in power-line cycles
    #[serde(default = "default_nplc")]
    pub nplc: f64,

    /// 2- or 4-wire sensing on the source meter
    #[serde(default)]
    pub wiring: Wiring,

    /// Wait after routing (milliseconds)
    #[serde(default = "default_settle_ms")]
    pub switch_settle_ms: u64,

    /// Wait between output on and reading (milliseconds)
    #[serde(default = "default_settle_ms")]
    pub probe_settle_ms: u64,

    /// Explicit assignment list; overrides `base_assignment` when non-empty
    #[serde(default)]
    pub assignments: Vec<Assignment>,

    /// Assignment rotated through all eight contacts when `assignments` is empty
    #[serde(default = "default_base_assignment")]
    pub base_assignment: Assignment,
}

fn default_switch() -> String {
    "switchbox".to_string()
}
fn default_source() -> String {
    "k2461".to_string()
}
fn default_current() -> f64 {
    1e-3
}
fn default_nplc() -> f64 {
    2.0
}
fn default_settle_ms() -> u64 {
    1000
}
fn default_base_assignment() -> Assignment {
    use super::assignment::{Contact, Terminal};
    Assignment::from_pairs([
        (Terminal::CurrentHigh, Contact::A),
        (Terminal::CurrentLow, Contact::E),
        (Terminal::Voltage1High, Contact::B),
        (Terminal::Voltage1Low, Contact::D),
    ])
    .unwrap_or_default()
}

impl Default for FourWireConfig {
    fn default() -> Self {
        Self {
            switch: default_switch(),
            source: default_source(),
            current: default_current(),
            nplc: default_nplc(),
            wiring: Wiring::default(),
            switch_settle_ms: default_settle_ms(),
            probe_settle_ms: default_settle_ms(),
            assignments: Vec::new(),
            base_assignment: default_base_assignment(),
        }
    }
}

impl FourWireConfig {
    /// Assignments the sweep steps through, in order.
    pub fn configurations(&self) -> Vec<Assignment> {
        if self.assignments.is_empty() {
            self.base_assignment.all_rotations()
        } else {
            self.assignments.clone()
        }
    }

    /// Check parameters before touching hardware.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.current.is_finite() && self.current > 0.0) {
            return Err(format!("four_wire.current must be positive, got {}", self.current));
        }
        if !keithley_2461::NPLC_RANGE.contains(&self.nplc) {
            return Err(format!("four_wire.nplc must be 0.01..=10, got {}", self.nplc));
        }
        if self.configurations().iter().all(Assignment::is_empty) {
            return Err("four_wire needs at least one non-empty assignment".to_string());
        }
        Ok(())
    }
}

/// One probe reading of the sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResistanceReading {
    /// Routing used for this reading
    pub assignment: Assignment,
    /// Sourced current (A)
    pub current: f64,
    /// Measured voltage (V)
    pub voltage: f64,
    /// V / I (ohm)
    pub resistance: f64,
}

/// Results of a sweep, in assignment order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FourWireReport {
    /// One entry per assignment
    pub readings: Vec<ResistanceReading>,
}

/// Flat CSV row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FourWireRow {
    /// Position in the sweep
    pub index: usize,
    /// Assignment as text
    pub assignment: String,
    /// Sourced current (A)
    pub current_a: f64,
    /// Measured voltage (V)
    pub voltage_v: f64,
    /// Resistance (ohm)
    pub resistance_ohm: f64,
}

impl FourWireReport {
    /// Resistances in sweep order
    pub fn resistances(&self) -> Vec<f64> {
        self.readings.iter().map(|r| r.resistance).collect()
    }

    /// Rows for CSV output
    pub fn rows(&self) -> Vec<FourWireRow> {
        self.readings
            .iter()
            .enumerate()
            .map(|(index, r)| FourWireRow {
                index,
                assignment: r.assignment.to_string(),
                current_a: r.current,
                voltage_v: r.voltage,
                resistance_ohm: r.resistance,
            })
            .collect()
    }
}

/// Run the sweep.
pub async fn run(
    switch: &dyn SwitchMatrix,
    source: &dyn ProbeSource,
    config: &FourWireConfig,
) -> Result<FourWireReport> {
    if let Err(e) = config.validate() {
        bail!(e);
    }

    let switch_settle = Duration::from_millis(config.switch_settle_ms);
    let probe_settle = Duration::from_millis(config.probe_settle_ms);
    let mut report = FourWireReport::default();

    for (step, assignment) in config.configurations().into_iter().enumerate() {
        tracing::info!(step, %assignment, "four-wire step");

        switch
            .route(&assignment)
            .await
            .with_context(|| format!("routing '{}'", assignment))?;
        tokio::time::sleep(switch_settle).await;

        source
            .enable_probe(config.current, config.wiring, config.nplc)
            .await
            .context("enabling probe current")?;

        let reading = async {
            tokio::time::sleep(probe_settle).await;
            let reading = source.read_probe().await?;
            let resistance = reading.resistance()?;
            anyhow::Ok((reading, resistance))
        }
        .await;
        let disabled = source.disable_probe().await;

        let (reading, resistance) =
            reading.with_context(|| format!("probe reading for '{}'", assignment))?;
        disabled.context("disabling probe current")?;

        tracing::info!(step, resistance, "four-wire reading");
        report.readings.push(ResistanceReading {
            assignment,
            current: reading.current,
            voltage: reading.voltage,
            resistance,
        });
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configurations_rotate_base() {
        let config = FourWireConfig::default();
        let configurations = config.configurations();
        assert_eq!(configurations.len(), 8);
        assert_eq!(configurations[0].to_string(), "I+=A, I-=E, V1+=B, V1-=D");
        assert_eq!(configurations[4].to_string(), "I+=E, I-=A, V1+=F, V1-=H");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn explicit_assignments_override_rotation() {
        let config: FourWireConfig = toml::from_str(
            "current = 1e-4\nassignments = [\"I+=A, I-=B\", \"I+=C, I-=D\"]\n",
        )
        .unwrap();
        assert_eq!(config.configurations().len(), 2);
        assert_eq!(config.source, "k2461");
    }

    #[test]
    fn rejects_bad_parameters() {
        let mut config = FourWireConfig {
            current: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.current = 1e-3;
        config.nplc = 20.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rows_carry_assignment_text() {
        let report = FourWireReport {
            readings: vec![ResistanceReading {
                assignment: "I+=A, I-=E".parse().unwrap(),
                current: 1e-3,
                voltage: 0.05,
                resistance: 50.0,
            }],
        };
        let rows = report.rows();
        assert_eq!(rows[0].assignment, "I+=A, I-=E");
        assert_eq!(report.resistances(), vec![50.0]);
    }
}
