//! Pulsed-current switching measurement
//!
//! For each pulse direction (a routing of `I+`/`I-` across the sample) a
//! single current pulse is sent, then the sample is rerouted for a Hall
//! measurement: the source meter sources a small DC current and buffers the
//! longitudinal voltage while the K2000 buffers the transverse voltage.
//!
//! Per direction:
//! 1. Route the pulse assignment, settle
//! 2. Record the pulse time, pulse, settle
//! 3. Route the measure assignment, configure both buffers, settle
//! 4. Trigger voltmeter then source, wait `points * point_time_ms`
//! 5. Read both buffers
//!
//! Times in the report are seconds since the start of the run: the pulse
//! time plus each reading's time relative to the first reading.
//!
//! The source buffer read is best effort. When it fails the transverse
//! readings are still kept: `rxx` is NaN and reading times are spaced by
//! `point_time_ms`.
//!
//! # Configuration
//!
//! ```toml
//! [hall_pulse]
//! pulse_current = 37e-3
//! pulse_width = 1e-3
//! measure_current = 1e-3
//! points = 100
//! point_time_ms = 180
//! pulses = ["I+=B, I-=F", "I+=D, I-=H"]
//! measure_assignment = "V1+=C, V1-=G, V2+=B, V2-=D, I+=A, I-=E"
//! ```

use super::assignment::Assignment;
use crate::hardware::capabilities::{
    BufferedSource, BufferedVoltmeter, PulseSource, SwitchMatrix,
};
use crate::hardware::{keithley_2000, keithley_2461};
use crate::measurement_types::{TimeSeries, VoltageRange};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Typed configuration for the pulsed measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HallPulseConfig {
    /// Instrument id of the switch box
    #[serde(default = "default_switch")]
    pub switch: String,

    /// Instrument id of the pulsing / buffered source meter
    #[serde(default = "default_source")]
    pub source: String,

    /// Instrument id of the transverse voltmeter
    #[serde(default = "default_voltmeter")]
    pub voltmeter: String,

    /// Pulse amplitude (A)
    #[serde(default = "default_pulse_current")]
    pub pulse_current: f64,

    /// Pulse width (s)
    #[serde(default = "default_pulse_width")]
    pub pulse_width: f64,

    /// DC current during the measurement (A)
    #[serde(default = "default_measure_current")]
    pub measure_current: f64,

    /// Readings per direction
    #[serde(default = "default_points")]
    pub points: usize,

    /// Expected time per reading (milliseconds)
    #[serde(default = "default_point_time_ms")]
    pub point_time_ms: u64,

    /// Wait after each routing and pulse (milliseconds)
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Pulse routings, one per direction, in order
    #[serde(default = "default_pulses")]
    pub pulses: Vec<Assignment>,

    /// Routing during the measurement
    #[serde(default = "default_measure_assignment")]
    pub measure_assignment: Assignment,

    /// Source meter integration time (power-line cycles)
    #[serde(default = "default_source_nplc")]
    pub source_nplc: f64,

    /// Voltmeter range
    #[serde(default)]
    pub voltmeter_range: VoltageRange,

    /// Voltmeter integration time (power-line cycles)
    #[serde(default = "default_voltmeter_nplc")]
    pub voltmeter_nplc: f64,
}

fn default_switch() -> String {
    "switchbox".to_string()
}
fn default_source() -> String {
    "k2461".to_string()
}
fn default_voltmeter() -> String {
    "k2000".to_string()
}
fn default_pulse_current() -> f64 {
    37e-3
}
fn default_pulse_width() -> f64 {
    1e-3
}
fn default_measure_current() -> f64 {
    1e-3
}
fn default_points() -> usize {
    100
}
fn default_point_time_ms() -> u64 {
    180
}
fn default_settle_ms() -> u64 {
    100
}
fn default_pulses() -> Vec<Assignment> {
    ["I+=B, I-=F", "I+=D, I-=H"]
        .iter()
        .filter_map(|text| text.parse().ok())
        .collect()
}
fn default_measure_assignment() -> Assignment {
    "V1+=C, V1-=G, V2+=B, V2-=D, I+=A, I-=E"
        .parse()
        .unwrap_or_default()
}
fn default_source_nplc() -> f64 {
    2.0
}
fn default_voltmeter_nplc() -> f64 {
    1.0
}

impl Default for HallPulseConfig {
    fn default() -> Self {
        Self {
            switch: default_switch(),
            source: default_source(),
            voltmeter: default_voltmeter(),
            pulse_current: default_pulse_current(),
            pulse_width: default_pulse_width(),
            measure_current: default_measure_current(),
            points: default_points(),
            point_time_ms: default_point_time_ms(),
            settle_ms: default_settle_ms(),
            pulses: default_pulses(),
            measure_assignment: default_measure_assignment(),
            source_nplc: default_source_nplc(),
            voltmeter_range: VoltageRange::default(),
            voltmeter_nplc: default_voltmeter_nplc(),
        }
    }
}

impl HallPulseConfig {
    /// Check parameters before touching hardware.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("pulse_current", self.pulse_current),
            ("pulse_width", self.pulse_width),
            ("measure_current", self.measure_current),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(format!("hall_pulse.{} must be positive, got {}", name, value));
            }
        }
        if !(1..=keithley_2000::DEFAULT_BUFFER_LENGTH).contains(&self.points) {
            return Err(format!(
                "hall_pulse.points must be 1..={}, got {}",
                keithley_2000::DEFAULT_BUFFER_LENGTH,
                self.points
            ));
        }
        if !keithley_2461::NPLC_RANGE.contains(&self.source_nplc) {
            return Err(format!(
                "hall_pulse.source_nplc must be 0.01..=10, got {}",
                self.source_nplc
            ));
        }
        if !keithley_2000::NPLC_RANGE.contains(&self.voltmeter_nplc) {
            return Err(format!(
                "hall_pulse.voltmeter_nplc must be 0.01..=10, got {}",
                self.voltmeter_nplc
            ));
        }
        if self.pulses.is_empty() || self.pulses.iter().any(Assignment::is_empty) {
            return Err("hall_pulse.pulses needs at least one non-empty assignment".to_string());
        }
        if self.measure_assignment.is_empty() {
            return Err("hall_pulse.measure_assignment is empty".to_string());
        }
        Ok(())
    }

    /// How long the buffers take to fill
    pub fn acquisition_time(&self) -> Duration {
        Duration::from_millis(self.point_time_ms.saturating_mul(self.points as u64))
    }
}

/// Readings after one pulse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulseRecord {
    /// Routing of the pulse
    pub assignment: Assignment,
    /// Pulse time, seconds since the start of the run
    pub pulse_time: f64,
    /// Reading times, seconds since the start of the run
    pub time: Vec<f64>,
    /// Longitudinal resistance (ohm)
    pub rxx: Vec<f64>,
    /// Transverse resistance (ohm)
    pub rxy: Vec<f64>,
}

/// Results of a run, one record per pulse direction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HallReport {
    /// Records in pulse order
    pub pulses: Vec<PulseRecord>,
}

/// Flat CSV row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HallRow {
    /// Pulse direction index
    pub pulse: usize,
    /// Pulse routing as text
    pub assignment: String,
    /// Seconds since the start of the run
    pub time_s: f64,
    /// Longitudinal resistance (ohm)
    pub rxx_ohm: f64,
    /// Transverse resistance (ohm)
    pub rxy_ohm: f64,
}

impl HallReport {
    /// Rows for CSV output, pulse by pulse
    pub fn rows(&self) -> Vec<HallRow> {
        self.pulses
            .iter()
            .enumerate()
            .flat_map(|(pulse, record)| {
                let assignment = record.assignment.to_string();
                record
                    .time
                    .iter()
                    .zip(&record.rxx)
                    .zip(&record.rxy)
                    .map(move |((time, rxx), rxy)| HallRow {
                        pulse,
                        assignment: assignment.clone(),
                        time_s: *time,
                        rxx_ohm: *rxx,
                        rxy_ohm: *rxy,
                    })
            })
            .collect()
    }
}

/// Instruments taking part in a run
pub struct HallInstruments<'a> {
    /// Contact routing
    pub switch: &'a dyn SwitchMatrix,
    /// Pulse source
    pub pulser: &'a dyn PulseSource,
    /// Buffered source meter
    pub source: &'a dyn BufferedSource,
    /// Buffered voltmeter
    pub voltmeter: &'a dyn BufferedVoltmeter,
}

/// Run every pulse direction in order.
pub async fn run(instruments: HallInstruments<'_>, config: &HallPulseConfig) -> Result<HallReport> {
    if let Err(e) = config.validate() {
        bail!(e);
    }

    let start = Instant::now();
    let settle = Duration::from_millis(config.settle_ms);
    let mut report = HallReport::default();

    for (index, pulse_assignment) in config.pulses.iter().enumerate() {
        tracing::info!(index, assignment = %pulse_assignment, "pulse direction");

        instruments
            .switch
            .route(pulse_assignment)
            .await
            .with_context(|| format!("routing pulse '{}'", pulse_assignment))?;
        tokio::time::sleep(settle).await;

        let pulse_time = start.elapsed().as_secs_f64();
        instruments
            .pulser
            .pulse_current(config.pulse_current, config.pulse_width)
            .await
            .context("sending pulse")?;
        tracing::info!(current = config.pulse_current, pulse_time, "pulse sent");
        tokio::time::sleep(settle).await;

        instruments
            .switch
            .route(&config.measure_assignment)
            .await
            .context("routing measurement")?;
        instruments
            .source
            .configure_buffer(config.measure_current, config.points, config.source_nplc)
            .await
            .context("configuring source buffer")?;
        instruments
            .voltmeter
            .configure_buffer(config.points, config.voltmeter_range, config.voltmeter_nplc)
            .await
            .context("configuring voltmeter buffer")?;
        tokio::time::sleep(settle).await;

        instruments.voltmeter.trigger().await.context("triggering voltmeter")?;
        instruments.source.trigger().await.context("triggering source")?;
        tokio::time::sleep(config.acquisition_time()).await;

        let series = match instruments.source.read_buffer(config.points).await {
            Ok(series) => Some(series),
            Err(e) => {
                tracing::warn!(index, error = %e, "could not read source buffer");
                None
            }
        };
        let transverse = instruments
            .voltmeter
            .read_buffer()
            .await
            .context("reading voltmeter buffer")?;

        let record = match &series {
            Some(series) => combine(
                pulse_assignment.clone(),
                pulse_time,
                series,
                &transverse,
                config.measure_current,
            ),
            None => transverse_only(
                pulse_assignment.clone(),
                pulse_time,
                &transverse,
                config.measure_current,
                config.point_time_ms,
            ),
        };
        report.pulses.push(record);
    }

    Ok(report)
}

fn combine(
    assignment: Assignment,
    pulse_time: f64,
    series: &TimeSeries,
    transverse: &[f64],
    current: f64,
) -> PulseRecord {
    let n = series
        .values
        .len()
        .min(series.time.len())
        .min(transverse.len());
    if series.values.len() != transverse.len() || series.time.len() != series.values.len() {
        tracing::warn!(
            source = series.values.len(),
            voltmeter = transverse.len(),
            kept = n,
            "buffer lengths differ, truncating"
        );
    }

    PulseRecord {
        assignment,
        pulse_time,
        time: series.time[..n].iter().map(|t| pulse_time + t).collect(),
        rxx: series.values[..n].iter().map(|v| v / current).collect(),
        rxy: transverse[..n].iter().map(|v| v / current).collect(),
    }
}

/// Record for a pulse whose source buffer could not be read.
fn transverse_only(
    assignment: Assignment,
    pulse_time: f64,
    transverse: &[f64],
    current: f64,
    point_time_ms: u64,
) -> PulseRecord {
    let spacing = point_time_ms as f64 / 1000.0;
    PulseRecord {
        assignment,
        pulse_time,
        time: (0..transverse.len())
            .map(|i| pulse_time + i as f64 * spacing)
            .collect(),
        rxx: vec![f64::NAN; transverse.len()],
        rxy: transverse.iter().map(|v| v / current).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_lab_setup() {
        let config = HallPulseConfig::default();
        assert_eq!(config.pulses.len(), 2);
        assert_eq!(config.pulses[1].to_string(), "I+=D, I-=H");
        assert_eq!(config.measure_assignment.len(), 6);
        assert_eq!(config.acquisition_time(), Duration::from_millis(18_000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_empty_runs() {
        let config = HallPulseConfig {
            pulses: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = HallPulseConfig {
            points: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_limits_the_instruments_cannot_meet() {
        let config = HallPulseConfig {
            points: keithley_2000::DEFAULT_BUFFER_LENGTH + 100,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("points"));

        let config = HallPulseConfig {
            voltmeter_nplc: 50.0,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("voltmeter_nplc"));

        let config = HallPulseConfig {
            source_nplc: -1.0,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("source_nplc"));

        let config = HallPulseConfig {
            points: keithley_2000::DEFAULT_BUFFER_LENGTH,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn combine_offsets_time_and_truncates() {
        let series = TimeSeries {
            time: vec![0.0, 0.2, 0.4],
            values: vec![2e-3, 4e-3, 6e-3],
        };
        let record = combine("I+=B, I-=F".parse().unwrap(), 10.0, &series, &[1e-3, 2e-3], 1e-3);

        assert_eq!(record.time.len(), 2);
        assert!((record.time[1] - 10.2).abs() < 1e-12);
        assert_eq!(record.rxx.len(), 2);
        assert!((record.rxx[1] - 4.0).abs() < 1e-12);
        assert!((record.rxy[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn transverse_only_keeps_every_reading() {
        let record = transverse_only("I+=B, I-=F".parse().unwrap(), 2.0, &[1e-3, -1e-3, 3e-3], 1e-3, 180);

        assert_eq!(record.rxy, vec![1.0, -1.0, 3.0]);
        assert_eq!(record.rxx.len(), 3);
        assert!(record.rxx.iter().all(|r| r.is_nan()));
        assert!((record.time[2] - 2.36).abs() < 1e-12);
    }

    #[test]
    fn rows_flatten_pulses() {
        let series = TimeSeries {
            time: vec![0.0, 0.1],
            values: vec![1e-3, 1e-3],
        };
        let report = HallReport {
            pulses: vec![
                combine("I+=B, I-=F".parse().unwrap(), 1.0, &series, &[0.0, 0.0], 1e-3),
                combine("I+=D, I-=H".parse().unwrap(), 5.0, &series, &[0.0, 0.0], 1e-3),
            ],
        };
        let rows = report.rows();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[2].pulse, 1);
        assert_eq!(rows[2].assignment, "I+=D, I-=H");
        assert!((rows[3].time_s - 5.1).abs() < 1e-12);
    }
}
