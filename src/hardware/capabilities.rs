//! Hardware capabilities used by measurement sequences.
//!
//! Sequences are written against these small traits instead of concrete
//! drivers, so a 4-wire sweep runs the same on a Keithley 2461 or 2401 and
//! tests can drive them with in-memory stand-ins.
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing

use crate::measurement_types::{ProbeReading, TimeSeries, VoltageRange, Wiring};
use crate::sequences::assignment::Assignment;
use anyhow::Result;
use async_trait::async_trait;

/// Capability: Contact Routing
///
/// Devices that connect named measurement lines to sample contacts.
///
/// # Contract
/// - `route` replaces the whole routing: lines not in the assignment end up
///   disconnected
/// - Returns once the hardware reports the relays settled
#[async_trait]
pub trait SwitchMatrix: Send + Sync {
    /// Connect lines to contacts as given, disconnecting everything else.
    async fn route(&self, assignment: &Assignment) -> Result<()>;
}

/// Capability: DC Current Probe
///
/// Source a steady current and read back (current, voltage) pairs.
#[async_trait]
pub trait ProbeSource: Send + Sync {
    /// Configure the probe and turn the output on.
    async fn enable_probe(&self, current: f64, wiring: Wiring, nplc: f64) -> Result<()>;

    /// Take one reading with the output on.
    async fn read_probe(&self) -> Result<ProbeReading>;

    /// Turn the output off.
    async fn disable_probe(&self) -> Result<()>;
}

/// Capability: Current Pulses
#[async_trait]
pub trait PulseSource: Send + Sync {
    /// Send a single square current pulse of `amps` lasting `width` seconds.
    ///
    /// Devices with a fixed pulse shape ignore `width`.
    async fn pulse_current(&self, amps: f64, width: f64) -> Result<()>;
}

/// Capability: Buffered Source-Measure
///
/// Source a current and fill the instrument buffer with timestamped
/// voltage readings on trigger.
#[async_trait]
pub trait BufferedSource: Send + Sync {
    /// Set up `num` readings at `current` amps, output on.
    async fn configure_buffer(&self, current: f64, num: usize, nplc: f64) -> Result<()>;

    /// Start filling the buffer.
    async fn trigger(&self) -> Result<()>;

    /// Turn the output off and read `num` readings back.
    async fn read_buffer(&self, num: usize) -> Result<TimeSeries>;
}

/// Capability: Buffered Voltmeter
#[async_trait]
pub trait BufferedVoltmeter: Send + Sync {
    /// Set up `num` triggered voltage readings.
    async fn configure_buffer(&self, num: usize, range: VoltageRange, nplc: f64) -> Result<()>;

    /// Start filling the buffer.
    async fn trigger(&self) -> Result<()>;

    /// Read the whole buffer.
    async fn read_buffer(&self) -> Result<Vec<f64>>;
}

/// Capabilities an instrument can offer (for lookup and configuration checks)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// [`SwitchMatrix`]
    SwitchMatrix,
    /// [`ProbeSource`]
    ProbeSource,
    /// [`PulseSource`]
    PulseSource,
    /// [`BufferedSource`]
    BufferedSource,
    /// [`BufferedVoltmeter`]
    BufferedVoltmeter,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Capability::SwitchMatrix => "switch matrix",
            Capability::ProbeSource => "probe source",
            Capability::PulseSource => "pulse source",
            Capability::BufferedSource => "buffered source",
            Capability::BufferedVoltmeter => "buffered voltmeter",
        };
        f.write_str(name)
    }
}
