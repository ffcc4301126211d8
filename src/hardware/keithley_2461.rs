//! Keithley 2461 High-Current SourceMeter Driver
//!
//! Protocol Overview:
//! - Format: SCPI (2400 graphical series, TSP disabled)
//! - Transport: USB-TMC through VISA, or LAN socket on port 5025
//! - Terminator: LF
//! - Readings go to `defbuffer1`; `trac:data?` returns the requested
//!   elements interleaved per reading
//!
//! Used for millisecond current pulses, buffered current-sourced voltage
//! measurements and as the DC probe source of 4-wire sweeps.

use crate::error::{DaqError, DaqResult};
use crate::hardware::capabilities::{BufferedSource, ProbeSource, PulseSource};
use crate::hardware::resource::{open_port, SerialSettings};
use crate::hardware::transport::{deinterleave, ScpiPort};
use crate::measurement_types::{Identity, ProbeReading, TimeSeries, Wiring};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;

/// USB resource of the lab's unit
pub const DEFAULT_RESOURCE: &str = "USB0::0x05E6::0x2461::04121022::INSTR";

/// Response timeout
pub const TIMEOUT: Duration = Duration::from_secs(12);

/// Default `defbuffer1` capacity set on connect
pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

/// Default pulse width in seconds
pub const DEFAULT_PULSE_WIDTH: f64 = 1e-3;

/// Accepted integration times (power-line cycles)
pub const NPLC_RANGE: std::ops::RangeInclusive<f64> = 0.01..=10.0;

/// Driver for the Keithley 2461
pub struct Keithley2461 {
    port: Mutex<ScpiPort>,
    buffer_capacity: usize,
}

impl Keithley2461 {
    /// Open the source meter at `resource` (usually [`DEFAULT_RESOURCE`])
    /// and put it in current-source, voltage-sense mode.
    pub async fn connect(resource: &str) -> DaqResult<Self> {
        let port = open_port(resource, &SerialSettings::default()).await?;
        let smu = Self::from_port(port);
        smu.initialize().await?;
        Ok(smu)
    }

    /// Wrap an open port. Nothing is sent.
    pub fn from_port(port: ScpiPort) -> Self {
        Self {
            port: Mutex::new(port.with_timeout(TIMEOUT)),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }

    /// Override the response timeout
    pub async fn set_timeout(&self, timeout: Duration) {
        self.port.lock().await.set_timeout(timeout);
    }

    /// Change the `defbuffer1` capacity applied by [`initialize`](Self::initialize).
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Identify, reset, and select current source / voltage sense.
    pub async fn initialize(&self) -> DaqResult<Identity> {
        let identity = self.identify().await?;
        tracing::info!(%identity, "Keithley 2461 connected");

        let commands = [
            "*RST".to_string(),
            "sour:func curr".to_string(),
            "sens:func \"volt\"".to_string(),
            "sens:volt:rang:auto on".to_string(),
            format!("trac:poin {}, \"defbuffer1\"", self.buffer_capacity),
        ];
        self.port.lock().await.write_all(&commands).await?;
        Ok(identity)
    }

    /// Query `*IDN?`
    pub async fn identify(&self) -> DaqResult<Identity> {
        let response = self.port.lock().await.query("*IDN?").await?;
        Identity::parse(&response)
    }

    /// Send one square current pulse of `current` amps lasting `width`
    /// seconds, measured 2-wire.
    pub async fn pulse_current(&self, current: f64, width: f64) -> DaqResult<()> {
        validate_width(width)?;
        let sweep = format!(
            "sour:puls:swe:curr:lin 0, 0, {}, 2, {}, off, \"defbuffer1\", 0, 0, 1, 30, 30, off, off",
            current, width
        );
        tracing::debug!(current, width, "Keithley 2461 current pulse");
        self.send_pulse(&sweep).await
    }

    /// Send one square voltage pulse of `voltage` volts lasting `width`
    /// seconds, measured 2-wire.
    pub async fn pulse_voltage(&self, voltage: f64, width: f64) -> DaqResult<()> {
        validate_width(width)?;
        let sweep = format!(
            "sour:puls:swe:volt:lin 0, 0, {}, 2, {}, off, \"defbuffer1\", 0, 0, 1, 75e-3, 75e-3, off, off",
            voltage, width
        );
        tracing::debug!(voltage, width, "Keithley 2461 voltage pulse");
        self.send_pulse(&sweep).await
    }

    async fn send_pulse(&self, sweep: &str) -> DaqResult<()> {
        self.port
            .lock()
            .await
            .write_all(&["sens:volt:rsen off", ":form:asc:prec 16", sweep, "init", "*wai"])
            .await
    }

    /// Configure `num` 4-wire voltage readings at a constant `current` using
    /// the `SimpleLoop` trigger model, output on.
    pub async fn measure_n(&self, current: f64, num: usize, nplc: f64) -> DaqResult<()> {
        if num == 0 || num > self.buffer_capacity {
            return Err(DaqError::InvalidParameter(format!(
                "reading count must be 1..={}, got {}",
                self.buffer_capacity, num
            )));
        }
        validate_nplc(nplc)?;
        let commands = [
            "sour:curr:rang 200e-6".to_string(),
            format!("sour:curr {}", current),
            "sens:volt:rsen on".to_string(),
            format!("sens:volt:nplc {}", nplc),
            "sens:volt:rang:auto on".to_string(),
            format!("trig:load \"SimpleLoop\", {}, 0, \"defbuffer1\"", num),
            "outp on".to_string(),
        ];
        self.port.lock().await.write_all(&commands).await
    }

    /// Start the loaded trigger model
    pub async fn trigger(&self) -> DaqResult<()> {
        self.port.lock().await.write_all(&["init", "*wai"]).await
    }

    /// Turn the output off and read the first `num` readings with their
    /// times relative to the first reading.
    pub async fn read_buffer(&self, num: usize) -> DaqResult<TimeSeries> {
        let values = {
            let mut port = self.port.lock().await;
            port.write("outp off").await?;
            port.query_ascii_values(&format!(
                "trac:data? 1, {}, \"defbuffer1\", read, rel",
                num
            ))
            .await?
        };

        let mut columns = deinterleave(&values, 2)?.into_iter();
        let values = columns.next().unwrap_or_default();
        let time = columns.next().unwrap_or_default();
        Ok(TimeSeries { time, values })
    }

    /// Source `current` and sense voltage on the separate sense leads.
    pub async fn enable_4_wire_probe(&self, current: f64, nplc: f64) -> DaqResult<()> {
        self.enable_probe_with(current, Wiring::FourWire, nplc).await
    }

    /// Source `current` and sense voltage on the source leads.
    pub async fn enable_2_wire_probe(&self, current: f64, nplc: f64) -> DaqResult<()> {
        self.enable_probe_with(current, Wiring::TwoWire, nplc).await
    }

    async fn enable_probe_with(&self, current: f64, wiring: Wiring, nplc: f64) -> DaqResult<()> {
        validate_nplc(nplc)?;
        let commands = [
            "sour:func curr".to_string(),
            format!("sour:curr {}", current),
            "sour:curr:vlim 2".to_string(),
            "sens:func \"volt\"".to_string(),
            "sens:volt:rang:auto on".to_string(),
            format!("sens:volt:rsen {}", wiring.remote_sense()),
            format!("sens:volt:nplc {}", nplc),
            "outp on".to_string(),
        ];
        self.port.lock().await.write_all(&commands).await
    }

    /// Turn the probe current off
    pub async fn disable_probe_current(&self) -> DaqResult<()> {
        self.port.lock().await.write("outp off").await
    }

    /// One probe reading as (sourced current, measured voltage).
    pub async fn read_one(&self) -> DaqResult<ProbeReading> {
        let values = self
            .port
            .lock()
            .await
            .query_ascii_values(":READ? \"defbuffer1\", sour, read")
            .await?;
        match values.as_slice() {
            [current, voltage, ..] => Ok(ProbeReading {
                current: *current,
                voltage: *voltage,
            }),
            _ => Err(DaqError::parse(
                format!("{:?}", values),
                "expected source and reading values",
            )),
        }
    }

    /// Reset, disable service requests and the output, then release the port.
    pub async fn close(&self) -> DaqResult<()> {
        let mut port = self.port.lock().await;
        port.write_all(&["*rst", "*sre 0", "outp off"]).await?;
        port.shutdown().await
    }
}

fn validate_width(width: f64) -> DaqResult<()> {
    if width <= 0.0 || !width.is_finite() {
        return Err(DaqError::InvalidParameter(format!(
            "pulse width must be positive, got {}",
            width
        )));
    }
    Ok(())
}

fn validate_nplc(nplc: f64) -> DaqResult<()> {
    if !NPLC_RANGE.contains(&nplc) {
        return Err(DaqError::InvalidParameter(format!(
            "NPLC must be 0.01..=10, got {}",
            nplc
        )));
    }
    Ok(())
}

#[async_trait]
impl PulseSource for Keithley2461 {
    async fn pulse_current(&self, amps: f64, width: f64) -> anyhow::Result<()> {
        Ok(Keithley2461::pulse_current(self, amps, width).await?)
    }
}

#[async_trait]
impl ProbeSource for Keithley2461 {
    async fn enable_probe(&self, current: f64, wiring: Wiring, nplc: f64) -> anyhow::Result<()> {
        Ok(self.enable_probe_with(current, wiring, nplc).await?)
    }

    async fn read_probe(&self) -> anyhow::Result<ProbeReading> {
        Ok(self.read_one().await?)
    }

    async fn disable_probe(&self) -> anyhow::Result<()> {
        Ok(self.disable_probe_current().await?)
    }
}

#[async_trait]
impl BufferedSource for Keithley2461 {
    async fn configure_buffer(&self, current: f64, num: usize, nplc: f64) -> anyhow::Result<()> {
        Ok(self.measure_n(current, num, nplc).await?)
    }

    async fn trigger(&self) -> anyhow::Result<()> {
        Ok(Keithley2461::trigger(self).await?)
    }

    async fn read_buffer(&self, num: usize) -> anyhow::Result<TimeSeries> {
        Ok(Keithley2461::read_buffer(self, num).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::channel_port::{self, DevicePeer};

    fn test_smu() -> (Keithley2461, DevicePeer) {
        let (stream, device) = channel_port::pair();
        (
            Keithley2461::from_port(ScpiPort::new("test", Box::new(stream))),
            device,
        )
    }

    #[tokio::test]
    async fn initialize_sizes_default_buffer() {
        let (smu, mut device) = test_smu();
        let smu = smu.with_buffer_capacity(2000);

        let (identity, _) = tokio::join!(smu.initialize(), async {
            device
                .expect_query("*IDN?", "KEITHLEY INSTRUMENTS,MODEL 2461,04121022,1.7.0b\n")
                .await;
            device
                .expect_commands(&[
                    "*RST",
                    "sour:func curr",
                    "sens:func \"volt\"",
                    "sens:volt:rang:auto on",
                    "trac:poin 2000, \"defbuffer1\"",
                ])
                .await;
        });
        assert_eq!(identity.unwrap().serial, "04121022");
    }

    #[tokio::test]
    async fn current_pulse_sweep_command() {
        let (smu, mut device) = test_smu();
        smu.pulse_current(0.01, 1e-3).await.unwrap();

        device
            .expect_commands(&[
                "sens:volt:rsen off",
                ":form:asc:prec 16",
                "sour:puls:swe:curr:lin 0, 0, 0.01, 2, 0.001, off, \"defbuffer1\", 0, 0, 1, 30, 30, off, off",
                "init",
                "*wai",
            ])
            .await;
    }

    #[tokio::test]
    async fn voltage_pulse_uses_voltage_limits() {
        let (smu, mut device) = test_smu();
        smu.pulse_voltage(1.5, 2e-3).await.unwrap();

        let lines = device.drain_lines().await;
        assert_eq!(
            lines[2],
            "sour:puls:swe:volt:lin 0, 0, 1.5, 2, 0.002, off, \"defbuffer1\", 0, 0, 1, 75e-3, 75e-3, off, off"
        );
        assert!(smu.pulse_voltage(1.0, 0.0).await.is_err());
    }

    #[tokio::test]
    async fn measure_n_loads_simple_loop() {
        let (smu, mut device) = test_smu();
        smu.measure_n(1e-4, 200, 2.0).await.unwrap();

        device
            .expect_commands(&[
                "sour:curr:rang 200e-6",
                "sour:curr 0.0001",
                "sens:volt:rsen on",
                "sens:volt:nplc 2",
                "sens:volt:rang:auto on",
                "trig:load \"SimpleLoop\", 200, 0, \"defbuffer1\"",
                "outp on",
            ])
            .await;

        assert!(smu.measure_n(1e-4, 20_000, 2.0).await.is_err());
    }

    #[tokio::test]
    async fn rejects_nplc_out_of_range_without_sending() {
        let (smu, mut device) = test_smu();
        assert!(matches!(
            smu.measure_n(1e-4, 10, 50.0).await,
            Err(DaqError::InvalidParameter(_))
        ));
        assert!(smu.enable_4_wire_probe(1e-3, 0.0).await.is_err());
        assert!(device.drain_lines().await.is_empty());
    }

    #[tokio::test]
    async fn read_buffer_deinterleaves_reading_and_time() {
        let (smu, mut device) = test_smu();

        let (series, _) = tokio::join!(smu.read_buffer(3), async {
            device.expect_command("outp off").await;
            device
                .expect_query(
                    "trac:data? 1, 3, \"defbuffer1\", read, rel",
                    "1.0e-2,0.0,1.1e-2,0.1,1.2e-2,0.2\n",
                )
                .await;
        });

        let series = series.unwrap();
        assert_eq!(series.values, vec![1.0e-2, 1.1e-2, 1.2e-2]);
        assert_eq!(series.time, vec![0.0, 0.1, 0.2]);
    }

    #[tokio::test]
    async fn probe_cycle() {
        let (smu, mut device) = test_smu();

        smu.enable_4_wire_probe(1e-3, 1.0).await.unwrap();
        let lines = device.drain_lines().await;
        assert_eq!(lines[2], "sour:curr:vlim 2");
        assert_eq!(lines[5], "sens:volt:rsen on");

        smu.enable_2_wire_probe(1e-3, 1.0).await.unwrap();
        let lines = device.drain_lines().await;
        assert_eq!(lines[5], "sens:volt:rsen off");

        let (reading, _) = tokio::join!(smu.read_one(), async {
            device
                .expect_query(":READ? \"defbuffer1\", sour, read", "1.0E-03,2.5E-01\n")
                .await;
        });
        let reading = reading.unwrap();
        assert_eq!(reading.current, 1e-3);
        assert_eq!(reading.voltage, 0.25);

        smu.disable_probe_current().await.unwrap();
        device.expect_command("outp off").await;
    }

    #[tokio::test]
    async fn close_resets_and_disables_output() {
        let (smu, mut device) = test_smu();
        smu.close().await.unwrap();
        device.expect_commands(&["*rst", "*sre 0", "outp off"]).await;
    }

    #[tokio::test]
    async fn unanswered_query_times_out() {
        let (stream, _device) = channel_port::pair();
        let smu = Keithley2461::from_port(ScpiPort::new("test", Box::new(stream)));
        smu.port
            .lock()
            .await
            .set_timeout(Duration::from_millis(50));

        let err = smu.read_one().await.unwrap_err();
        assert!(matches!(err, DaqError::Timeout { .. }));
    }
}
