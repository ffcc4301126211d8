//! Keithley 2401 SourceMeter Driver
//!
//! Protocol Overview:
//! - Format: SCPI (2400 series)
//! - Transport: RS-232, 19200 baud, 8N1
//! - Terminator: CR LF
//! - Buffer readings are `volt, curr, time` triples (see `form:elem`)
//!
//! The 2401 is used for two things: short fixed-width current pulses and
//! buffered current-sourced voltage sweeps. It can also act as a DC probe
//! source in 4-wire resistance sweeps.

use crate::error::{DaqError, DaqResult};
use crate::hardware::capabilities::{ProbeSource, PulseSource};
use crate::hardware::resource::{open_port, SerialSettings};
use crate::hardware::transport::{deinterleave, ScpiPort};
use crate::measurement_types::{Identity, ProbeReading, SweepBuffer, Wiring};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;

/// Baud rate (19.2k)
pub const BAUD_RATE: u32 = 19_200;

/// Response timeout; buffer dumps of long sweeps are slow at 19.2k
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Voltage compliance for buffered sweeps and pulses
const VOLTAGE_COMPLIANCE: f64 = 20.0;

/// Voltage compliance in probe mode
const PROBE_COMPLIANCE: f64 = 2.0;

/// Driver for the Keithley 2401
pub struct Keithley2401 {
    port: Mutex<ScpiPort>,
}

impl Keithley2401 {
    /// Open the source meter at `resource` and reset it.
    pub async fn connect(resource: &str) -> DaqResult<Self> {
        let port = open_port(resource, &SerialSettings::new(BAUD_RATE)).await?;
        let smu = Self::from_port(port);
        smu.initialize().await?;
        tracing::info!(resource, "Keithley 2401 connected");
        Ok(smu)
    }

    /// Wrap an open port with this instrument's terminations and timeout.
    pub fn from_port(port: ScpiPort) -> Self {
        Self {
            port: Mutex::new(
                port.with_write_termination("\r\n")
                    .with_read_termination(b'\n')
                    .with_timeout(TIMEOUT),
            ),
        }
    }

    /// Override the response timeout
    pub async fn set_timeout(&self, timeout: Duration) {
        self.port.lock().await.set_timeout(timeout);
    }

    /// Reset and clear status.
    pub async fn initialize(&self) -> DaqResult<()> {
        self.port.lock().await.write_all(&["*rst", "*cls"]).await
    }

    /// Query `*IDN?`
    pub async fn identify(&self) -> DaqResult<Identity> {
        let response = self.port.lock().await.query("*IDN?").await?;
        Identity::parse(&response)
    }

    /// Send one square current pulse of `current` amps.
    ///
    /// Pulse width is fixed by the instrument (about 5 ms with zero trigger
    /// and source delays).
    pub async fn pulse_current(&self, current: f64) -> DaqResult<()> {
        let commands = [
            "*rst".to_string(),
            "trac:cle".to_string(),
            "*cls".to_string(),
            ":syst:rsen on".to_string(),
            "trig:coun 1".to_string(),
            "sour:func curr".to_string(),
            "sens:func:conc off".to_string(),
            "sens:volt:rang:auto on".to_string(),
            format!("sens:volt:prot:lev {}", VOLTAGE_COMPLIANCE),
            format!("sour:curr:lev {}", current),
            "trig:del 0".to_string(),
            "sour:del 0".to_string(),
            "sour:cle:auto on".to_string(),
            "INIT".to_string(),
            "*WAI".to_string(),
        ];
        tracing::debug!(current, "Keithley 2401 pulse");
        self.port.lock().await.write_all(&commands).await
    }

    /// Configure `num` buffered 4-wire voltage readings at a constant
    /// `current`, timestamps absolute, output on.
    pub async fn measure_n(&self, current: f64, num: usize, nplc: f64) -> DaqResult<()> {
        if num == 0 {
            return Err(DaqError::InvalidParameter(
                "reading count must be positive".to_string(),
            ));
        }
        let commands = [
            "*rst".to_string(),
            "*cls".to_string(),
            "sour:func curr".to_string(),
            format!("sour:curr {}", current),
            "sour:curr:rang:auto on".to_string(),
            format!("sens:volt:prot:lev {}", VOLTAGE_COMPLIANCE),
            "sens:func \"volt\"".to_string(),
            format!("sens:volt:nplc {}", nplc),
            "sens:volt:rang:auto on".to_string(),
            "syst:rsen on".to_string(),
            "form:elem time, volt, curr".to_string(),
            "trac:cle".to_string(),
            format!("trig:count {}", num),
            format!("trac:poin {}", num),
            "trac:feed sens".to_string(),
            "trac:feed:cont next".to_string(),
            "trac:tst:form abs".to_string(),
            "outp on".to_string(),
        ];
        self.port.lock().await.write_all(&commands).await
    }

    /// Start the configured sweep
    pub async fn trigger(&self) -> DaqResult<()> {
        self.port.lock().await.write_all(&["init", "*wai"]).await
    }

    /// Turn the output off and read the whole buffer.
    pub async fn read_buffer(&self) -> DaqResult<SweepBuffer> {
        let values = {
            let mut port = self.port.lock().await;
            port.write("outp off").await?;
            port.query_ascii_values("trac:data?").await?
        };

        let mut columns = deinterleave(&values, 3)?.into_iter();
        let voltage = columns.next().unwrap_or_default();
        let current = columns.next().unwrap_or_default();
        let time = columns.next().unwrap_or_default();
        Ok(SweepBuffer {
            time,
            voltage,
            current,
        })
    }

    /// Source a steady `current` and measure voltage on each [`read_one`](Self::read_one).
    pub async fn enable_probe(&self, current: f64, wiring: Wiring, nplc: f64) -> DaqResult<()> {
        let commands = [
            "sour:func curr".to_string(),
            format!("sour:curr {}", current),
            "sour:curr:rang:auto on".to_string(),
            format!("sens:volt:prot:lev {}", PROBE_COMPLIANCE),
            "sens:func \"volt\"".to_string(),
            "sens:volt:rang:auto on".to_string(),
            format!("syst:rsen {}", wiring.remote_sense()),
            format!("sens:volt:nplc {}", nplc),
            "form:elem volt, curr".to_string(),
            "outp on".to_string(),
        ];
        self.port.lock().await.write_all(&commands).await
    }

    /// One probe reading as (current, voltage).
    pub async fn read_one(&self) -> DaqResult<ProbeReading> {
        let response = self.port.lock().await.query("read?").await?;
        let values = crate::hardware::transport::parse_ascii_values(&response)?;
        match values.as_slice() {
            [voltage, current, ..] => Ok(ProbeReading {
                current: *current,
                voltage: *voltage,
            }),
            _ => Err(DaqError::parse(response, "expected voltage and current")),
        }
    }

    /// Turn the probe current off
    pub async fn disable_probe_current(&self) -> DaqResult<()> {
        self.port.lock().await.write("outp off").await
    }

    /// Output off, then release the port
    pub async fn close(&self) -> DaqResult<()> {
        let mut port = self.port.lock().await;
        port.write("outp off").await?;
        port.shutdown().await
    }
}

#[async_trait]
impl PulseSource for Keithley2401 {
    async fn pulse_current(&self, amps: f64, _width: f64) -> anyhow::Result<()> {
        Ok(Keithley2401::pulse_current(self, amps).await?)
    }
}

#[async_trait]
impl ProbeSource for Keithley2401 {
    async fn enable_probe(&self, current: f64, wiring: Wiring, nplc: f64) -> anyhow::Result<()> {
        Ok(Keithley2401::enable_probe(self, current, wiring, nplc).await?)
    }

    async fn read_probe(&self) -> anyhow::Result<ProbeReading> {
        Ok(self.read_one().await?)
    }

    async fn disable_probe(&self) -> anyhow::Result<()> {
        Ok(self.disable_probe_current().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::channel_port::{self, DevicePeer};

    fn test_smu() -> (Keithley2401, DevicePeer) {
        let (stream, device) = channel_port::pair();
        (
            Keithley2401::from_port(ScpiPort::new("test", Box::new(stream))),
            device,
        )
    }

    #[tokio::test]
    async fn pulse_sends_full_block() {
        let (smu, mut device) = test_smu();
        smu.pulse_current(0.015).await.unwrap();

        let lines = device.drain_lines().await;
        assert_eq!(lines.len(), 15);
        assert_eq!(lines[0], "*rst");
        assert_eq!(lines[9], "sour:curr:lev 0.015");
        assert_eq!(lines[13..], ["INIT", "*WAI"]);
    }

    #[tokio::test]
    async fn measure_n_formats_buffer() {
        let (smu, mut device) = test_smu();
        smu.measure_n(1e-3, 50, 2.0).await.unwrap();

        let lines = device.drain_lines().await;
        assert_eq!(lines[3], "sour:curr 0.001");
        assert_eq!(lines[7], "sens:volt:nplc 2");
        assert!(lines.contains(&"trig:count 50".to_string()));
        assert!(lines.contains(&"trac:poin 50".to_string()));
        assert_eq!(lines.last().map(String::as_str), Some("outp on"));

        assert!(smu.measure_n(1e-3, 0, 2.0).await.is_err());
    }

    #[tokio::test]
    async fn read_buffer_splits_triples() {
        let (smu, mut device) = test_smu();

        let (buffer, _) = tokio::join!(smu.read_buffer(), async {
            device.expect_command("outp off").await;
            device
                .expect_query(
                    "trac:data?",
                    "+1.0E-01,+1.0E-03,+0.0E+00,+1.1E-01,+1.0E-03,+5.0E-02\r\n",
                )
                .await;
        });

        let buffer = buffer.unwrap();
        assert_eq!(buffer.voltage, vec![0.1, 0.11]);
        assert_eq!(buffer.current, vec![1e-3, 1e-3]);
        assert_eq!(buffer.time, vec![0.0, 0.05]);
    }

    #[tokio::test]
    async fn read_buffer_rejects_partial_triples() {
        let (smu, mut device) = test_smu();

        let (buffer, _) = tokio::join!(smu.read_buffer(), async {
            device.expect_command("outp off").await;
            device.expect_query("trac:data?", "1.0,2.0\r\n").await;
        });
        assert!(matches!(buffer, Err(DaqError::Parse { .. })));
    }

    #[tokio::test]
    async fn probe_reads_voltage_then_current() {
        let (smu, mut device) = test_smu();
        ProbeSource::enable_probe(&smu, 1e-4, Wiring::TwoWire, 1.0)
            .await
            .unwrap();
        let lines = device.drain_lines().await;
        assert!(lines.contains(&"syst:rsen off".to_string()));
        assert_eq!(lines.last().map(String::as_str), Some("outp on"));

        let (reading, _) = tokio::join!(smu.read_probe(), async {
            device.expect_query("read?", "+2.5E-02,+1.0E-04\r\n").await;
        });
        let reading = reading.unwrap();
        assert_eq!(reading.current, 1e-4);
        assert_eq!(reading.voltage, 0.025);

        smu.disable_probe().await.unwrap();
        device.expect_command("outp off").await;
    }

    #[tokio::test]
    async fn close_turns_output_off() {
        let (smu, mut device) = test_smu();
        smu.close().await.unwrap();
        device.expect_command("outp off").await;
    }
}
