//! Keithley 2000 Digital Multimeter Driver
//!
//! Reference: Keithley Model 2000 User's Manual, SCPI command reference
//!
//! Protocol Overview:
//! - Format: SCPI
//! - Transport: RS-232, 19200 baud, 8N1, no flow control
//! - Terminator: CR LF on both write and read
//! - Buffer: up to 1024 readings, filled by the trigger model after `init`
//!
//! # Example Usage
//!
//! ```no_run
//! use rust_instruments::hardware::keithley_2000::Keithley2000;
//! use rust_instruments::measurement_types::VoltageRange;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let dmm = Keithley2000::connect("COM3").await?;
//!
//!     // 100 triggered voltage readings into the buffer
//!     dmm.measure_n(100, VoltageRange::Auto, 1.0).await?;
//!     dmm.trigger().await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//!     let readings = dmm.read_buffer().await?;
//!     println!("{} readings", readings.len());
//!
//!     Ok(())
//! }
//! ```

use crate::error::{DaqError, DaqResult};
use crate::hardware::capabilities::BufferedVoltmeter;
use crate::hardware::resource::{open_port, SerialSettings};
use crate::hardware::transport::ScpiPort;
use crate::measurement_types::{Identity, VoltageRange, Wiring};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;

/// Baud rate set on the front panel (19.2k)
pub const BAUD_RATE: u32 = 19_200;

/// Response timeout
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Buffer length used unless changed with [`Keithley2000::with_buffer_length`]
pub const DEFAULT_BUFFER_LENGTH: usize = 500;

/// Largest buffer the instrument supports
pub const MAX_BUFFER_LENGTH: usize = 1024;

/// Accepted integration times (power-line cycles)
pub const NPLC_RANGE: std::ops::RangeInclusive<f64> = 0.01..=10.0;

/// Driver for the Keithley 2000 multimeter
pub struct Keithley2000 {
    port: Mutex<ScpiPort>,
    buffer_length: usize,
}

impl Keithley2000 {
    /// Open the multimeter at `resource` and reset it.
    ///
    /// # Errors
    /// Returns error if the port cannot be opened or the instrument does not
    /// answer the identification query.
    pub async fn connect(resource: &str) -> DaqResult<Self> {
        let port = open_port(resource, &SerialSettings::new(BAUD_RATE)).await?;
        let dmm = Self::from_port(port);
        dmm.initialize().await?;
        Ok(dmm)
    }

    /// Wrap an open port, applying this instrument's terminations and
    /// timeout. Nothing is sent.
    pub fn from_port(port: ScpiPort) -> Self {
        Self {
            port: Mutex::new(
                port.with_write_termination("\r\n")
                    .with_read_termination(b'\n')
                    .with_timeout(TIMEOUT),
            ),
            buffer_length: DEFAULT_BUFFER_LENGTH,
        }
    }

    /// Override the response timeout
    pub async fn set_timeout(&self, timeout: Duration) {
        self.port.lock().await.set_timeout(timeout);
    }

    /// Change the largest reading count `measure_n` accepts.
    pub fn with_buffer_length(mut self, buffer_length: usize) -> DaqResult<Self> {
        if !(1..=MAX_BUFFER_LENGTH).contains(&buffer_length) {
            return Err(DaqError::InvalidParameter(format!(
                "buffer length must be 1..={}, got {}",
                MAX_BUFFER_LENGTH, buffer_length
            )));
        }
        self.buffer_length = buffer_length;
        Ok(self)
    }

    /// Largest reading count `measure_n` accepts
    pub fn buffer_length(&self) -> usize {
        self.buffer_length
    }

    /// Reset and clear status, then log the identification string.
    pub async fn initialize(&self) -> DaqResult<Identity> {
        self.port.lock().await.write_all(&["*rst", "*cls"]).await?;
        let identity = self.identify().await?;
        tracing::info!(%identity, "Keithley 2000 connected");
        Ok(identity)
    }

    /// Query `*IDN?`
    pub async fn identify(&self) -> DaqResult<Identity> {
        let response = self.port.lock().await.query("*IDN?").await?;
        Identity::parse(&response)
    }

    /// Configure `num` triggered voltage readings into the buffer.
    ///
    /// Readings start on [`trigger`](Self::trigger) and the buffer does not
    /// overwrite earlier readings until full.
    pub async fn measure_n(&self, num: usize, range: VoltageRange, nplc: f64) -> DaqResult<()> {
        validate_nplc(nplc)?;
        if num == 0 || num > self.buffer_length {
            return Err(DaqError::InvalidParameter(format!(
                "reading count must be 1..={}, got {}",
                self.buffer_length, num
            )));
        }

        let commands = [
            "sens:func \"volt\"".to_string(),
            format!("sens:volt:nplc {}", nplc),
            range.command("sens:volt"),
            format!("trig:count {}", num),
            "trac:clear".to_string(),
            format!("trac:poin {}", num),
            "trac:feed sens".to_string(),
            "trac:feed:cont next".to_string(),
        ];
        self.port.lock().await.write_all(&commands).await
    }

    /// Configure single voltage readings, read with [`read_one`](Self::read_one).
    pub async fn measure_one(&self, range: VoltageRange, nplc: f64) -> DaqResult<()> {
        validate_nplc(nplc)?;
        let commands = [
            "sens:func \"volt\"".to_string(),
            format!("sens:volt:nplc {}", nplc),
            range.command("sens:volt"),
        ];
        self.port.lock().await.write_all(&commands).await
    }

    /// Configure single resistance readings, 2-wire (`res`) or 4-wire
    /// (`fres`), autoranged. [`read_one`](Self::read_one) then returns ohms.
    pub async fn measure_resistance(&self, wiring: Wiring, nplc: f64) -> DaqResult<()> {
        validate_nplc(nplc)?;
        let function = match wiring {
            Wiring::TwoWire => "res",
            Wiring::FourWire => "fres",
        };
        let commands = [
            format!("sens:func \"{}\"", function),
            format!("sens:{}:nplc {}", function, nplc),
            format!("sens:{}:rang:auto on", function),
        ];
        self.port.lock().await.write_all(&commands).await
    }

    /// Start the configured measurement
    pub async fn trigger(&self) -> DaqResult<()> {
        self.port.lock().await.write_all(&["init", "*wai"]).await
    }

    /// Read every reading in the buffer
    pub async fn read_buffer(&self) -> DaqResult<Vec<f64>> {
        self.port.lock().await.query_ascii_values("trac:data?").await
    }

    /// Read the latest single reading
    pub async fn read_one(&self) -> DaqResult<f64> {
        let values = self.port.lock().await.query_ascii_values("sens:data?").await?;
        values
            .first()
            .copied()
            .ok_or_else(|| DaqError::parse("", "no reading in sens:data? response"))
    }

    /// Release the port
    pub async fn close(&self) -> DaqResult<()> {
        self.port.lock().await.shutdown().await
    }
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
impl BufferedVoltmeter for Keithley2000 {
    async fn configure_buffer(
        &self,
        num: usize,
        range: VoltageRange,
        nplc: f64,
    ) -> anyhow::Result<()> {
        Ok(self.measure_n(num, range, nplc).await?)
    }

    async fn trigger(&self) -> anyhow::Result<()> {
        Ok(Keithley2000::trigger(self).await?)
    }

    async fn read_buffer(&self) -> anyhow::Result<Vec<f64>> {
        Ok(Keithley2000::read_buffer(self).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::channel_port::{self, DevicePeer};

    fn test_dmm() -> (Keithley2000, DevicePeer) {
        let (stream, device) = channel_port::pair();
        (
            Keithley2000::from_port(ScpiPort::new("test", Box::new(stream))),
            device,
        )
    }

    #[tokio::test]
    async fn initialize_resets_and_identifies() {
        let (dmm, mut device) = test_dmm();

        let (identity, _) = tokio::join!(dmm.initialize(), async {
            device.expect_commands(&["*rst", "*cls"]).await;
            device
                .expect_query("*IDN?", "KEITHLEY INSTRUMENTS INC.,MODEL 2000,0661234,A19  /A02\r\n")
                .await;
        });
        assert_eq!(identity.unwrap().model, "MODEL 2000");
    }

    #[tokio::test]
    async fn measure_n_configures_buffer() {
        let (dmm, mut device) = test_dmm();
        dmm.measure_n(100, VoltageRange::Fixed(0.1), 2.0).await.unwrap();

        assert_eq!(
            device.drain_lines().await,
            vec![
                "sens:func \"volt\"",
                "sens:volt:nplc 2",
                "sens:volt:rang 0.1",
                "trig:count 100",
                "trac:clear",
                "trac:poin 100",
                "trac:feed sens",
                "trac:feed:cont next",
            ]
        );
    }

    #[tokio::test]
    async fn measure_n_respects_buffer_length() {
        let (dmm, mut device) = test_dmm();
        assert!(dmm.measure_n(501, VoltageRange::Auto, 1.0).await.is_err());
        assert!(dmm.measure_n(0, VoltageRange::Auto, 1.0).await.is_err());

        let dmm = dmm.with_buffer_length(1024).unwrap();
        dmm.measure_n(1000, VoltageRange::Auto, 1.0).await.unwrap();
        assert_eq!(device.drain_lines().await.len(), 8);

        assert!(dmm.with_buffer_length(2000).is_err());
    }

    #[tokio::test]
    async fn rejects_nplc_out_of_range_without_sending() {
        let (dmm, mut device) = test_dmm();
        let err = dmm.measure_one(VoltageRange::Auto, 50.0).await.unwrap_err();
        assert!(matches!(err, DaqError::InvalidParameter(_)));
        assert!(device.drain_lines().await.is_empty());
    }

    #[tokio::test]
    async fn trigger_and_read_buffer() {
        let (dmm, mut device) = test_dmm();
        dmm.trigger().await.unwrap();
        device.expect_commands(&["init", "*wai"]).await;

        let (readings, _) = tokio::join!(dmm.read_buffer(), async {
            device
                .expect_query("trac:data?", "+1.0E-03,+1.1E-03,+0.9E-03\r\n")
                .await;
        });
        assert_eq!(readings.unwrap(), vec![1.0e-3, 1.1e-3, 0.9e-3]);
    }

    #[tokio::test]
    async fn single_reading_with_auto_range() {
        let (dmm, mut device) = test_dmm();
        dmm.measure_one(VoltageRange::Auto, 0.1).await.unwrap();
        device
            .expect_commands(&["sens:func \"volt\"", "sens:volt:nplc 0.1", "sens:volt:rang:auto on"])
            .await;

        let (value, _) = tokio::join!(dmm.read_one(), async {
            device.expect_query("sens:data?", "-4.2E-06\r\n").await;
        });
        assert_eq!(value.unwrap(), -4.2e-6);
    }

    #[tokio::test]
    async fn four_wire_resistance_mode() {
        let (dmm, mut device) = test_dmm();
        dmm.measure_resistance(Wiring::FourWire, 1.0).await.unwrap();
        device
            .expect_commands(&["sens:func \"fres\"", "sens:fres:nplc 1", "sens:fres:rang:auto on"])
            .await;

        dmm.measure_resistance(Wiring::TwoWire, 10.0).await.unwrap();
        device.expect_command("sens:func \"res\"").await;
    }
}
