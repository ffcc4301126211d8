//! Lake Shore Model 336 Temperature Controller Driver
//!
//! Protocol Overview:
//! - Transport: USB-serial at 57600 baud, 7 data bits, odd parity, 1 stop
//!   bit; or LAN socket on port 7777
//! - Terminator: CR LF
//! - Four sensor inputs `A`-`D`, four control loops `1`-`4` (only loops 1
//!   and 2 drive the main heaters)

use crate::error::{DaqError, DaqResult};
use crate::hardware::resource::{open_port, Parity, SerialSettings};
use crate::hardware::transport::ScpiPort;
use crate::measurement_types::Identity;
use std::time::Duration;
use tokio::sync::Mutex;

/// Baud rate
pub const BAUD_RATE: u32 = 57_600;

/// Response timeout
pub const TIMEOUT: Duration = Duration::from_secs(3);

/// Main heater range (`RANGE`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaterRange {
    /// Heater off
    Off = 0,
    /// Low
    Low = 1,
    /// Medium
    Medium = 2,
    /// High
    High = 3,
}

/// Driver for the Lakeshore 336
pub struct Lakeshore336 {
    port: Mutex<ScpiPort>,
}

impl Lakeshore336 {
    /// Open the controller and log its identification.
    pub async fn connect(resource: &str) -> DaqResult<Self> {
        let settings = SerialSettings::new(BAUD_RATE)
            .with_data_bits(7)
            .with_parity(Parity::Odd);
        let port = open_port(resource, &settings).await?;
        let controller = Self::from_port(port);
        controller.initialize().await?;
        Ok(controller)
    }

    /// Wrap an open port. Nothing is sent.
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

    /// Nothing to configure; confirms the controller answers.
    pub async fn initialize(&self) -> DaqResult<Identity> {
        let identity = self.identify().await?;
        tracing::info!(%identity, "Lakeshore 336 connected");
        Ok(identity)
    }

    /// Query `*IDN?`
    pub async fn identify(&self) -> DaqResult<Identity> {
        let response = self.port.lock().await.query("*IDN?").await?;
        Identity::parse(&response)
    }

    /// Temperature of input `channel` in kelvin
    pub async fn temperature(&self, channel: char) -> DaqResult<f64> {
        let channel = validate_channel(channel)?;
        self.query_f64(&format!("KRDG? {}", channel)).await
    }

    /// Raw sensor reading of input `channel` in sensor units
    pub async fn sensor_reading(&self, channel: char) -> DaqResult<f64> {
        let channel = validate_channel(channel)?;
        self.query_f64(&format!("SRDG? {}", channel)).await
    }

    /// Control setpoint of `output` in kelvin
    pub async fn set_setpoint(&self, output: u8, kelvin: f64) -> DaqResult<()> {
        validate_loop(output, 4)?;
        if kelvin.is_nan() || kelvin < 0.0 {
            return Err(DaqError::InvalidParameter(format!(
                "setpoint must be non-negative, got {}",
                kelvin
            )));
        }
        self.port
            .lock()
            .await
            .write(&format!("SETP {},{}", output, kelvin))
            .await
    }

    /// Current setpoint of `output` in kelvin
    pub async fn setpoint(&self, output: u8) -> DaqResult<f64> {
        validate_loop(output, 4)?;
        self.query_f64(&format!("SETP? {}", output)).await
    }

    /// Enable or disable setpoint ramping at `kelvin_per_minute`
    pub async fn set_ramp(&self, output: u8, enabled: bool, kelvin_per_minute: f64) -> DaqResult<()> {
        validate_loop(output, 4)?;
        if !(0.0..=100.0).contains(&kelvin_per_minute) {
            return Err(DaqError::InvalidParameter(format!(
                "ramp rate must be 0..=100 K/min, got {}",
                kelvin_per_minute
            )));
        }
        self.port
            .lock()
            .await
            .write(&format!(
                "RAMP {},{},{}",
                output,
                u8::from(enabled),
                kelvin_per_minute
            ))
            .await
    }

    /// Main heater range for loop 1 or 2
    pub async fn set_heater_range(&self, output: u8, range: HeaterRange) -> DaqResult<()> {
        validate_loop(output, 2)?;
        self.port
            .lock()
            .await
            .write(&format!("RANGE {},{}", output, range as u8))
            .await
    }

    /// Heater output of loop 1 or 2 in percent
    pub async fn heater_output(&self, output: u8) -> DaqResult<f64> {
        validate_loop(output, 2)?;
        self.query_f64(&format!("HTR? {}", output)).await
    }

    async fn query_f64(&self, query: &str) -> DaqResult<f64> {
        let response = self.port.lock().await.query(query).await?;
        response
            .trim()
            .parse()
            .map_err(|e| DaqError::parse(response.clone(), format!("{}", e)))
    }

    /// Release the port
    pub async fn close(&self) -> DaqResult<()> {
        self.port.lock().await.shutdown().await
    }
}

fn validate_channel(channel: char) -> DaqResult<char> {
    let upper = channel.to_ascii_uppercase();
    if !('A'..='D').contains(&upper) {
        return Err(DaqError::InvalidParameter(format!(
            "input channel must be A-D, got '{}'",
            channel
        )));
    }
    Ok(upper)
}

fn validate_loop(output: u8, highest: u8) -> DaqResult<()> {
    if !(1..=highest).contains(&output) {
        return Err(DaqError::InvalidParameter(format!(
            "control loop must be 1-{}, got {}",
            highest, output
        )));
    }
    Ok(())
}
