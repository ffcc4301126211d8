//! Rigol DS1000Z Series Oscilloscope Driver
//!
//! Protocol Overview:
//! - Format: SCPI
//! - Transport: LAN socket on port 5555, or USBTMC
//! - Terminator: LF
//! - Waveforms are read on screen (`NORM` mode) as ASCII values behind an
//!   IEEE 488.2 definite-length block header

use crate::error::{DaqError, DaqResult};
use crate::hardware::resource::{open_port, SerialSettings};
use crate::hardware::transport::{parse_ascii_values, strip_block_header, ScpiPort};
use crate::measurement_types::Identity;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;

/// Response timeout; ASCII waveform transfers are slow
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// A captured channel trace
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Waveform {
    /// Seconds relative to the trigger point
    pub time: Vec<f64>,
    /// Volts
    pub voltage: Vec<f64>,
}

/// Driver for Rigol DS1000Z scopes
pub struct RigolDs1000z {
    port: Mutex<ScpiPort>,
}

impl RigolDs1000z {
    /// Open the scope and log its identification.
    pub async fn connect(resource: &str) -> DaqResult<Self> {
        let port = open_port(resource, &SerialSettings::default()).await?;
        let scope = Self::from_port(port);
        scope.initialize().await?;
        Ok(scope)
    }

    /// Wrap an open port. Nothing is sent.
    pub fn from_port(port: ScpiPort) -> Self {
        Self {
            port: Mutex::new(port.with_timeout(TIMEOUT)),
        }
    }

    /// Override the response timeout
    pub async fn set_timeout(&self, timeout: Duration) {
        self.port.lock().await.set_timeout(timeout);
    }

    /// Identify and log
    pub async fn initialize(&self) -> DaqResult<Identity> {
        let identity = self.identify().await?;
        tracing::info!(%identity, "Rigol scope connected");
        Ok(identity)
    }

    /// Query `*IDN?`
    pub async fn identify(&self) -> DaqResult<Identity> {
        let response = self.port.lock().await.query("*IDN?").await?;
        Identity::parse(&response)
    }

    /// Start continuous acquisition
    pub async fn run(&self) -> DaqResult<()> {
        self.port.lock().await.write(":RUN").await
    }

    /// Stop acquisition
    pub async fn stop(&self) -> DaqResult<()> {
        self.port.lock().await.write(":STOP").await
    }

    /// Arm a single-shot acquisition
    pub async fn single(&self) -> DaqResult<()> {
        self.port.lock().await.write(":SING").await
    }

    /// Trigger now
    pub async fn force_trigger(&self) -> DaqResult<()> {
        self.port.lock().await.write(":TFOR").await
    }

    /// Horizontal scale in seconds per division
    pub async fn set_timebase(&self, seconds_per_div: f64) -> DaqResult<()> {
        if seconds_per_div <= 0.0 {
            return Err(DaqError::InvalidParameter(format!(
                "timebase must be positive, got {}",
                seconds_per_div
            )));
        }
        self.port
            .lock()
            .await
            .write(&format!(":TIM:MAIN:SCAL {}", seconds_per_div))
            .await
    }

    /// Vertical scale of `channel` in volts per division
    pub async fn set_channel_scale(&self, channel: u8, volts_per_div: f64) -> DaqResult<()> {
        validate_channel(channel)?;
        if volts_per_div <= 0.0 {
            return Err(DaqError::InvalidParameter(format!(
                "channel scale must be positive, got {}",
                volts_per_div
            )));
        }
        self.port
            .lock()
            .await
            .write(&format!(":CHAN{}:SCAL {}", channel, volts_per_div))
            .await
    }

    /// Show or hide `channel`
    pub async fn set_channel_enabled(&self, channel: u8, enabled: bool) -> DaqResult<()> {
        validate_channel(channel)?;
        self.port
            .lock()
            .await
            .write(&format!(":CHAN{}:DISP {}", channel, if enabled { "ON" } else { "OFF" }))
            .await
    }

    /// Read the on-screen trace of `channel`.
    pub async fn read_waveform(&self, channel: u8) -> DaqResult<Waveform> {
        validate_channel(channel)?;

        let (x_increment, x_origin, data) = {
            let mut port = self.port.lock().await;
            port.write_all(&[
                format!(":WAV:SOUR CHAN{}", channel),
                ":WAV:MODE NORM".to_string(),
                ":WAV:FORM ASC".to_string(),
            ])
            .await?;
            let x_increment = first_value(&port.query(":WAV:XINC?").await?)?;
            let x_origin = first_value(&port.query(":WAV:XOR?").await?)?;
            let data = port.query(":WAV:DATA?").await?;
            (x_increment, x_origin, data)
        };

        let payload = strip_block_header(data.trim())?;
        let voltage = parse_ascii_values(payload.trim().trim_end_matches(','))?;
        let time = (0..voltage.len())
            .map(|i| x_origin + i as f64 * x_increment)
            .collect();

        tracing::debug!(channel, points = voltage.len(), "waveform read");
        Ok(Waveform { time, voltage })
    }

    /// Release the port
    pub async fn close(&self) -> DaqResult<()> {
        self.port.lock().await.shutdown().await
    }
}

fn first_value(response: &str) -> DaqResult<f64> {
    response
        .trim()
        .parse()
        .map_err(|e| DaqError::parse(response, format!("{}", e)))
}

fn validate_channel(channel: u8) -> DaqResult<()> {
    if !(1..=4).contains(&channel) {
        return Err(DaqError::InvalidParameter(format!(
            "scope channel must be 1-4, got {}",
            channel
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::channel_port::{self, DevicePeer};

    fn test_scope() -> (RigolDs1000z, DevicePeer) {
        let (stream, device) = channel_port::pair();
        (
            RigolDs1000z::from_port(ScpiPort::new("test", Box::new(stream))),
            device,
        )
    }

    #[tokio::test]
    async fn acquisition_and_scale_commands() {
        let (scope, mut device) = test_scope();
        scope.stop().await.unwrap();
        scope.set_timebase(0.001).await.unwrap();
        scope.set_channel_scale(2, 0.5).await.unwrap();
        scope.set_channel_enabled(3, false).await.unwrap();
        scope.single().await.unwrap();
        scope.force_trigger().await.unwrap();
        scope.run().await.unwrap();

        device
            .expect_commands(&[
                ":STOP",
                ":TIM:MAIN:SCAL 0.001",
                ":CHAN2:SCAL 0.5",
                ":CHAN3:DISP OFF",
                ":SING",
                ":TFOR",
                ":RUN",
            ])
            .await;

        assert!(scope.set_channel_scale(5, 1.0).await.is_err());
        assert!(scope.set_timebase(0.0).await.is_err());
    }

    #[tokio::test]
    async fn waveform_times_follow_origin_and_increment() {
        let (scope, mut device) = test_scope();

        let (waveform, _) = tokio::join!(scope.read_waveform(1), async {
            device
                .expect_commands(&[":WAV:SOUR CHAN1", ":WAV:MODE NORM", ":WAV:FORM ASC"])
                .await;
            device.expect_query(":WAV:XINC?", "1.000000e-06\n").await;
            device.expect_query(":WAV:XOR?", "-6.000000e-06\n").await;
            device
                .expect_query(":WAV:DATA?", "#9000000025-1.0e-02,0.0e+00,1.0e-02,\n")
                .await;
        });

        let waveform = waveform.unwrap();
        assert_eq!(waveform.voltage, vec![-1.0e-2, 0.0, 1.0e-2]);
        assert_eq!(waveform.time.len(), 3);
        assert!((waveform.time[0] + 6e-6).abs() < 1e-15);
        assert!((waveform.time[2] + 4e-6).abs() < 1e-15);
    }
}
