//! Stanford Research SR830 DSP Lock-In Amplifier Driver
//!
//! Reference: SR830 manual, chapter 5 (remote programming)
//!
//! Protocol Overview:
//! - Transport: GPIB (through VISA) or RS-232 at 9600 baud 8N1
//! - Terminator: CR on RS-232, LF on GPIB
//! - `OUTX` selects which interface responses go to and must be sent first
//! - Time constant and sensitivity are set by table index (`OFLT`, `SENS`)

use crate::error::{DaqError, DaqResult};
use crate::hardware::resource::{open_port, Resource, SerialSettings};
use crate::hardware::transport::ScpiPort;
use crate::measurement_types::Identity;
use std::time::Duration;
use tokio::sync::Mutex;

/// RS-232 baud rate (factory setting)
pub const BAUD_RATE: u32 = 9_600;

/// Response timeout
pub const TIMEOUT: Duration = Duration::from_secs(3);

/// Sine output amplitude limits in volts rms
const AMPLITUDE_RANGE: std::ops::RangeInclusive<f64> = 0.004..=5.0;

/// Reference frequency limits in Hz
const FREQUENCY_RANGE: std::ops::RangeInclusive<f64> = 0.001..=102_000.0;

/// Which interface the SR830 sends responses to (`OUTX`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputInterface {
    /// RS-232 (`OUTX 0`)
    Rs232,
    /// GPIB (`OUTX 1`)
    Gpib,
}

impl OutputInterface {
    /// Serial resources use RS-232, everything else is treated as GPIB.
    pub fn for_resource(resource: &str) -> DaqResult<Self> {
        Ok(match Resource::parse(resource)? {
            Resource::Serial(_) => OutputInterface::Rs232,
            _ => OutputInterface::Gpib,
        })
    }

    fn code(self) -> u8 {
        match self {
            OutputInterface::Rs232 => 0,
            OutputInterface::Gpib => 1,
        }
    }
}

/// Low-pass filter time constant (`OFLT` index order).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum TimeConstant {
    Us10,
    Us30,
    Us100,
    Us300,
    Ms1,
    Ms3,
    Ms10,
    Ms30,
    Ms100,
    Ms300,
    S1,
    S3,
    S10,
    S30,
    S100,
    S300,
    Ks1,
    Ks3,
    Ks10,
    Ks30,
}

impl TimeConstant {
    /// Every setting in index order
    pub const ALL: [TimeConstant; 20] = [
        TimeConstant::Us10,
        TimeConstant::Us30,
        TimeConstant::Us100,
        TimeConstant::Us300,
        TimeConstant::Ms1,
        TimeConstant::Ms3,
        TimeConstant::Ms10,
        TimeConstant::Ms30,
        TimeConstant::Ms100,
        TimeConstant::Ms300,
        TimeConstant::S1,
        TimeConstant::S3,
        TimeConstant::S10,
        TimeConstant::S30,
        TimeConstant::S100,
        TimeConstant::S300,
        TimeConstant::Ks1,
        TimeConstant::Ks3,
        TimeConstant::Ks10,
        TimeConstant::Ks30,
    ];

    /// `OFLT` index
    pub fn index(self) -> usize {
        self as usize
    }

    /// Time constant in seconds
    pub fn seconds(self) -> f64 {
        one_three_series(self.index(), 10e-6)
    }

    /// Setting closest to `seconds` on a log scale
    pub fn nearest(seconds: f64) -> Self {
        nearest(&Self::ALL, seconds, |tc| tc.seconds())
    }
}

/// Full-scale sensitivity (`SENS` index order), volts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Sensitivity {
    Nv2,
    Nv5,
    Nv10,
    Nv20,
    Nv50,
    Nv100,
    Nv200,
    Nv500,
    Uv1,
    Uv2,
    Uv5,
    Uv10,
    Uv20,
    Uv50,
    Uv100,
    Uv200,
    Uv500,
    Mv1,
    Mv2,
    Mv5,
    Mv10,
    Mv20,
    Mv50,
    Mv100,
    Mv200,
    Mv500,
    V1,
}

impl Sensitivity {
    /// Every setting in index order
    pub const ALL: [Sensitivity; 27] = [
        Sensitivity::Nv2,
        Sensitivity::Nv5,
        Sensitivity::Nv10,
        Sensitivity::Nv20,
        Sensitivity::Nv50,
        Sensitivity::Nv100,
        Sensitivity::Nv200,
        Sensitivity::Nv500,
        Sensitivity::Uv1,
        Sensitivity::Uv2,
        Sensitivity::Uv5,
        Sensitivity::Uv10,
        Sensitivity::Uv20,
        Sensitivity::Uv50,
        Sensitivity::Uv100,
        Sensitivity::Uv200,
        Sensitivity::Uv500,
        Sensitivity::Mv1,
        Sensitivity::Mv2,
        Sensitivity::Mv5,
        Sensitivity::Mv10,
        Sensitivity::Mv20,
        Sensitivity::Mv50,
        Sensitivity::Mv100,
        Sensitivity::Mv200,
        Sensitivity::Mv500,
        Sensitivity::V1,
    ];

    /// `SENS` index
    pub fn index(self) -> usize {
        self as usize
    }

    /// Full scale in volts
    pub fn volts(self) -> f64 {
        // 2, 5, 10, 20, 50, ... nV
        let index = self.index();
        let decade = 10f64.powi((index / 3) as i32);
        let mantissa = [2.0, 5.0, 10.0][index % 3];
        mantissa * decade * 1e-9
    }

    /// Setting closest to `volts` on a log scale
    pub fn nearest(volts: f64) -> Self {
        nearest(&Self::ALL, volts, |s| s.volts())
    }
}

/// 10, 30, 100, 300, ... times `base`
fn one_three_series(index: usize, base: f64) -> f64 {
    let decade = 10f64.powi((index / 2) as i32);
    let mantissa = if index % 2 == 0 { 1.0 } else { 3.0 };
    mantissa * decade * base
}

fn nearest<T: Copy>(table: &[T], target: f64, value: impl Fn(T) -> f64) -> T {
    let target = target.max(f64::MIN_POSITIVE).ln();
    let mut best = table[0];
    let mut best_distance = f64::INFINITY;
    for &candidate in table {
        let distance = (value(candidate).ln() - target).abs();
        if distance < best_distance {
            best = candidate;
            best_distance = distance;
        }
    }
    best
}

/// Driver for the SR830
pub struct Sr830 {
    port: Mutex<ScpiPort>,
    interface: OutputInterface,
}

impl Sr830 {
    /// Open the lock-in, select its output interface and log its
    /// identification.
    pub async fn connect(resource: &str) -> DaqResult<Self> {
        let interface = OutputInterface::for_resource(resource)?;
        let port = open_port(resource, &SerialSettings::new(BAUD_RATE)).await?;
        let lockin = Self::from_port(port, interface);
        lockin.initialize().await?;
        let identity = lockin.identify().await?;
        tracing::info!(%identity, "SR830 connected");
        Ok(lockin)
    }

    /// Wrap an open port with the terminations `interface` needs.
    pub fn from_port(port: ScpiPort, interface: OutputInterface) -> Self {
        let port = match interface {
            OutputInterface::Rs232 => port
                .with_write_termination("\r")
                .with_read_termination(b'\r'),
            OutputInterface::Gpib => port,
        };
        Self {
            port: Mutex::new(port.with_timeout(TIMEOUT)),
            interface,
        }
    }

    /// Override the response timeout
    pub async fn set_timeout(&self, timeout: Duration) {
        self.port.lock().await.set_timeout(timeout);
    }

    /// Direct responses to our interface and clear status.
    pub async fn initialize(&self) -> DaqResult<()> {
        let outx = format!("OUTX {}", self.interface.code());
        self.port.lock().await.write_all(&[outx.as_str(), "*CLS"]).await
    }

    /// Query `*IDN?`
    pub async fn identify(&self) -> DaqResult<Identity> {
        let response = self.port.lock().await.query("*IDN?").await?;
        Identity::parse(&response)
    }

    /// Internal reference frequency in Hz
    pub async fn set_reference_frequency(&self, hz: f64) -> DaqResult<()> {
        if !FREQUENCY_RANGE.contains(&hz) {
            return Err(DaqError::InvalidParameter(format!(
                "reference frequency {} Hz outside 0.001..=102000",
                hz
            )));
        }
        self.port.lock().await.write(&format!("FREQ {}", hz)).await
    }

    /// Current reference frequency in Hz
    pub async fn reference_frequency(&self) -> DaqResult<f64> {
        self.query_f64("FREQ?").await
    }

    /// Sine output amplitude in volts rms
    pub async fn set_sine_amplitude(&self, volts: f64) -> DaqResult<()> {
        if !AMPLITUDE_RANGE.contains(&volts) {
            return Err(DaqError::InvalidParameter(format!(
                "sine amplitude {} V outside 0.004..=5",
                volts
            )));
        }
        self.port.lock().await.write(&format!("SLVL {}", volts)).await
    }

    /// Reference phase shift in degrees
    pub async fn set_phase(&self, degrees: f64) -> DaqResult<()> {
        if !(-360.0..=729.99).contains(&degrees) {
            return Err(DaqError::InvalidParameter(format!(
                "phase {} deg outside -360..=729.99",
                degrees
            )));
        }
        self.port.lock().await.write(&format!("PHAS {}", degrees)).await
    }

    /// Auto-phase: zero the current phase
    pub async fn auto_phase(&self) -> DaqResult<()> {
        self.port.lock().await.write("APHS").await
    }

    /// Set the low-pass filter time constant
    pub async fn set_time_constant(&self, time_constant: TimeConstant) -> DaqResult<()> {
        self.port
            .lock()
            .await
            .write(&format!("OFLT {}", time_constant.index()))
            .await
    }

    /// Set the full-scale sensitivity
    pub async fn set_sensitivity(&self, sensitivity: Sensitivity) -> DaqResult<()> {
        self.port
            .lock()
            .await
            .write(&format!("SENS {}", sensitivity.index()))
            .await
    }

    /// X and Y, sampled at the same instant
    pub async fn read_xy(&self) -> DaqResult<(f64, f64)> {
        self.snap_pair("SNAP? 1,2").await
    }

    /// R and theta (degrees), sampled at the same instant
    pub async fn read_r_theta(&self) -> DaqResult<(f64, f64)> {
        self.snap_pair("SNAP? 3,4").await
    }

    async fn snap_pair(&self, query: &str) -> DaqResult<(f64, f64)> {
        let values = self.port.lock().await.query_ascii_values(query).await?;
        match values.as_slice() {
            [a, b] => Ok((*a, *b)),
            _ => Err(DaqError::parse(
                format!("{:?}", values),
                format!("expected two values for {}", query),
            )),
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::channel_port::{self, DevicePeer};

    fn test_lockin(interface: OutputInterface) -> (Sr830, DevicePeer) {
        let (stream, device) = channel_port::pair();
        (
            Sr830::from_port(ScpiPort::new("test", Box::new(stream)), interface),
            device,
        )
    }

    #[test]
    fn tables_match_manual() {
        assert_eq!(TimeConstant::Us10.seconds(), 10e-6);
        assert!((TimeConstant::Ms300.seconds() - 0.3).abs() < 1e-12);
        assert!((TimeConstant::Ks30.seconds() - 30e3).abs() < 1e-6);
        assert_eq!(TimeConstant::S1.index(), 10);

        assert!((Sensitivity::Nv2.volts() - 2e-9).abs() < 1e-20);
        assert!((Sensitivity::Uv100.volts() - 100e-6).abs() < 1e-15);
        assert!((Sensitivity::V1.volts() - 1.0).abs() < 1e-12);
        assert_eq!(Sensitivity::V1.index(), 26);
    }

    #[test]
    fn nearest_setting() {
        assert_eq!(TimeConstant::nearest(0.25), TimeConstant::Ms300);
        assert_eq!(TimeConstant::nearest(1e-9), TimeConstant::Us10);
        assert_eq!(Sensitivity::nearest(0.011), Sensitivity::Mv10);
        assert_eq!(Sensitivity::nearest(5.0), Sensitivity::V1);
    }

    #[tokio::test]
    async fn initialize_selects_interface() {
        let (lockin, mut device) = test_lockin(OutputInterface::Rs232);
        lockin.initialize().await.unwrap();
        device.expect_commands(&["OUTX 0", "*CLS"]).await;

        let (lockin, mut device) = test_lockin(OutputInterface::Gpib);
        lockin.initialize().await.unwrap();
        device.expect_commands(&["OUTX 1", "*CLS"]).await;
    }

    #[test]
    fn interface_follows_resource() {
        assert_eq!(
            OutputInterface::for_resource("COM2").unwrap(),
            OutputInterface::Rs232
        );
        assert_eq!(
            OutputInterface::for_resource("GPIB0::8::INSTR").unwrap(),
            OutputInterface::Gpib
        );
        assert!(OutputInterface::for_resource("nowhere").is_err());
    }

    #[tokio::test]
    async fn settings_commands() {
        let (lockin, mut device) = test_lockin(OutputInterface::Gpib);
        lockin.set_reference_frequency(137.0).await.unwrap();
        lockin.set_sine_amplitude(0.5).await.unwrap();
        lockin.set_phase(-45.0).await.unwrap();
        lockin.auto_phase().await.unwrap();
        lockin.set_time_constant(TimeConstant::Ms100).await.unwrap();
        lockin.set_sensitivity(Sensitivity::Uv50).await.unwrap();

        device
            .expect_commands(&[
                "FREQ 137",
                "SLVL 0.5",
                "PHAS -45",
                "APHS",
                "OFLT 8",
                "SENS 13",
            ])
            .await;

        assert!(lockin.set_sine_amplitude(0.001).await.is_err());
        assert!(lockin.set_reference_frequency(2e5).await.is_err());
    }

    #[tokio::test]
    async fn snap_reads_pairs() {
        let (lockin, mut device) = test_lockin(OutputInterface::Rs232);

        let (xy, _) = tokio::join!(lockin.read_xy(), async {
            device.expect_query("SNAP? 1,2", "1.25e-6,-3.0e-8\r").await;
        });
        assert_eq!(xy.unwrap(), (1.25e-6, -3.0e-8));

        let (r_theta, _) = tokio::join!(lockin.read_r_theta(), async {
            device.expect_query("SNAP? 3,4", "1.25e-6,12.5\r").await;
        });
        assert_eq!(r_theta.unwrap(), (1.25e-6, 12.5));

        let (frequency, _) = tokio::join!(lockin.reference_frequency(), async {
            device.expect_query("FREQ?", "137.000\r").await;
        });
        assert_eq!(frequency.unwrap(), 137.0);
    }
}
