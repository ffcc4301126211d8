//! Resource strings and transport opening.
//!
//! Instruments are addressed with VISA-style resource strings so existing
//! lab notes keep working:
//!
//! | resource | transport |
//! | --- | --- |
//! | `COM3`, `ASRL3::INSTR`, `/dev/ttyUSB0` | RS-232 / USB-serial (`tokio-serial`) |
//! | `TCPIP0::192.168.1.20::5025::SOCKET` | raw SCPI socket |
//! | `/dev/usbtmc0` | Linux USBTMC character device |
//! | `USB0::0x05E6::0x2461::04121022::INSTR`, `GPIB0::8::INSTR` | VISA (feature `instrument_visa`) |

use super::transport::{DynSerial, ScpiPort};
use crate::error::{DaqError, DaqResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A parsed instrument address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// Serial port name or device path
    Serial(String),
    /// Raw TCP socket speaking SCPI lines
    TcpSocket {
        /// Host name or address
        host: String,
        /// TCP port
        port: u16,
    },
    /// Linux USBTMC character device
    UsbTmc(PathBuf),
    /// Anything that needs a VISA library (USB-TMC by VID/PID, GPIB, VXI-11)
    Visa(String),
}

impl Resource {
    /// Parse a resource string.
    pub fn parse(resource: &str) -> DaqResult<Self> {
        let trimmed = resource.trim();
        let upper = trimmed.to_ascii_uppercase();

        if let Some(number) = upper.strip_prefix("COM") {
            if !number.is_empty() && number.chars().all(|c| c.is_ascii_digit()) {
                return Ok(Resource::Serial(format!("COM{}", number)));
            }
        }

        if upper.starts_with("ASRL") && upper.ends_with("::INSTR") {
            let inner = &trimmed[4..trimmed.len() - "::INSTR".len()];
            if inner.starts_with('/') {
                return Ok(Resource::Serial(inner.to_string()));
            }
            let number: u32 = inner
                .parse()
                .map_err(|_| DaqError::UnsupportedResource(resource.to_string()))?;
            return Ok(Resource::Serial(asrl_port_name(number)));
        }

        if trimmed.starts_with("/dev/usbtmc") {
            return Ok(Resource::UsbTmc(PathBuf::from(trimmed)));
        }

        if trimmed.starts_with("/dev/") {
            return Ok(Resource::Serial(trimmed.to_string()));
        }

        if upper.starts_with("TCPIP") && upper.ends_with("::SOCKET") {
            let parts: Vec<&str> = trimmed.split("::").collect();
            if parts.len() == 4 {
                let port = parts[2]
                    .parse()
                    .map_err(|_| DaqError::UnsupportedResource(resource.to_string()))?;
                return Ok(Resource::TcpSocket {
                    host: parts[1].to_string(),
                    port,
                });
            }
            return Err(DaqError::UnsupportedResource(resource.to_string()));
        }

        if (upper.starts_with("USB") || upper.starts_with("GPIB") || upper.starts_with("TCPIP"))
            && upper.ends_with("::INSTR")
        {
            return Ok(Resource::Visa(trimmed.to_string()));
        }

        Err(DaqError::UnsupportedResource(resource.to_string()))
    }

    /// Open the transport.
    ///
    /// `serial` is only consulted for serial resources.
    pub async fn open(&self, serial: &SerialSettings) -> DaqResult<DynSerial> {
        match self {
            Resource::Serial(path) => open_serial(path, serial).await,
            Resource::TcpSocket { host, port } => {
                let stream = tokio::net::TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            Resource::UsbTmc(path) => {
                let file = tokio::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)
                    .await?;
                Ok(Box::new(file))
            }
            Resource::Visa(name) => open_visa(name).await,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Serial(path) => write!(f, "{}", path),
            Resource::TcpSocket { host, port } => write!(f, "TCPIP0::{}::{}::SOCKET", host, port),
            Resource::UsbTmc(path) => write!(f, "{}", path.display()),
            Resource::Visa(name) => write!(f, "{}", name),
        }
    }
}

/// Parity setting for serial links
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Serial line settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (7 or 8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Parity
    #[serde(default)]
    pub parity: Parity,
    /// Stop bits (1 or 2)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

impl SerialSettings {
    /// 8N1 at the given baud rate
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
        }
    }

    /// Set parity
    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Set data bits
    pub fn with_data_bits(mut self, data_bits: u8) -> Self {
        self.data_bits = data_bits;
        self
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self::new(9600)
    }
}

/// Parse `resource` and open it as a [`ScpiPort`] with default terminations.
pub async fn open_port(resource: &str, serial: &SerialSettings) -> DaqResult<ScpiPort> {
    let parsed = Resource::parse(resource)?;
    let stream = parsed.open(serial).await?;
    tracing::info!(resource = %parsed, "opened instrument transport");
    Ok(ScpiPort::new(resource, stream))
}

fn asrl_port_name(number: u32) -> String {
    if cfg!(windows) {
        format!("COM{}", number)
    } else {
        format!("/dev/ttyS{}", number.saturating_sub(1))
    }
}

#[cfg(feature = "instrument_serial")]
async fn open_serial(path: &str, settings: &SerialSettings) -> DaqResult<DynSerial> {
    use tokio_serial::SerialPortBuilderExt;

    let data_bits = match settings.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        8 => tokio_serial::DataBits::Eight,
        other => {
            return Err(DaqError::InvalidParameter(format!(
                "unsupported data bits {}",
                other
            )))
        }
    };
    let parity = match settings.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    };
    let stop_bits = match settings.stop_bits {
        1 => tokio_serial::StopBits::One,
        2 => tokio_serial::StopBits::Two,
        other => {
            return Err(DaqError::InvalidParameter(format!(
                "unsupported stop bits {}",
                other
            )))
        }
    };

    let path_owned = path.to_string();
    let baud_rate = settings.baud_rate;

    // Opening can block on some platforms
    let port = tokio::task::spawn_blocking(move || {
        tokio_serial::new(&path_owned, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
    })
    .await
    .map_err(|e| DaqError::Instrument(format!("serial open task failed: {}", e)))??;

    Ok(Box::new(port))
}

#[cfg(not(feature = "instrument_serial"))]
async fn open_serial(_path: &str, _settings: &SerialSettings) -> DaqResult<DynSerial> {
    Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
}

#[cfg(feature = "instrument_visa")]
async fn open_visa(name: &str) -> DaqResult<DynSerial> {
    super::visa::open(name).await
}

#[cfg(not(feature = "instrument_visa"))]
async fn open_visa(_name: &str) -> DaqResult<DynSerial> {
    Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serial_names() {
        assert_eq!(Resource::parse("COM4").unwrap(), Resource::Serial("COM4".into()));
        assert_eq!(Resource::parse("com12").unwrap(), Resource::Serial("COM12".into()));
        assert_eq!(
            Resource::parse("/dev/ttyUSB0").unwrap(),
            Resource::Serial("/dev/ttyUSB0".into())
        );
        assert_eq!(
            Resource::parse("ASRL/dev/ttyACM1::INSTR").unwrap(),
            Resource::Serial("/dev/ttyACM1".into())
        );
    }

    #[test]
    fn asrl_number_maps_to_platform_port() {
        let expected = if cfg!(windows) { "COM3" } else { "/dev/ttyS2" };
        assert_eq!(
            Resource::parse("ASRL3::INSTR").unwrap(),
            Resource::Serial(expected.into())
        );
    }

    #[test]
    fn parses_socket_and_usbtmc() {
        assert_eq!(
            Resource::parse("TCPIP0::192.168.1.20::5555::SOCKET").unwrap(),
            Resource::TcpSocket {
                host: "192.168.1.20".into(),
                port: 5555
            }
        );
        assert_eq!(
            Resource::parse("/dev/usbtmc0").unwrap(),
            Resource::UsbTmc(PathBuf::from("/dev/usbtmc0"))
        );
        assert!(Resource::parse("TCPIP0::host::notaport::SOCKET").is_err());
    }

    #[test]
    fn visa_only_resources_are_recognised() {
        for name in [
            "USB0::0x05E6::0x2461::04121022::INSTR",
            "GPIB0::8::INSTR",
            "TCPIP0::10.0.0.5::inst0::INSTR",
        ] {
            assert_eq!(Resource::parse(name).unwrap(), Resource::Visa(name.into()));
        }
    }

    #[test]
    fn rejects_unknown_resources() {
        assert!(matches!(
            Resource::parse("modbus://plc"),
            Err(DaqError::UnsupportedResource(_))
        ));
        assert!(Resource::parse("COM").is_err());
    }

    #[test]
    fn display_round_trips_socket() {
        let resource = Resource::parse("TCPIP0::scope.lab::5555::SOCKET").unwrap();
        assert_eq!(resource.to_string(), "TCPIP0::scope.lab::5555::SOCKET");
    }

    #[test]
    fn serial_settings_deserialize_with_defaults() {
        let settings: SerialSettings = toml::from_str("baud_rate = 57600\nparity = \"odd\"\ndata_bits = 7").unwrap();
        assert_eq!(settings.baud_rate, 57600);
        assert_eq!(settings.parity, Parity::Odd);
        assert_eq!(settings.data_bits, 7);
        assert_eq!(settings.stop_bits, 1);
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn visa_resources_need_the_feature() {
        let err = open_port("GPIB0::8::INSTR", &SerialSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::FeatureNotEnabled(f) if f == "instrument_visa"));
    }
}
