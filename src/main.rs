//! CLI entry point for rust_instruments
//!
//! # Usage
//!
//! ```bash
//! rust_instruments ports
//! rust_instruments idn COM3 --baud 19200
//! rust_instruments --config config/lab.toml four-wire --output data/sample1.csv
//! rust_instruments hall-pulse
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use rust_instruments::config::{LabConfig, DEFAULT_CONFIG_PATH};
use rust_instruments::hardware::registry::InstrumentRegistry;
use rust_instruments::hardware::resource::{open_port, SerialSettings};
use rust_instruments::logging;
use rust_instruments::measurement_types::Identity;
use rust_instruments::sequences::{four_wire, hall_pulse};
use rust_instruments::storage;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rust_instruments")]
#[command(about = "Bench instrument control and measurement sequences", long_about = None)]
struct Cli {
    /// Lab configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,

    /// Query `*IDN?` on a resource
    Idn {
        /// Resource string (COM3, /dev/ttyUSB0, TCPIP0::host::5025::SOCKET, ...)
        resource: String,

        /// Baud rate for serial resources
        #[arg(long, default_value_t = 9600)]
        baud: u32,
    },

    /// Four-wire resistance sweep over all configured assignments
    FourWire {
        /// CSV output file (default: timestamped file in the output directory)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Pulsed-current switching measurement
    HallPulse {
        /// CSV output file (default: timestamped file in the output directory)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = LabConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
    }
    logging::init_from_config(&config).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Ports => list_ports(),
        Commands::Idn { resource, baud } => identify(&resource, baud).await,
        Commands::FourWire { output } => run_four_wire(config, output).await,
        Commands::HallPulse { output } => run_hall_pulse(config, output).await,
    }
}

#[cfg(feature = "instrument_serial")]
fn list_ports() -> Result<()> {
    let ports = serialport::available_ports().context("enumerating serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        match port.port_type {
            serialport::SerialPortType::UsbPort(info) => println!(
                "{}  USB {:04x}:{:04x} {}",
                port.port_name,
                info.vid,
                info.pid,
                info.product.unwrap_or_default()
            ),
            _ => println!("{}", port.port_name),
        }
    }
    Ok(())
}

#[cfg(not(feature = "instrument_serial"))]
fn list_ports() -> Result<()> {
    Err(rust_instruments::DaqError::FeatureNotEnabled("instrument_serial".to_string()).into())
}

async fn identify(resource: &str, baud: u32) -> Result<()> {
    let mut port = open_port(resource, &SerialSettings::new(baud)).await?;
    let response = port.query("*IDN?").await;
    port.shutdown().await?;
    let identity = Identity::parse(&response?)?;
    println!("{}", identity);
    Ok(())
}

async fn run_four_wire(mut config: LabConfig, output: Option<PathBuf>) -> Result<()> {
    let params = config.four_wire.get_or_insert_with(Default::default).clone();
    config.validate()?;

    let registry = InstrumentRegistry::connect_all(&config).await?;
    let result = async {
        let switch = registry.switch_matrix(&params.switch)?;
        let source = registry.probe_source(&params.source)?;
        four_wire::run(switch.as_ref(), source.as_ref(), &params).await
    }
    .await;
    let closed = registry.close_all().await;
    let report = result?;
    closed?;

    for row in report.rows() {
        println!(
            "{:>2}  {:<40} {:>14.6e} ohm",
            row.index, row.assignment, row.resistance_ohm
        );
    }

    let path = output_path(output, &config.application.output_dir, "four_wire");
    storage::write_csv_with_metadata(&path, &params, &report.rows())?;
    println!("Saved {}", path.display());
    Ok(())
}

async fn run_hall_pulse(mut config: LabConfig, output: Option<PathBuf>) -> Result<()> {
    let params = config.hall_pulse.get_or_insert_with(Default::default).clone();
    config.validate()?;

    let registry = InstrumentRegistry::connect_all(&config).await?;
    let result = async {
        let switch = registry.switch_matrix(&params.switch)?;
        let pulser = registry.pulse_source(&params.source)?;
        let source = registry.buffered_source(&params.source)?;
        let voltmeter = registry.buffered_voltmeter(&params.voltmeter)?;
        let instruments = hall_pulse::HallInstruments {
            switch: switch.as_ref(),
            pulser: pulser.as_ref(),
            source: source.as_ref(),
            voltmeter: voltmeter.as_ref(),
        };
        hall_pulse::run(instruments, &params).await
    }
    .await;
    let closed = registry.close_all().await;
    let report = result?;
    closed?;

    let rows = report.rows();
    println!(
        "{} pulses, {} readings",
        report.pulses.len(),
        rows.len()
    );

    let path = output_path(output, &config.application.output_dir, "hall_pulse");
    storage::write_csv_with_metadata(&path, &params, &rows)?;
    println!("Saved {}", path.display());
    Ok(())
}

fn output_path(output: Option<PathBuf>, dir: &Path, prefix: &str) -> PathBuf {
    output.unwrap_or_else(|| storage::timestamped_path(dir, prefix))
}
