//! # Rust Instruments
//!
//! Async drivers for bench instruments that speak SCPI over serial, USB,
//! GPIB or raw sockets, plus the measurement sequences built on them.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: transports (`ScpiPort`, resource strings), one driver
//!   per instrument (Keithley 2000/2401/2461, switch box, SR830, Lakeshore
//!   336, Rigol DS1000Z), capability traits and the instrument registry.
//! - **`sequences`**: terminal assignments, the four-wire resistance sweep
//!   and the pulsed-current Hall measurement.
//! - **`config`**: `LabConfig`, loaded from TOML and environment variables.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`storage`**: CSV output of sequence results.
//! - **`error`**: the `DaqError` enum shared by every driver.
//! - **`measurement_types`**: readings and buffers passed between drivers
//!   and sequences.

pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod measurement_types;
pub mod sequences;
pub mod storage;

pub use error::{DaqError, DaqResult};
