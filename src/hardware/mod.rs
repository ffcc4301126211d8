//! Instrument drivers
//!
//! - **Transport**: `resource` parses resource strings and opens serial,
//!   socket, USBTMC or VISA links as a [`transport::ScpiPort`]
//! - **Drivers**: one module per instrument model
//! - **Capabilities**: traits sequences are written against
//! - **Registry**: drivers built from configuration, looked up by id

pub mod capabilities;
pub mod channel_port;
pub mod registry;
pub mod resource;
pub mod transport;

#[cfg(feature = "instrument_visa")]
pub mod visa;

pub mod keithley_2000;
pub mod keithley_2401;
pub mod keithley_2461;
pub mod lakeshore_336;
pub mod rigol_ds1000z;
pub mod sr830;
pub mod switchbox;

pub use capabilities::{
    BufferedSource, BufferedVoltmeter, Capability, ProbeSource, PulseSource, SwitchMatrix,
};
pub use registry::{Device, DeviceComponents, InstrumentRegistry};
pub use transport::ScpiPort;
