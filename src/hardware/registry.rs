//! Instrument registry
//!
//! Builds drivers from the `[[instruments]]` configuration section and hands
//! them to measurement sequences by capability:
//!
//! - **Device**: one connected instrument (or a set of capability
//!   implementations registered directly, used by tests and simulations)
//! - **InstrumentRegistry**: connected devices by id
//! - **Capability access**: `switch_matrix("switchbox")`,
//!   `probe_source("k2461")`, ... return `Arc<dyn Trait>` or an error naming
//!   the id and the missing capability
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use rust_instruments::config::LabConfig;
//! use rust_instruments::hardware::registry::InstrumentRegistry;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = LabConfig::load()?;
//!     let registry = InstrumentRegistry::connect_all(&config).await?;
//!
//!     let source = registry.probe_source("k2461")?;
//!     source.disable_probe().await?;
//!
//!     registry.close_all().await?;
//!     Ok(())
//! }
//! ```

use crate::config::{InstrumentDefinition, InstrumentKind, LabConfig};
use crate::error::DaqResult;
use crate::hardware::capabilities::{
    BufferedSource, BufferedVoltmeter, Capability, ProbeSource, PulseSource, SwitchMatrix,
};
use crate::hardware::keithley_2000::Keithley2000;
use crate::hardware::keithley_2401::Keithley2401;
use crate::hardware::keithley_2461::Keithley2461;
use crate::hardware::lakeshore_336::Lakeshore336;
use crate::hardware::resource::open_port;
use crate::hardware::rigol_ds1000z::RigolDs1000z;
use crate::hardware::sr830::{OutputInterface, Sr830};
use crate::hardware::switchbox::SwitchBox;
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// Unique identifier of a registered instrument (the configuration `id`)
pub type DeviceId = String;

// =============================================================================
// Device
// =============================================================================

/// Capability implementations registered without a driver.
#[derive(Default, Clone)]
pub struct DeviceComponents {
    /// SwitchMatrix implementation (if supported)
    pub switch_matrix: Option<Arc<dyn SwitchMatrix>>,
    /// ProbeSource implementation (if supported)
    pub probe_source: Option<Arc<dyn ProbeSource>>,
    /// PulseSource implementation (if supported)
    pub pulse_source: Option<Arc<dyn PulseSource>>,
    /// BufferedSource implementation (if supported)
    pub buffered_source: Option<Arc<dyn BufferedSource>>,
    /// BufferedVoltmeter implementation (if supported)
    pub buffered_voltmeter: Option<Arc<dyn BufferedVoltmeter>>,
}

impl DeviceComponents {
    /// No capabilities
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a switch matrix
    pub fn with_switch_matrix(mut self, switch: Arc<dyn SwitchMatrix>) -> Self {
        self.switch_matrix = Some(switch);
        self
    }

    /// Add a probe source
    pub fn with_probe_source(mut self, source: Arc<dyn ProbeSource>) -> Self {
        self.probe_source = Some(source);
        self
    }

    /// Add a pulse source
    pub fn with_pulse_source(mut self, source: Arc<dyn PulseSource>) -> Self {
        self.pulse_source = Some(source);
        self
    }

    /// Add a buffered source
    pub fn with_buffered_source(mut self, source: Arc<dyn BufferedSource>) -> Self {
        self.buffered_source = Some(source);
        self
    }

    /// Add a buffered voltmeter
    pub fn with_buffered_voltmeter(mut self, voltmeter: Arc<dyn BufferedVoltmeter>) -> Self {
        self.buffered_voltmeter = Some(voltmeter);
        self
    }
}

/// A registered instrument
#[derive(Clone)]
pub enum Device {
    /// Keithley 2000 multimeter
    Keithley2000(Arc<Keithley2000>),
    /// Keithley 2401 source meter
    Keithley2401(Arc<Keithley2401>),
    /// Keithley 2461 source meter
    Keithley2461(Arc<Keithley2461>),
    /// Switch box
    SwitchBox(Arc<SwitchBox>),
    /// SR830 lock-in amplifier
    Sr830(Arc<Sr830>),
    /// Lakeshore 336 temperature controller
    Lakeshore336(Arc<Lakeshore336>),
    /// Rigol DS1000Z oscilloscope
    RigolDs1000z(Arc<RigolDs1000z>),
    /// Capability implementations without a driver
    Components(DeviceComponents),
}

impl Device {
    /// Open, configure and initialize the instrument described by `definition`.
    pub async fn connect(definition: &InstrumentDefinition) -> DaqResult<Self> {
        let resource = definition.resource()?;
        let port = open_port(resource, &definition.serial_settings()).await?;
        let timeout = definition.timeout();

        let device = match definition.r#type {
            InstrumentKind::Keithley2000 => {
                let dmm = Keithley2000::from_port(port);
                if let Some(timeout) = timeout {
                    dmm.set_timeout(timeout).await;
                }
                dmm.initialize().await?;
                Device::Keithley2000(Arc::new(dmm))
            }
            InstrumentKind::Keithley2401 => {
                let smu = Keithley2401::from_port(port);
                if let Some(timeout) = timeout {
                    smu.set_timeout(timeout).await;
                }
                smu.initialize().await?;
                Device::Keithley2401(Arc::new(smu))
            }
            InstrumentKind::Keithley2461 => {
                let smu = Keithley2461::from_port(port);
                if let Some(timeout) = timeout {
                    smu.set_timeout(timeout).await;
                }
                smu.initialize().await?;
                Device::Keithley2461(Arc::new(smu))
            }
            InstrumentKind::Switchbox => {
                let switchbox = SwitchBox::from_port(port);
                if let Some(timeout) = timeout {
                    switchbox.set_timeout(timeout).await;
                }
                switchbox.initialize().await?;
                Device::SwitchBox(Arc::new(switchbox))
            }
            InstrumentKind::Sr830 => {
                let lockin = Sr830::from_port(port, OutputInterface::for_resource(resource)?);
                if let Some(timeout) = timeout {
                    lockin.set_timeout(timeout).await;
                }
                lockin.initialize().await?;
                let identity = lockin.identify().await?;
                tracing::info!(%identity, "SR830 connected");
                Device::Sr830(Arc::new(lockin))
            }
            InstrumentKind::Lakeshore336 => {
                let controller = Lakeshore336::from_port(port);
                if let Some(timeout) = timeout {
                    controller.set_timeout(timeout).await;
                }
                controller.initialize().await?;
                Device::Lakeshore336(Arc::new(controller))
            }
            InstrumentKind::RigolDs1000z => {
                let scope = RigolDs1000z::from_port(port);
                if let Some(timeout) = timeout {
                    scope.set_timeout(timeout).await;
                }
                scope.initialize().await?;
                Device::RigolDs1000z(Arc::new(scope))
            }
        };

        tracing::info!(id = %definition.id, kind = %definition.r#type, resource, "instrument ready");
        Ok(device)
    }

    /// Capabilities this device offers
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut capabilities = Vec::new();
        if self.switch_matrix().is_some() {
            capabilities.push(Capability::SwitchMatrix);
        }
        if self.probe_source().is_some() {
            capabilities.push(Capability::ProbeSource);
        }
        if self.pulse_source().is_some() {
            capabilities.push(Capability::PulseSource);
        }
        if self.buffered_source().is_some() {
            capabilities.push(Capability::BufferedSource);
        }
        if self.buffered_voltmeter().is_some() {
            capabilities.push(Capability::BufferedVoltmeter);
        }
        capabilities
    }

    /// Device as SwitchMatrix (if it supports this capability)
    pub fn switch_matrix(&self) -> Option<Arc<dyn SwitchMatrix>> {
        match self {
            Device::SwitchBox(d) => Some(Arc::clone(d) as Arc<dyn SwitchMatrix>),
            Device::Components(c) => c.switch_matrix.clone(),
            _ => None,
        }
    }

    /// Device as ProbeSource (if it supports this capability)
    pub fn probe_source(&self) -> Option<Arc<dyn ProbeSource>> {
        match self {
            Device::Keithley2401(d) => Some(Arc::clone(d) as Arc<dyn ProbeSource>),
            Device::Keithley2461(d) => Some(Arc::clone(d) as Arc<dyn ProbeSource>),
            Device::Components(c) => c.probe_source.clone(),
            _ => None,
        }
    }

    /// Device as PulseSource (if it supports this capability)
    pub fn pulse_source(&self) -> Option<Arc<dyn PulseSource>> {
        match self {
            Device::Keithley2401(d) => Some(Arc::clone(d) as Arc<dyn PulseSource>),
            Device::Keithley2461(d) => Some(Arc::clone(d) as Arc<dyn PulseSource>),
            Device::Components(c) => c.pulse_source.clone(),
            _ => None,
        }
    }

    /// Device as BufferedSource (if it supports this capability)
    pub fn buffered_source(&self) -> Option<Arc<dyn BufferedSource>> {
        match self {
            Device::Keithley2461(d) => Some(Arc::clone(d) as Arc<dyn BufferedSource>),
            Device::Components(c) => c.buffered_source.clone(),
            _ => None,
        }
    }

    /// Device as BufferedVoltmeter (if it supports this capability)
    pub fn buffered_voltmeter(&self) -> Option<Arc<dyn BufferedVoltmeter>> {
        match self {
            Device::Keithley2000(d) => Some(Arc::clone(d) as Arc<dyn BufferedVoltmeter>),
            Device::Components(c) => c.buffered_voltmeter.clone(),
            _ => None,
        }
    }

    /// Run the instrument's shutdown sequence and release the port.
    pub async fn close(&self) -> DaqResult<()> {
        match self {
            Device::Keithley2000(d) => d.close().await,
            Device::Keithley2401(d) => d.close().await,
            Device::Keithley2461(d) => d.close().await,
            Device::SwitchBox(d) => d.close().await,
            Device::Sr830(d) => d.close().await,
            Device::Lakeshore336(d) => d.close().await,
            Device::RigolDs1000z(d) => d.close().await,
            Device::Components(_) => Ok(()),
        }
    }
}

// =============================================================================
// Instrument Registry
// =============================================================================

/// Connected instruments by id
#[derive(Default)]
pub struct InstrumentRegistry {
    devices: BTreeMap<DeviceId, Device>,
}

impl InstrumentRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect every enabled instrument in `config`.
    ///
    /// If one instrument fails, the ones already connected are closed
    /// before the error is returned.
    pub async fn connect_all(config: &LabConfig) -> Result<Self> {
        Self::connect_with(config.enabled_instruments(), |definition| {
            let definition = definition.clone();
            async move { Device::connect(&definition).await }
        })
        .await
    }

    async fn connect_with<'a, F, Fut>(
        definitions: impl IntoIterator<Item = &'a InstrumentDefinition>,
        mut connect: F,
    ) -> Result<Self>
    where
        F: FnMut(&InstrumentDefinition) -> Fut,
        Fut: Future<Output = DaqResult<Device>>,
    {
        let mut registry = Self::new();

        for definition in definitions {
            tracing::info!(id = %definition.id, kind = %definition.r#type, "connecting");
            let step = match connect(definition).await {
                Ok(device) => match registry.insert(definition.id.clone(), device.clone()) {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        if let Err(close_err) = device.close().await {
                            tracing::warn!(id = %definition.id, "close failed: {}", close_err);
                        }
                        Err(e)
                    }
                },
                Err(e) => Err(anyhow::Error::new(e)),
            };

            if let Err(e) = step {
                if let Err(close_err) = registry.close_all().await {
                    tracing::warn!("cleanup after failed connect: {:#}", close_err);
                }
                return Err(e).with_context(|| {
                    format!("connecting '{}' ({})", definition.id, definition.r#type)
                });
            }
        }

        Ok(registry)
    }

    /// Register a device under `id`
    ///
    /// # Errors
    /// Returns error if `id` is already registered
    pub fn insert(&mut self, id: impl Into<DeviceId>, device: Device) -> Result<()> {
        let id = id.into();
        if self.devices.contains_key(&id) {
            return Err(anyhow!("Device '{}' is already registered", id));
        }
        self.devices.insert(id, device);
        Ok(())
    }

    /// Remove a device without closing it
    pub fn remove(&mut self, id: &str) -> Option<Device> {
        self.devices.remove(id)
    }

    /// Device by id
    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    /// Check if a device is registered
    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    /// Registered ids in order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    /// Get count of registered devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    // =========================================================================
    // Capability Access
    // =========================================================================

    /// Get a device as SwitchMatrix
    pub fn switch_matrix(&self, id: &str) -> Result<Arc<dyn SwitchMatrix>> {
        self.capability(id, Capability::SwitchMatrix, Device::switch_matrix)
    }

    /// Get a device as ProbeSource
    pub fn probe_source(&self, id: &str) -> Result<Arc<dyn ProbeSource>> {
        self.capability(id, Capability::ProbeSource, Device::probe_source)
    }

    /// Get a device as PulseSource
    pub fn pulse_source(&self, id: &str) -> Result<Arc<dyn PulseSource>> {
        self.capability(id, Capability::PulseSource, Device::pulse_source)
    }

    /// Get a device as BufferedSource
    pub fn buffered_source(&self, id: &str) -> Result<Arc<dyn BufferedSource>> {
        self.capability(id, Capability::BufferedSource, Device::buffered_source)
    }

    /// Get a device as BufferedVoltmeter
    pub fn buffered_voltmeter(&self, id: &str) -> Result<Arc<dyn BufferedVoltmeter>> {
        self.capability(id, Capability::BufferedVoltmeter, Device::buffered_voltmeter)
    }

    /// Ids of all devices that support `capability`
    pub fn devices_with_capability(&self, capability: Capability) -> Vec<DeviceId> {
        self.devices
            .iter()
            .filter(|(_, d)| d.capabilities().contains(&capability))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn capability<T: ?Sized>(
        &self,
        id: &str,
        capability: Capability,
        access: impl Fn(&Device) -> Option<Arc<T>>,
    ) -> Result<Arc<T>> {
        let device = self
            .devices
            .get(id)
            .ok_or_else(|| anyhow!("no instrument registered as '{}'", id))?;
        access(device).ok_or_else(|| anyhow!("instrument '{}' is not a {}", id, capability))
    }

    /// Close every device, then report all failures together.
    pub async fn close_all(&self) -> Result<()> {
        let mut failures = Vec::new();
        for (id, device) in &self.devices {
            match device.close().await {
                Ok(()) => tracing::debug!(%id, "closed"),
                Err(e) => {
                    tracing::warn!(%id, "close failed: {}", e);
                    failures.push(format!("{}: {}", id, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("failed to close {}", failures.join("; ")))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
