//! Contact switch box driver
//!
//! Relay matrix routing the six measurement lines (`I+`, `I-`, `V1+`, `V1-`,
//! `V2+`, `V2-`) to the eight sample contacts `A`-`H`.
//!
//! Protocol Overview:
//! - Transport: USB-serial, 57600 baud, 8N1
//! - Terminator: LF
//! - `ROUT:OPEN:ALL` opens every relay, `ROUT:CLOS <line>,<contact>` closes one
//! - `*OPC?` answers `1` once all queued relay operations have settled

use crate::error::{DaqError, DaqResult};
use crate::hardware::capabilities::SwitchMatrix;
use crate::hardware::resource::{open_port, SerialSettings};
use crate::hardware::transport::ScpiPort;
use crate::sequences::assignment::Assignment;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;

/// Baud rate
pub const BAUD_RATE: u32 = 57_600;

/// Response timeout, long enough for a full set of relay operations
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Driver for the contact switch box
pub struct SwitchBox {
    port: Mutex<ScpiPort>,
}

impl SwitchBox {
    /// Open the switch box and reset it (all relays open).
    pub async fn connect(resource: &str) -> DaqResult<Self> {
        let port = open_port(resource, &SerialSettings::new(BAUD_RATE)).await?;
        let switchbox = Self::from_port(port);
        switchbox.initialize().await?;
        tracing::info!(resource, "switch box connected");
        Ok(switchbox)
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

    /// Reset; every relay opens.
    pub async fn initialize(&self) -> DaqResult<()> {
        self.port.lock().await.write("*rst").await
    }

    /// Route lines to contacts as given by `assignment`, opening everything
    /// else first, and wait for the relays to settle.
    pub async fn switch(&self, assignment: &Assignment) -> DaqResult<()> {
        let mut commands = vec!["ROUT:OPEN:ALL".to_string()];
        commands.extend(
            assignment
                .iter()
                .map(|(terminal, contact)| format!("ROUT:CLOS {},{}", terminal, contact)),
        );

        let mut port = self.port.lock().await;
        port.write_all(&commands).await?;
        let response = port.query("*OPC?").await?;
        if response.trim() != "1" {
            return Err(DaqError::Instrument(format!(
                "switch box did not confirm routing '{}' (got '{}')",
                assignment, response
            )));
        }
        tracing::debug!(%assignment, "switch box routed");
        Ok(())
    }

    /// Open every relay
    pub async fn open_all(&self) -> DaqResult<()> {
        self.port.lock().await.write("ROUT:OPEN:ALL").await
    }

    /// Open every relay, then release the port
    pub async fn close(&self) -> DaqResult<()> {
        let mut port = self.port.lock().await;
        port.write("ROUT:OPEN:ALL").await?;
        port.shutdown().await
    }
}

#[async_trait]
impl SwitchMatrix for SwitchBox {
    async fn route(&self, assignment: &Assignment) -> anyhow::Result<()> {
        Ok(self.switch(assignment).await?)
    }
}
