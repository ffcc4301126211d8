//! VISA bridge for resources only a VISA library can reach (GPIB, USB-TMC by
//! VID/PID, VXI-11).
//!
//! VISA sessions are blocking, so each one lives on its own thread. The
//! thread owns the [`DevicePeer`](super::channel_port::DevicePeer) end of a
//! channel pair: every command line written to the returned stream is
//! forwarded to the instrument, and after a query (a header containing `?`)
//! one response line is read back and handed to the driver.

use super::channel_port::{self, DevicePeer};
use super::transport::DynSerial;
use crate::error::{DaqError, DaqResult};
use std::ffi::CString;
use std::io::{BufRead, BufReader, Write};
use tokio::sync::oneshot;
use visa_rs::prelude::*;

/// Open `name` through the system VISA library.
pub async fn open(name: &str) -> DaqResult<DynSerial> {
    let resource = CString::new(name)
        .map_err(|_| DaqError::UnsupportedResource(name.to_string()))?;
    let (port, peer) = channel_port::pair();
    let (ready_tx, ready_rx) = oneshot::channel();
    let label = name.to_string();

    std::thread::Builder::new()
        .name(format!("visa-{}", label))
        .spawn(move || {
            // The resource manager must outlive the session it opened
            let session = DefaultRM::new().and_then(|rm| {
                let id = rm.find_res(&resource.into())?;
                let instr = rm.open(&id, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)?;
                Ok((rm, instr))
            });
            match session {
                Ok((_rm, instr)) => {
                    let _ = ready_tx.send(Ok(()));
                    pump(instr, peer, &label);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(DaqError::Instrument(format!(
                        "VISA open failed for '{}': {}",
                        label, e
                    ))));
                }
            }
        })?;

    ready_rx
        .await
        .map_err(|_| DaqError::Instrument(format!("VISA thread for '{}' exited", name)))??;

    Ok(Box::new(port))
}

fn pump(mut instr: Instrument, mut peer: DevicePeer, label: &str) {
    while let Some(line) = peer.blocking_next_line() {
        if let Err(e) = instr.write_all(format!("{}\n", line).as_bytes()) {
            tracing::warn!(resource = %label, error = %e, "VISA write failed");
            break;
        }

        let header = line.split_whitespace().next().unwrap_or_default();
        if !header.contains('?') {
            continue;
        }

        let mut response = String::new();
        let read = {
            let mut reader = BufReader::new(&instr);
            reader.read_line(&mut response)
        };
        match read {
            Ok(_) => {
                if !peer.send_line(response) {
                    break;
                }
            }
            Err(e) => {
                // Leave the driver to time out on its own read
                tracing::warn!(resource = %label, error = %e, "VISA read failed");
            }
        }
    }
    tracing::debug!(resource = %label, "VISA bridge closed");
}
