//! Directly bus-addressed GPIB via a VISA backend.
//!
//! Used when an instrument hangs off a local GPIB interface card rather than
//! a LAN gateway. Requires a VISA installation at runtime, which is why the
//! whole module sits behind the `instrument_visa` feature; builds without it
//! report [`ConnectionError::FeatureDisabled`] from the factory instead.
//!
//! VISA calls are synchronous, so all I/O runs on Tokio's blocking executor,
//! mirroring how the serial adapters handled their blocking backends before
//! the async-native rewrite.

use crate::config::TimeoutSettings;
use crate::error::{CommResult, ConnectionError};
use crate::registry::TransportKind;
use crate::terminator::Terminator;
use crate::transport::{decode_text, SessionState, Transport};
use async_trait::async_trait;
use std::any::Any;
use std::ffi::CString;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use tracing::debug;
use visa_rs::prelude::*;

/// Session for one device on a local GPIB bus.
pub struct VisaSession {
    bus_address: u8,
    resource: String,
    terminator: Terminator,
    timeouts: TimeoutSettings,
    instrument: Option<Arc<Mutex<Instrument>>>,
    state: SessionState,
}

impl VisaSession {
    /// Create a closed session for `bus_address` on the first GPIB interface.
    pub fn new(bus_address: u8, terminator: Terminator) -> Self {
        Self {
            bus_address,
            resource: format!("GPIB0::{bus_address}::INSTR"),
            terminator,
            timeouts: TimeoutSettings::default(),
            instrument: None,
            state: SessionState::Closed,
        }
    }

    /// Apply per-operation deadlines.
    pub fn with_timeouts(mut self, timeouts: TimeoutSettings) -> Self {
        self.timeouts = timeouts;
        self
    }

    fn handle(&self) -> CommResult<Arc<Mutex<Instrument>>> {
        self.instrument
            .clone()
            .ok_or(ConnectionError::Disconnected)
    }

    fn mark_failed(&mut self) {
        self.state = SessionState::Failed;
        self.instrument = None;
    }
}

/// VISA surfaces its bus timeout as an opaque I/O error; recognise it so the
/// caller sees `Timeout` rather than `Malformed`.
fn map_visa_io(err: std::io::Error, operation: &str) -> ConnectionError {
    let text = err.to_string();
    if text.contains("TMO") || text.to_ascii_lowercase().contains("timeout") {
        ConnectionError::Timeout(operation.to_string())
    } else {
        ConnectionError::from_io(err, operation)
    }
}

#[async_trait]
impl Transport for VisaSession {
    fn kind(&self) -> TransportKind {
        TransportKind::Gpib
    }

    fn info(&self) -> String {
        format!("gpib {} (terminator {})", self.resource, self.terminator)
    }

    fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    async fn open(&mut self) -> CommResult<()> {
        match self.state {
            SessionState::Open => return Ok(()),
            SessionState::Failed => return Err(ConnectionError::Disconnected),
            SessionState::Closed => {}
        }
        let resource = self.resource.clone();
        let open_timeout = self.timeouts.open();
        let probe = self.terminator.frame("*IDN?");

        let instrument = tokio::task::spawn_blocking(move || -> CommResult<Instrument> {
            let rm = DefaultRM::new()
                .map_err(|err| ConnectionError::Unreachable(format!("VISA init failed: {err}")))?;
            let rsc = CString::new(resource.clone())
                .map_err(|_| ConnectionError::Unreachable(resource.clone()))?
                .into();
            let instr = rm
                .open(&rsc, AccessMode::NO_LOCK, open_timeout)
                .map_err(|err| ConnectionError::Unreachable(format!("{resource}: {err}")))?;

            // Identification probe: fail fast if nothing answers on the bus.
            (&instr)
                .write_all(&probe)
                .map_err(|err| map_visa_io(err, "identification probe"))?;
            let mut scratch = [0u8; 256];
            let n = (&instr)
                .read(&mut scratch)
                .map_err(|_| {
                    ConnectionError::Unreachable(format!(
                        "no device answered identification probe at {resource}"
                    ))
                })?;
            if n == 0 {
                return Err(ConnectionError::Unreachable(format!(
                    "empty identification response at {resource}"
                )));
            }
            Ok(instr)
        })
        .await
        .map_err(|err| ConnectionError::Unreachable(format!("VISA task failed: {err}")))??;

        debug!(resource = %self.resource, "gpib session open");
        self.instrument = Some(Arc::new(Mutex::new(instrument)));
        self.state = SessionState::Open;
        Ok(())
    }

    async fn write(&mut self, command: &str) -> CommResult<()> {
        self.state.ensure_open()?;
        let handle = self.handle()?;
        let framed = self.terminator.frame(command);

        let result = tokio::task::spawn_blocking(move || -> CommResult<()> {
            let guard = handle
                .lock()
                .map_err(|_| ConnectionError::Disconnected)?;
            (&*guard)
                .write_all(&framed)
                .map_err(|err| map_visa_io(err, "write"))
        })
        .await
        .map_err(|err| ConnectionError::Malformed(format!("VISA task failed: {err}")))?;

        if let Err(err) = &result {
            if err.is_fatal() {
                self.mark_failed();
            }
        }
        result
    }

    async fn read(&mut self) -> CommResult<String> {
        self.state.ensure_open()?;
        let handle = self.handle()?;
        let terminator = self.terminator;
        let deadline = self.timeouts.read();

        let result = tokio::task::spawn_blocking(move || -> CommResult<Vec<u8>> {
            let guard = handle
                .lock()
                .map_err(|_| ConnectionError::Disconnected)?;
            let start = std::time::Instant::now();
            let mut buffer = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                if start.elapsed() > deadline {
                    return Err(ConnectionError::Timeout("reading response".to_string()));
                }
                let n = (&*guard)
                    .read(&mut chunk)
                    .map_err(|err| map_visa_io(err, "read"))?;
                if n == 0 {
                    return Err(ConnectionError::Disconnected);
                }
                buffer.extend_from_slice(&chunk[..n]);
                if terminator.is_complete(&buffer) {
                    return Ok(buffer);
                }
            }
        })
        .await
        .map_err(|err| ConnectionError::Malformed(format!("VISA task failed: {err}")))?;

        match result {
            Ok(buffer) => decode_text(&buffer, terminator),
            Err(err) => {
                if err.is_fatal() {
                    self.mark_failed();
                }
                Err(err)
            }
        }
    }

    async fn close(&mut self) {
        // Dropping the VISA handle releases the bus channel.
        self.instrument = None;
        self.state = SessionState::Closed;
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
