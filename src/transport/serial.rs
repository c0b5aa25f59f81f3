//! RS-232 / USB-serial session for laboratory devices.
//!
//! Two discovery modes: a fixed device path (`/dev/ttyUSB0`, `COM3`) taken
//! straight from the registry, or a scan of the connected USB-serial devices
//! for a matching serial number. No arbitration is needed on a point-to-point
//! serial line, but the scan can legitimately come up empty when the device
//! is unplugged — that is an `Unreachable` open failure, not a bug.

use crate::config::TimeoutSettings;
use crate::error::{CommResult, ConnectionError};
use crate::registry::TransportKind;
use crate::terminator::Terminator;
use crate::transport::{decode_text, read_until, SessionState, Transport};
use async_trait::async_trait;
use std::any::Any;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, trace};

/// Settle time before a drain-style read on terminator-less devices; the
/// instrument needs a moment to place its reply on the line.
const SETTLE: Duration = Duration::from_millis(150);

/// How a serial instrument is located at open time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialLocator {
    /// Fixed device path from the registry.
    Path(String),
    /// USB serial number; the port list is scanned for a match.
    SerialNumber(String),
}

impl SerialLocator {
    fn describe(&self) -> String {
        match self {
            SerialLocator::Path(path) => path.clone(),
            SerialLocator::SerialNumber(sn) => format!("usb serial {sn}"),
        }
    }
}

/// Exclusive session over one serial port, 8N1, no flow control.
pub struct SerialSession {
    locator: SerialLocator,
    baud_rate: u32,
    terminator: Terminator,
    timeouts: TimeoutSettings,
    stream: Option<SerialStream>,
    state: SessionState,
}

impl SerialSession {
    /// Create a closed session for the given locator and baud rate.
    pub fn new(locator: SerialLocator, baud_rate: u32, terminator: Terminator) -> Self {
        Self {
            locator,
            baud_rate,
            terminator,
            timeouts: TimeoutSettings::default(),
            stream: None,
            state: SessionState::Closed,
        }
    }

    /// Apply per-operation deadlines.
    pub fn with_timeouts(mut self, timeouts: TimeoutSettings) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Resolve the locator to a concrete port path.
    fn resolve_path(&self) -> CommResult<String> {
        match &self.locator {
            SerialLocator::Path(path) => Ok(path.clone()),
            SerialLocator::SerialNumber(wanted) => {
                let ports = serialport::available_ports().map_err(|err| {
                    ConnectionError::Unreachable(format!("serial port scan failed: {err}"))
                })?;
                for port in ports {
                    if let serialport::SerialPortType::UsbPort(info) = &port.port_type {
                        if info.serial_number.as_deref() == Some(wanted.as_str()) {
                            return Ok(port.port_name);
                        }
                    }
                }
                Err(ConnectionError::Unreachable(format!(
                    "no connected USB-serial device with serial number '{wanted}'"
                )))
            }
        }
    }

    fn mark_failed(&mut self) {
        self.state = SessionState::Failed;
        self.stream = None;
    }
}

fn map_serial_open_err(err: tokio_serial::Error, target: &str) -> ConnectionError {
    match err.kind {
        tokio_serial::ErrorKind::NoDevice => {
            ConnectionError::Unreachable(format!("{target}: no such device"))
        }
        tokio_serial::ErrorKind::Io(kind) if kind == std::io::ErrorKind::PermissionDenied => {
            ConnectionError::Busy(format!("{target}: already claimed"))
        }
        _ => ConnectionError::Unreachable(format!("{target}: {err}")),
    }
}

#[async_trait]
impl Transport for SerialSession {
    fn kind(&self) -> TransportKind {
        match self.locator {
            SerialLocator::Path(_) => TransportKind::Serial,
            SerialLocator::SerialNumber(_) => TransportKind::Usb,
        }
    }

    fn info(&self) -> String {
        format!(
            "{} {} @ {} baud (terminator {})",
            self.kind(),
            self.locator.describe(),
            self.baud_rate,
            self.terminator
        )
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
        let path = self.resolve_path()?;
        let stream = tokio_serial::new(&path, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|err| map_serial_open_err(err, &path))?;

        debug!(port = %path, baud = self.baud_rate, "serial session open");
        self.stream = Some(stream);
        self.state = SessionState::Open;
        Ok(())
    }

    async fn write(&mut self, command: &str) -> CommResult<()> {
        self.state.ensure_open()?;
        let framed = self.terminator.frame(command);
        trace!(port = %self.locator.describe(), command, "serial write");

        let deadline = self.timeouts.write();
        let result = {
            let stream = self.stream.as_mut().ok_or(ConnectionError::Disconnected)?;
            // Drop any stale reply still sitting in the buffers; a fresh
            // command must pair with a fresh response.
            stream
                .clear(tokio_serial::ClearBuffer::All)
                .map_err(|err| ConnectionError::Malformed(format!("buffer clear failed: {err}")))?;
            match tokio::time::timeout(deadline, async {
                stream.write_all(&framed).await?;
                stream.flush().await
            })
            .await
            {
                Err(_) => Err(ConnectionError::Timeout(format!("writing '{command}'"))),
                Ok(Err(err)) => Err(ConnectionError::from_io(err, "serial write")),
                Ok(Ok(())) => Ok(()),
            }
        };

        if let Err(err) = &result {
            if err.is_fatal() {
                self.mark_failed();
            }
        }
        result
    }

    async fn read(&mut self) -> CommResult<String> {
        self.state.ensure_open()?;
        let terminator = self.terminator;
        let deadline = self.timeouts.read();

        if terminator == Terminator::None {
            tokio::time::sleep(SETTLE).await;
        }

        let result = {
            let stream = self.stream.as_mut().ok_or(ConnectionError::Disconnected)?;
            read_until(stream, terminator, deadline).await
        };

        match result {
            Ok(buffer) => {
                let text = decode_text(&buffer, terminator)?;
                trace!(port = %self.locator.describe(), response = %text, "serial read");
                Ok(text)
            }
            Err(err) => {
                if err.is_fatal() {
                    self.mark_failed();
                }
                Err(err)
            }
        }
    }

    async fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(port = %self.locator.describe(), "serial session closed");
        }
        self.state = SessionState::Closed;
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
