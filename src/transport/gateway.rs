//! GPIB-over-Ethernet: bus-addressed instruments reached through a LAN/GPIB
//! gateway box.
//!
//! One gateway multiplexes every bus address behind a single TCP socket, and
//! the gateway itself is a single-duplex resource: all sessions routed
//! through the same box share one [`GatewayLink`] whose internal lock
//! serializes wire traffic across addresses. A [`GpibLanSession`] holds a
//! non-owning `Arc` to the link plus its own bus address.
//!
//! The wire protocol distinguishes gateway control messages from instrument
//! payload by an extra framing layer: control lines are ASCII, prefixed
//! `++` and LF-framed (`++addr 5`, `++read eoi`, `++spoll 5`, `++loc`);
//! anything else is forwarded verbatim to the currently addressed device.

use crate::config::TimeoutSettings;
use crate::error::{CommResult, ConnectionError};
use crate::registry::TransportKind;
use crate::terminator::Terminator;
use crate::transport::{decode_text, read_until, SessionState, Transport};
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, trace};

/// TCP control port the gateway listens on.
pub const GATEWAY_PORT: u16 = 1234;

/// Shared physical connection to one LAN/GPIB gateway box.
///
/// Held behind an `Arc` by every session whose instrument hangs off that
/// gateway's bus; the factory keeps a pool so two instruments with different
/// bus addresses but the same gateway host share one socket.
pub struct GatewayLink {
    host: String,
    port: u16,
    timeouts: TimeoutSettings,
    state: Mutex<LinkState>,
}

#[derive(Default)]
struct LinkState {
    stream: Option<TcpStream>,
    /// Bus address the gateway currently has selected, to skip redundant
    /// `++addr` round-trips.
    selected: Option<u8>,
}

impl GatewayLink {
    /// Create an unconnected link to `host` on the standard gateway port.
    pub fn new(host: impl Into<String>, timeouts: TimeoutSettings) -> Self {
        Self {
            host: host.into(),
            port: GATEWAY_PORT,
            timeouts,
            state: Mutex::new(LinkState::default()),
        }
    }

    /// Override the gateway control port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Gateway hostname or IP this link targets.
    pub fn host(&self) -> &str {
        &self.host
    }

    fn endpoint(&self) -> String {
        // A host may carry an explicit port; the standard gateway port
        // applies otherwise.
        if self.host.contains(':') {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Connect the socket if it is not already up. The gateway keeps no
    /// session state beyond the selected address, so a fresh connection is
    /// always equivalent.
    async fn ensure_connected(&self, state: &mut LinkState) -> CommResult<()> {
        if state.stream.is_some() {
            return Ok(());
        }
        let endpoint = self.endpoint();
        let stream = match tokio::time::timeout(self.timeouts.open(), TcpStream::connect(&endpoint))
            .await
        {
            Err(_) => {
                return Err(ConnectionError::Timeout(format!("connecting to {endpoint}")));
            }
            Ok(Err(err)) => return Err(ConnectionError::from_open_io(err, &endpoint)),
            Ok(Ok(stream)) => stream,
        };
        stream
            .set_nodelay(true)
            .map_err(|err| ConnectionError::from_open_io(err, &endpoint))?;
        debug!(endpoint = %endpoint, "gateway link connected");
        state.selected = None;
        state.stream = Some(stream);
        Ok(())
    }

    /// Transmit raw bytes on the gateway socket within the write deadline.
    async fn transmit(&self, state: &mut LinkState, bytes: &[u8], what: &str) -> CommResult<()> {
        let stream = state.stream.as_mut().ok_or(ConnectionError::Disconnected)?;
        let result = match tokio::time::timeout(self.timeouts.write(), async {
            stream.write_all(bytes).await?;
            stream.flush().await
        })
        .await
        {
            Err(_) => Err(ConnectionError::Timeout(what.to_string())),
            Ok(Err(err)) => Err(ConnectionError::from_io(err, what)),
            Ok(Ok(())) => Ok(()),
        };
        if let Err(err) = &result {
            if err.is_fatal() {
                sever(state);
            }
        }
        result
    }

    /// Send one `++` control line.
    async fn control(&self, state: &mut LinkState, line: &str) -> CommResult<()> {
        trace!(gateway = %self.host, line, "gateway control");
        let mut framed = line.as_bytes().to_vec();
        framed.push(b'\n');
        self.transmit(state, &framed, "gateway control write").await
    }

    /// Make sure the gateway has `address` selected.
    async fn select(&self, state: &mut LinkState, address: u8) -> CommResult<()> {
        if state.selected == Some(address) {
            return Ok(());
        }
        self.control(state, &format!("++addr {address}")).await?;
        state.selected = Some(address);
        Ok(())
    }

    /// Forward instrument payload verbatim.
    async fn send_payload(&self, state: &mut LinkState, framed: &[u8]) -> CommResult<()> {
        self.transmit(state, framed, "instrument payload write").await
    }

    /// Ask the gateway for the addressed device's response and read it until
    /// `terminator` (a single chunk when the policy is `None`).
    async fn read_response(
        &self,
        state: &mut LinkState,
        terminator: Terminator,
    ) -> CommResult<Vec<u8>> {
        self.control(state, "++read eoi").await?;
        let deadline = self.timeouts.read();
        let stream = state.stream.as_mut().ok_or(ConnectionError::Disconnected)?;
        let result = read_until(stream, terminator, deadline).await;
        if let Err(err) = &result {
            if err.is_fatal() {
                sever(state);
            }
        }
        result
    }

    /// Serial-poll `address` and return the raw status byte.
    async fn serial_poll(&self, state: &mut LinkState, address: u8) -> CommResult<u8> {
        self.control(state, &format!("++spoll {address}")).await?;
        let deadline = self.timeouts.read();
        let stream = state.stream.as_mut().ok_or(ConnectionError::Disconnected)?;
        let line = match read_until(stream, Terminator::Lf, deadline).await {
            Ok(line) => line,
            Err(err) => {
                if err.is_fatal() {
                    sever(state);
                }
                return Err(err);
            }
        };
        let text = decode_text(&line, Terminator::Lf)?;
        text.trim()
            .parse::<u8>()
            .map_err(|_| ConnectionError::Malformed(format!("status byte '{text}' is not a byte")))
    }

    async fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().await
    }
}

fn sever(state: &mut LinkState) {
    state.stream = None;
    state.selected = None;
}

/// Unpack a status byte into bit flags, index = bit significance (so
/// `bits[7]` is the MSB).
pub fn status_bits(byte: u8) -> [bool; 8] {
    let mut bits = [false; 8];
    for (i, bit) in bits.iter_mut().enumerate() {
        *bit = byte & (1 << i) != 0;
    }
    bits
}

/// One instrument session multiplexed over a shared [`GatewayLink`].
pub struct GpibLanSession {
    link: Arc<GatewayLink>,
    bus_address: u8,
    terminator: Terminator,
    state: SessionState,
}

impl GpibLanSession {
    /// Create a closed session for `bus_address` behind `link`.
    pub fn new(link: Arc<GatewayLink>, bus_address: u8, terminator: Terminator) -> Self {
        Self {
            link,
            bus_address,
            terminator,
            state: SessionState::Closed,
        }
    }

    /// Serial-poll this device and return its status byte as bit flags.
    pub async fn status_byte(&mut self) -> CommResult<[bool; 8]> {
        self.state.ensure_open()?;
        let result = async {
            let mut guard = self.link.lock().await;
            self.link.ensure_connected(&mut guard).await?;
            self.link.serial_poll(&mut guard, self.bus_address).await
        }
        .await;
        self.latch_on_fatal(&result);
        result.map(status_bits)
    }

    /// Return the device to front-panel (local) control.
    pub async fn set_local(&mut self) -> CommResult<()> {
        self.state.ensure_open()?;
        let result = async {
            let mut guard = self.link.lock().await;
            self.link.ensure_connected(&mut guard).await?;
            self.link.select(&mut guard, self.bus_address).await?;
            self.link.control(&mut guard, "++loc").await
        }
        .await;
        self.latch_on_fatal(&result);
        result
    }

    fn latch_on_fatal<T>(&mut self, result: &CommResult<T>) {
        if let Err(err) = result {
            if err.is_fatal() {
                self.state = SessionState::Failed;
            }
        }
    }
}

#[async_trait]
impl Transport for GpibLanSession {
    fn kind(&self) -> TransportKind {
        TransportKind::GpibOverEthernet
    }

    fn info(&self) -> String {
        format!(
            "gpib-ethernet {} @ {} (terminator {})",
            self.bus_address,
            self.link.host(),
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
        let result = async {
            let mut guard = self.link.lock().await;
            self.link.ensure_connected(&mut guard).await?;
            // Presence probe: a device that is powered and addressed answers
            // a serial poll; silence means nothing lives at this address.
            self.link.serial_poll(&mut guard, self.bus_address).await
        }
        .await;
        match result {
            Ok(status) => {
                debug!(
                    gateway = %self.link.host(),
                    bus_address = self.bus_address,
                    status,
                    "gpib-ethernet session open"
                );
                self.state = SessionState::Open;
                Ok(())
            }
            Err(ConnectionError::Timeout(_)) => Err(ConnectionError::Unreachable(format!(
                "no device answered serial poll at bus address {} via {}",
                self.bus_address,
                self.link.host()
            ))),
            Err(err) => Err(err),
        }
    }

    async fn write(&mut self, command: &str) -> CommResult<()> {
        self.state.ensure_open()?;
        let framed = self.terminator.frame(command);
        let result = async {
            let mut guard = self.link.lock().await;
            self.link.ensure_connected(&mut guard).await?;
            self.link.select(&mut guard, self.bus_address).await?;
            self.link.send_payload(&mut guard, &framed).await
        }
        .await;
        self.latch_on_fatal(&result);
        result
    }

    async fn read(&mut self) -> CommResult<String> {
        self.state.ensure_open()?;
        let result = async {
            let mut guard = self.link.lock().await;
            self.link.ensure_connected(&mut guard).await?;
            self.link.select(&mut guard, self.bus_address).await?;
            self.link.read_response(&mut guard, self.terminator).await
        }
        .await;
        self.latch_on_fatal(&result);
        decode_text(&result?, self.terminator)
    }

    /// Atomic query: the link lock is held across address selection, the
    /// payload write and the response read, so traffic from sessions on
    /// other bus addresses can never interleave on the gateway socket.
    async fn query(&mut self, command: &str) -> CommResult<String> {
        self.state.ensure_open()?;
        let framed = self.terminator.frame(command);
        let result = async {
            let mut guard = self.link.lock().await;
            self.link.ensure_connected(&mut guard).await?;
            self.link.select(&mut guard, self.bus_address).await?;
            self.link.send_payload(&mut guard, &framed).await?;
            self.link.read_response(&mut guard, self.terminator).await
        }
        .await;
        self.latch_on_fatal(&result);
        decode_text(&result?, self.terminator)
    }

    async fn close(&mut self) {
        // The link is shared; the socket itself drops with its last owner.
        self.state = SessionState::Closed;
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
