//! Transport sessions: one physical/logical channel to one instrument.
//!
//! Every variant implements the same [`Transport`] contract — open, write,
//! read-until-terminator, query, close — so device drivers never care whether
//! an instrument sits on a GPIB bus, a serial port, or a network socket.
//!
//! Sessions are exclusively owned: the trait takes `&mut self` everywhere, so
//! a session can only be driven by one caller at a time, and [`query`] is
//! write-then-read with nothing interleaved in between. Instruments are
//! half-duplex; that guarantee is the whole point of `query`.
//!
//! [`query`]: Transport::query

use crate::error::{CommResult, ConnectionError};
use crate::registry::TransportKind;
use crate::terminator::Terminator;
use async_trait::async_trait;
use std::any::Any;
use std::time::Duration;
use tokio::io::AsyncReadExt;

pub mod ethernet;
pub mod gateway;
pub mod mock;
#[cfg(feature = "tokio_serial")]
pub mod serial;
#[cfg(feature = "instrument_visa")]
pub mod visa;

pub use ethernet::EthernetSession;
pub use gateway::{GatewayLink, GpibLanSession};
pub use mock::MockTransport;
#[cfg(feature = "tokio_serial")]
pub use serial::{SerialLocator, SerialSession};
#[cfg(feature = "instrument_visa")]
pub use visa::VisaSession;

/// Common contract implemented by every transport variant.
#[async_trait]
pub trait Transport: Send {
    /// Which transport variant this session is.
    fn kind(&self) -> TransportKind;

    /// Human-readable description of the endpoint, for logs and listings.
    fn info(&self) -> String;

    /// Whether the session currently holds a live channel.
    fn is_open(&self) -> bool;

    /// Establish the underlying channel and perform one-time setup.
    async fn open(&mut self) -> CommResult<()>;

    /// Frame a command with the session terminator and transmit it.
    async fn write(&mut self, command: &str) -> CommResult<()>;

    /// Block until the terminator policy reports a complete response (or the
    /// read deadline elapses) and return the payload with the terminator
    /// stripped.
    async fn read(&mut self) -> CommResult<String>;

    /// Atomic write-then-read. No other operation on this session can
    /// interleave between the two.
    async fn query(&mut self, command: &str) -> CommResult<String> {
        self.write(command).await?;
        self.read().await
    }

    /// Release the underlying channel. Idempotent; after close every
    /// operation fails with [`ConnectionError::Disconnected`] without
    /// touching the handle.
    async fn close(&mut self);

    /// Downcast hook for variant-specific extras (e.g. GPIB serial poll).
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Lifecycle of a session's underlying channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    /// Created, or explicitly closed. Terminal once `close` was called.
    Closed,
    /// Channel established and usable.
    Open,
    /// A fatal error severed the channel. Terminal.
    Failed,
}

impl SessionState {
    /// Gate an I/O operation on the session being open.
    pub(crate) fn ensure_open(self) -> CommResult<()> {
        match self {
            SessionState::Open => Ok(()),
            SessionState::Closed | SessionState::Failed => Err(ConnectionError::Disconnected),
        }
    }
}

/// Accumulate reads until the terminator reports completion, bounded by an
/// overall deadline.
///
/// With [`Terminator::None`] the first successful read is the complete
/// response; no multi-chunk reassembly is attempted. A zero-length read means
/// the peer severed the channel. A deadline expiry with a partial buffer is a
/// [`ConnectionError::Timeout`], never a truncated success.
pub(crate) async fn read_until<R>(
    reader: &mut R,
    terminator: Terminator,
    deadline: Duration,
) -> CommResult<Vec<u8>>
where
    R: AsyncReadExt + Unpin + ?Sized,
{
    let start = tokio::time::Instant::now();
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];

    loop {
        let remaining = deadline
            .checked_sub(start.elapsed())
            .filter(|d| !d.is_zero())
            .ok_or_else(|| ConnectionError::Timeout("reading response".to_string()))?;

        let n = match tokio::time::timeout(remaining, reader.read(&mut chunk)).await {
            Err(_) => return Err(ConnectionError::Timeout("reading response".to_string())),
            Ok(Err(err)) => return Err(ConnectionError::from_io(err, "read")),
            Ok(Ok(0)) => return Err(ConnectionError::Disconnected),
            Ok(Ok(n)) => n,
        };

        buffer.extend_from_slice(&chunk[..n]);
        if terminator.is_complete(&buffer) {
            return Ok(buffer);
        }
    }
}

/// Strip the terminator and decode the payload as UTF-8 text.
pub(crate) fn decode_text(buffer: &[u8], terminator: Terminator) -> CommResult<String> {
    let payload = terminator.strip(buffer);
    std::str::from_utf8(payload)
        .map(str::to_string)
        .map_err(|err| ConnectionError::Malformed(format!("response is not valid UTF-8: {err}")))
}
