//! Raw TCP session for instruments with their own network stack.

use crate::config::TimeoutSettings;
use crate::error::{CommResult, ConnectionError};
use crate::registry::TransportKind;
use crate::terminator::Terminator;
use crate::transport::{decode_text, read_until, SessionState, Transport};
use async_trait::async_trait;
use std::any::Any;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// TCP stream to one instrument; no bus addressing involved.
pub struct EthernetSession {
    host: String,
    port: u16,
    terminator: Terminator,
    timeouts: TimeoutSettings,
    stream: Option<TcpStream>,
    state: SessionState,
}

impl EthernetSession {
    /// Create a closed session for `host:port`.
    pub fn new(host: impl Into<String>, port: u16, terminator: Terminator) -> Self {
        Self {
            host: host.into(),
            port,
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

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn mark_failed(&mut self) {
        self.state = SessionState::Failed;
        self.stream = None;
    }
}

#[async_trait]
impl Transport for EthernetSession {
    fn kind(&self) -> TransportKind {
        TransportKind::Ethernet
    }

    fn info(&self) -> String {
        format!("ethernet {} (terminator {})", self.endpoint(), self.terminator)
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

        debug!(endpoint = %endpoint, "ethernet session open");
        self.stream = Some(stream);
        self.state = SessionState::Open;
        Ok(())
    }

    async fn write(&mut self, command: &str) -> CommResult<()> {
        self.state.ensure_open()?;
        let framed = self.terminator.frame(command);
        trace!(endpoint = %self.endpoint(), command, "ethernet write");

        let deadline = self.timeouts.write();
        let result = {
            let stream = self.stream.as_mut().ok_or(ConnectionError::Disconnected)?;
            match tokio::time::timeout(deadline, async {
                stream.write_all(&framed).await?;
                stream.flush().await
            })
            .await
            {
                Err(_) => Err(ConnectionError::Timeout(format!("writing '{command}'"))),
                Ok(Err(err)) => Err(ConnectionError::from_io(err, "write")),
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

        let result = {
            let stream = self.stream.as_mut().ok_or(ConnectionError::Disconnected)?;
            read_until(stream, terminator, deadline).await
        };

        match result {
            Ok(buffer) => {
                let text = decode_text(&buffer, terminator)?;
                trace!(endpoint = %self.endpoint(), response = %text, "ethernet read");
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
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!(endpoint = %self.endpoint(), "ethernet session closed");
        }
        self.state = SessionState::Closed;
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
