//! Scripted in-memory transport for testing without hardware.
//!
//! Queue canned responses, inject failures, and inspect a journal of every
//! wire-level action the session performed. The journal only records real
//! I/O: operations rejected because the session is closed leave no trace,
//! which is exactly what tests assert when checking the post-close contract.

use crate::error::{CommResult, ConnectionError};
use crate::registry::TransportKind;
use crate::terminator::Terminator;
use crate::transport::{SessionState, Transport};
use async_trait::async_trait;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Failure to inject into a mock operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Endpoint cannot be reached.
    Unreachable,
    /// Resource claimed elsewhere.
    Busy,
    /// Deadline expiry.
    Timeout,
    /// Channel severed; latches the session.
    Disconnected,
}

impl MockFailure {
    fn to_error(self) -> ConnectionError {
        match self {
            MockFailure::Unreachable => ConnectionError::Unreachable("mock endpoint".into()),
            MockFailure::Busy => ConnectionError::Busy("mock endpoint".into()),
            MockFailure::Timeout => ConnectionError::Timeout("mock operation".into()),
            MockFailure::Disconnected => ConnectionError::Disconnected,
        }
    }
}

/// Shared handle onto a mock session's I/O journal.
#[derive(Debug, Clone, Default)]
pub struct MockJournal(Arc<Mutex<Vec<String>>>);

impl MockJournal {
    /// Snapshot of the journal entries so far.
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().map(|g| g.clone()).unwrap_or_default()
    }

    fn push(&self, entry: String) {
        if let Ok(mut guard) = self.0.lock() {
            guard.push(entry);
        }
    }
}

/// Scripted transport session.
pub struct MockTransport {
    kind: TransportKind,
    terminator: Terminator,
    responses: VecDeque<String>,
    journal: MockJournal,
    fail_open: Option<MockFailure>,
    fail_next: Option<MockFailure>,
    state: SessionState,
}

impl MockTransport {
    /// A mock Ethernet-flavoured session with LF termination.
    pub fn new() -> Self {
        Self {
            kind: TransportKind::Ethernet,
            terminator: Terminator::Lf,
            responses: VecDeque::new(),
            journal: MockJournal::default(),
            fail_open: None,
            fail_next: None,
            state: SessionState::Closed,
        }
    }

    /// Pretend to be a different transport variant.
    pub fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    /// Change the framing terminator.
    pub fn with_terminator(mut self, terminator: Terminator) -> Self {
        self.terminator = terminator;
        self
    }

    /// Queue responses returned by successive reads, in order.
    pub fn with_responses<I, S>(mut self, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.responses = responses.into_iter().map(Into::into).collect();
        self
    }

    /// Make `open` fail with the given failure.
    pub fn with_open_failure(mut self, failure: MockFailure) -> Self {
        self.fail_open = Some(failure);
        self
    }

    /// Make the next write/read fail with the given failure.
    pub fn fail_next(&mut self, failure: MockFailure) {
        self.fail_next = Some(failure);
    }

    /// Handle for inspecting recorded I/O after the session moved elsewhere.
    pub fn journal(&self) -> MockJournal {
        self.journal.clone()
    }

    fn take_injected(&mut self) -> CommResult<()> {
        if let Some(failure) = self.fail_next.take() {
            let err = failure.to_error();
            if err.is_fatal() {
                self.state = SessionState::Failed;
            }
            return Err(err);
        }
        Ok(())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn info(&self) -> String {
        format!("mock {} (terminator {})", self.kind, self.terminator)
    }

    fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    async fn open(&mut self) -> CommResult<()> {
        if self.state == SessionState::Failed {
            return Err(ConnectionError::Disconnected);
        }
        if let Some(failure) = self.fail_open {
            return Err(failure.to_error());
        }
        self.journal.push("open".to_string());
        self.state = SessionState::Open;
        Ok(())
    }

    async fn write(&mut self, command: &str) -> CommResult<()> {
        self.state.ensure_open()?;
        self.take_injected()?;
        let framed = self.terminator.frame(command);
        let escaped: String = String::from_utf8_lossy(&framed).escape_default().collect();
        self.journal.push(format!("write:{escaped}"));
        Ok(())
    }

    async fn read(&mut self) -> CommResult<String> {
        self.state.ensure_open()?;
        self.take_injected()?;
        let response = self
            .responses
            .pop_front()
            .ok_or_else(|| ConnectionError::Timeout("no scripted response".to_string()))?;
        self.journal.push(format!("read:{response}"));
        Ok(response)
    }

    async fn close(&mut self) {
        if self.state == SessionState::Open {
            self.journal.push("close".to_string());
        }
        self.state = SessionState::Closed;
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
