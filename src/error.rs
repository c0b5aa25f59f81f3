//! Custom error types for the connection layer.
//!
//! Two error enums cover the two failure domains:
//!
//! - **`RegistryError`**: the instrument registry could not produce a usable
//!   set of connection parameters. These are surfaced immediately to the
//!   caller of [`crate::factory::ConnectionFactory::connect`] and never
//!   retried internally.
//! - **`ConnectionError`**: an operation on a live (or opening) transport
//!   session failed. The layer performs no automatic retry; retry policy, if
//!   any, belongs to the device driver holding the session.
//!
//! A session that reports [`ConnectionError::Disconnected`] is permanently
//! closed: every subsequent operation on it fails with `Disconnected` without
//! touching the underlying handle.

use thiserror::Error;

/// Convenience alias for results of transport operations.
pub type CommResult<T> = std::result::Result<T, ConnectionError>;

/// Failures while resolving an instrument identifier to connection parameters.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The identifier has no section in the registry file.
    #[error("unknown instrument identifier '{0}'")]
    UnknownIdentifier(String),

    /// The section exists but its fields are missing, malformed, or ambiguous.
    #[error("invalid parameters for '{id}': {reason}")]
    InvalidParameters {
        /// Instrument identifier of the offending section.
        id: String,
        /// Human-readable explanation of the inconsistency.
        reason: String,
    },

    /// The registry file itself could not be read or parsed.
    #[error("failed to load instrument registry: {0}")]
    Load(#[from] config::ConfigError),
}

/// Failures of a transport session operation.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The address, port, or device could not be reached at open time.
    #[error("instrument unreachable: {0}")]
    Unreachable(String),

    /// The bus, port, or device is already claimed by another session.
    #[error("resource busy: {0}")]
    Busy(String),

    /// The transport did not complete the operation within its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The channel was severed, or the session was already closed.
    #[error("session disconnected")]
    Disconnected,

    /// The instrument returned a payload that cannot be decoded as text.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Identifier resolution failed before a session could be constructed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The transport variant was compiled out of this build.
    #[error("support for this transport is not enabled; rebuild with --features {0}")]
    FeatureDisabled(&'static str),
}

impl ConnectionError {
    /// Map an I/O error raised while establishing a channel.
    pub(crate) fn from_open_io(err: std::io::Error, target: &str) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                ConnectionError::Timeout(format!("connecting to {target}"))
            }
            ErrorKind::AddrInUse | ErrorKind::PermissionDenied => {
                ConnectionError::Busy(format!("{target}: {err}"))
            }
            _ => ConnectionError::Unreachable(format!("{target}: {err}")),
        }
    }

    /// Map an I/O error raised on an already-open channel.
    pub(crate) fn from_io(err: std::io::Error, operation: &str) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                ConnectionError::Timeout(operation.to_string())
            }
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof => ConnectionError::Disconnected,
            _ => ConnectionError::Malformed(format!("{operation}: {err}")),
        }
    }

    /// Whether this failure permanently invalidates the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectionError::Disconnected)
    }
}
