//! Timeout configuration shared by all transport sessions.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default baud rate applied when a serial registry entry omits `baud_rate`.
pub const DEFAULT_BAUD: u32 = 9600;

/// Per-operation deadlines, in milliseconds.
///
/// The registry format carries no timing information, so these defaults apply
/// to every session a factory constructs. `open` is allowed slightly longer
/// than `read`/`write` because socket connects and port scans dominate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    /// Deadline for establishing the underlying channel.
    #[serde(default = "default_open_ms")]
    pub open_ms: u64,
    /// Deadline for the transport to accept a framed command.
    #[serde(default = "default_write_ms")]
    pub write_ms: u64,
    /// Deadline for a complete (terminator-delimited) response.
    #[serde(default = "default_read_ms")]
    pub read_ms: u64,
}

fn default_open_ms() -> u64 {
    3000
}

fn default_write_ms() -> u64 {
    2000
}

fn default_read_ms() -> u64 {
    2000
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            open_ms: default_open_ms(),
            write_ms: default_write_ms(),
            read_ms: default_read_ms(),
        }
    }
}

impl TimeoutSettings {
    /// Open deadline as a [`Duration`].
    pub fn open(&self) -> Duration {
        Duration::from_millis(self.open_ms)
    }

    /// Write deadline as a [`Duration`].
    pub fn write(&self) -> Duration {
        Duration::from_millis(self.write_ms)
    }

    /// Read deadline as a [`Duration`].
    pub fn read(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }
}
