//! # labcomms
//!
//! Unified, address-agnostic communication with heterogeneous laboratory
//! test instruments. Optical spectrum analysers, oscilloscopes, power
//! meters, lock-in amplifiers and the rest of the bench differ in physical
//! transport — GPIB, RS-232 serial, raw Ethernet, USB — but acquisition code
//! should not care: it asks for an instrument by name and gets back one
//! session speaking a single query/write/read contract.
//!
//! ## Crate structure
//!
//! - **`registry`**: maps a bench-assigned identifier to validated
//!   [`registry::ConnectionParameters`], loaded once from a sectioned
//!   key-value file. Ambiguous entries are rejected at load, not at connect.
//! - **`factory`**: the sole entry point for drivers —
//!   [`factory::ConnectionFactory::connect`] turns an identifier into a
//!   live, correctly configured session. Also pools the shared
//!   GPIB-over-Ethernet gateway links.
//! - **`transport`**: the [`transport::Transport`] trait and its variants
//!   (Ethernet, GPIB-over-Ethernet gateway, serial/USB, VISA-backed GPIB,
//!   plus a scripted mock for tests).
//! - **`terminator`**: the line-termination policy framing outgoing commands
//!   and delimiting responses.
//! - **`facade`**: a thin generic instrument wrapper (`*IDN?`, typed query
//!   helpers) for driver layers built on top.
//! - **`config`**: per-operation timeout defaults.
//! - **`error`**: `RegistryError` / `ConnectionError` taxonomy.
//!
//! ## Example
//!
//! ```no_run
//! use labcomms::factory::ConnectionFactory;
//! use labcomms::registry::InstrumentRegistry;
//! use labcomms::Transport;
//! use std::path::Path;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let registry = InstrumentRegistry::load(Path::new("config/instruments.ini"))?;
//! let factory = ConnectionFactory::new(registry);
//!
//! let mut osa = factory.connect("OSA1").await?;
//! let ident = osa.query("*IDN?").await?;
//! println!("{ident}");
//! osa.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod facade;
pub mod factory;
pub mod registry;
pub mod terminator;
pub mod transport;

pub use error::{CommResult, ConnectionError, RegistryError};
pub use factory::ConnectionFactory;
pub use registry::{ConnectionParameters, DeviceType, InstrumentRegistry, TransportKind};
pub use terminator::Terminator;
pub use transport::Transport;
