//! Connection factory: the sole entry point device drivers use to obtain a
//! live transport session.
//!
//! `connect` resolves the identifier through the registry, constructs the
//! session variant matching the resolved [`crate::registry::TransportKind`],
//! performs the
//! one-time open (handshake, timeout configuration) and hands back the live
//! session. On any failure the partially-constructed session is fully closed
//! before the error is returned, so no OS handle ever leaks.
//!
//! The factory also owns the pool of shared [`GatewayLink`]s: GPIB-over-
//! Ethernet entries pointing at the same gateway host receive the same link,
//! which is what serializes their wire traffic. The pool holds weak
//! references, so a gateway socket lives exactly as long as some session
//! still routes through it.

use crate::config::TimeoutSettings;
use crate::error::CommResult;
use crate::registry::{ConnectionParameters, InstrumentRegistry};
use crate::transport::{EthernetSession, GatewayLink, GpibLanSession, Transport};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::info;

#[cfg(feature = "tokio_serial")]
use crate::transport::{SerialLocator, SerialSession};
#[cfg(feature = "instrument_visa")]
use crate::transport::VisaSession;

/// Builds and opens transport sessions from registry entries.
pub struct ConnectionFactory {
    registry: Arc<InstrumentRegistry>,
    timeouts: TimeoutSettings,
    gateways: Mutex<HashMap<String, Weak<GatewayLink>>>,
}

impl ConnectionFactory {
    /// Wrap a loaded registry with default timeouts.
    pub fn new(registry: InstrumentRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            timeouts: TimeoutSettings::default(),
            gateways: Mutex::new(HashMap::new()),
        }
    }

    /// Apply per-operation deadlines to every session this factory builds.
    pub fn with_timeouts(mut self, timeouts: TimeoutSettings) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// The registry backing this factory.
    pub fn registry(&self) -> &InstrumentRegistry {
        &self.registry
    }

    /// Shared link for a gateway host, reusing a live one when any session
    /// still holds it.
    async fn gateway_link(&self, host: &str) -> Arc<GatewayLink> {
        let mut pool = self.gateways.lock().await;
        if let Some(link) = pool.get(host).and_then(Weak::upgrade) {
            return link;
        }
        let link = Arc::new(GatewayLink::new(host, self.timeouts.clone()));
        pool.insert(host.to_string(), Arc::downgrade(&link));
        link
    }

    /// Resolve `id`, construct the matching session variant and open it.
    pub async fn connect(&self, id: &str) -> CommResult<Box<dyn Transport>> {
        let entry = self.registry.resolve(id)?;

        let mut session: Box<dyn Transport> = match &entry.params {
            ConnectionParameters::Gpib {
                bus_address,
                terminator,
            } => {
                #[cfg(feature = "instrument_visa")]
                {
                    Box::new(
                        VisaSession::new(*bus_address, *terminator)
                            .with_timeouts(self.timeouts.clone()),
                    )
                }
                #[cfg(not(feature = "instrument_visa"))]
                {
                    let _ = (bus_address, terminator);
                    return Err(crate::error::ConnectionError::FeatureDisabled(
                        "instrument_visa",
                    ));
                }
            }
            ConnectionParameters::GpibOverEthernet {
                gateway,
                bus_address,
                terminator,
            } => {
                let link = self.gateway_link(gateway).await;
                Box::new(GpibLanSession::new(link, *bus_address, *terminator))
            }
            ConnectionParameters::Ethernet {
                host,
                port,
                terminator,
            } => Box::new(
                EthernetSession::new(host.clone(), *port, *terminator)
                    .with_timeouts(self.timeouts.clone()),
            ),
            ConnectionParameters::Serial {
                path,
                baud_rate,
                terminator,
            } => {
                #[cfg(feature = "tokio_serial")]
                {
                    Box::new(
                        SerialSession::new(
                            SerialLocator::Path(path.clone()),
                            *baud_rate,
                            *terminator,
                        )
                        .with_timeouts(self.timeouts.clone()),
                    )
                }
                #[cfg(not(feature = "tokio_serial"))]
                {
                    let _ = (path, baud_rate, terminator);
                    return Err(crate::error::ConnectionError::FeatureDisabled(
                        "tokio_serial",
                    ));
                }
            }
            ConnectionParameters::Usb {
                serial_number,
                baud_rate,
                terminator,
            } => {
                #[cfg(feature = "tokio_serial")]
                {
                    Box::new(
                        SerialSession::new(
                            SerialLocator::SerialNumber(serial_number.clone()),
                            *baud_rate,
                            *terminator,
                        )
                        .with_timeouts(self.timeouts.clone()),
                    )
                }
                #[cfg(not(feature = "tokio_serial"))]
                {
                    let _ = (serial_number, baud_rate, terminator);
                    return Err(crate::error::ConnectionError::FeatureDisabled(
                        "tokio_serial",
                    ));
                }
            }
        };

        if let Err(err) = session.open().await {
            // Release anything the half-open session may hold.
            session.close().await;
            return Err(err);
        }

        info!(id = %entry.id, session = %session.info(), "instrument connected");
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConnectionError as CErr, RegistryError};

    fn factory(ini: &str) -> ConnectionFactory {
        ConnectionFactory::new(
            InstrumentRegistry::from_ini_str(ini).expect("test registry parses"),
        )
    }

    #[tokio::test]
    async fn unknown_identifier_surfaces_registry_error() {
        let factory = factory("[OSA1]\ngpib_address = 3\nip_address = 10.0.0.9\n");
        let err = factory.connect("nope").await.err().expect("unknown id");
        assert!(matches!(
            err,
            CErr::Registry(RegistryError::UnknownIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn gateway_links_are_shared_per_host() {
        let factory = factory("[A]\ngpib_address = 1\nip_address = 10.0.0.9\n");
        let first = factory.gateway_link("10.0.0.9").await;
        let second = factory.gateway_link("10.0.0.9").await;
        assert!(Arc::ptr_eq(&first, &second));

        let other = factory.gateway_link("10.0.0.10").await;
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[tokio::test]
    async fn dead_gateway_links_are_rebuilt() {
        let factory = factory("[A]\ngpib_address = 1\nip_address = 10.0.0.9\n");
        let first = factory.gateway_link("10.0.0.9").await;
        let host = first.host().to_string();
        drop(first);
        // All sessions gone: the weak entry is dead and a fresh link appears.
        let rebuilt = factory.gateway_link(&host).await;
        assert_eq!(rebuilt.host(), host);
    }
}
