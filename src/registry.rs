//! Instrument registry: resolves a bench-assigned identifier to validated
//! connection parameters.
//!
//! The registry is loaded once at startup from a sectioned key-value (INI)
//! file and treated as immutable afterwards. Each section names one
//! instrument; the reserved `[GPIBEthernetServers]` section enumerates
//! LAN/GPIB gateway hosts keyed by a logical location name.
//!
//! Transport selection is explicit: the combination of fields present in a
//! section maps deterministically onto one [`ConnectionParameters`] variant,
//! and every ambiguous or incomplete combination is rejected here, at load
//! time, rather than surfacing later as a connect failure.
//!
//! ```ini
//! [GPIBEthernetServers]
//! optics_lab = 10.46.25.190
//!
//! [OSA1]
//! device_type = osa
//! gpib_address = 3
//! gpib_location = optics_lab
//! terminating_char = LF
//! ```

use crate::config::DEFAULT_BAUD;
use crate::error::RegistryError;
use crate::terminator::Terminator;
use config::{Config, File, FileFormat};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// Reserved section enumerating LAN/GPIB gateway hosts by location name.
pub const GATEWAY_SECTION: &str = "GPIBEthernetServers";

/// Category of instrument an identifier refers to.
///
/// Informational only: device type routes to the correct driver but has no
/// effect on transport framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    /// Optical spectrum analyser.
    Osa,
    /// Oscilloscope.
    Osc,
    /// Electrical (RF) spectrum analyser.
    Esa,
    /// Pulse-diagnostic device (autocorrelator and friends).
    Pdd,
    /// Power supply.
    Ps,
    /// Power meter.
    Pm,
    /// Lock-in amplifier.
    Lockin,
    /// Function generator.
    Fg,
    /// Gateway or utility server entry.
    Server,
}

impl DeviceType {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "osa" => Some(DeviceType::Osa),
            "osc" => Some(DeviceType::Osc),
            "esa" => Some(DeviceType::Esa),
            "pdd" => Some(DeviceType::Pdd),
            "ps" => Some(DeviceType::Ps),
            "pm" => Some(DeviceType::Pm),
            "lockin" => Some(DeviceType::Lockin),
            "fg" => Some(DeviceType::Fg),
            "server" => Some(DeviceType::Server),
            _ => None,
        }
    }
}

/// Which transport session variant a registry entry constructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Directly bus-addressed GPIB.
    Gpib,
    /// GPIB bus reached through a LAN gateway.
    GpibOverEthernet,
    /// RS-232 serial port at a fixed device path.
    Serial,
    /// Raw TCP to the instrument's own network stack.
    Ethernet,
    /// USB-serial device discovered by serial number.
    Usb,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportKind::Gpib => "gpib",
            TransportKind::GpibOverEthernet => "gpib-ethernet",
            TransportKind::Serial => "serial",
            TransportKind::Ethernet => "ethernet",
            TransportKind::Usb => "usb",
        };
        f.write_str(label)
    }
}

/// Validated, transport-specific connection parameters for one instrument.
///
/// Exactly one transport-specific field group is populated, consistent with
/// the [`TransportKind`] the variant encodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionParameters {
    /// Directly bus-addressed GPIB device.
    Gpib {
        /// Bus address, 0-30.
        bus_address: u8,
        /// End-of-message convention.
        terminator: Terminator,
    },
    /// GPIB device reached through a LAN/GPIB gateway.
    GpibOverEthernet {
        /// Gateway hostname or IP address.
        gateway: String,
        /// Bus address forwarded inside each framed request, 0-30.
        bus_address: u8,
        /// End-of-message convention.
        terminator: Terminator,
    },
    /// Instrument with its own TCP network stack.
    Ethernet {
        /// Hostname or IP address.
        host: String,
        /// TCP port.
        port: u16,
        /// End-of-message convention.
        terminator: Terminator,
    },
    /// RS-232 device at a fixed port path.
    Serial {
        /// Device path, e.g. `/dev/ttyUSB0` or `COM3`.
        path: String,
        /// Baud rate.
        baud_rate: u32,
        /// End-of-message convention.
        terminator: Terminator,
    },
    /// USB-serial device located by scanning for its serial number.
    Usb {
        /// Device serial number, e.g. `P1003109`.
        serial_number: String,
        /// Baud rate.
        baud_rate: u32,
        /// End-of-message convention.
        terminator: Terminator,
    },
}

impl ConnectionParameters {
    /// The transport variant these parameters construct.
    pub fn kind(&self) -> TransportKind {
        match self {
            ConnectionParameters::Gpib { .. } => TransportKind::Gpib,
            ConnectionParameters::GpibOverEthernet { .. } => TransportKind::GpibOverEthernet,
            ConnectionParameters::Ethernet { .. } => TransportKind::Ethernet,
            ConnectionParameters::Serial { .. } => TransportKind::Serial,
            ConnectionParameters::Usb { .. } => TransportKind::Usb,
        }
    }

    /// The terminator policy carried by every variant.
    pub fn terminator(&self) -> Terminator {
        match self {
            ConnectionParameters::Gpib { terminator, .. }
            | ConnectionParameters::GpibOverEthernet { terminator, .. }
            | ConnectionParameters::Ethernet { terminator, .. }
            | ConnectionParameters::Serial { terminator, .. }
            | ConnectionParameters::Usb { terminator, .. } => *terminator,
        }
    }
}

/// One resolved registry entry.
#[derive(Debug, Clone)]
pub struct InstrumentEntry {
    /// Identifier as spelled in the registry file.
    pub id: String,
    /// Device category, when the section declares one.
    pub device_type: Option<DeviceType>,
    /// Validated transport parameters.
    pub params: ConnectionParameters,
}

/// Process-wide read-mostly mapping from identifier to parameters.
///
/// Lookups are case-insensitive: the underlying INI machinery does not
/// guarantee case preservation, and bench names are unambiguous either way.
#[derive(Debug, Clone, Default)]
pub struct InstrumentRegistry {
    entries: HashMap<String, InstrumentEntry>,
    gateways: HashMap<String, String>,
}

impl InstrumentRegistry {
    /// Load and validate a registry file.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let raw = Config::builder()
            .add_source(File::from(path.to_path_buf()).format(FileFormat::Ini))
            .build()?;
        Self::build(raw.try_deserialize()?)
    }

    /// Parse a registry from INI text. Used by tests and embedded fixtures.
    pub fn from_ini_str(text: &str) -> Result<Self, RegistryError> {
        let raw = Config::builder()
            .add_source(File::from_str(text, FileFormat::Ini))
            .build()?;
        Self::build(raw.try_deserialize()?)
    }

    fn build(sections: HashMap<String, HashMap<String, String>>) -> Result<Self, RegistryError> {
        let mut gateways = HashMap::new();
        let mut instrument_sections = Vec::new();

        for (name, fields) in sections {
            if name.eq_ignore_ascii_case(GATEWAY_SECTION) {
                for (location, host) in fields {
                    if host.trim().is_empty() {
                        return Err(RegistryError::InvalidParameters {
                            id: GATEWAY_SECTION.to_string(),
                            reason: format!("empty gateway host for location '{location}'"),
                        });
                    }
                    gateways.insert(location.to_ascii_lowercase(), host.trim().to_string());
                }
            } else {
                instrument_sections.push((name, fields));
            }
        }

        let mut entries = HashMap::new();
        for (id, fields) in instrument_sections {
            let entry = parse_entry(&id, &fields, &gateways)?;
            entries.insert(id.to_ascii_lowercase(), entry);
        }

        tracing::debug!(
            instruments = entries.len(),
            gateways = gateways.len(),
            "instrument registry loaded"
        );

        Ok(Self { entries, gateways })
    }

    /// Resolve an identifier to its validated entry.
    pub fn resolve(&self, id: &str) -> Result<&InstrumentEntry, RegistryError> {
        self.entries
            .get(&id.to_ascii_lowercase())
            .ok_or_else(|| RegistryError::UnknownIdentifier(id.to_string()))
    }

    /// All known identifiers, sorted for stable listings.
    pub fn identifiers(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.entries.values().map(|e| e.id.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    /// Gateway host for a logical location name, if configured.
    pub fn gateway_host(&self, location: &str) -> Option<&str> {
        self.gateways
            .get(&location.to_ascii_lowercase())
            .map(String::as_str)
    }
}

fn invalid(id: &str, reason: impl Into<String>) -> RegistryError {
    RegistryError::InvalidParameters {
        id: id.to_string(),
        reason: reason.into(),
    }
}

fn parse_entry(
    id: &str,
    fields: &HashMap<String, String>,
    gateways: &HashMap<String, String>,
) -> Result<InstrumentEntry, RegistryError> {
    let get = |key: &str| -> Option<&str> {
        fields
            .get(key)
            .map(String::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let device_type = match get("device_type") {
        Some(raw) => Some(
            DeviceType::parse(raw).ok_or_else(|| invalid(id, format!("unknown device_type '{raw}'")))?,
        ),
        None => None,
    };

    let ip_address = get("ip_address");
    let port = get("port");
    let gpib_address = get("gpib_address");
    let gpib_location = get("gpib_location");
    let serial_number = get("serial_number");
    let com_port = get("com_port");
    let baud_rate = match get("baud_rate") {
        Some(raw) => Some(
            raw.parse::<u32>()
                .map_err(|_| invalid(id, format!("baud_rate '{raw}' is not an integer")))?,
        ),
        None => None,
    };

    // Reject ambiguous field groups before looking at any individual value.
    if gpib_address.is_some() && (serial_number.is_some() || com_port.is_some()) {
        return Err(invalid(id, "gpib_address cannot be combined with serial fields"));
    }
    if serial_number.is_some() && (com_port.is_some() || ip_address.is_some()) {
        return Err(invalid(
            id,
            "serial_number cannot be combined with com_port or ip_address",
        ));
    }
    if com_port.is_some() && ip_address.is_some() {
        return Err(invalid(id, "com_port cannot be combined with ip_address"));
    }

    let explicit_terminator = match get("terminating_char") {
        Some(raw) => Some(raw.parse::<Terminator>().map_err(|e| invalid(id, e))?),
        None => None,
    };

    let params = if let Some(raw_addr) = gpib_address {
        let bus_address: u8 = raw_addr
            .parse()
            .map_err(|_| invalid(id, format!("gpib_address '{raw_addr}' is not an integer")))?;
        if bus_address > 30 {
            return Err(invalid(
                id,
                format!("gpib_address {bus_address} outside the 0-30 bus range"),
            ));
        }
        let terminator = explicit_terminator.unwrap_or(Terminator::Lf);

        if let Some(host) = ip_address {
            ConnectionParameters::GpibOverEthernet {
                gateway: host.to_string(),
                bus_address,
                terminator,
            }
        } else if let Some(location) = gpib_location {
            let host = gateways
                .get(&location.to_ascii_lowercase())
                .ok_or_else(|| {
                    invalid(
                        id,
                        format!("gpib_location '{location}' not present in [{GATEWAY_SECTION}]"),
                    )
                })?;
            ConnectionParameters::GpibOverEthernet {
                gateway: host.clone(),
                bus_address,
                terminator,
            }
        } else {
            ConnectionParameters::Gpib {
                bus_address,
                terminator,
            }
        }
    } else if let Some(host) = ip_address {
        let raw_port = port.ok_or_else(|| invalid(id, "ip_address given without port"))?;
        let port: u16 = raw_port
            .parse()
            .map_err(|_| invalid(id, format!("port '{raw_port}' is not a valid TCP port")))?;
        ConnectionParameters::Ethernet {
            host: host.to_string(),
            port,
            terminator: explicit_terminator.unwrap_or(Terminator::CrLf),
        }
    } else if let Some(serial_number) = serial_number {
        ConnectionParameters::Usb {
            serial_number: serial_number.to_string(),
            baud_rate: baud_rate.unwrap_or(DEFAULT_BAUD),
            terminator: explicit_terminator.unwrap_or(Terminator::None),
        }
    } else if let Some(path) = com_port {
        ConnectionParameters::Serial {
            path: path.to_string(),
            baud_rate: baud_rate.unwrap_or(DEFAULT_BAUD),
            terminator: explicit_terminator.unwrap_or(Terminator::None),
        }
    } else {
        return Err(invalid(
            id,
            "no transport fields (expected gpib_address, ip_address, serial_number or com_port)",
        ));
    };

    Ok(InstrumentEntry {
        id: id.to_string(),
        device_type,
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"
[GPIBEthernetServers]
optics_lab = 10.46.25.190
hearing_hub = 10.204.43.240

[OSA1]
device_type = osa
gpib_address = 3
gpib_location = optics_lab
terminating_char = LF

[HP54616C]
device_type = osc
ip_address = 10.46.25.51
gpib_address = 7

[AndoAQ6317B]
device_type = osa
ip_address = 10.46.25.60
port = 4000
terminating_char = CRLF

[ThorLabsPM100A]
device_type = pm
serial_number = P1003109

[SRS830]
device_type = lockin
com_port = /dev/ttyUSB1
baud_rate = 19200
terminating_char = CR
"#;

    fn fixture() -> InstrumentRegistry {
        InstrumentRegistry::from_ini_str(FIXTURE).expect("fixture registry parses")
    }

    #[test]
    fn gpib_address_with_location_resolves_via_gateway_section() {
        let reg = fixture();
        let entry = reg.resolve("OSA1").expect("OSA1 present");
        assert_eq!(entry.device_type, Some(DeviceType::Osa));
        assert_eq!(
            entry.params,
            ConnectionParameters::GpibOverEthernet {
                gateway: "10.46.25.190".into(),
                bus_address: 3,
                terminator: Terminator::Lf,
            }
        );
    }

    #[test]
    fn gpib_address_with_ip_uses_entry_ip_as_gateway() {
        let reg = fixture();
        let entry = reg.resolve("HP54616C").expect("HP54616C present");
        assert_eq!(entry.params.kind(), TransportKind::GpibOverEthernet);
        match &entry.params {
            ConnectionParameters::GpibOverEthernet {
                gateway,
                bus_address,
                terminator,
            } => {
                assert_eq!(gateway, "10.46.25.51");
                assert_eq!(*bus_address, 7);
                assert_eq!(*terminator, Terminator::Lf, "GPIB default is LF");
            }
            other => panic!("unexpected params: {other:?}"),
        }
    }

    #[test]
    fn gpib_address_alone_is_direct_gpib() {
        let reg = InstrumentRegistry::from_ini_str(
            "[PSU1]\ndevice_type = ps\ngpib_address = 12\n",
        )
        .expect("parses");
        assert_eq!(
            reg.resolve("PSU1").expect("present").params.kind(),
            TransportKind::Gpib
        );
    }

    #[test]
    fn ip_and_port_is_raw_ethernet() {
        let reg = fixture();
        let entry = reg.resolve("AndoAQ6317B").expect("present");
        assert_eq!(
            entry.params,
            ConnectionParameters::Ethernet {
                host: "10.46.25.60".into(),
                port: 4000,
                terminator: Terminator::CrLf,
            }
        );
    }

    #[test]
    fn serial_number_alone_is_usb_with_default_baud() {
        let reg = fixture();
        let entry = reg.resolve("ThorLabsPM100A").expect("present");
        assert_eq!(
            entry.params,
            ConnectionParameters::Usb {
                serial_number: "P1003109".into(),
                baud_rate: DEFAULT_BAUD,
                terminator: Terminator::None,
            }
        );
    }

    #[test]
    fn com_port_is_serial_with_explicit_baud() {
        let reg = fixture();
        let entry = reg.resolve("SRS830").expect("present");
        assert_eq!(
            entry.params,
            ConnectionParameters::Serial {
                path: "/dev/ttyUSB1".into(),
                baud_rate: 19200,
                terminator: Terminator::Cr,
            }
        );
    }

    #[test]
    fn unknown_identifier_is_reported() {
        let reg = fixture();
        assert!(matches!(
            reg.resolve("DOES_NOT_EXIST"),
            Err(RegistryError::UnknownIdentifier(_))
        ));
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let reg = fixture();
        assert!(reg.resolve("osa1").is_ok());
        assert!(reg.resolve("THORLABSPM100A").is_ok());
    }

    #[test]
    fn ambiguous_field_groups_are_rejected_at_load() {
        for section in [
            "[X]\ngpib_address = 3\nserial_number = AB1\n",
            "[X]\nserial_number = AB1\ncom_port = COM3\n",
            "[X]\nserial_number = AB1\nip_address = 10.0.0.2\n",
            "[X]\nip_address = 10.0.0.2\n",
            "[X]\ndevice_type = pm\n",
        ] {
            assert!(
                matches!(
                    InstrumentRegistry::from_ini_str(section),
                    Err(RegistryError::InvalidParameters { .. })
                ),
                "expected rejection for: {section}"
            );
        }
    }

    #[test]
    fn out_of_range_bus_address_is_rejected() {
        assert!(matches!(
            InstrumentRegistry::from_ini_str("[X]\ngpib_address = 31\n"),
            Err(RegistryError::InvalidParameters { .. })
        ));
    }

    #[test]
    fn unknown_gateway_location_is_rejected() {
        assert!(matches!(
            InstrumentRegistry::from_ini_str("[X]\ngpib_address = 3\ngpib_location = basement\n"),
            Err(RegistryError::InvalidParameters { .. })
        ));
    }

    #[test]
    fn bad_terminator_spelling_is_rejected() {
        assert!(matches!(
            InstrumentRegistry::from_ini_str("[X]\ngpib_address = 3\nterminating_char = EOL\n"),
            Err(RegistryError::InvalidParameters { .. })
        ));
    }

    #[test]
    fn gateway_hosts_are_queryable() {
        let reg = fixture();
        assert_eq!(reg.gateway_host("Hearing_Hub"), Some("10.204.43.240"));
        assert_eq!(reg.gateway_host("unknown"), None);
    }

    #[test]
    fn identifiers_are_sorted() {
        let reg = fixture();
        let ids = reg.identifiers();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
        assert_eq!(ids.len(), 5);
    }
}
