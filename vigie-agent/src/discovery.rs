//! Network discovery and agent identification
//!
//! This module handles:
//! - Primary MAC address detection with priority (Ethernet > WiFi > Other)
//! - Network interface enumeration with IP addresses
//! - Agent identity (the `source` of every uploaded record)

use anyhow::{Context, Result};
use if_addrs::{get_if_addrs, IfAddr};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Network interface information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub mac: String,
    pub ip: String,
    #[serde(rename = "type")]
    pub interface_type: InterfaceType,
}

/// Interface type classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Ethernet,
    Wireless,
    Loopback,
    Other,
}

/// Complete network discovery result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub primary_mac: String,
    pub interfaces: Vec<NetworkInterface>,
}

/// Who this agent is, as seen by the collector API
#[derive(Debug, Clone, Serialize)]
pub struct AgentIdentity {
    pub source: String,
    pub hostname: String,
}

impl AgentIdentity {
    /// Configured source wins; otherwise the primary MAC address
    pub fn resolve(configured: Option<&str>) -> Result<Self> {
        let hostname = gethostname::gethostname().to_string_lossy().to_string();

        let source = match configured {
            Some(source) if !source.trim().is_empty() => source.to_string(),
            _ => {
                let network = NetworkInfo::discover()
                    .context("Failed to discover network information")?;
                network.primary_mac
            }
        };

        info!("Agent identity - source: {}, hostname: {}", source, hostname);
        Ok(Self { source, hostname })
    }
}

impl NetworkInfo {
    /// Discover network interfaces and determine primary MAC
    pub fn discover() -> Result<Self> {
        debug!("Enumerating network interfaces...");

        let interfaces = Self::enumerate()?;
        let primary_mac = Self::select_primary_mac(&interfaces)?;

        info!("Selected primary MAC: {} from {} interfaces", primary_mac, interfaces.len());

        Ok(NetworkInfo {
            primary_mac,
            interfaces,
        })
    }

    /// Non-loopback interfaces that expose a hardware address
    pub fn enumerate() -> Result<Vec<NetworkInterface>> {
        let if_addrs = get_if_addrs().context("Failed to enumerate network interfaces")?;

        let mut interfaces = Vec::new();
        for if_addr in if_addrs {
            if if_addr.is_loopback() {
                continue;
            }

            let ip = match if_addr.addr {
                IfAddr::V4(v4) => v4.ip.to_string(),
                IfAddr::V6(v6) => v6.ip.to_string(),
            };

            match mac_address::mac_address_by_name(&if_addr.name) {
                Ok(Some(mac)) => {
                    let interface = NetworkInterface {
                        name: if_addr.name.clone(),
                        mac: format_mac(&mac.bytes()),
                        ip,
                        interface_type: Self::classify_interface(&if_addr.name),
                    };
                    debug!("Found interface: {} ({})", interface.name, interface.mac);
                    interfaces.push(interface);
                }
                Ok(None) => debug!("No MAC found for interface: {}", if_addr.name),
                Err(e) => debug!("Error getting MAC for {}: {}", if_addr.name, e),
            }
        }

        Ok(interfaces)
    }

    /// Classify interface type based on name patterns
    fn classify_interface(name: &str) -> InterfaceType {
        let name_lower = name.to_lowercase();

        if name_lower == "lo" || name_lower.starts_with("lo0") {
            return InterfaceType::Loopback;
        }

        if name_lower.contains("wlan")
            || name_lower.contains("wifi")
            || name_lower.contains("wlp")
            || name_lower.contains("wlo")
        {
            return InterfaceType::Wireless;
        }

        // en/eth/ens/enp/eno
        if name_lower.starts_with("eth") || name_lower.starts_with("en") {
            return InterfaceType::Ethernet;
        }

        InterfaceType::Other
    }

    /// Select primary MAC address based on interface priority
    fn select_primary_mac(interfaces: &[NetworkInterface]) -> Result<String> {
        for kind in [InterfaceType::Ethernet, InterfaceType::Wireless] {
            if let Some(interface) = interfaces.iter().find(|i| i.interface_type == kind) {
                info!("Selected {:?} interface as primary: {}", kind, interface.name);
                return Ok(interface.mac.clone());
            }
        }

        if let Some(interface) = interfaces.first() {
            warn!("No Ethernet/WiFi found, using first interface: {}", interface.name);
            return Ok(interface.mac.clone());
        }

        Err(anyhow::anyhow!("No suitable network interface found"))
    }
}

pub fn format_mac(bytes: &[u8; 6]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}
