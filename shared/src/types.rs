use std::fmt;
use serde::{Serialize, Deserialize};

/// A long-running unit tracked by the host's service manager.
/// This is the canonical data model used by the directory, the API, and peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceUnit {
    /// Unit identifier, e.g. "nginx.service"
    pub name: String,

    /// Coarse lifecycle label, e.g. "active", "failed", "inactive"
    #[serde(default)]
    pub state: String,

    /// Fine-grained lifecycle detail, e.g. "running", "dead"
    #[serde(default, alias = "sub_state")]
    pub sub_state: String,

    /// Human readable label
    #[serde(default)]
    pub description: String,

    /// Whether the unit is in the pin registry for its host
    #[serde(default)]
    pub pinned: bool,

    /// Peer hostname the unit was fetched from, only set by fan-out
    #[serde(default, alias = "host", skip_serializing_if = "Option::is_none")]
    pub origin_host: Option<String>,
}

/// One page of the service directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePage {
    pub units: Vec<ServiceUnit>,
    pub total: usize,
    pub page: usize,
    pub pages: usize,
}

impl ServicePage {
    /// Result returned when no data source could be reached.
    pub fn unavailable(page: usize) -> Self {
        Self {
            units: Vec::new(),
            total: 0,
            page,
            pages: 0,
        }
    }
}

/// A pinned service. `host` is absent for units on the local host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// A monitored peer running its own status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerHost {
    /// Address or DNS name, optionally with a port, e.g. "pi.lan:18745"
    pub hostname: String,
}

/// Classification of the device an address is assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceType {
    Ethernet,
    Wifi,
    Bluetooth,
    DockerBridge,
    Other,
}

impl DeviceType {
    /// Physical device classes reported by the bus path.
    pub fn is_physical(&self) -> bool {
        matches!(self, DeviceType::Ethernet | DeviceType::Wifi | DeviceType::Bluetooth)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceType::Ethernet => "ethernet",
            DeviceType::Wifi => "wifi",
            DeviceType::Bluetooth => "bluetooth",
            DeviceType::DockerBridge => "docker-bridge",
            DeviceType::Other => "other",
        };
        f.write_str(s)
    }
}

/// An IPv4 address assigned to a local interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAddress {
    pub address: String,
    pub device: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
}

/// Host identity block shown on the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    pub hostname: String,
    pub external_ip: String,
    pub local_ip: Vec<NetworkAddress>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_unit_defaults() {
        let unit: ServiceUnit = serde_json::from_str(r#"{"name":"x"}"#).unwrap();
        assert_eq!(unit.name, "x");
        assert!(unit.state.is_empty());
        assert!(!unit.pinned);
        assert!(unit.origin_host.is_none());
    }

    #[test]
    fn test_unit_accepts_snake_case_fields() {
        let unit: ServiceUnit = serde_json::from_str(
            r#"{"name":"a.service","state":"active","sub_state":"running","host":"pi.lan"}"#,
        )
        .unwrap();
        assert_eq!(unit.sub_state, "running");
        assert_eq!(unit.origin_host.as_deref(), Some("pi.lan"));
    }

    #[test]
    fn test_device_type_wire_names() {
        let addr = NetworkAddress {
            address: "172.17.0.1".to_string(),
            device: "docker0".to_string(),
            device_type: DeviceType::DockerBridge,
        };
        let json = serde_json::to_value(&addr).unwrap();
        assert_eq!(json["type"], "docker-bridge");
        assert_eq!(DeviceType::DockerBridge.to_string(), "docker-bridge");
    }
}
