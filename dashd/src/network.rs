//! Local address discovery.
//!
//! Addresses come from an ordered list of strategies: the network manager
//! over the system bus first, then the kernel's interface list. The first
//! strategy producing a non-empty result wins; failures and empty results
//! fall through to the next one.

use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use shared::types::{DeviceType, NetworkAddress, NetworkInfo};
use crate::bus::{ConnectionManager, RawDevice};
use crate::ttl_cache::TtlCache;

/// Network manager device type codes
const NM_DEVICE_ETHERNET: u32 = 1;
const NM_DEVICE_WIFI: u32 = 2;
const NM_DEVICE_BT: u32 = 5;

pub trait AddressStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn resolve(&self) -> BoxFuture<'_, Result<Vec<NetworkAddress>>>;
}

/// Device class for a network manager type code
pub fn classify_nm_device(code: u32) -> DeviceType {
    match code {
        NM_DEVICE_ETHERNET => DeviceType::Ethernet,
        NM_DEVICE_WIFI => DeviceType::Wifi,
        NM_DEVICE_BT => DeviceType::Bluetooth,
        _ => DeviceType::Other,
    }
}

/// Device class from interface naming conventions
pub fn classify_interface(name: &str) -> DeviceType {
    const PREFIXES: &[(&str, DeviceType)] = &[
        ("eth", DeviceType::Ethernet),
        ("en", DeviceType::Ethernet),
        ("wl", DeviceType::Wifi),
        ("docker", DeviceType::DockerBridge),
        ("br-", DeviceType::DockerBridge),
        ("veth", DeviceType::DockerBridge),
        ("bnep", DeviceType::Bluetooth),
        ("bt", DeviceType::Bluetooth),
    ];

    PREFIXES
        .iter()
        .find(|(prefix, _)| name.starts_with(prefix))
        .map(|(_, kind)| *kind)
        .unwrap_or(DeviceType::Other)
}

fn is_loopback(address: &str) -> bool {
    address
        .parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

/// Addresses of physical devices reported by the network manager
pub fn addresses_from_devices(devices: Vec<RawDevice>) -> Vec<NetworkAddress> {
    devices
        .into_iter()
        .map(|device| {
            let kind = classify_nm_device(device.device_type);
            (device, kind)
        })
        .filter(|(_, kind)| kind.is_physical())
        .flat_map(|(device, kind)| {
            let interface = device.interface;
            device.ipv4.into_iter().map(move |address| NetworkAddress {
                address,
                device: interface.clone(),
                device_type: kind,
            })
        })
        .collect()
}

/// IPv4 addresses from `(interface, address)` pairs, loopback excluded
pub fn addresses_from_interfaces<I>(interfaces: I) -> Vec<NetworkAddress>
where
    I: IntoIterator<Item = (String, Ipv4Addr)>,
{
    interfaces
        .into_iter()
        .filter(|(_, ip)| !ip.is_loopback())
        .map(|(name, ip)| NetworkAddress {
            address: ip.to_string(),
            device_type: classify_interface(&name),
            device: name,
        })
        .collect()
}

/// Asks the network manager over the system bus
pub struct BusStrategy {
    bus: Arc<ConnectionManager>,
}

impl BusStrategy {
    pub fn new(bus: Arc<ConnectionManager>) -> Self {
        Self { bus }
    }
}

impl AddressStrategy for BusStrategy {
    fn name(&self) -> &'static str {
        "network manager"
    }

    fn resolve(&self) -> BoxFuture<'_, Result<Vec<NetworkAddress>>> {
        Box::pin(async move {
            let devices = self
                .bus
                .call("GetDevices", |handle| async move { handle.bus().network_devices().await })
                .await
                .ok_or_else(|| anyhow!("bus unavailable"))?;
            Ok(addresses_from_devices(devices))
        })
    }
}

/// Reads the kernel's interface list with getifaddrs
pub struct InterfaceStrategy;

impl InterfaceStrategy {
    fn read() -> Result<Vec<NetworkAddress>> {
        let addrs = nix::ifaddrs::getifaddrs().context("getifaddrs failed")?;

        let pairs: Vec<(String, Ipv4Addr)> = addrs
            .filter_map(|ifaddr| {
                let sin = ifaddr.address.as_ref()?.as_sockaddr_in()?;
                let ip = *SocketAddrV4::from(*sin).ip();
                Some((ifaddr.interface_name, ip))
            })
            .collect();

        Ok(addresses_from_interfaces(pairs))
    }
}

impl AddressStrategy for InterfaceStrategy {
    fn name(&self) -> &'static str {
        "interfaces"
    }

    fn resolve(&self) -> BoxFuture<'_, Result<Vec<NetworkAddress>>> {
        Box::pin(async move {
            tokio::task::spawn_blocking(Self::read)
                .await
                .context("Interface enumeration task failed")?
        })
    }
}

pub struct NetworkObserver {
    strategies: Vec<Box<dyn AddressStrategy>>,
}

impl NetworkObserver {
    pub fn new(strategies: Vec<Box<dyn AddressStrategy>>) -> Self {
        Self { strategies }
    }

    /// Bus first, kernel interfaces as fallback
    pub fn with_defaults(bus: Arc<ConnectionManager>) -> Self {
        Self::new(vec![
            Box::new(BusStrategy::new(bus)),
            Box::new(InterfaceStrategy),
        ])
    }

    /// Addresses from the first strategy that succeeds with a non-empty
    /// result. Never fails; an empty list means no strategy found anything.
    pub async fn resolve_addresses(&self) -> Vec<NetworkAddress> {
        for strategy in &self.strategies {
            match strategy.resolve().await {
                Ok(addresses) => {
                    let addresses: Vec<_> = addresses
                        .into_iter()
                        .filter(|a| !is_loopback(&a.address))
                        .collect();
                    if !addresses.is_empty() {
                        tracing::debug!("Resolved {} addresses via {}", addresses.len(), strategy.name());
                        return addresses;
                    }
                    tracing::debug!("No addresses via {}, trying next", strategy.name());
                }
                Err(e) => {
                    tracing::warn!("Address lookup via {} failed: {:#}", strategy.name(), e);
                }
            }
        }
        Vec::new()
    }
}

/// Egress address lookup, memoized per freshness window
pub struct EgressLookup {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    ttl: Duration,
    cache: TtlCache<String>,
}

/// Shown when the egress address cannot be determined
pub const UNKNOWN_EGRESS: &str = "?";

impl EgressLookup {
    pub fn new(client: reqwest::Client, url: String, timeout: Duration, ttl: Duration) -> Self {
        Self {
            client,
            url,
            timeout,
            ttl,
            cache: TtlCache::new(),
        }
    }

    #[cfg(test)]
    fn with_clock(mut self, clock: crate::ttl_cache::Clock) -> Self {
        self.cache = TtlCache::with_clock(clock);
        self
    }

    pub async fn external_ip(&self) -> String {
        self.cache
            .memoize("egress_ip", self.ttl, None, || async move {
                match self.fetch().await {
                    Ok(ip) => ip,
                    Err(e) => {
                        tracing::warn!("Egress IP lookup failed: {:#}", e);
                        UNKNOWN_EGRESS.to_string()
                    }
                }
            })
            .await
    }

    async fn fetch(&self) -> Result<String> {
        let body = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .context("Egress request failed")?
            .error_for_status()
            .context("Egress service returned an error")?
            .text()
            .await
            .context("Failed to read egress response")?;

        Ok(body.trim().to_string())
    }
}

pub fn hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|e| {
            tracing::warn!("Failed to read hostname: {}", e);
            "unknown".to_string()
        })
}

pub async fn network_info(observer: &NetworkObserver, egress: &EgressLookup) -> NetworkInfo {
    let (external_ip, local_ip) = tokio::join!(egress.external_ip(), observer.resolve_addresses());
    NetworkInfo {
        hostname: hostname(),
        external_ip,
        local_ip,
    }
}
