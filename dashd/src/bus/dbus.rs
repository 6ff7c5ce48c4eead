use std::collections::HashMap;
use std::sync::Arc;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use zbus::zvariant::{OwnedObjectPath, OwnedValue};
use zbus::{proxy, Connection};
use super::{Bus, BusConnector, MethodFailure, RawDevice, RawUnit};

/// Row layout of org.freedesktop.systemd1.Manager.ListUnits
type UnitRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    OwnedObjectPath,
    u32,
    String,
    OwnedObjectPath,
);

#[proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
trait SystemdManager {
    fn list_units(&self) -> zbus::Result<Vec<UnitRow>>;
}

#[proxy(
    interface = "org.freedesktop.NetworkManager",
    default_service = "org.freedesktop.NetworkManager",
    default_path = "/org/freedesktop/NetworkManager"
)]
trait NetworkManager {
    fn get_devices(&self) -> zbus::Result<Vec<OwnedObjectPath>>;
}

#[proxy(
    interface = "org.freedesktop.NetworkManager.Device",
    default_service = "org.freedesktop.NetworkManager"
)]
trait Device {
    #[zbus(property)]
    fn interface(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn device_type(&self) -> zbus::Result<u32>;

    #[zbus(property)]
    fn ip4_config(&self) -> zbus::Result<OwnedObjectPath>;
}

#[proxy(
    interface = "org.freedesktop.NetworkManager.IP4Config",
    default_service = "org.freedesktop.NetworkManager"
)]
trait Ip4Config {
    #[zbus(property)]
    fn address_data(&self) -> zbus::Result<Vec<HashMap<String, OwnedValue>>>;
}

/// Error replies from a reachable peer are method failures; anything else
/// (I/O, closed connection, protocol errors) is a transport failure.
fn classify(e: zbus::Error) -> anyhow::Error {
    match e {
        zbus::Error::MethodError(..) | zbus::Error::FDO(_) => {
            anyhow::Error::new(MethodFailure(e.to_string()))
        }
        other => anyhow::Error::new(other),
    }
}

/// Connects to the D-Bus system bus
pub struct SystemBusConnector;

impl BusConnector for SystemBusConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Bus>>> {
        Box::pin(async move {
            let conn = Connection::system()
                .await
                .context("Failed to connect to system bus")?;
            Ok(Arc::new(SystemBus { conn }) as Arc<dyn Bus>)
        })
    }
}

/// systemd and NetworkManager queries over one system bus connection
pub struct SystemBus {
    conn: Connection,
}

impl SystemBus {
    async fn read_units(&self) -> Result<Vec<RawUnit>> {
        let manager = SystemdManagerProxy::new(&self.conn)
            .await
            .context("Failed to create systemd manager proxy")?;

        let rows = manager
            .list_units()
            .await
            .map_err(classify)
            .context("ListUnits failed")?;

        Ok(rows
            .into_iter()
            .map(|(name, description, _load_state, active_state, sub_state, ..)| RawUnit {
                name,
                description,
                active_state,
                sub_state,
            })
            .collect())
    }

    async fn read_devices(&self) -> Result<Vec<RawDevice>> {
        let nm = NetworkManagerProxy::new(&self.conn)
            .await
            .context("Failed to create NetworkManager proxy")?;

        let paths = nm.get_devices().await.map_err(classify).context("GetDevices failed")?;

        let mut devices = Vec::with_capacity(paths.len());
        for path in paths {
            let device = DeviceProxy::builder(&self.conn)
                .path(path.clone())?
                .build()
                .await
                .with_context(|| format!("Failed to create device proxy for {}", path.as_str()))?;

            let interface = device.interface().await.map_err(classify).context("Failed to read Interface")?;
            let device_type = device.device_type().await.map_err(classify).context("Failed to read DeviceType")?;
            let config_path = device.ip4_config().await.map_err(classify).context("Failed to read Ip4Config")?;

            // "/" means the device has no IPv4 configuration
            let ipv4 = if config_path.as_str() == "/" {
                Vec::new()
            } else {
                self.read_ipv4(config_path).await?
            };

            devices.push(RawDevice {
                interface,
                device_type,
                ipv4,
            });
        }

        Ok(devices)
    }

    async fn read_ipv4(&self, path: OwnedObjectPath) -> Result<Vec<String>> {
        let config = Ip4ConfigProxy::builder(&self.conn)
            .path(path)?
            .build()
            .await
            .context("Failed to create IP4Config proxy")?;

        let data = config
            .address_data()
            .await
            .map_err(classify)
            .context("Failed to read AddressData")?;

        Ok(data
            .iter()
            .filter_map(|entry| entry.get("address"))
            .filter_map(|value| <&str>::try_from(value).ok())
            .map(str::to_string)
            .collect())
    }
}

impl Bus for SystemBus {
    fn list_units(&self) -> BoxFuture<'_, Result<Vec<RawUnit>>> {
        Box::pin(self.read_units())
    }

    fn network_devices(&self) -> BoxFuture<'_, Result<Vec<RawDevice>>> {
        Box::pin(self.read_devices())
    }
}
