use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub peers: PeersConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub weather: WeatherConfig,
    #[serde(default)]
    pub containers: ContainersConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_bus_call_timeout")]
    pub call_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeersConfig {
    #[serde(default = "default_peer_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_peer_ttl")]
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_egress_url")]
    pub egress_url: String,
    #[serde(default = "default_egress_timeout")]
    pub egress_timeout_ms: u64,
    #[serde(default = "default_egress_ttl")]
    pub egress_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeatherConfig {
    /// Overridden by OPENWEATHERMAP_API_KEY when set
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_weather_url")]
    pub base_url: String,
    #[serde(default = "default_weather_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_weather_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainersConfig {
    #[serde(default = "default_engines")]
    pub engines: Vec<String>,
}

fn default_listen() -> String {
    format!("0.0.0.0:{}", shared::protocol::DEFAULT_PORT)
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/dashd/db.sqlite")
}

fn default_bus_connect_timeout() -> u64 {
    2000
}

fn default_bus_call_timeout() -> u64 {
    3000
}

fn default_peer_timeout() -> u64 {
    3000
}

fn default_peer_ttl() -> u64 {
    300
}

fn default_egress_url() -> String {
    "http://icanhazip.com".to_string()
}

fn default_egress_timeout() -> u64 {
    3000
}

fn default_egress_ttl() -> u64 {
    60
}

fn default_weather_url() -> String {
    "http://api.openweathermap.org".to_string()
}

fn default_weather_ttl() -> u64 {
    600
}

fn default_weather_timeout() -> u64 {
    5000
}

fn default_engines() -> Vec<String> {
    vec!["docker".to_string(), "nerdctl".to_string()]
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_bus_connect_timeout(),
            call_timeout_ms: default_bus_call_timeout(),
        }
    }
}

impl BusConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_peer_timeout(),
            cache_ttl_secs: default_peer_ttl(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            egress_url: default_egress_url(),
            egress_timeout_ms: default_egress_timeout(),
            egress_ttl_secs: default_egress_ttl(),
        }
    }
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_weather_url(),
            ttl_secs: default_weather_ttl(),
            timeout_ms: default_weather_timeout(),
        }
    }
}

impl Default for ContainersConfig {
    fn default() -> Self {
        Self {
            engines: default_engines(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load the file if it exists, otherwise run on defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            tracing::warn!("Config file {} not found, using defaults", path.display());
            Self::default()
        };

        if let Ok(key) = std::env::var("OPENWEATHERMAP_API_KEY") {
            if !key.is_empty() {
                config.weather.api_key = Some(key);
            }
        }

        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Invalid TOML")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.api.listen, "0.0.0.0:18745");
        assert_eq!(config.peers.cache_ttl_secs, 300);
        assert_eq!(config.network.egress_ttl_secs, 60);
        assert_eq!(config.weather.ttl_secs, 600);
        assert!(config.weather.api_key.is_none());
        assert_eq!(config.containers.engines, vec!["docker", "nerdctl"]);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::parse(
            r#"
            [api]
            listen = "127.0.0.1:9000"

            [peers]
            request_timeout_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.api.listen, "127.0.0.1:9000");
        assert_eq!(config.peers.request_timeout_ms, 500);
        assert_eq!(config.peers.cache_ttl_secs, 300);
        assert_eq!(config.bus.call_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(Config::parse("[api\nlisten = 1").is_err());
    }
}
