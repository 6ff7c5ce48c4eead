use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use crate::config::WeatherConfig;
use crate::store::{Record, StoreHandle, WEATHER_CITIES};
use crate::ttl_cache::TtlCache;

/// A city saved for the weather panel, resolved through the geocoding API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct City {
    pub name: String,
    pub country: String,
    #[serde(default)]
    pub state: Option<String>,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CityWeather {
    pub city: String,
    pub country: String,
    pub state: Option<String>,
    pub id: i64,
    pub openweathermap_id: i64,
    pub temperature: f64,
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct CityInput {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Current {
    id: i64,
    main: Main,
    weather: Vec<Condition>,
}

#[derive(Debug, Clone, Deserialize)]
struct Main {
    temp: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct Condition {
    description: String,
}

pub struct WeatherService {
    store: StoreHandle,
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    timeout: Duration,
    ttl: Duration,
    cache: TtlCache<Current>,
}

impl WeatherService {
    pub fn new(store: StoreHandle, client: reqwest::Client, config: &WeatherConfig) -> Self {
        Self {
            store,
            client,
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_millis(config.timeout_ms),
            ttl: Duration::from_secs(config.ttl_secs),
            cache: TtlCache::new(),
        }
    }

    /// Weather needs an API key; without one the panel stays empty
    pub fn enabled(&self) -> bool {
        self.api_key.is_some()
    }

    /// Current weather for every saved city. Cities whose lookup fails are left out.
    pub async fn list(&self) -> Result<Vec<CityWeather>> {
        if !self.enabled() {
            return Ok(Vec::new());
        }

        let cities: Vec<Record<City>> = self.store.records(WEATHER_CITIES).await?;
        let lookups = cities.iter().map(|city| self.current(&city.data));
        let results = futures::future::join_all(lookups).await;

        Ok(cities
            .into_iter()
            .zip(results)
            .filter_map(|(city, result)| match result {
                Ok(current) => Some(CityWeather {
                    city: city.data.name,
                    country: city.data.country,
                    state: city.data.state,
                    id: city.id,
                    openweathermap_id: current.id,
                    temperature: current.main.temp,
                    description: current
                        .weather
                        .first()
                        .map(|c| c.description.clone())
                        .unwrap_or_default(),
                }),
                Err(e) => {
                    tracing::warn!("Weather lookup for {} failed: {:#}", city.data.name, e);
                    None
                }
            })
            .collect())
    }

    /// Resolve `name` and save it. Returns None when the city is unknown.
    pub async fn add_city(&self, name: &str) -> Result<Option<i64>> {
        let key = self.key()?;
        let url = format!("{}/geo/1.0/direct", self.base_url);

        let matches: Vec<City> = self
            .client
            .get(&url)
            .query(&[("q", name), ("limit", "1"), ("appid", key)])
            .timeout(self.timeout)
            .send()
            .await
            .context("Geocoding request failed")?
            .error_for_status()
            .context("Geocoding service returned an error")?
            .json()
            .await
            .context("Malformed geocoding response")?;

        let Some(city) = matches.into_iter().next() else {
            return Ok(None);
        };

        let id = self.store.insert_record(WEATHER_CITIES, &city).await?;
        tracing::info!("Added weather city {}, {}", city.name, city.country);
        Ok(Some(id))
    }

    pub async fn remove_city(&self, id: i64) -> Result<bool> {
        self.store.remove(WEATHER_CITIES, id).await
    }

    /// Current conditions, memoized per coordinate for the freshness window
    async fn current(&self, city: &City) -> Result<Current> {
        let cache_key = format!("{}:{}", city.lat, city.lon);
        self.cache
            .try_memoize(&cache_key, self.ttl, None, || async move {
                self.fetch_current(city.lat, city.lon).await
            })
            .await
    }

    async fn fetch_current(&self, lat: f64, lon: f64) -> Result<Current> {
        let key = self.key()?;
        let url = format!("{}/data/2.5/weather", self.base_url);

        self.client
            .get(&url)
            .query(&[
                ("lat", lat.to_string().as_str()),
                ("lon", lon.to_string().as_str()),
                ("appid", key),
                ("units", "metric"),
            ])
            .timeout(self.timeout)
            .send()
            .await
            .context("Weather request failed")?
            .error_for_status()
            .context("Weather service returned an error")?
            .json()
            .await
            .context("Malformed weather response")
    }

    fn key(&self) -> Result<&str> {
        self.api_key.as_deref().ok_or_else(|| anyhow!("weather is disabled"))
    }
}
