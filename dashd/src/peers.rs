use std::time::Duration;
use anyhow::{anyhow, bail, Context, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::task::JoinSet;
use shared::protocol::SERVICES_PATH;
use shared::types::{PeerHost, ServiceUnit};
use crate::directory::sort_units;
use crate::pins::PinRegistry;
use crate::store::{StoreHandle, MONITORED_DEVICES};
use crate::ttl_cache::TtlCache;

const CACHE_KEY: &str = "all_services";

/// Peers answer with either a bare unit array or a directory page
#[derive(Deserialize)]
#[serde(untagged)]
enum PeerResponse {
    Units(Vec<ServiceUnit>),
    Page { units: Vec<ServiceUnit> },
}

impl PeerResponse {
    fn into_units(self) -> Vec<ServiceUnit> {
        match self {
            PeerResponse::Units(units) | PeerResponse::Page { units } => units,
        }
    }
}

/// Queries every monitored peer's service listing and merges the results
pub struct PeerAggregator {
    store: StoreHandle,
    pins: PinRegistry,
    client: reqwest::Client,
    request_timeout: Duration,
    ttl: Duration,
    cache: TtlCache<Vec<ServiceUnit>>,
}

impl PeerAggregator {
    pub fn new(
        store: StoreHandle,
        pins: PinRegistry,
        client: reqwest::Client,
        request_timeout: Duration,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            pins,
            client,
            request_timeout,
            ttl,
            cache: TtlCache::new(),
        }
    }

    #[cfg(test)]
    fn with_clock(mut self, clock: crate::ttl_cache::Clock) -> Self {
        self.cache = TtlCache::with_clock(clock);
        self
    }

    /// Units from all peers, each tagged with its origin host. Served from
    /// the cache within the freshness window unless `bust` is set. Pin flags
    /// are applied after the cache so pin changes show up immediately.
    pub async fn aggregate_all(&self, bust: bool) -> Vec<ServiceUnit> {
        let bust = bust.then(|| self.cache.bust_key());

        let mut units = self
            .cache
            .memoize(CACHE_KEY, self.ttl, bust, || async move { self.fan_out().await })
            .await;

        self.annotate_pins(&mut units).await;
        sort_units(&mut units);
        units
    }

    async fn fan_out(&self) -> Vec<ServiceUnit> {
        let peers = match self.store.records::<PeerHost>(MONITORED_DEVICES).await {
            Ok(peers) => peers,
            Err(e) => {
                tracing::warn!("Failed to read monitored devices: {:#}", e);
                return Vec::new();
            }
        };

        tracing::debug!("Fanning out to {} peers", peers.len());

        let mut tasks = JoinSet::new();
        for (idx, peer) in peers.into_iter().enumerate() {
            let client = self.client.clone();
            let timeout = self.request_timeout;
            let hostname = peer.data.hostname;
            tasks.spawn(async move {
                let result = fetch_peer(&client, &hostname, timeout).await;
                (idx, hostname, result)
            });
        }

        let mut gathered = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, hostname, Ok(units))) => gathered.push((idx, hostname, units)),
                Ok((_, hostname, Err(e))) => {
                    tracing::warn!("Peer {} contributed no units: {:#}", hostname, e);
                }
                Err(e) => {
                    tracing::warn!("Peer task failed: {}", e);
                }
            }
        }

        // Keep peers in registration order regardless of completion order
        gathered.sort_by_key(|(idx, _, _)| *idx);

        gathered
            .into_iter()
            .flat_map(|(_, hostname, units)| {
                units.into_iter().map(move |mut unit| {
                    unit.origin_host = Some(hostname.clone());
                    unit
                })
            })
            .collect()
    }

    async fn annotate_pins(&self, units: &mut [ServiceUnit]) {
        let scoped = match self.pins.all_scoped().await {
            Ok(scoped) => scoped,
            Err(e) => {
                tracing::warn!("Pin registry unavailable, keeping peer pin flags: {:#}", e);
                return;
            }
        };

        for unit in units.iter_mut() {
            unit.pinned = scoped.contains(&(unit.origin_host.clone(), unit.name.clone()));
        }
    }
}

/// One peer's listing. Non-200 answers, malformed bodies and timeouts are errors.
async fn fetch_peer(client: &reqwest::Client, hostname: &str, timeout: Duration) -> Result<Vec<ServiceUnit>> {
    let url = format!("http://{}{}?limit=0", hostname, SERVICES_PATH);

    let request = async {
        let response = client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        if response.status() != StatusCode::OK {
            bail!("{} answered {}", url, response.status());
        }

        let body: PeerResponse = response
            .json()
            .await
            .with_context(|| format!("Malformed response from {}", url))?;

        Ok(body.into_units())
    };

    tokio::time::timeout(timeout, request)
        .await
        .map_err(|_| anyhow!("{} timed out after {:?}", url, timeout))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn peer(body: serde_json::Value) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(SERVICES_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;
        server
    }

    async fn aggregator(hosts: &[String]) -> (PeerAggregator, PinRegistry) {
        let store = StoreHandle::in_memory();
        for hostname in hosts {
            store
                .insert_record(MONITORED_DEVICES, &PeerHost { hostname: hostname.clone() })
                .await
                .unwrap();
        }
        let pins = PinRegistry::new(store.clone());
        let aggregator = PeerAggregator::new(
            store,
            pins.clone(),
            reqwest::Client::new(),
            Duration::from_millis(300),
            Duration::from_secs(3600),
        );
        (aggregator, pins)
    }

    #[tokio::test]
    async fn test_slow_peer_is_isolated() {
        let a = peer(json!([{"name": "x"}])).await;
        let b = peer(json!([{"name": "x"}])).await;

        let slow = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{"name": "x"}]))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&slow)
            .await;

        let hosts = vec![
            a.address().to_string(),
            slow.address().to_string(),
            b.address().to_string(),
        ];
        let (aggregator, _) = aggregator(&hosts).await;

        let units = aggregator.aggregate_all(false).await;
        assert_eq!(units.len(), 2);
        assert!(units.iter().all(|u| u.name == "x"));

        let mut origins: Vec<_> = units.iter().filter_map(|u| u.origin_host.clone()).collect();
        origins.sort();
        let mut expected = vec![hosts[0].clone(), hosts[2].clone()];
        expected.sort();
        assert_eq!(origins, expected);
    }

    #[tokio::test]
    async fn test_bad_peers_contribute_nothing() {
        let good = peer(json!({"units": [{"name": "nginx.service", "state": "active"}], "total": 1, "page": 1, "pages": 1})).await;
        let malformed = peer(json!({"error": "nope"})).await;

        let failing = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&failing)
            .await;

        let hosts = vec![
            good.address().to_string(),
            malformed.address().to_string(),
            failing.address().to_string(),
            // Nothing listens here
            "127.0.0.1:9".to_string(),
        ];
        let (aggregator, _) = aggregator(&hosts).await;

        let units = aggregator.aggregate_all(false).await;
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].name, "nginx.service");
        assert_eq!(units[0].origin_host.as_deref(), Some(hosts[0].as_str()));
    }

    #[tokio::test]
    async fn test_no_peers_is_empty() {
        let (aggregator, _) = aggregator(&[]).await;
        assert!(aggregator.aggregate_all(true).await.is_empty());
    }

    #[tokio::test]
    async fn test_cached_within_window_unless_bust() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(SERVICES_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"name": "x"}])))
            .expect(2)
            .mount(&server)
            .await;

        let (aggregator, _) = aggregator(&[server.address().to_string()]).await;
        let aggregator = aggregator.with_clock(std::sync::Arc::new(|| 1_000u64));

        assert_eq!(aggregator.aggregate_all(false).await.len(), 1);
        assert_eq!(aggregator.aggregate_all(false).await.len(), 1);
        // Forced refresh goes back to the peer
        assert_eq!(aggregator.aggregate_all(true).await.len(), 1);
    }

    #[tokio::test]
    async fn test_pins_apply_per_origin_host() {
        let a = peer(json!([{"name": "x", "state": "active"}, {"name": "y", "state": "active"}])).await;
        let b = peer(json!([{"name": "x", "state": "active"}])).await;
        let hosts = vec![a.address().to_string(), b.address().to_string()];
        let (aggregator, pins) = aggregator(&hosts).await;

        let units = aggregator.aggregate_all(false).await;
        assert!(units.iter().all(|u| !u.pinned));

        // Served from cache, but the new pin is visible right away
        pins.pin("y", Some(&hosts[0])).await.unwrap();
        let units = aggregator.aggregate_all(false).await;
        assert_eq!(units[0].name, "y");
        assert!(units[0].pinned);
        assert_eq!(units.iter().filter(|u| u.pinned).count(), 1);
    }
}
