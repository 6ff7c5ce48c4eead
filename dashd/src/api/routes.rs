use std::sync::Arc;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use shared::protocol::{ALL_SERVICES_PATH, NETWORK_PATH, SERVICES_PATH};
use shared::types::{NetworkInfo, PeerHost, PinRecord, ServicePage, ServiceUnit};
use crate::containers::{self, Container};
use crate::directory::{ServiceDirectory, ServiceQuery};
use crate::documents::{
    self, DeviceInput, Invalid, Link, LinkInput, LinkOrderInput, Todo, TodoInput,
};
use crate::hardware::{self, HardwareInfo};
use crate::network::{self, EgressLookup, NetworkObserver};
use crate::peers::PeerAggregator;
use crate::pins::PinRegistry;
use crate::store::{Record, StoreHandle};
use crate::weather::{CityInput, CityWeather, WeatherService};

#[derive(Clone)]
pub struct AppState {
    pub store: StoreHandle,
    pub pins: PinRegistry,
    pub directory: ServiceDirectory,
    pub peers: Arc<PeerAggregator>,
    pub observer: Arc<NetworkObserver>,
    pub egress: Arc<EgressLookup>,
    pub weather: Arc<WeatherService>,
    /// Container engines to try, in order
    pub engines: Arc<[String]>,
    /// Outbound client for link icon lookups
    pub client: reqwest::Client,
}

pub enum ApiError {
    BadRequest(String),
    NotFound,
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            ApiError::NotFound => StatusCode::NOT_FOUND.into_response(),
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }
}

impl From<Invalid> for ApiError {
    fn from(invalid: Invalid) -> Self {
        ApiError::BadRequest(invalid.0)
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Log a store or upstream failure and map it to a 500
fn internal(what: &'static str) -> impl FnOnce(anyhow::Error) -> ApiError {
    move |e| {
        tracing::error!("{}: {:#}", what, e);
        ApiError::Internal
    }
}

fn found(removed: bool) -> ApiResult<StatusCode> {
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

#[derive(Serialize)]
pub struct Created {
    pub id: i64,
}

fn created(id: i64) -> (StatusCode, Json<Created>) {
    (StatusCode::CREATED, Json(Created { id }))
}

#[derive(Deserialize)]
pub struct AllServicesQuery {
    #[serde(default)]
    pub bust: bool,
}

#[derive(Deserialize)]
pub struct PinQuery {
    #[serde(default)]
    pub host: Option<String>,
}

impl PinQuery {
    fn host(&self) -> Option<&str> {
        self.host.as_deref().filter(|h| !h.is_empty())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(SERVICES_PATH, get(list_services))
        .route(ALL_SERVICES_PATH, get(all_services))
        .route("/api/services/pinned", get(pinned_services))
        .route("/api/services/pin/:name", put(pin_service).delete(unpin_service))
        .route(NETWORK_PATH, get(network_info))
        .route("/api/hardware", get(hardware_info))
        .route("/api/containers", get(list_containers))
        .route("/api/monitored_devices", get(list_devices).put(add_device))
        .route("/api/monitored_devices/:id", delete(remove_device))
        .route("/api/todos", get(list_todos).put(add_todo))
        .route("/api/todos/:id", patch(update_todo).delete(remove_todo))
        .route("/api/link", get(list_links).put(add_link))
        .route("/api/link/order", post(reorder_link))
        .route("/api/link/:id", delete(remove_link))
        .route("/api/weather", get(list_weather).put(add_city))
        .route("/api/weather/:id", delete(remove_city))
        .with_state(state)
}

async fn list_services(
    State(state): State<AppState>,
    Query(query): Query<ServiceQuery>,
) -> Json<ServicePage> {
    Json(state.directory.list_units(&query).await)
}

async fn all_services(
    State(state): State<AppState>,
    Query(query): Query<AllServicesQuery>,
) -> Json<Vec<ServiceUnit>> {
    Json(state.peers.aggregate_all(query.bust).await)
}

async fn pinned_services(State(state): State<AppState>) -> ApiResult<Json<Vec<Record<PinRecord>>>> {
    state
        .pins
        .records()
        .await
        .map(Json)
        .map_err(internal("Failed to list pins"))
}

async fn pin_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<PinQuery>,
) -> ApiResult<StatusCode> {
    state
        .pins
        .pin(&name, query.host())
        .await
        .map_err(internal("Failed to pin service"))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unpin_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<PinQuery>,
) -> ApiResult<StatusCode> {
    state
        .pins
        .unpin(&name, query.host())
        .await
        .map_err(internal("Failed to unpin service"))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn network_info(State(state): State<AppState>) -> Json<NetworkInfo> {
    Json(network::network_info(&state.observer, &state.egress).await)
}

async fn hardware_info() -> Json<HardwareInfo> {
    Json(hardware::hardware_info().await)
}

async fn list_containers(State(state): State<AppState>) -> Json<Vec<Container>> {
    Json(containers::list_containers(&state.engines).await)
}

async fn list_devices(State(state): State<AppState>) -> ApiResult<Json<Vec<Record<PeerHost>>>> {
    documents::list_devices(&state.store)
        .await
        .map(Json)
        .map_err(internal("Failed to list monitored devices"))
}

async fn add_device(
    State(state): State<AppState>,
    Json(input): Json<DeviceInput>,
) -> ApiResult<(StatusCode, Json<Created>)> {
    let device = input.validate()?;
    let id = documents::add_device(&state.store, &device)
        .await
        .map_err(internal("Failed to add monitored device"))?;
    Ok(created(id))
}

async fn remove_device(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    let removed = documents::remove_device(&state.store, id)
        .await
        .map_err(internal("Failed to remove monitored device"))?;
    found(removed)
}

async fn list_todos(State(state): State<AppState>) -> ApiResult<Json<Vec<Record<Todo>>>> {
    documents::list_todos(&state.store)
        .await
        .map(Json)
        .map_err(internal("Failed to list todos"))
}

async fn add_todo(
    State(state): State<AppState>,
    Json(input): Json<TodoInput>,
) -> ApiResult<(StatusCode, Json<Created>)> {
    let content = input.validate()?;
    let id = documents::add_todo(&state.store, content)
        .await
        .map_err(internal("Failed to add todo"))?;
    Ok(created(id))
}

async fn update_todo(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(input): Json<TodoInput>,
) -> ApiResult<StatusCode> {
    let content = input.validate()?;
    let updated = documents::update_todo(&state.store, id, content)
        .await
        .map_err(internal("Failed to update todo"))?;
    found(updated)
}

async fn remove_todo(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    let removed = documents::remove_todo(&state.store, id)
        .await
        .map_err(internal("Failed to remove todo"))?;
    found(removed)
}

async fn list_links(State(state): State<AppState>) -> ApiResult<Json<Vec<Record<Link>>>> {
    documents::list_links(&state.store)
        .await
        .map(Json)
        .map_err(internal("Failed to list links"))
}

async fn add_link(
    State(state): State<AppState>,
    Json(input): Json<LinkInput>,
) -> ApiResult<(StatusCode, Json<Created>)> {
    let link = input.validate()?;
    let id = documents::add_link(&state.store, &state.client, link)
        .await
        .map_err(internal("Failed to add link"))?;
    Ok(created(id))
}

async fn remove_link(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    let removed = documents::remove_link(&state.store, id)
        .await
        .map_err(internal("Failed to remove link"))?;
    found(removed)
}

async fn reorder_link(
    State(state): State<AppState>,
    Json(input): Json<LinkOrderInput>,
) -> ApiResult<StatusCode> {
    if input.index < 0 {
        return Err(ApiError::BadRequest("index must not be negative".to_string()));
    }
    let moved = documents::reorder_link(&state.store, input.id, input.index)
        .await
        .map_err(internal("Failed to reorder links"))?;
    found(moved)
}

async fn list_weather(State(state): State<AppState>) -> ApiResult<Json<Vec<CityWeather>>> {
    state
        .weather
        .list()
        .await
        .map(Json)
        .map_err(internal("Failed to list weather"))
}

async fn add_city(
    State(state): State<AppState>,
    Json(input): Json<CityInput>,
) -> ApiResult<(StatusCode, Json<Created>)> {
    if !state.weather.enabled() {
        return Err(ApiError::NotFound);
    }
    let name = input.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }

    let id = state
        .weather
        .add_city(name)
        .await
        .map_err(internal("Failed to add weather city"))?
        .ok_or(ApiError::NotFound)?;
    Ok(created(id))
}

async fn remove_city(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    if !state.weather.enabled() {
        return Err(ApiError::NotFound);
    }
    let removed = state
        .weather
        .remove_city(id)
        .await
        .map_err(internal("Failed to remove weather city"))?;
    found(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use crate::bus::testing::{manager, unit, FakeBus, FakeConnector};
    use crate::config::WeatherConfig;

    fn app_with(connector: FakeConnector) -> Router {
        let store = StoreHandle::in_memory();
        let pins = PinRegistry::new(store.clone());
        let bus = Arc::new(manager(connector));
        let client = reqwest::Client::new();

        let state = AppState {
            directory: ServiceDirectory::new(bus, pins.clone()),
            peers: Arc::new(PeerAggregator::new(
                store.clone(),
                pins.clone(),
                client.clone(),
                Duration::from_millis(200),
                Duration::from_secs(60),
            )),
            observer: Arc::new(NetworkObserver::new(Vec::new())),
            egress: Arc::new(EgressLookup::new(
                client.clone(),
                "http://127.0.0.1:9".to_string(),
                Duration::from_millis(200),
                Duration::from_secs(60),
            )),
            weather: Arc::new(WeatherService::new(store.clone(), client.clone(), &WeatherConfig::default())),
            engines: Arc::from(Vec::<String>::new()),
            client,
            store,
            pins,
        };
        router(state)
    }

    fn app() -> Router {
        app_with(FakeConnector::new(FakeBus {
            units: vec![
                unit("cups.service", "failed"),
                unit("nginx.service", "active"),
                unit("sshd.service", "inactive"),
                unit("tmp.mount", "active"),
            ],
            ..Default::default()
        }))
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    fn names(units: &Value) -> Vec<&str> {
        units
            .as_array()
            .unwrap()
            .iter()
            .map(|u| u["name"].as_str().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_services_listing_and_pins() {
        let app = app();

        let (status, page) = send(&app, Method::GET, "/api/services", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(names(&page["units"]), vec!["nginx.service", "cups.service", "sshd.service"]);
        assert_eq!(page["pages"], 1);

        let (status, _) = send(&app, Method::PUT, "/api/services/pin/sshd.service", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, Method::PUT, "/api/services/pin/sshd.service", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, page) = send(&app, Method::GET, "/api/services?state=inactive", None).await;
        assert_eq!(names(&page["units"]), vec!["sshd.service"]);
        assert_eq!(page["units"][0]["pinned"], true);

        let (_, pinned) = send(&app, Method::GET, "/api/services/pinned", None).await;
        assert_eq!(pinned.as_array().unwrap().len(), 1);
        assert_eq!(pinned[0]["name"], "sshd.service");

        let (status, _) = send(&app, Method::DELETE, "/api/services/pin/sshd.service", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, pinned) = send(&app, Method::GET, "/api/services/pinned", None).await;
        assert!(pinned.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_services_pagination_query() {
        let app = app();

        let (_, page) = send(&app, Method::GET, "/api/services?page=2&limit=2", None).await;
        assert_eq!(names(&page["units"]), vec!["sshd.service"]);
        assert_eq!((page["total"].as_u64(), page["pages"].as_u64()), (Some(3), Some(2)));

        let (status, _) = send(&app, Method::GET, "/api/services?page=abc", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Blank values fall back to the defaults instead of being rejected
        let (status, page) = send(&app, Method::GET, "/api/services?page=&limit=&state=", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["units"].as_array().unwrap().len(), 3);
        assert_eq!((page["page"].as_u64(), page["pages"].as_u64()), (Some(1), Some(1)));

        let (_, page) = send(&app, Method::GET, "/api/services?page=-3&limit=2", None).await;
        assert_eq!(names(&page["units"]), vec!["nginx.service", "cups.service"]);
        assert_eq!(page["page"], 1);
    }

    #[tokio::test]
    async fn test_services_without_bus() {
        let connector = FakeConnector::new(FakeBus::default());
        connector.available.store(false, Ordering::SeqCst);
        let app = app_with(connector);

        let (status, page) = send(&app, Method::GET, "/api/services", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page, json!({"units": [], "total": 0, "page": 1, "pages": 0}));
    }

    #[tokio::test]
    async fn test_all_services_without_peers() {
        let (status, units) = send(&app(), Method::GET, "/api/services/all?bust=true", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(units, json!([]));
    }

    #[tokio::test]
    async fn test_todo_lifecycle() {
        let app = app();

        let (status, created) = send(&app, Method::PUT, "/api/todos", Some(json!({"content": "water plants"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["id"].as_i64().unwrap();

        let (status, _) = send(&app, Method::PATCH, &format!("/api/todos/{}", id), Some(json!({"content": "water cactus"}))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, todos) = send(&app, Method::GET, "/api/todos", None).await;
        assert_eq!(todos[0]["id"], id);
        assert_eq!(todos[0]["content"], "water cactus");
        assert!(todos[0]["createdAt"].is_string());

        let (status, _) = send(&app, Method::PATCH, "/api/todos/999", Some(json!({"content": "x"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, Method::PUT, "/api/todos", Some(json!({"content": ""}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, Method::DELETE, &format!("/api/todos/{}", id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, Method::DELETE, &format!("/api/todos/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_monitored_devices() {
        let app = app();

        let (status, _) = send(&app, Method::PUT, "/api/monitored_devices", Some(json!({"hostname": "pi"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, created) = send(&app, Method::PUT, "/api/monitored_devices", Some(json!({"hostname": "pi.lan:18745"}))).await;
        assert_eq!(status, StatusCode::CREATED);

        let (_, devices) = send(&app, Method::GET, "/api/monitored_devices", None).await;
        assert_eq!(devices, json!([{"id": created["id"], "hostname": "pi.lan:18745"}]));
    }

    #[tokio::test]
    async fn test_link_reorder() {
        let app = app();
        let mut ids = Vec::new();
        for name in ["mail", "wiki", "grafana"] {
            let body = json!({"url": format!("https://{}.lan", name), "name": name, "icon": "/favicon.ico"});
            let (status, created) = send(&app, Method::PUT, "/api/link", Some(body)).await;
            assert_eq!(status, StatusCode::CREATED);
            ids.push(created["id"].as_i64().unwrap());
        }

        let (status, _) = send(&app, Method::POST, "/api/link/order", Some(json!({"id": ids[2], "index": 0}))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, links) = send(&app, Method::GET, "/api/link", None).await;
        assert_eq!(names(&links), vec!["grafana", "mail", "wiki"]);

        let (status, _) = send(&app, Method::PUT, "/api/link", Some(json!({"url": "javascript:alert(1)", "name": "x"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_weather_disabled_without_key() {
        let app = app();

        let (status, cities) = send(&app, Method::GET, "/api/weather", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cities, json!([]));

        let (status, _) = send(&app, Method::PUT, "/api/weather", Some(json!({"name": "Oslo"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, Method::DELETE, "/api/weather/1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_network_info_degrades() {
        let (status, info) = send(&app(), Method::GET, "/api/network", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(info["externalIp"], "?");
        assert_eq!(info["localIp"], json!([]));
        assert!(info["hostname"].is_string());
    }

    #[tokio::test]
    async fn test_containers_without_engines() {
        let (status, containers) = send(&app(), Method::GET, "/api/containers", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(containers, json!([]));
    }
}
