pub mod db;
pub mod handle;

use serde::{Deserialize, Serialize};

pub use db::{DocumentDb, Predicate};
pub use handle::StoreHandle;

/// Collection names
pub const PINNED_SERVICES: &str = "pinned_services";
pub const MONITORED_DEVICES: &str = "monitored_devices";
pub const TODOS: &str = "todos";
pub const LINKS: &str = "links";
pub const WEATHER_CITIES: &str = "weather_cities";

/// A typed document together with its identifier, serialized flat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<T> {
    pub id: i64,
    #[serde(flatten)]
    pub data: T,
}
