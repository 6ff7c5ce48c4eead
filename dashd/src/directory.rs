use std::collections::HashSet;
use std::sync::Arc;
use serde::{de, Deserialize, Deserializer};
use shared::protocol::{SERVICE_SUFFIX, STATE_ACTIVE, STATE_ALL, STATE_FAILED};
use shared::types::{ServicePage, ServiceUnit};
use crate::bus::{ConnectionManager, RawUnit};
use crate::pins::PinRegistry;

/// Directory query, as taken from the query string.
/// `page` below 1 is treated as 1; `limit` of 0 or less disables pagination.
/// Empty `page=` or `limit=` values count as absent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceQuery {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub page: Option<i64>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub limit: Option<i64>,
}

fn blank_as_none<'de, D: Deserializer<'de>>(de: D) -> Result<Option<i64>, D::Error> {
    let raw = Option::<String>::deserialize(de)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value.parse().map(Some).map_err(de::Error::custom),
    }
}

impl ServiceQuery {
    pub fn page(&self) -> usize {
        self.page.unwrap_or(1).max(1) as usize
    }

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(0)
    }
}

/// Lists this host's service units through the bus
#[derive(Clone)]
pub struct ServiceDirectory {
    bus: Arc<ConnectionManager>,
    pins: PinRegistry,
}

impl ServiceDirectory {
    pub fn new(bus: Arc<ConnectionManager>, pins: PinRegistry) -> Self {
        Self { bus, pins }
    }

    /// Filter, sort and paginate the unit listing. A missing or failing bus
    /// yields an empty page with `pages = 0`, never an error.
    pub async fn list_units(&self, query: &ServiceQuery) -> ServicePage {
        let page = query.page();

        let raw = self
            .bus
            .call("ListUnits", |handle| async move { handle.bus().list_units().await })
            .await;
        let Some(raw) = raw else {
            return ServicePage::unavailable(page);
        };

        let pinned = self.pins.all_pinned(None).await.unwrap_or_else(|e| {
            tracing::warn!("Pin registry unavailable, listing without pins: {:#}", e);
            HashSet::new()
        });

        let mut units = select_units(raw, query, &pinned);
        sort_units(&mut units);
        paginate(units, page, query.limit())
    }
}

pub fn is_service(name: &str) -> bool {
    name.ends_with(SERVICE_SUFFIX)
}

/// Keep long-running services matching the state and search filters,
/// annotated with their pin flag
pub fn select_units(raw: Vec<RawUnit>, query: &ServiceQuery, pinned: &HashSet<String>) -> Vec<ServiceUnit> {
    let state = query
        .state
        .as_deref()
        .filter(|s| !s.is_empty() && *s != STATE_ALL);
    let search = query
        .search
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase);

    raw.into_iter()
        .filter(|unit| is_service(&unit.name))
        .filter(|unit| state.map_or(true, |s| unit.active_state == s))
        .filter(|unit| {
            search
                .as_deref()
                .map_or(true, |needle| unit.name.to_lowercase().contains(needle))
        })
        .map(|unit| ServiceUnit {
            pinned: pinned.contains(&unit.name),
            name: unit.name,
            state: unit.active_state,
            sub_state: unit.sub_state,
            description: unit.description,
            origin_host: None,
        })
        .collect()
}

/// Pinned first, then active, then failed, then everything else; name and
/// origin host break ties
pub fn sort_units(units: &mut [ServiceUnit]) {
    units.sort_by(|a, b| {
        sort_key(a)
            .cmp(&sort_key(b))
            .then_with(|| a.origin_host.cmp(&b.origin_host))
    });
}

fn sort_key(unit: &ServiceUnit) -> (bool, bool, bool, &str) {
    (
        !unit.pinned,
        unit.state != STATE_ACTIVE,
        unit.state != STATE_FAILED,
        unit.name.as_str(),
    )
}

/// Slice one page out of the sorted units.
/// With `limit <= 0` everything is on page 1 and `pages` is 1.
pub fn paginate(units: Vec<ServiceUnit>, page: usize, limit: i64) -> ServicePage {
    let page = page.max(1);
    let total = units.len();

    if limit <= 0 {
        let units = if page == 1 { units } else { Vec::new() };
        return ServicePage { units, total, page, pages: 1 };
    }

    let limit = limit as usize;
    let pages = total.div_ceil(limit);
    let start = (page - 1).saturating_mul(limit);
    let units = units.into_iter().skip(start).take(limit).collect();

    ServicePage { units, total, page, pages }
}
