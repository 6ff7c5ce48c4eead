use std::sync::LazyLock;
use std::time::Duration;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use shared::types::PeerHost;
use crate::store::{Record, StoreHandle, LINKS, MONITORED_DEVICES, TODOS};

const ICON_TIMEOUT: Duration = Duration::from_secs(3);

static LINK_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<link\b[^>]*>").unwrap());
static TAG_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)([a-z][a-z0-9_:-]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#).unwrap()
});

/// Rejected caller input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalid(pub String);

#[derive(Debug, Deserialize)]
pub struct DeviceInput {
    pub hostname: String,
}

impl DeviceInput {
    pub fn validate(self) -> Result<PeerHost, Invalid> {
        let hostname = self.hostname.trim().to_string();
        if hostname.len() < 3 {
            return Err(Invalid("hostname must be at least 3 characters".to_string()));
        }
        Ok(PeerHost { hostname })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Todo {
    pub content: String,
    #[serde(alias = "created_at")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct TodoInput {
    pub content: String,
}

impl TodoInput {
    pub fn validate(self) -> Result<String, Invalid> {
        if self.content.trim().is_empty() {
            return Err(Invalid("content must not be empty".to_string()));
        }
        Ok(self.content)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub order: i64,
}

#[derive(Debug, Deserialize)]
pub struct LinkInput {
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
}

impl LinkInput {
    pub fn validate(self) -> Result<LinkInput, Invalid> {
        let url = reqwest::Url::parse(&self.url)
            .map_err(|e| Invalid(format!("invalid url: {}", e)))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(Invalid("url must be an http(s) address".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(Invalid("name must not be empty".to_string()));
        }
        Ok(self)
    }
}

#[derive(Debug, Deserialize)]
pub struct LinkOrderInput {
    pub id: i64,
    pub index: i64,
}

/// Monitored peer hosts
pub async fn list_devices(store: &StoreHandle) -> Result<Vec<Record<PeerHost>>> {
    store.records(MONITORED_DEVICES).await
}

pub async fn add_device(store: &StoreHandle, device: &PeerHost) -> Result<i64> {
    let id = store.insert_record(MONITORED_DEVICES, device).await?;
    tracing::info!("Monitoring {}", device.hostname);
    Ok(id)
}

pub async fn remove_device(store: &StoreHandle, id: i64) -> Result<bool> {
    store.remove(MONITORED_DEVICES, id).await
}

pub async fn list_todos(store: &StoreHandle) -> Result<Vec<Record<Todo>>> {
    store.records(TODOS).await
}

pub async fn add_todo(store: &StoreHandle, content: String) -> Result<i64> {
    let todo = Todo {
        content,
        created_at: Utc::now(),
    };
    store.insert_record(TODOS, &todo).await
}

/// Replace a todo's content, keeping its creation time.
/// Returns false when the todo does not exist.
pub async fn update_todo(store: &StoreHandle, id: i64, content: String) -> Result<bool> {
    let Some(existing) = store.record::<Todo>(TODOS, id).await? else {
        return Ok(false);
    };

    let todo = Todo {
        content,
        created_at: existing.data.created_at,
    };
    store.update_record(TODOS, id, &todo).await
}

pub async fn remove_todo(store: &StoreHandle, id: i64) -> Result<bool> {
    store.remove(TODOS, id).await
}

/// Links in display order
pub async fn list_links(store: &StoreHandle) -> Result<Vec<Record<Link>>> {
    let mut links: Vec<Record<Link>> = store.records(LINKS).await?;
    links.sort_by_key(|link| (link.data.order, link.id));
    Ok(links)
}

/// Append a link after the existing ones. Without an explicit icon the
/// target page is fetched and its `<link rel="icon">` is used, if any.
pub async fn add_link(store: &StoreHandle, client: &reqwest::Client, input: LinkInput) -> Result<i64> {
    let icon = match input.icon.filter(|icon| !icon.trim().is_empty()) {
        Some(icon) => Some(icon),
        None => discover_icon(client, &input.url, ICON_TIMEOUT).await,
    };

    let order = store.count(LINKS).await? as i64;
    let link = Link {
        url: input.url,
        name: input.name,
        icon,
        order,
    };
    store.insert_record(LINKS, &link).await
}

/// Icon advertised by the page at `page`, resolved against the page's final
/// address. Any fetch or parse failure yields None.
pub async fn discover_icon(client: &reqwest::Client, page: &str, limit: Duration) -> Option<String> {
    let response = match client.get(page).timeout(limit).send().await {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            tracing::debug!("No icon for {}: status {}", page, response.status());
            return None;
        }
        Err(e) => {
            tracing::debug!("No icon for {}: {}", page, e);
            return None;
        }
    };

    let base = response.url().clone();
    let html = response.text().await.ok()?;
    let href = find_icon_href(&html)?;
    resolve_icon(&base, &href)
}

/// `href` of the first `<link>` whose `rel` mentions "icon"
pub fn find_icon_href(html: &str) -> Option<String> {
    LINK_TAG.find_iter(html).find_map(|tag| {
        let mut rel = None;
        let mut href = None;
        for attr in TAG_ATTR.captures_iter(tag.as_str()) {
            let value = attr.get(2).or(attr.get(3)).or(attr.get(4)).map(|v| v.as_str().trim());
            match attr[1].to_ascii_lowercase().as_str() {
                "rel" => rel = value,
                "href" => href = value,
                _ => {}
            }
        }

        let is_icon = rel.is_some_and(|rel| rel.to_ascii_lowercase().contains("icon"));
        href.filter(|href| is_icon && !href.is_empty()).map(str::to_string)
    })
}

fn resolve_icon(base: &Url, href: &str) -> Option<String> {
    if href.starts_with("data:") {
        return Some(href.to_string());
    }
    base.join(href).ok().map(String::from)
}

pub async fn remove_link(store: &StoreHandle, id: i64) -> Result<bool> {
    store.remove(LINKS, id).await
}

/// Move a link to `index`: every link at or after `index` shifts down by one
/// and the moved link takes the freed slot. Returns false for an unknown id.
pub async fn reorder_link(store: &StoreHandle, id: i64, index: i64) -> Result<bool> {
    let links: Vec<Record<Link>> = store.records(LINKS).await?;
    let Some(moved) = links.iter().find(|link| link.id == id).cloned() else {
        return Ok(false);
    };

    for link in links.into_iter().filter(|l| l.id != id && l.data.order >= index) {
        let shifted = Link {
            order: link.data.order + 1,
            ..link.data
        };
        store
            .update_record(LINKS, link.id, &shifted)
            .await
            .with_context(|| format!("Failed to shift link {}", link.id))?;
    }

    let placed = Link {
        order: index,
        ..moved.data
    };
    store.update_record(LINKS, id, &placed).await
}
