use std::collections::HashSet;
use anyhow::{Context, Result};
use serde_json::Value;
use shared::types::PinRecord;
use crate::store::{Predicate, Record, StoreHandle, PINNED_SERVICES};

/// Persisted set of pinned units, each scoped to a host (None = this host)
#[derive(Clone)]
pub struct PinRegistry {
    store: StoreHandle,
}

fn matches(name: &str, host: Option<&str>) -> Predicate {
    let name = name.to_string();
    let host = host.map(str::to_string);
    Box::new(move |doc: &Value| {
        doc.get("name").and_then(Value::as_str) == Some(name.as_str())
            && doc.get("host").and_then(Value::as_str) == host.as_deref()
    })
}

fn in_scope(host: Option<&str>) -> Predicate {
    let host = host.map(str::to_string);
    Box::new(move |doc: &Value| doc.get("host").and_then(Value::as_str) == host.as_deref())
}

impl PinRegistry {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    /// Pin a unit. Pinning an already pinned unit is a no-op.
    pub async fn pin(&self, name: &str, host: Option<&str>) -> Result<()> {
        let record = PinRecord {
            name: name.to_string(),
            host: host.map(str::to_string),
        };
        let body = serde_json::to_value(&record).context("Failed to serialize pin")?;

        let inserted = self
            .store
            .insert_unless(PINNED_SERVICES, body, matches(name, host))
            .await
            .context("Failed to pin service")?;

        if inserted.is_some() {
            tracing::info!("Pinned {} on {}", name, host.unwrap_or("local host"));
        }
        Ok(())
    }

    /// Remove every pin for `(name, host)`. Unpinning an unknown unit is a no-op.
    pub async fn unpin(&self, name: &str, host: Option<&str>) -> Result<()> {
        let removed = self
            .store
            .remove_where(PINNED_SERVICES, matches(name, host))
            .await
            .context("Failed to unpin service")?;

        if removed > 0 {
            tracing::info!("Unpinned {} on {}", name, host.unwrap_or("local host"));
        }
        Ok(())
    }

    pub async fn is_pinned(&self, name: &str, host: Option<&str>) -> Result<bool> {
        let found = self
            .store
            .search(PINNED_SERVICES, matches(name, host))
            .await
            .context("Failed to look up pin")?;
        Ok(!found.is_empty())
    }

    /// Names pinned for one host scope
    pub async fn all_pinned(&self, host: Option<&str>) -> Result<HashSet<String>> {
        let docs = self
            .store
            .search(PINNED_SERVICES, in_scope(host))
            .await
            .context("Failed to list pins")?;

        Ok(docs
            .into_iter()
            .filter_map(|doc| doc.body.get("name").and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    /// Every pin record across all host scopes
    pub async fn records(&self) -> Result<Vec<Record<PinRecord>>> {
        self.store.records(PINNED_SERVICES).await
    }

    /// Every pin as `(host, name)`, for annotating merged peer results
    pub async fn all_scoped(&self) -> Result<HashSet<(Option<String>, String)>> {
        Ok(self
            .records()
            .await?
            .into_iter()
            .map(|record| (record.data.host, record.data.name))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PinRegistry {
        PinRegistry::new(StoreHandle::in_memory())
    }

    #[tokio::test]
    async fn test_pin_is_idempotent() {
        let pins = registry();

        pins.pin("nginx.service", None).await.unwrap();
        let before = pins.all_pinned(None).await.unwrap();
        pins.pin("nginx.service", None).await.unwrap();
        let after = pins.all_pinned(None).await.unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(before, after);
        assert_eq!(pins.records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_host_scoping() {
        let pins = registry();

        pins.pin("nginx.service", None).await.unwrap();
        pins.pin("nginx.service", Some("pi.lan")).await.unwrap();
        pins.pin("sshd.service", Some("pi.lan")).await.unwrap();

        assert!(pins.is_pinned("nginx.service", None).await.unwrap());
        assert!(!pins.is_pinned("sshd.service", None).await.unwrap());
        assert!(pins.is_pinned("sshd.service", Some("pi.lan")).await.unwrap());

        let local = pins.all_pinned(None).await.unwrap();
        assert_eq!(local, HashSet::from(["nginx.service".to_string()]));

        let remote = pins.all_pinned(Some("pi.lan")).await.unwrap();
        assert_eq!(remote.len(), 2);

        let scoped = pins.all_scoped().await.unwrap();
        assert!(scoped.contains(&(Some("pi.lan".to_string()), "sshd.service".to_string())));
        assert!(scoped.contains(&(None, "nginx.service".to_string())));
    }

    #[tokio::test]
    async fn test_unpin() {
        let pins = registry();

        // Unknown unit is a no-op
        pins.unpin("ghost.service", None).await.unwrap();

        pins.pin("nginx.service", None).await.unwrap();
        pins.pin("nginx.service", Some("pi.lan")).await.unwrap();
        pins.unpin("nginx.service", None).await.unwrap();

        assert!(!pins.is_pinned("nginx.service", None).await.unwrap());
        assert!(pins.is_pinned("nginx.service", Some("pi.lan")).await.unwrap());
    }
}
