use std::io::ErrorKind;
use std::time::Duration;
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use crate::process::output_within;

const ENGINE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Container {
    pub running: bool,
    pub image: String,
    pub id: String,
    pub name: String,
}

/// One line of `ps --format json` as printed by docker and nerdctl
#[derive(Debug, Deserialize)]
struct EngineRow {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Names", default)]
    names: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Status", default)]
    status: String,
}

impl From<EngineRow> for Container {
    fn from(row: EngineRow) -> Self {
        Self {
            running: row.state == "running" || row.status == "Up" || row.status.starts_with("Up "),
            image: row.image,
            id: row.id,
            name: row.names,
        }
    }
}

/// Containers from the first engine on the list that can be spawned.
/// Any failure yields an empty list.
pub async fn list_containers(engines: &[String]) -> Vec<Container> {
    list_containers_within(engines, ENGINE_TIMEOUT).await
}

async fn list_containers_within(engines: &[String], limit: Duration) -> Vec<Container> {
    match query_engines(engines, limit).await {
        Ok(containers) => containers,
        Err(e) => {
            tracing::debug!("No container listing: {:#}", e);
            Vec::new()
        }
    }
}

async fn query_engines(engines: &[String], limit: Duration) -> Result<Vec<Container>> {
    for engine in engines {
        let output = match output_within(engine, &["ps", "-a", "--format", "json"], limit).await {
            Ok(output) => output,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("Failed to run {}", engine)),
        };

        if !output.status.success() {
            bail!("{} ps exited with {}", engine, output.status);
        }
        return parse_ps(&String::from_utf8_lossy(&output.stdout))
            .with_context(|| format!("Malformed {} ps output", engine));
    }

    Err(anyhow!("no container engine installed"))
}

/// Parse line-delimited JSON rows. A single JSON array is accepted too.
pub fn parse_ps(raw: &str) -> Result<Vec<Container>> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        let rows: Vec<EngineRow> = serde_json::from_str(trimmed)?;
        return Ok(rows.into_iter().map(Container::from).collect());
    }

    trimmed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| -> Result<Container> { Ok(serde_json::from_str::<EngineRow>(line)?.into()) })
        .collect()
}
