use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use anyhow::{bail, Context, Result};
use serde::Serialize;
use crate::process::output_within;

const THERMAL_ROOT: &str = "/sys/class/thermal";
const CPU_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
const UNKNOWN: &str = "N/A";
/// `df` blocks on unresponsive network mounts
const DF_TIMEOUT: Duration = Duration::from_secs(5);

/// Mount sources that are never real disks
const PSEUDO_FILESYSTEMS: &[&str] = &["tmpfs", "devtmpfs", "udev", "overlay", "shm", "cgroup", "none"];

#[derive(Debug, Serialize)]
pub struct HardwareInfo {
    pub uptime: String,
    pub temperature: String,
    /// Busy percentage keyed by `all`, `core0`, `core1`...
    pub cpu: BTreeMap<String, f64>,
    pub ram: Option<Memory>,
    pub disk: BTreeMap<String, Disk>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Memory {
    pub total: u64,
    pub used: u64,
    pub available: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Disk {
    pub size: u64,
    pub used: u64,
    pub available: u64,
    pub percent: String,
    pub mount: String,
}

/// Sample the host. Each reading degrades on its own.
pub async fn hardware_info() -> HardwareInfo {
    let (uptime, temperature, cpu, ram, disk) = tokio::join!(
        uptime(),
        temperature(Path::new(THERMAL_ROOT)),
        cpu_busy(),
        memory(),
        disks(),
    );

    HardwareInfo {
        uptime: uptime.unwrap_or_else(|e| {
            tracing::debug!("Uptime unavailable: {:#}", e);
            UNKNOWN.to_string()
        }),
        temperature: temperature.unwrap_or_else(|| UNKNOWN.to_string()),
        cpu: cpu.unwrap_or_else(|e| {
            tracing::debug!("CPU stats unavailable: {:#}", e);
            BTreeMap::new()
        }),
        ram: memory_or_none(ram),
        disk: disk.unwrap_or_else(|e| {
            tracing::debug!("Disk usage unavailable: {:#}", e);
            BTreeMap::new()
        }),
    }
}

fn memory_or_none(ram: Result<Memory>) -> Option<Memory> {
    ram.map_err(|e| tracing::debug!("Memory stats unavailable: {:#}", e))
        .ok()
}

async fn uptime() -> Result<String> {
    let raw = tokio::fs::read_to_string("/proc/uptime")
        .await
        .context("Failed to read /proc/uptime")?;
    let secs = parse_uptime(&raw).context("Malformed /proc/uptime")?;
    Ok(format_uptime(secs))
}

/// First CPU or SoC thermal zone, in degrees Celsius
async fn temperature(root: &Path) -> Option<String> {
    let mut zones = tokio::fs::read_dir(root).await.ok()?;
    let mut paths = Vec::new();
    while let Ok(Some(entry)) = zones.next_entry().await {
        if entry.file_name().to_string_lossy().starts_with("thermal_zone") {
            paths.push(entry.path());
        }
    }
    paths.sort();

    for zone in paths {
        let Ok(kind) = tokio::fs::read_to_string(zone.join("type")).await else {
            continue;
        };
        if !is_cpu_zone(&kind) {
            continue;
        }
        if let Ok(raw) = tokio::fs::read_to_string(zone.join("temp")).await {
            if let Some(celsius) = parse_millidegrees(&raw) {
                return Some(format!("{:.1}", celsius));
            }
        }
    }
    None
}

async fn cpu_busy() -> Result<BTreeMap<String, f64>> {
    let before = tokio::fs::read_to_string("/proc/stat")
        .await
        .context("Failed to read /proc/stat")?;
    tokio::time::sleep(CPU_SAMPLE_INTERVAL).await;
    let after = tokio::fs::read_to_string("/proc/stat")
        .await
        .context("Failed to read /proc/stat")?;

    Ok(busy_percentages(&parse_cpu_stats(&before), &parse_cpu_stats(&after)))
}

async fn memory() -> Result<Memory> {
    let raw = tokio::fs::read_to_string("/proc/meminfo")
        .await
        .context("Failed to read /proc/meminfo")?;
    parse_meminfo(&raw).context("Malformed /proc/meminfo")
}

async fn disks() -> Result<BTreeMap<String, Disk>> {
    let output = output_within("df", &["-kP"], DF_TIMEOUT)
        .await
        .context("Failed to run df")?;
    if !output.status.success() {
        bail!("df exited with {}", output.status);
    }
    Ok(parse_df(&String::from_utf8_lossy(&output.stdout)))
}

pub fn parse_uptime(raw: &str) -> Option<f64> {
    raw.split_whitespace().next()?.parse().ok()
}

/// Human readable uptime in the style of `uptime -p`
pub fn format_uptime(secs: f64) -> String {
    let total_minutes = (secs.max(0.0) / 60.0) as u64;
    let days = total_minutes / (24 * 60);
    let hours = (total_minutes / 60) % 24;
    let minutes = total_minutes % 60;

    let parts: Vec<String> = [(days, "day"), (hours, "hour"), (minutes, "minute")]
        .into_iter()
        .filter(|(n, _)| *n > 0)
        .map(|(n, unit)| format!("{} {}{}", n, unit, if n == 1 { "" } else { "s" }))
        .collect();

    if parts.is_empty() {
        "up 0 minutes".to_string()
    } else {
        format!("up {}", parts.join(", "))
    }
}

fn is_cpu_zone(kind: &str) -> bool {
    let kind = kind.trim().to_lowercase();
    kind.contains("cpu") || kind.contains("soc") || kind.contains("pkg_temp")
}

fn parse_millidegrees(raw: &str) -> Option<f64> {
    raw.trim().parse::<i64>().ok().map(|milli| milli as f64 / 1000.0)
}

/// Jiffy counters per CPU line, keyed `all` for the aggregate and `coreN` per core
pub fn parse_cpu_stats(raw: &str) -> BTreeMap<String, Vec<u64>> {
    raw.lines()
        .take_while(|line| line.starts_with("cpu"))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let label = fields.next()?;
            let label = match label.strip_prefix("cpu") {
                Some("") => "all".to_string(),
                Some(core) => format!("core{}", core),
                None => return None,
            };
            let values: Vec<u64> = fields.filter_map(|v| v.parse().ok()).collect();
            (values.len() > 3).then_some((label, values))
        })
        .collect()
}

/// Share of non-idle time between two samples. A CPU with no elapsed
/// jiffies reports 0.
pub fn busy_percentages(
    before: &BTreeMap<String, Vec<u64>>,
    after: &BTreeMap<String, Vec<u64>>,
) -> BTreeMap<String, f64> {
    before
        .iter()
        .filter_map(|(cpu, then)| {
            let now = after.get(cpu)?;
            let total = now.iter().sum::<u64>().saturating_sub(then.iter().sum());
            let idle = now[3].saturating_sub(then[3]);
            let busy = if total == 0 {
                0.0
            } else {
                100.0 - (idle as f64 / total as f64) * 100.0
            };
            Some((cpu.clone(), busy))
        })
        .collect()
}

pub fn parse_meminfo(raw: &str) -> Option<Memory> {
    let field = |name: &str| -> Option<u64> {
        raw.lines()
            .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))?
            .split_whitespace()
            .next()?
            .parse::<u64>()
            .ok()
            .map(|kib| kib * 1024)
    };

    let total = field("MemTotal")?;
    let available = field("MemAvailable")?;
    Some(Memory {
        total,
        used: total.saturating_sub(available),
        available,
    })
}

/// Parse POSIX `df -kP` output, skipping the header and pseudo filesystems
pub fn parse_df(raw: &str) -> BTreeMap<String, Disk> {
    raw.lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [source, size, used, available, percent, mount @ ..] = fields.as_slice() else {
                return None;
            };
            if mount.is_empty() || PSEUDO_FILESYSTEMS.iter().any(|p| source.contains(p)) {
                return None;
            }
            let kib = |v: &str| v.parse::<u64>().ok().map(|k| k * 1024);
            Some((
                source.to_string(),
                Disk {
                    size: kib(*size)?,
                    used: kib(*used)?,
                    available: kib(*available)?,
                    percent: percent.to_string(),
                    mount: mount.join(" "),
                },
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uptime_formatting() {
        assert_eq!(parse_uptime("350735.47 234388.90\n"), Some(350735.47));
        assert_eq!(format_uptime(350735.47), "up 4 days, 1 hour, 25 minutes");
        assert_eq!(format_uptime(7200.0), "up 2 hours");
        assert_eq!(format_uptime(12.0), "up 0 minutes");
    }

    #[test]
    fn test_cpu_busy_between_samples() {
        let before = parse_cpu_stats(
            "cpu  100 0 100 800 0 0 0 0 0 0\n\
             cpu0 50 0 50 400 0 0 0 0 0 0\n\
             cpu1 50 0 50 400 0 0 0 0 0 0\n\
             intr 12345\n",
        );
        let after = parse_cpu_stats(
            "cpu  150 0 150 900 0 0 0 0 0 0\n\
             cpu0 100 0 100 400 0 0 0 0 0 0\n\
             cpu1 50 0 50 400 0 0 0 0 0 0\n",
        );

        let busy = busy_percentages(&before, &after);
        assert_eq!(busy.len(), 3);
        assert!((busy["all"] - 50.0).abs() < 1e-9);
        assert!((busy["core0"] - 100.0).abs() < 1e-9);
        assert_eq!(busy["core1"], 0.0);
    }

    #[test]
    fn test_meminfo() {
        let raw = "MemTotal:        8000 kB\nMemFree:         1000 kB\nMemAvailable:    3000 kB\n";
        assert_eq!(
            parse_meminfo(raw),
            Some(Memory { total: 8000 * 1024, used: 5000 * 1024, available: 3000 * 1024 })
        );
        assert_eq!(parse_meminfo("MemTotal: 8000 kB\n"), None);
    }

    #[test]
    fn test_df_skips_pseudo_filesystems() {
        let raw = "\
Filesystem     1024-blocks     Used Available Capacity Mounted on
/dev/sda2        100000000 40000000  60000000      40% /
tmpfs              1000000        0   1000000       0% /dev/shm
overlay           50000000 10000000  40000000      20% /var/lib/docker/overlay2/abc/merged
/dev/sdb1          2000000  1000000   1000000      50% /mnt/My Files
";
        let disks = parse_df(raw);
        assert_eq!(disks.len(), 2);
        assert_eq!(disks["/dev/sda2"].mount, "/");
        assert_eq!(disks["/dev/sda2"].size, 100000000 * 1024);
        assert_eq!(disks["/dev/sdb1"].mount, "/mnt/My Files");
        assert_eq!(disks["/dev/sdb1"].percent, "50%");
    }

    #[test]
    fn test_thermal_zone_selection() {
        assert!(is_cpu_zone("x86_pkg_temp\n"));
        assert!(is_cpu_zone("cpu-thermal"));
        assert!(is_cpu_zone("SOC_THERMAL"));
        assert!(!is_cpu_zone("acpitz"));
        assert_eq!(parse_millidegrees("48312\n"), Some(48.312));
    }

    #[tokio::test]
    async fn test_missing_thermal_root_is_none() {
        assert_eq!(temperature(Path::new("/nonexistent/thermal")).await, None);
    }
}
