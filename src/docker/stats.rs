//! One-shot container statistics, reduced to the handful of numbers the UI
//! shows, plus the comparator used to order them.

use crate::docker::nullable;
use crate::error::{Error, Result};
use bollard::Docker;
use bollard::query_parameters::StatsOptionsBuilder;
use futures_util::StreamExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// The subset of the docker stats payload the calculators need. Decoded from
/// the wire json so it does not depend on the client's model types.
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct StatsPayload {
    #[serde(deserialize_with = "nullable")]
    pub cpu_stats: CpuStats,
    #[serde(deserialize_with = "nullable")]
    pub precpu_stats: CpuStats,
    #[serde(deserialize_with = "nullable")]
    pub memory_stats: MemoryStats,
    pub networks: Option<HashMap<String, NetworkStats>>,
    #[serde(deserialize_with = "nullable")]
    pub blkio_stats: BlkioStats,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct CpuStats {
    #[serde(deserialize_with = "nullable")]
    pub cpu_usage: CpuUsage,
    pub system_cpu_usage: Option<u64>,
    pub online_cpus: Option<u32>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct CpuUsage {
    #[serde(deserialize_with = "nullable")]
    pub total_usage: u64,
    pub percpu_usage: Option<Vec<u64>>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct MemoryStats {
    pub usage: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct NetworkStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct BlkioStats {
    pub io_service_bytes_recursive: Option<Vec<BlkioEntry>>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct BlkioEntry {
    pub op: String,
    pub value: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStats {
    pub id: String,
    pub name: String,
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub block_read: u64,
    pub block_write: u64,
}

/// CPU usage between the pre-sample and the sample of a one-shot payload.
pub fn cpu_percent(payload: &StatsPayload) -> f64 {
    let cpu = &payload.cpu_stats;
    let pre = &payload.precpu_stats;
    let cpu_delta = cpu.cpu_usage.total_usage as f64 - pre.cpu_usage.total_usage as f64;
    let system_delta =
        cpu.system_cpu_usage.unwrap_or(0) as f64 - pre.system_cpu_usage.unwrap_or(0) as f64;
    let online = match cpu.online_cpus {
        Some(n) if n > 0 => n as f64,
        _ => cpu
            .cpu_usage
            .percpu_usage
            .as_ref()
            .map(|p| p.len())
            .unwrap_or(0) as f64,
    };
    if cpu_delta > 0.0 && system_delta > 0.0 {
        cpu_delta / system_delta * online * 100.0
    } else {
        0.0
    }
}

pub fn reduce(id: &str, name: &str, payload: &StatsPayload) -> ContainerStats {
    let (network_rx, network_tx) = payload
        .networks
        .iter()
        .flat_map(|n| n.values())
        .fold((0u64, 0u64), |(rx, tx), n| {
            (rx.saturating_add(n.rx_bytes), tx.saturating_add(n.tx_bytes))
        });

    let (block_read, block_write) = payload
        .blkio_stats
        .io_service_bytes_recursive
        .iter()
        .flatten()
        .fold((0u64, 0u64), |(r, w), entry| {
            if entry.op.eq_ignore_ascii_case("read") {
                (r.saturating_add(entry.value), w)
            } else if entry.op.eq_ignore_ascii_case("write") {
                (r, w.saturating_add(entry.value))
            } else {
                (r, w)
            }
        });

    ContainerStats {
        id: id.to_string(),
        name: name.to_string(),
        cpu_percent: cpu_percent(payload),
        memory_usage: payload.memory_stats.usage.unwrap_or(0),
        memory_limit: payload.memory_stats.limit.unwrap_or(0),
        network_rx,
        network_tx,
        block_read,
        block_write,
    }
}

async fn fetch_one(docker: &Docker, id: &str, name: &str) -> Result<ContainerStats> {
    let options = StatsOptionsBuilder::default()
        .stream(false)
        .one_shot(true)
        .build();
    let mut stream = docker.stats(id, Some(options));
    let response = stream
        .next()
        .await
        .ok_or_else(|| Error::Upstream(format!("empty stats response for {name}")))??;
    let payload: StatsPayload = serde_json::from_value(serde_json::to_value(&response)?)?;
    Ok(reduce(id, name, &payload))
}

/// Fetches stats for `(id, name)` pairs in parallel. Containers whose stats
/// cannot be read are left out.
pub async fn collect(docker: &Docker, containers: Vec<(String, String)>) -> Vec<ContainerStats> {
    if containers.is_empty() {
        return vec![];
    }
    let (tx, mut rx) = mpsc::channel(containers.len());
    for (id, name) in containers {
        let docker = docker.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            match fetch_one(&docker, &id, &name).await {
                Ok(stats) => {
                    let _ = tx.send(stats).await;
                }
                Err(e) => warn!("could not read stats of {name}: {e}"),
            }
        });
    }
    drop(tx);

    let mut stats = Vec::new();
    while let Some(s) = rx.recv().await {
        stats.push(s);
    }
    debug!("collected stats for {} containers", stats.len());
    stats
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SortField {
    #[default]
    Name,
    Cpu,
    Mem,
    NetworkRx,
    NetworkTx,
    DiskR,
    DiskW,
}

impl std::str::FromStr for SortField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "" | "NAME" => Ok(SortField::Name),
            "CPU" => Ok(SortField::Cpu),
            "MEM" => Ok(SortField::Mem),
            "NETWORK_RX" => Ok(SortField::NetworkRx),
            "NETWORK_TX" => Ok(SortField::NetworkTx),
            "DISK_R" => Ok(SortField::DiskR),
            "DISK_W" => Ok(SortField::DiskW),
            other => Err(Error::invalid(format!("unknown sort field {other}"))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

fn compare(a: &ContainerStats, b: &ContainerStats, field: SortField) -> Ordering {
    let primary = match field {
        SortField::Name => Ordering::Equal,
        SortField::Cpu => a.cpu_percent.total_cmp(&b.cpu_percent),
        SortField::Mem => a.memory_usage.cmp(&b.memory_usage),
        SortField::NetworkRx => a.network_rx.cmp(&b.network_rx),
        SortField::NetworkTx => a.network_tx.cmp(&b.network_tx),
        SortField::DiskR => a.block_read.cmp(&b.block_read),
        SortField::DiskW => a.block_write.cmp(&b.block_write),
    };
    primary
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.id.cmp(&b.id))
}

pub fn sort_stats(stats: &mut [ContainerStats], field: SortField, order: Order) {
    match order {
        Order::Asc => stats.sort_by(|a, b| compare(a, b, field)),
        Order::Desc => stats.sort_by(|a, b| compare(b, a, field)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(json: serde_json::Value) -> StatsPayload {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn cpu_percent_from_pre_sample() {
        let p = payload(serde_json::json!({
            "cpu_stats": {"cpu_usage": {"total_usage": 2000}, "system_cpu_usage": 20000, "online_cpus": 4},
            "precpu_stats": {"cpu_usage": {"total_usage": 1000}, "system_cpu_usage": 10000}
        }));
        assert!((cpu_percent(&p) - 40.0).abs() < 1e-9);
    }

    #[test]
    fn cpu_percent_falls_back_to_percpu_length() {
        let p = payload(serde_json::json!({
            "cpu_stats": {"cpu_usage": {"total_usage": 2000, "percpu_usage": [1, 2]}, "system_cpu_usage": 20000},
            "precpu_stats": {"cpu_usage": {"total_usage": 1000}, "system_cpu_usage": 10000}
        }));
        assert!((cpu_percent(&p) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn cpu_percent_is_zero_without_progress() {
        let p = payload(serde_json::json!({
            "cpu_stats": {"cpu_usage": {"total_usage": 1000}, "system_cpu_usage": 20000, "online_cpus": 4},
            "precpu_stats": {"cpu_usage": {"total_usage": 1000}, "system_cpu_usage": 10000}
        }));
        assert_eq!(cpu_percent(&p), 0.0);
        assert_eq!(cpu_percent(&StatsPayload::default()), 0.0);
    }

    #[test]
    fn reduce_sums_interfaces_and_block_io() {
        let p = payload(serde_json::json!({
            "memory_stats": {"usage": 1024, "limit": 4096},
            "networks": {
                "eth0": {"rx_bytes": 10, "tx_bytes": 20},
                "eth1": {"rx_bytes": 5, "tx_bytes": 1}
            },
            "blkio_stats": {"io_service_bytes_recursive": [
                {"major": 8, "minor": 0, "op": "read", "value": 100},
                {"major": 8, "minor": 0, "op": "write", "value": 50},
                {"major": 8, "minor": 16, "op": "Read", "value": 1},
                {"major": 8, "minor": 0, "op": "total", "value": 151}
            ]}
        }));
        let stats = reduce("abc", "web", &p);
        assert_eq!(stats.memory_usage, 1024);
        assert_eq!(stats.memory_limit, 4096);
        assert_eq!((stats.network_rx, stats.network_tx), (15, 21));
        assert_eq!((stats.block_read, stats.block_write), (101, 50));
    }

    #[test]
    fn counters_saturate_instead_of_overflowing() {
        let p = payload(serde_json::json!({
            "networks": {
                "eth0": {"rx_bytes": u64::MAX, "tx_bytes": 1},
                "eth1": {"rx_bytes": 7, "tx_bytes": u64::MAX}
            },
            "blkio_stats": {"io_service_bytes_recursive": [
                {"major": 8, "minor": 0, "op": "read", "value": u64::MAX},
                {"major": 8, "minor": 16, "op": "read", "value": 3}
            ]}
        }));
        let stats = reduce("abc", "web", &p);
        assert_eq!((stats.network_rx, stats.network_tx), (u64::MAX, u64::MAX));
        assert_eq!((stats.block_read, stats.block_write), (u64::MAX, 0));
    }

    fn sample() -> Vec<ContainerStats> {
        let mk = |name: &str, cpu: f64, mem: u64| ContainerStats {
            id: format!("id-{name}"),
            name: name.to_string(),
            cpu_percent: cpu,
            memory_usage: mem,
            ..Default::default()
        };
        vec![
            mk("db", 12.5, 300),
            mk("web", 40.0, 100),
            mk("cache", 12.5, 200),
            mk("api", 0.0, 300),
        ]
    }

    #[test]
    fn sorts_by_cpu_descending_with_name_tiebreak() {
        let mut stats = sample();
        sort_stats(&mut stats, SortField::Cpu, Order::Desc);
        let names: Vec<_> = stats.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["web", "db", "cache", "api"]);
    }

    #[test]
    fn sorting_is_idempotent_for_every_field() {
        let fields = [
            SortField::Name,
            SortField::Cpu,
            SortField::Mem,
            SortField::NetworkRx,
            SortField::NetworkTx,
            SortField::DiskR,
            SortField::DiskW,
        ];
        for field in fields {
            for order in [Order::Asc, Order::Desc] {
                let mut once = sample();
                sort_stats(&mut once, field, order);
                let mut twice = once.clone();
                sort_stats(&mut twice, field, order);
                assert_eq!(once, twice, "{field:?} {order:?}");
            }
        }
    }

    #[test]
    fn parses_sort_field() {
        assert_eq!("cpu".parse::<SortField>().unwrap(), SortField::Cpu);
        assert_eq!("".parse::<SortField>().unwrap(), SortField::Name);
        assert!("colour".parse::<SortField>().is_err());
    }
}
