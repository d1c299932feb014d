//! The compose file as written (`ComposeFile`) and as resolved against its
//! environment and directory (`Project`).

use crate::compose::labels;
use crate::error::{Error, Result};
use crate::shared::{ProjectName, ServiceName};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

/// Network every service joins when it names none.
pub const DEFAULT_NETWORK: &str = "default";

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum StringOrList {
    String(String),
    List(Vec<String>),
}

impl StringOrList {
    /// The string form is split like a shell would.
    pub fn to_args(&self) -> Result<Vec<String>> {
        match self {
            StringOrList::String(s) => shell_words::split(s)
                .map_err(|e| Error::invalid(format!("cannot parse command {s:?}: {e}"))),
            StringOrList::List(list) => Ok(list.clone()),
        }
    }

    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StringOrList::String(s) => vec![s.clone()],
            StringOrList::List(list) => list.clone(),
        }
    }
}

/// `KEY=value` lists or `KEY: value` maps, as used by environment, labels and
/// build args. Map values may be any scalar or absent.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum MapOrList {
    Map(BTreeMap<String, Option<Value>>),
    List(Vec<String>),
}

impl Default for MapOrList {
    fn default() -> Self {
        MapOrList::Map(BTreeMap::new())
    }
}

impl MapOrList {
    /// Entries with their value, `None` where only the key is given.
    pub fn entries(&self) -> Vec<(String, Option<String>)> {
        match self {
            MapOrList::Map(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.as_ref().and_then(scalar_to_string)))
                .collect(),
            MapOrList::List(list) => list
                .iter()
                .map(|entry| match entry.split_once('=') {
                    Some((k, v)) => (k.to_string(), Some(v.to_string())),
                    None => (entry.clone(), None),
                })
                .collect(),
        }
    }
}

pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        other => serde_yaml::to_string(other)
            .ok()
            .map(|s| s.trim_end().to_string()),
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum BuildSpec {
    Context(String),
    Full(BuildConfig),
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct BuildConfig {
    pub context: Option<String>,
    pub dockerfile: Option<String>,
    pub args: MapOrList,
    pub target: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum VolumeEntry {
    Short(String),
    Long(VolumeLong),
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct VolumeLong {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub source: Option<String>,
    pub target: String,
    pub read_only: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum PortEntry {
    Number(u16),
    Short(String),
    Long(PortLong),
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct PortLong {
    pub target: u16,
    pub published: Option<Value>,
    pub protocol: Option<String>,
    pub host_ip: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum DependsOn {
    List(Vec<String>),
    Map(BTreeMap<String, Option<Value>>),
}

impl Default for DependsOn {
    fn default() -> Self {
        DependsOn::List(vec![])
    }
}

impl DependsOn {
    pub fn names(&self) -> Vec<String> {
        match self {
            DependsOn::List(list) => list.clone(),
            DependsOn::Map(map) => map.keys().cloned().collect(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct ServiceNetworkConfig {
    pub aliases: Vec<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ServiceNetworks {
    List(Vec<String>),
    Map(BTreeMap<String, Option<ServiceNetworkConfig>>),
}

impl ServiceNetworks {
    pub fn resolve(&self) -> BTreeMap<String, Vec<String>> {
        match self {
            ServiceNetworks::List(list) => list.iter().map(|n| (n.clone(), vec![])).collect(),
            ServiceNetworks::Map(map) => map
                .iter()
                .map(|(n, c)| (n.clone(), c.clone().unwrap_or_default().aliases))
                .collect(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct HealthcheckConfig {
    pub test: Option<StringOrList>,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub start_period: Option<String>,
    pub retries: Option<i64>,
    pub disable: bool,
}

/// One service as written in the file.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct ServiceConfig {
    pub image: Option<String>,
    pub build: Option<BuildSpec>,
    pub container_name: Option<String>,
    pub command: Option<StringOrList>,
    pub entrypoint: Option<StringOrList>,
    pub environment: MapOrList,
    pub env_file: Option<StringOrList>,
    pub ports: Vec<PortEntry>,
    pub volumes: Vec<VolumeEntry>,
    pub depends_on: DependsOn,
    pub networks: Option<ServiceNetworks>,
    pub network_mode: Option<String>,
    pub restart: Option<String>,
    pub labels: MapOrList,
    pub profiles: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub hostname: Option<String>,
    pub tty: bool,
    pub stdin_open: bool,
    pub privileged: bool,
    pub extra_hosts: Vec<String>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub healthcheck: Option<HealthcheckConfig>,
    pub pull_policy: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct NetworkConfig {
    pub name: Option<String>,
    pub driver: Option<String>,
    pub external: bool,
    pub internal: bool,
    pub labels: MapOrList,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct VolumeConfig {
    pub name: Option<String>,
    pub driver: Option<String>,
    pub external: bool,
    pub labels: MapOrList,
}

/// A compose file as written, after interpolation.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct ComposeFile {
    pub name: Option<String>,
    pub services: BTreeMap<String, ServiceConfig>,
    pub networks: BTreeMap<String, Option<NetworkConfig>>,
    pub volumes: BTreeMap<String, Option<VolumeConfig>>,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Bind,
    Volume,
    Tmpfs,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub kind: MountKind,
    /// Absolute host path for binds, volume key for named volumes, empty for
    /// anonymous volumes and tmpfs.
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub host_ip: Option<String>,
    pub published: Option<u16>,
    pub target: u16,
    pub protocol: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Build {
    pub context: PathBuf,
    pub dockerfile: String,
    pub args: BTreeMap<String, String>,
    pub target: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Healthcheck {
    pub test: Vec<String>,
    pub interval: Option<Duration>,
    pub timeout: Option<Duration>,
    pub start_period: Option<Duration>,
    pub retries: Option<i64>,
}

/// A service with paths, environment and labels resolved.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Service {
    pub name: ServiceName,
    pub image: String,
    pub build: Option<Build>,
    pub container_name: Option<String>,
    pub command: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub environment: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub ports: Vec<PortBinding>,
    pub depends_on: Vec<String>,
    /// Network key to aliases.
    pub networks: BTreeMap<String, Vec<String>>,
    pub network_mode: Option<String>,
    pub restart: Option<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub hostname: Option<String>,
    pub tty: bool,
    pub stdin_open: bool,
    pub privileged: bool,
    pub extra_hosts: Vec<String>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub healthcheck: Option<Healthcheck>,
    pub pull_policy: Option<String>,
}

impl Service {
    /// Paths of the bind mounts, in declaration order.
    pub fn bind_sources(&self) -> impl Iterator<Item = &str> {
        self.mounts
            .iter()
            .filter(|m| m.kind == MountKind::Bind)
            .map(|m| m.source.as_str())
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Project {
    pub name: ProjectName,
    pub working_dir: PathBuf,
    pub config_files: Vec<PathBuf>,
    /// Enabled services by name.
    pub services: BTreeMap<String, Service>,
    /// Services switched off by profiles.
    pub disabled_services: Vec<String>,
    pub networks: BTreeMap<String, NetworkConfig>,
    pub volumes: BTreeMap<String, VolumeConfig>,
}

impl Project {
    pub fn service(&self, name: &str) -> Result<&Service> {
        self.services
            .get(name)
            .ok_or_else(|| Error::not_found("service", name))
    }

    /// Name of the one container a service runs as.
    pub fn container_name(&self, service: &Service) -> String {
        service
            .container_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}-1", self.name, service.name))
    }

    pub fn network_name(&self, key: &str) -> String {
        match self.networks.get(key) {
            Some(NetworkConfig {
                name: Some(name), ..
            }) => name.clone(),
            Some(NetworkConfig { external: true, .. }) => key.to_string(),
            _ => format!("{}_{key}", self.name),
        }
    }

    pub fn volume_name(&self, key: &str) -> String {
        match self.volumes.get(key) {
            Some(VolumeConfig {
                name: Some(name), ..
            }) => name.clone(),
            Some(VolumeConfig { external: true, .. }) => key.to_string(),
            _ => format!("{}_{key}", self.name),
        }
    }

    /// Labels stamped on networks and volumes the project creates.
    pub fn resource_labels(&self, kind: &str, key: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (labels::PROJECT.to_string(), self.name.to_string()),
            (format!("com.docker.compose.{kind}"), key.to_string()),
            (labels::VERSION.to_string(), labels::COMPOSE_VERSION.to_string()),
        ])
    }

    /// `names` and everything they depend on, dependencies first. An empty
    /// selection means every service.
    pub fn services_in_order(&self, names: &[String]) -> Result<Vec<&Service>> {
        let mut wanted: BTreeSet<&str> = BTreeSet::new();
        let mut queue: Vec<&str> = if names.is_empty() {
            self.services.keys().map(String::as_str).collect()
        } else {
            names.iter().map(String::as_str).collect()
        };
        while let Some(name) = queue.pop() {
            if wanted.insert(name) {
                queue.extend(self.service(name)?.depends_on.iter().map(String::as_str));
            }
        }

        let mut ordered: Vec<&Service> = Vec::with_capacity(wanted.len());
        let mut placed: BTreeSet<&str> = BTreeSet::new();
        while ordered.len() < wanted.len() {
            let ready: Vec<&str> = wanted
                .iter()
                .copied()
                .filter(|n| !placed.contains(n))
                .filter(|n| {
                    self.services[*n]
                        .depends_on
                        .iter()
                        .all(|d| placed.contains(d.as_str()))
                })
                .collect();
            if ready.is_empty() {
                let stuck: Vec<&str> = wanted.difference(&placed).copied().collect();
                return Err(Error::invalid(format!(
                    "dependency cycle between services: {}",
                    stuck.join(", ")
                )));
            }
            for name in ready {
                placed.insert(name);
                ordered.push(&self.services[name]);
            }
        }
        Ok(ordered)
    }

    /// The selected services only, without dependencies. An empty selection
    /// means every service.
    pub fn selected(&self, names: &[String]) -> Result<Vec<&Service>> {
        if names.is_empty() {
            return Ok(self.services.values().collect());
        }
        names.iter().map(|n| self.service(n)).collect()
    }

    /// Keys of the networks the services use, the implicit default network
    /// included.
    pub fn used_networks(&self) -> BTreeSet<String> {
        self.services
            .values()
            .filter(|s| s.network_mode.is_none())
            .flat_map(|s| s.networks.keys().cloned())
            .collect()
    }
}

/// Parses compose durations such as `30s`, `1m30s`, `1h`, `500ms` or a bare
/// number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let invalid = || Error::invalid(format!("invalid duration {input:?}"));
    let input = input.trim();
    if input.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = input.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 0.001,
            "us" => 0.000_001,
            _ => return Err(invalid()),
        };
        let part = Duration::try_from_secs_f64(value * unit).map_err(|_| invalid())?;
        total = total.checked_add(part).ok_or_else(invalid)?;
        rest = &rest[unit_len..];
    }
    Ok(total)
}
