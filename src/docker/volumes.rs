use crate::compose::labels;
use crate::docker::{nullable, wire};
use crate::error::Result;
use bollard::Docker;
use bollard::models::VolumeCreateOptions;
use bollard::query_parameters::{
    ListContainersOptions, ListVolumesOptions, PruneVolumesOptions, RemoveVolumeOptions,
};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Set by docker on volumes it created for an anonymous `VOLUME` or mount.
pub const ANONYMOUS_LABEL: &str = "com.docker.volume.anonymous";

#[derive(Deserialize, Debug, Default)]
#[serde(default, rename_all = "PascalCase")]
struct WireVolume {
    name: String,
    driver: String,
    mountpoint: String,
    created_at: Option<String>,
    labels: Option<HashMap<String, String>>,
    scope: String,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default, rename_all = "PascalCase")]
struct WireMount {
    #[serde(rename = "Type")]
    kind: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default, rename_all = "PascalCase")]
struct WireContainerMounts {
    #[serde(deserialize_with = "nullable")]
    names: Vec<String>,
    #[serde(deserialize_with = "nullable")]
    mounts: Vec<WireMount>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VolumeView {
    pub name: String,
    pub driver: String,
    pub mountpoint: String,
    pub created_at: String,
    pub scope: String,
    pub labels: HashMap<String, String>,
    /// Compose project the volume belongs to, empty for standalone volumes.
    pub project: String,
    pub anonymous: bool,
    /// Names of the containers mounting the volume.
    pub containers: Vec<String>,
}

impl VolumeView {
    pub fn in_use(&self) -> bool {
        !self.containers.is_empty()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PruneMode {
    /// Every volume no container mounts.
    #[default]
    Unused,
    /// Unused anonymous volumes only.
    Anonymous,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub deleted: Vec<String>,
    pub space_reclaimed: i64,
}

fn view(volume: WireVolume, usage: &HashMap<String, Vec<String>>) -> VolumeView {
    let labels = volume.labels.unwrap_or_default();
    let mut containers = usage.get(&volume.name).cloned().unwrap_or_default();
    containers.sort();
    VolumeView {
        project: labels.get(labels::PROJECT).cloned().unwrap_or_default(),
        anonymous: labels.contains_key(ANONYMOUS_LABEL),
        containers,
        name: volume.name,
        driver: volume.driver,
        mountpoint: volume.mountpoint,
        created_at: volume.created_at.unwrap_or_default(),
        scope: volume.scope,
        labels,
    }
}

fn usage_by_volume(containers: Vec<WireContainerMounts>) -> HashMap<String, Vec<String>> {
    let mut usage: HashMap<String, Vec<String>> = HashMap::new();
    for container in containers {
        let name = container
            .names
            .first()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();
        for mount in container.mounts {
            if mount.kind.as_deref() == Some("volume")
                && let Some(volume) = mount.name
            {
                usage.entry(volume).or_default().push(name.clone());
            }
        }
    }
    usage
}

pub async fn list(docker: &Docker) -> Result<Vec<VolumeView>> {
    let response = docker.list_volumes(None::<ListVolumesOptions>).await?;
    let containers = docker
        .list_containers(Some(ListContainersOptions {
            all: true,
            ..Default::default()
        }))
        .await?;
    let containers = containers
        .iter()
        .map(wire)
        .collect::<Result<Vec<WireContainerMounts>>>()?;
    let usage = usage_by_volume(containers);

    let mut views = response
        .volumes
        .unwrap_or_default()
        .iter()
        .map(|v| wire(v).map(|v| view(v, &usage)))
        .collect::<Result<Vec<_>>>()?;
    views.sort_by(|a, b| a.project.cmp(&b.project).then_with(|| a.name.cmp(&b.name)));
    Ok(views)
}

pub async fn create(docker: &Docker, name: &str, driver: Option<&str>) -> Result<VolumeView> {
    let volume = docker
        .create_volume(VolumeCreateOptions {
            name: Some(name.to_string()),
            driver: driver.map(str::to_string),
            ..Default::default()
        })
        .await?;
    info!("created volume {name}");
    Ok(view(wire(&volume)?, &HashMap::new()))
}

pub async fn delete(docker: &Docker, name: &str, force: bool) -> Result<()> {
    docker
        .remove_volume(name, Some(RemoveVolumeOptions { force }))
        .await?;
    info!("removed volume {name}");
    Ok(())
}

pub async fn prune(docker: &Docker, mode: PruneMode) -> Result<PruneReport> {
    let filters = match mode {
        PruneMode::Unused => HashMap::from([("all".to_string(), vec!["true".to_string()])]),
        PruneMode::Anonymous => {
            HashMap::from([("label".to_string(), vec![ANONYMOUS_LABEL.to_string()])])
        }
    };
    let response = docker
        .prune_volumes(Some(PruneVolumesOptions {
            filters: Some(filters),
        }))
        .await?;
    let report = PruneReport {
        deleted: response.volumes_deleted.unwrap_or_default(),
        space_reclaimed: response.space_reclaimed.unwrap_or(0),
    };
    info!("pruned {} volume(s)", report.deleted.len());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_by_compose_project_and_flags_anonymous() {
        let volume: WireVolume = serde_json::from_value(serde_json::json!({
            "Name": "web_data",
            "Driver": "local",
            "Mountpoint": "/var/lib/docker/volumes/web_data/_data",
            "Labels": {"com.docker.compose.project": "web", "com.docker.volume.anonymous": ""},
            "Scope": "local"
        }))
        .unwrap();
        let v = view(volume, &HashMap::new());
        assert_eq!(v.project, "web");
        assert!(v.anonymous);
        assert!(!v.in_use());
    }

    #[test]
    fn usage_counts_only_volume_mounts() {
        let containers: Vec<WireContainerMounts> = serde_json::from_value(serde_json::json!([
            {"Names": ["/web-nginx-1"], "Mounts": [
                {"Type": "volume", "Name": "web_data"},
                {"Type": "bind", "Source": "/srv/web"}
            ]},
            {"Names": ["/backup"], "Mounts": [{"Type": "volume", "Name": "web_data"}]},
            {"Names": ["/idle"], "Mounts": null}
        ]))
        .unwrap();
        let usage = usage_by_volume(containers);
        assert_eq!(usage.len(), 1);
        assert_eq!(usage["web_data"], ["web-nginx-1", "backup"]);
    }
}
