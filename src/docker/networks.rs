use crate::compose::labels;
use crate::docker::wire;
use crate::error::Result;
use bollard::Docker;
use bollard::models::NetworkCreateRequest;
use bollard::query_parameters::{ListNetworksOptions, PruneNetworksOptions};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Networks docker creates itself; they cannot be removed.
const BUILTIN: [&str; 3] = ["bridge", "host", "none"];

#[derive(Deserialize, Debug, Default)]
#[serde(default, rename_all = "PascalCase")]
struct WireNetwork {
    name: String,
    id: String,
    created: Option<String>,
    scope: String,
    driver: String,
    internal: bool,
    labels: Option<HashMap<String, String>>,
    containers: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default, rename_all = "PascalCase")]
struct WireCreated {
    id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkView {
    pub id: String,
    pub name: String,
    pub driver: String,
    pub scope: String,
    pub created: String,
    pub internal: bool,
    pub project: String,
    pub containers: usize,
    pub builtin: bool,
}

impl From<WireNetwork> for NetworkView {
    fn from(network: WireNetwork) -> Self {
        let labels = network.labels.unwrap_or_default();
        NetworkView {
            builtin: BUILTIN.contains(&network.name.as_str()),
            project: labels.get(labels::PROJECT).cloned().unwrap_or_default(),
            containers: network.containers.map(|c| c.len()).unwrap_or(0),
            id: network.id,
            name: network.name,
            driver: network.driver,
            scope: network.scope,
            created: network.created.unwrap_or_default(),
            internal: network.internal,
        }
    }
}

pub async fn list(docker: &Docker) -> Result<Vec<NetworkView>> {
    let networks = docker.list_networks(None::<ListNetworksOptions>).await?;
    let mut views = networks
        .iter()
        .map(|n| wire::<WireNetwork>(n).map(NetworkView::from))
        .collect::<Result<Vec<_>>>()?;
    views.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(views)
}

pub async fn create(docker: &Docker, name: &str, driver: Option<&str>) -> Result<String> {
    let response = docker
        .create_network(NetworkCreateRequest {
            name: name.to_string(),
            driver: driver.map(str::to_string),
            ..Default::default()
        })
        .await?;
    let created: WireCreated = wire(&response)?;
    info!("created network {name} ({})", created.id);
    Ok(created.id)
}

pub async fn delete(docker: &Docker, id: &str) -> Result<()> {
    docker.remove_network(id).await?;
    info!("removed network {id}");
    Ok(())
}

pub async fn prune(docker: &Docker) -> Result<Vec<String>> {
    let response = docker.prune_networks(None::<PruneNetworksOptions>).await?;
    let deleted = response.networks_deleted.unwrap_or_default();
    info!("pruned {} network(s)", deleted.len());
    Ok(deleted)
}
