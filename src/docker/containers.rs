use crate::compose::labels;
use crate::docker::ports::{PortMapping, RawPort, filter_ports};
use crate::docker::stats::{self, ContainerStats};
use crate::docker::{nullable, wire};
use crate::error::Result;
use crate::shared::ProjectName;
use bollard::Docker;
use bollard::query_parameters::{
    ListContainersOptions, LogsOptions, RemoveContainerOptions, RestartContainerOptions,
    StartContainerOptions, StopContainerOptionsBuilder,
};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const STOP_TIMEOUT_SECS: i32 = 30;

#[derive(Deserialize, Debug, Default)]
#[serde(default, rename_all = "PascalCase")]
struct WirePort {
    #[serde(rename = "IP")]
    ip: Option<String>,
    private_port: u16,
    public_port: Option<u16>,
    #[serde(rename = "Type")]
    protocol: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default, rename_all = "PascalCase")]
struct WireContainer {
    id: String,
    #[serde(deserialize_with = "nullable")]
    names: Vec<String>,
    image: String,
    #[serde(rename = "ImageID")]
    image_id: String,
    command: String,
    created: i64,
    #[serde(deserialize_with = "nullable")]
    ports: Vec<WirePort>,
    #[serde(deserialize_with = "nullable")]
    labels: HashMap<String, String>,
    state: Option<String>,
    status: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ContainerView {
    pub id: String,
    pub name: String,
    pub image: String,
    pub image_id: String,
    pub command: String,
    pub created: i64,
    pub state: String,
    pub status: String,
    pub ports: Vec<PortMapping>,
    pub labels: HashMap<String, String>,
    /// Compose project and service, empty for standalone containers.
    pub project: String,
    pub service: String,
    /// Reference of a newer image, empty when none is known.
    pub update_available: String,
}

impl ContainerView {
    fn from_wire(container: WireContainer, machine_addr: &str) -> Self {
        let ports = container.ports.into_iter().map(|p| RawPort {
            ip: p.ip,
            private_port: p.private_port,
            public_port: p.public_port,
            protocol: p.protocol.unwrap_or_else(|| "tcp".to_string()),
        });
        ContainerView {
            name: container
                .names
                .first()
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            ports: filter_ports(ports, machine_addr),
            project: container
                .labels
                .get(labels::PROJECT)
                .cloned()
                .unwrap_or_default(),
            service: container
                .labels
                .get(labels::SERVICE)
                .cloned()
                .unwrap_or_default(),
            id: container.id,
            image: container.image,
            image_id: container.image_id,
            command: container.command,
            created: container.created,
            state: container.state.unwrap_or_default(),
            status: container.status,
            labels: container.labels,
            update_available: String::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Which containers to list.
#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    pub all: bool,
    pub project: Option<ProjectName>,
    pub ids: Vec<String>,
}

impl ContainerFilter {
    pub fn project(project: &ProjectName, all: bool) -> Self {
        Self {
            all,
            project: Some(project.clone()),
            ids: vec![],
        }
    }

    fn filters(&self) -> HashMap<String, Vec<String>> {
        let mut filters = HashMap::new();
        if let Some(project) = &self.project {
            filters.insert(
                "label".to_string(),
                vec![format!("{}={project}", labels::PROJECT)],
            );
        }
        if !self.ids.is_empty() {
            filters.insert("id".to_string(), self.ids.clone());
        }
        filters
    }
}

/// Direct container operations against one docker daemon.
#[derive(Clone)]
pub struct ContainerEngine {
    docker: Docker,
    machine_addr: String,
}

impl ContainerEngine {
    /// `machine_addr` replaces the bind address of published ports.
    pub fn new(docker: Docker, machine_addr: impl Into<String>) -> Self {
        Self {
            docker,
            machine_addr: machine_addr.into(),
        }
    }

    pub async fn list(&self, filter: &ContainerFilter) -> Result<Vec<ContainerView>> {
        let options = ListContainersOptions {
            all: filter.all,
            filters: Some(filter.filters()),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        debug!("found {} containers", containers.len());

        let mut views = containers
            .iter()
            .map(|c| wire(c).map(|c| ContainerView::from_wire(c, &self.machine_addr)))
            .collect::<Result<Vec<_>>>()?;
        views.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(views)
    }

    pub async fn start(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            self.docker
                .start_container(id, None::<StartContainerOptions>)
                .await?;
            info!("started container {id}");
        }
        Ok(())
    }

    pub async fn stop(&self, ids: &[String]) -> Result<()> {
        let options = StopContainerOptionsBuilder::new()
            .t(STOP_TIMEOUT_SECS)
            .build();
        for id in ids {
            self.docker
                .stop_container(id, Some(options.clone()))
                .await?;
            info!("stopped container {id}");
        }
        Ok(())
    }

    pub async fn restart(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            self.docker
                .restart_container(id, None::<RestartContainerOptions>)
                .await?;
            info!("restarted container {id}");
        }
        Ok(())
    }

    /// Force-removes the containers, keeping their volumes.
    pub async fn remove(&self, ids: &[String]) -> Result<()> {
        let options = RemoveContainerOptions {
            v: false,
            force: true,
            link: false,
        };
        for id in ids {
            self.docker
                .remove_container(id, Some(options.clone()))
                .await?;
            info!("removed container {id}");
        }
        Ok(())
    }

    /// Stats of the containers matching `filter`. Only running containers
    /// report stats.
    pub async fn stats(&self, filter: &ContainerFilter) -> Result<Vec<ContainerStats>> {
        let filter = ContainerFilter {
            all: false,
            ..filter.clone()
        };
        let containers = self
            .list(&filter)
            .await?
            .into_iter()
            .map(|c| (c.id, c.name))
            .collect();
        Ok(stats::collect(&self.docker, containers).await)
    }

    /// Follows the output of a container. TTY containers yield their raw
    /// output; others are demultiplexed into stdout and stderr frames.
    pub fn logs(&self, id: &str, tail: &str) -> impl Stream<Item = Result<Bytes>> + Send + use<> {
        let options = LogsOptions {
            follow: true,
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        self.docker
            .logs(id, Some(options))
            .map(|chunk| -> Result<Bytes> { Ok(chunk?.into_bytes()) })
    }
}

/// Fills `update_available` from a `image id -> update reference` lookup.
pub fn annotate(containers: &mut [ContainerView], updates: &HashMap<String, String>) {
    for container in containers {
        if let Some(update) = updates.get(&container.image_id) {
            container.update_available = update.clone();
        }
    }
}
