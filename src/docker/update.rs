use crate::docker::Progress;
use crate::docker::images::{self, pull_image};
use crate::error::{Error, Result};
use crate::shared::ImageName;
use bollard::Docker;
use bollard::models::{ContainerCreateBody, ContainerInspectResponse, HealthStatusEnum};
use bollard::query_parameters::{
    CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    RenameContainerOptions, StartContainerOptions, StopContainerOptionsBuilder,
};
use log::{debug, info, trace, warn};
use serde::Serialize;
use std::time::Duration;

const STOP_TIMEOUT_SECS: i32 = 30;
const HEALTH_GRACE: Duration = Duration::from_secs(5);

const KEEP_VOLUMES: RemoveContainerOptions = RemoveContainerOptions {
    v: false,
    force: false,
    link: false,
};

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum UpdateOutcome {
    UpToDate,
    Updated { container_id: String },
}

/// Replaces a standalone container with one running the newest version of
/// its image. The old container is kept as `<id>-backup` until the new one
/// reports healthy, and restored otherwise.
pub async fn update_container(
    docker: &Docker,
    container_id: &str,
    progress: &mut Progress<'_>,
) -> Result<UpdateOutcome> {
    let details = docker
        .inspect_container(container_id, None::<InspectContainerOptions>)
        .await?;
    trace!(
        "container details: {}",
        serde_json::to_string_pretty(&details).unwrap_or_default()
    );

    let image = details
        .config
        .as_ref()
        .and_then(|c| c.image.clone())
        .map(ImageName::new)
        .ok_or_else(|| Error::invalid(format!("container {container_id} has no image")))?;
    let current_image_id = details.image.clone().unwrap_or_default();

    progress.line(format!("checking for updates: {image}")).await;
    let pulled = pull_image(docker, &image, progress).await?;
    let latest_image_id = images::image_id(docker, image.as_str()).await?;
    if latest_image_id == current_image_id {
        progress.line(format!("{image} is up to date")).await;
        return Ok(UpdateOutcome::UpToDate);
    }
    debug!(
        "{image}: {current_image_id} -> {latest_image_id} (digest {})",
        pulled.digest
    );

    info!("Stopping container {container_id}...");
    progress.line("stopping container").await;
    let stop = StopContainerOptionsBuilder::new()
        .t(STOP_TIMEOUT_SECS)
        .build();
    docker.stop_container(container_id, Some(stop.clone())).await?;

    let backup_name = format!("{container_id}-backup");
    debug!("rename old container to {backup_name}");
    docker
        .rename_container(
            container_id,
            RenameContainerOptions {
                name: backup_name.clone(),
            },
        )
        .await?;

    let original_name = container_name(&details);
    let created = recreate(docker, details).await?;
    docker
        .start_container(&created, None::<StartContainerOptions>)
        .await?;
    progress.line(format!("started {original_name}")).await;

    if let Err(e) = check_container_health(docker, &created).await {
        warn!("New container failed, rolling back to previous version");
        progress.line("new container is unhealthy, rolling back").await;
        docker.stop_container(&created, Some(stop)).await?;
        docker
            .remove_container(
                &created,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        docker
            .rename_container(
                &backup_name,
                RenameContainerOptions {
                    name: original_name,
                },
            )
            .await?;
        docker
            .start_container(container_id, None::<StartContainerOptions>)
            .await?;
        info!("Rollback complete, old container restarted");
        return Err(e);
    }

    docker
        .remove_container(container_id, Some(KEEP_VOLUMES))
        .await?;
    info!("Container {original_name} updated, backup removed");
    Ok(UpdateOutcome::Updated {
        container_id: created,
    })
}

fn container_name(details: &ContainerInspectResponse) -> String {
    details
        .name
        .as_deref()
        .unwrap_or_default()
        .trim_start_matches('/')
        .to_string()
}

/// Creates a container from the inspected configuration of another one,
/// under that container's name.
async fn recreate(docker: &Docker, details: ContainerInspectResponse) -> Result<String> {
    let name = container_name(&details);
    let config = create_body(details);
    let options = CreateContainerOptions {
        name: Some(name),
        ..Default::default()
    };
    let container = docker.create_container(Some(options), config).await?;
    debug!("Container created with ID: {}", container.id);
    Ok(container.id)
}

fn create_body(details: ContainerInspectResponse) -> ContainerCreateBody {
    let mut config = ContainerCreateBody {
        host_config: details.host_config,
        ..Default::default()
    };
    if let Some(last) = details.config {
        config.env = last.env;
        config.cmd = last.cmd;
        config.entrypoint = last.entrypoint;
        config.working_dir = last.working_dir;
        config.user = last.user;
        config.labels = last.labels;
        config.exposed_ports = last.exposed_ports;
        config.image = last.image;
        config.attach_stderr = last.attach_stderr;
        config.attach_stdout = last.attach_stdout;
        config.tty = last.tty;
    }
    config
}

async fn check_container_health(docker: &Docker, container: &str) -> Result<()> {
    tokio::time::sleep(HEALTH_GRACE).await;

    let inspect = docker
        .inspect_container(container, None::<InspectContainerOptions>)
        .await?;

    if let Some(state) = inspect.state
        && state.running == Some(true)
    {
        match state.health.and_then(|h| h.status) {
            None => return Ok(()),
            Some(HealthStatusEnum::HEALTHY) => return Ok(()),
            // no health check configured
            Some(HealthStatusEnum::NONE) | Some(HealthStatusEnum::EMPTY) => return Ok(()),
            Some(_) => {}
        }
    }

    Err(Error::Upstream(format!(
        "container {container} is not healthy after update"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerConfig, HostConfig};
    use std::collections::HashMap;

    #[test]
    fn recreated_container_keeps_its_configuration() {
        let details = ContainerInspectResponse {
            name: Some("/whoami".to_string()),
            config: Some(ContainerConfig {
                image: Some("traefik/whoami:latest".to_string()),
                env: Some(vec!["PORT=8080".to_string()]),
                labels: Some(HashMap::from([("team".to_string(), "ops".to_string())])),
                tty: Some(false),
                ..Default::default()
            }),
            host_config: Some(HostConfig {
                binds: Some(vec!["/srv/whoami:/data".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(container_name(&details), "whoami");

        let body = create_body(details);
        assert_eq!(body.image.as_deref(), Some("traefik/whoami:latest"));
        assert_eq!(body.env.unwrap(), ["PORT=8080"]);
        assert_eq!(body.labels.unwrap()["team"], "ops");
        assert_eq!(
            body.host_config.unwrap().binds.unwrap(),
            ["/srv/whoami:/data"]
        );
    }
}
