//! Compose lifecycle against one docker daemon: containers are created from
//! the resolved project and carry the compose labels, so `docker compose`
//! and this engine see the same stacks.

use crate::compose::model::{MountKind, PortBinding, Service};
use crate::compose::{Project, build, labels, sync};
use crate::docker::containers::{ContainerEngine, ContainerFilter, ContainerView};
use crate::docker::images::{digest_of, pull_image};
use crate::docker::pool::ActiveHost;
use crate::docker::stats::ContainerStats;
use crate::docker::Progress;
use crate::error::{Error, ErrorKind, Result};
use crate::shared::ImageName;
use bollard::Docker;
use bollard::models::{
    ContainerCreateBody, EndpointSettings, HealthConfig, HostConfig, Mount as DockerMount,
    MountTypeEnum, NetworkCreateRequest, NetworkingConfig, PortBinding as DockerPortBinding,
    RestartPolicy, RestartPolicyNameEnum, VolumeCreateOptions,
};
use bollard::query_parameters::{
    CreateContainerOptions, InspectNetworkOptions, RemoveContainerOptions,
    RestartContainerOptions, StartContainerOptions, StopContainerOptionsBuilder,
};
use log::{debug, info, warn};
use russh_sftp::client::SftpSession;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

const STOP_TIMEOUT_SECS: i32 = 10;

const FORCE_REMOVE: RemoveContainerOptions = RemoveContainerOptions {
    v: false,
    force: true,
    link: false,
};

/// Service name to the digest of its local image, empty when the image is
/// not present.
pub type DigestSnapshot = BTreeMap<String, String>;

#[derive(Clone)]
pub struct ComposeEngine {
    docker: Docker,
    sftp: Option<Arc<SftpSession>>,
    root: PathBuf,
    containers: ContainerEngine,
}

impl ComposeEngine {
    pub fn new(host: &ActiveHost, root: impl Into<PathBuf>, machine_addr: &str) -> Self {
        Self {
            docker: host.docker().clone(),
            sftp: host.sftp(),
            root: root.into(),
            containers: ContainerEngine::new(host.docker().clone(), machine_addr),
        }
    }

    pub fn containers(&self) -> &ContainerEngine {
        &self.containers
    }

    /// Builds, then (re)creates and starts the services and their
    /// dependencies. On a remote host bind sources are synced first. Without
    /// a service selection, containers of services no longer in the project
    /// are removed.
    pub async fn up(
        &self,
        project: &Project,
        services: &[String],
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        if let Some(sftp) = &self.sftp {
            sync::sync_project(sftp.as_ref(), &self.root, project, progress).await?;
        }
        self.converge(project, services, progress)
            .await
            .map_err(|e| Error::compose("up", e))
    }

    async fn converge(
        &self,
        project: &Project,
        services: &[String],
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        let ordered = project.services_in_order(services)?;
        for service in &ordered {
            if service.build.is_some() {
                build::build_service(&self.docker, service, progress).await?;
            }
        }

        let networks: BTreeSet<&str> = ordered
            .iter()
            .filter(|s| s.network_mode.is_none())
            .flat_map(|s| s.networks.keys().map(String::as_str))
            .collect();
        for key in networks {
            self.ensure_network(project, key, progress).await?;
        }
        let volumes: BTreeSet<&str> = ordered
            .iter()
            .flat_map(|s| s.mounts.iter())
            .filter(|m| m.kind == MountKind::Volume && !m.source.is_empty())
            .map(|m| m.source.as_str())
            .collect();
        for key in volumes {
            self.ensure_volume(project, key, progress).await?;
        }

        for service in &ordered {
            if service.build.is_none() {
                self.ensure_image(service, progress).await?;
            }
            self.recreate(project, service, progress).await?;
        }

        if services.is_empty() {
            self.remove_orphans(project, progress).await?;
        }
        info!("project {} is up", project.name);
        Ok(())
    }

    async fn ensure_network(
        &self,
        project: &Project,
        key: &str,
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        let name = project.network_name(key);
        let config = project.networks.get(key).cloned().unwrap_or_default();
        match self
            .docker
            .inspect_network(&name, None::<InspectNetworkOptions>)
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) => {
                let e = Error::from(e);
                if e.kind() != ErrorKind::NotFound {
                    return Err(e);
                }
            }
        }
        if config.external {
            return Err(Error::not_found("external network", name));
        }

        let mut labels: HashMap<String, String> = config
            .labels
            .entries()
            .into_iter()
            .map(|(k, v)| (k, v.unwrap_or_default()))
            .collect();
        labels.extend(project.resource_labels("network", key));
        self.docker
            .create_network(NetworkCreateRequest {
                name: name.clone(),
                driver: config.driver.clone(),
                internal: Some(config.internal),
                labels: Some(labels),
                ..Default::default()
            })
            .await?;
        progress.line(format!("network {name} created")).await;
        Ok(())
    }

    async fn ensure_volume(
        &self,
        project: &Project,
        key: &str,
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        let name = project.volume_name(key);
        let config = project.volumes.get(key).cloned().unwrap_or_default();
        match self.docker.inspect_volume(&name).await {
            Ok(_) => return Ok(()),
            Err(e) => {
                let e = Error::from(e);
                if e.kind() != ErrorKind::NotFound {
                    return Err(e);
                }
            }
        }
        if config.external {
            return Err(Error::not_found("external volume", name));
        }

        let mut labels: HashMap<String, String> = config
            .labels
            .entries()
            .into_iter()
            .map(|(k, v)| (k, v.unwrap_or_default()))
            .collect();
        labels.extend(project.resource_labels("volume", key));
        self.docker
            .create_volume(VolumeCreateOptions {
                name: Some(name.clone()),
                driver: config.driver.clone(),
                labels: Some(labels),
                ..Default::default()
            })
            .await?;
        progress.line(format!("volume {name} created")).await;
        Ok(())
    }

    async fn ensure_image(&self, service: &Service, progress: &mut Progress<'_>) -> Result<()> {
        let present = !digest_of(&self.docker, &service.image).await?.is_empty();
        let pull = match service.pull_policy.as_deref().unwrap_or("missing") {
            "always" => true,
            "never" if !present => {
                return Err(Error::not_found("image", service.image.as_str()));
            }
            _ => !present,
        };
        if pull {
            pull_image(&self.docker, &ImageName::new(service.image.as_str()), progress).await?;
        }
        Ok(())
    }

    async fn recreate(
        &self,
        project: &Project,
        service: &Service,
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        let name = project.container_name(service);
        match self.docker.remove_container(&name, Some(FORCE_REMOVE)).await {
            Ok(()) => progress.line(format!("container {name} removed")).await,
            Err(e) => {
                let e = Error::from(e);
                if e.kind() != ErrorKind::NotFound {
                    return Err(e);
                }
            }
        }

        let options = CreateContainerOptions {
            name: Some(name.clone()),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(Some(options), create_body(project, service)?)
            .await?;
        progress.line(format!("container {name} created")).await;
        self.docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await?;
        progress.line(format!("container {name} started")).await;
        debug!("{name} runs as {}", created.id);
        Ok(())
    }

    async fn remove_orphans(&self, project: &Project, progress: &mut Progress<'_>) -> Result<()> {
        let containers = self
            .containers
            .list(&ContainerFilter::project(&project.name, true))
            .await?;
        for container in containers {
            if project.services.contains_key(&container.service)
                || project.disabled_services.contains(&container.service)
            {
                continue;
            }
            self.docker
                .remove_container(&container.id, Some(FORCE_REMOVE))
                .await?;
            progress
                .line(format!("orphan container {} removed", container.name))
                .await;
        }
        Ok(())
    }

    /// Containers of the project, narrowed to `services` when given.
    async fn project_containers(
        &self,
        project: &Project,
        services: &[String],
        all: bool,
    ) -> Result<Vec<ContainerView>> {
        let containers = self
            .containers
            .list(&ContainerFilter::project(&project.name, all))
            .await?;
        Ok(containers
            .into_iter()
            .filter(|c| services.is_empty() || services.contains(&c.service))
            .collect())
    }

    /// Stops and removes the containers. Without a service selection the
    /// project's networks are removed as well; volumes are kept.
    pub async fn down(
        &self,
        project: &Project,
        services: &[String],
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        self.remove_project(project, services, progress)
            .await
            .map_err(|e| Error::compose("down", e))
    }

    async fn remove_project(
        &self,
        project: &Project,
        services: &[String],
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        let stop = StopContainerOptionsBuilder::new()
            .t(STOP_TIMEOUT_SECS)
            .build();
        for container in self.project_containers(project, services, true).await? {
            if container.is_running() {
                self.docker
                    .stop_container(&container.id, Some(stop.clone()))
                    .await?;
                progress.line(format!("container {} stopped", container.name)).await;
            }
            self.docker
                .remove_container(&container.id, Some(FORCE_REMOVE))
                .await?;
            progress.line(format!("container {} removed", container.name)).await;
        }
        if !services.is_empty() {
            return Ok(());
        }

        let keys: BTreeSet<String> = project
            .used_networks()
            .into_iter()
            .chain(project.networks.keys().cloned())
            .collect();
        for key in keys {
            if project.networks.get(&key).is_some_and(|n| n.external) {
                continue;
            }
            let name = project.network_name(&key);
            match self.docker.remove_network(&name).await {
                Ok(()) => progress.line(format!("network {name} removed")).await,
                Err(e) => {
                    let e = Error::from(e);
                    if e.kind() != ErrorKind::NotFound {
                        warn!("could not remove network {name}: {e}");
                        progress.line(format!("network {name} not removed: {e}")).await;
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn stop(
        &self,
        project: &Project,
        services: &[String],
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        let result: Result<()> = async {
            let options = StopContainerOptionsBuilder::new()
                .t(STOP_TIMEOUT_SECS)
                .build();
            for container in self.project_containers(project, services, false).await? {
                self.docker
                    .stop_container(&container.id, Some(options.clone()))
                    .await?;
                progress.line(format!("container {} stopped", container.name)).await;
            }
            Ok::<(), Error>(())
        }
        .await;
        result.map_err(|e| Error::compose("stop", e))
    }

    pub async fn restart(
        &self,
        project: &Project,
        services: &[String],
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        let result: Result<()> = async {
            for container in self.project_containers(project, services, true).await? {
                self.docker
                    .restart_container(&container.id, None::<RestartContainerOptions>)
                    .await?;
                progress.line(format!("container {} restarted", container.name)).await;
            }
            Ok::<(), Error>(())
        }
        .await;
        result.map_err(|e| Error::compose("restart", e))
    }

    /// Pulls the images of the selected services. Services built from a
    /// context are skipped.
    pub async fn pull(
        &self,
        project: &Project,
        services: &[String],
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        let result: Result<()> = async {
            for service in project.selected(services)? {
                if service.build.is_some() {
                    debug!("not pulling {}: built locally", service.name);
                    continue;
                }
                progress.line(format!("pulling {} for {}", service.image, service.name)).await;
                pull_image(&self.docker, &ImageName::new(service.image.as_str()), progress)
                    .await?;
            }
            Ok::<(), Error>(())
        }
        .await;
        result.map_err(|e| Error::compose("pull", e))
    }

    pub async fn snapshot(&self, project: &Project, services: &[String]) -> Result<DigestSnapshot> {
        let mut snapshot = DigestSnapshot::new();
        for service in project.selected(services)? {
            let digest = digest_of(&self.docker, &service.image).await?;
            snapshot.insert(service.name.to_string(), digest);
        }
        Ok(snapshot)
    }

    /// Pulls and, when any image changed, recreates the project. Returns
    /// whether anything was updated.
    pub async fn update(
        &self,
        project: &Project,
        services: &[String],
        progress: &mut Progress<'_>,
    ) -> Result<bool> {
        let before = self
            .snapshot(project, services)
            .await
            .map_err(|e| Error::compose("update", e))?;
        self.pull(project, services, progress).await?;
        let after = self
            .snapshot(project, services)
            .await
            .map_err(|e| Error::compose("update", e))?;

        if !images_changed(&before, &after) {
            progress.line("all images are up to date").await;
            return Ok(false);
        }
        for (service, digest) in &after {
            if before.get(service) != Some(digest) {
                progress.line(format!("{service}: new image {digest}")).await;
            }
        }
        self.up(project, services, progress).await?;
        Ok(true)
    }

    pub async fn list(&self, project: &Project, all: bool) -> Result<Vec<ContainerView>> {
        self.containers
            .list(&ContainerFilter::project(&project.name, all))
            .await
    }

    pub async fn stats(&self, project: &Project) -> Result<Vec<ContainerStats>> {
        self.containers
            .stats(&ContainerFilter::project(&project.name, false))
            .await
    }
}

pub fn images_changed(before: &DigestSnapshot, after: &DigestSnapshot) -> bool {
    before != after
}

fn restart_policy(policy: &str) -> Result<RestartPolicy> {
    let (name, retries) = match policy.split_once(':') {
        Some((name, retries)) => (
            name,
            Some(
                retries
                    .parse::<i64>()
                    .map_err(|_| Error::invalid(format!("invalid restart policy {policy:?}")))?,
            ),
        ),
        None => (policy, None),
    };
    let name = match name {
        "no" | "" => RestartPolicyNameEnum::NO,
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        other => return Err(Error::invalid(format!("unknown restart policy {other:?}"))),
    };
    Ok(RestartPolicy {
        name: Some(name),
        maximum_retry_count: retries,
    })
}

fn port_bindings(ports: &[PortBinding]) -> HashMap<String, Option<Vec<DockerPortBinding>>> {
    let mut bindings: HashMap<String, Option<Vec<DockerPortBinding>>> = HashMap::new();
    for port in ports {
        bindings
            .entry(format!("{}/{}", port.target, port.protocol))
            .or_insert_with(|| Some(vec![]))
            .get_or_insert_with(Vec::new)
            .push(DockerPortBinding {
                host_ip: port.host_ip.clone(),
                host_port: port.published.map(|p| p.to_string()),
            });
    }
    bindings
}

fn nanos(duration: Option<std::time::Duration>) -> Option<i64> {
    duration.map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
}

fn non_empty(list: &[String]) -> Option<Vec<String>> {
    (!list.is_empty()).then(|| list.to_vec())
}

/// The create request for the one container of `service`.
pub fn create_body(project: &Project, service: &Service) -> Result<ContainerCreateBody> {
    let mut binds = Vec::new();
    let mut mounts = Vec::new();
    let mut tmpfs = HashMap::new();
    for mount in &service.mounts {
        let suffix = if mount.read_only { ":ro" } else { "" };
        match mount.kind {
            MountKind::Bind => binds.push(format!("{}:{}{suffix}", mount.source, mount.target)),
            MountKind::Volume if !mount.source.is_empty() => binds.push(format!(
                "{}:{}{suffix}",
                project.volume_name(&mount.source),
                mount.target
            )),
            MountKind::Volume => mounts.push(DockerMount {
                target: Some(mount.target.clone()),
                typ: Some(MountTypeEnum::VOLUME),
                read_only: Some(mount.read_only),
                ..Default::default()
            }),
            MountKind::Tmpfs => {
                tmpfs.insert(mount.target.clone(), String::new());
            }
        }
    }

    let (network_mode, networking_config) = match &service.network_mode {
        Some(mode) => (Some(mode.clone()), None),
        None => {
            let endpoints: HashMap<String, EndpointSettings> = service
                .networks
                .iter()
                .map(|(key, aliases)| {
                    let mut aliases = aliases.clone();
                    aliases.push(service.name.to_string());
                    (
                        project.network_name(key),
                        EndpointSettings {
                            aliases: Some(aliases),
                            ..Default::default()
                        },
                    )
                })
                .collect();
            let primary = service.networks.keys().next().map(|k| project.network_name(k));
            (
                primary,
                Some(NetworkingConfig {
                    endpoints_config: Some(endpoints),
                }),
            )
        }
    };

    let host_config = HostConfig {
        binds: non_empty(&binds),
        mounts: (!mounts.is_empty()).then_some(mounts),
        tmpfs: (!tmpfs.is_empty()).then_some(tmpfs),
        port_bindings: (!service.ports.is_empty()).then(|| port_bindings(&service.ports)),
        restart_policy: service.restart.as_deref().map(restart_policy).transpose()?,
        network_mode,
        privileged: Some(service.privileged),
        extra_hosts: non_empty(&service.extra_hosts),
        cap_add: non_empty(&service.cap_add),
        cap_drop: non_empty(&service.cap_drop),
        ..Default::default()
    };

    let mut container_labels: HashMap<String, String> = service
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    container_labels.insert(labels::CONTAINER_NUMBER.to_string(), "1".to_string());

    Ok(ContainerCreateBody {
        image: Some(service.image.clone()),
        cmd: service.command.clone(),
        entrypoint: service.entrypoint.clone(),
        env: Some(
            service
                .environment
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect(),
        ),
        labels: Some(container_labels),
        working_dir: service.working_dir.clone(),
        user: service.user.clone(),
        hostname: service.hostname.clone(),
        tty: Some(service.tty),
        open_stdin: Some(service.stdin_open),
        healthcheck: service.healthcheck.as_ref().map(|h| HealthConfig {
            test: Some(h.test.clone()),
            interval: nanos(h.interval),
            timeout: nanos(h.timeout),
            start_period: nanos(h.start_period),
            retries: h.retries,
            ..Default::default()
        }),
        host_config: Some(host_config),
        networking_config,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::Loader;
    use std::fs;

    fn load(compose: &str) -> (tempfile::TempDir, Project) {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("web")).unwrap();
        fs::write(root.path().join("web/compose.yaml"), compose).unwrap();
        let project = Loader::new(root.path()).load("web/compose.yaml").unwrap();
        (root, project)
    }

    #[test]
    fn create_body_carries_labels_ports_and_mounts() {
        let (root, project) = load(
            "services:\n  nginx:\n    image: nginx:1.25\n    restart: on-failure:3\n    ports:\n      - \"8080:80\"\n      - \"127.0.0.1:8443:443/tcp\"\n    volumes:\n      - ./html:/usr/share/nginx/html:ro\n      - cache:/cache\n      - /anon\n    environment:\n      MODE: prod\nvolumes:\n  cache: {}\n",
        );
        let nginx = project.service("nginx").unwrap();
        let body = create_body(&project, nginx).unwrap();

        assert_eq!(body.image.as_deref(), Some("nginx:1.25"));
        let stamped = body.labels.unwrap();
        assert_eq!(stamped[labels::PROJECT], "web");
        assert_eq!(stamped[labels::SERVICE], "nginx");
        assert_eq!(stamped[labels::CONTAINER_NUMBER], "1");
        assert_eq!(body.env.unwrap(), ["MODE=prod"]);

        let host = body.host_config.unwrap();
        let html = root.path().join("web/html");
        assert_eq!(
            host.binds.unwrap(),
            [
                format!("{}:/usr/share/nginx/html:ro", html.display()),
                "web_cache:/cache".to_string(),
            ]
        );
        assert_eq!(host.mounts.unwrap()[0].target.as_deref(), Some("/anon"));
        let ports = host.port_bindings.unwrap();
        assert_eq!(
            ports["80/tcp"].as_ref().unwrap()[0].host_port.as_deref(),
            Some("8080")
        );
        assert_eq!(
            ports["443/tcp"].as_ref().unwrap()[0].host_ip.as_deref(),
            Some("127.0.0.1")
        );
        let restart = host.restart_policy.unwrap();
        assert_eq!(restart.name, Some(RestartPolicyNameEnum::ON_FAILURE));
        assert_eq!(restart.maximum_retry_count, Some(3));
        assert_eq!(host.network_mode.as_deref(), Some("web_default"));

        let endpoints = body.networking_config.unwrap().endpoints_config.unwrap();
        assert_eq!(endpoints["web_default"].aliases.as_ref().unwrap(), &["nginx"]);
    }

    #[test]
    fn network_mode_skips_endpoints() {
        let (_root, project) = load(
            "services:\n  vpn:\n    image: wireguard\n    network_mode: host\n",
        );
        let body = create_body(&project, project.service("vpn").unwrap()).unwrap();
        assert_eq!(body.host_config.unwrap().network_mode.as_deref(), Some("host"));
        assert!(body.networking_config.is_none());
    }

    #[test]
    fn unknown_restart_policy_is_rejected() {
        assert!(restart_policy("sometimes").is_err());
        assert!(restart_policy("on-failure:x").is_err());
        assert_eq!(
            restart_policy("unless-stopped").unwrap().name,
            Some(RestartPolicyNameEnum::UNLESS_STOPPED)
        );
    }

    #[test]
    fn update_is_a_noop_when_digests_match() {
        let before = DigestSnapshot::from([
            ("web".to_string(), "nginx@sha256:aaa".to_string()),
            ("db".to_string(), String::new()),
        ]);
        assert!(!images_changed(&before, &before.clone()));
        let mut after = before.clone();
        after.insert("db".to_string(), "postgres@sha256:bbb".to_string());
        assert!(images_changed(&before, &after));
    }

    #[tokio::test]
    #[ignore = "needs a docker daemon"]
    async fn up_and_down_a_single_service_project() {
        let (_root, project) = load("services:\n  nginx:\n    image: nginx:1.25\n");
        let client = crate::docker::client::ConnectedClient::local().await.unwrap();
        let host = ActiveHost {
            name: client.name().clone(),
            client: Arc::new(client),
        };
        let engine = ComposeEngine::new(&host, "/tmp", "0.0.0.0");

        let (mut writer, mut reader) = tokio::io::duplex(64 * 1024);
        engine
            .up(&project, &[], &mut Progress::new(&mut writer))
            .await
            .unwrap();
        drop(writer);
        let mut out = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut reader, &mut out)
            .await
            .unwrap();
        assert!(out.contains("nginx"));

        let containers = engine.list(&project, true).await.unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].project, "web");

        engine.down(&project, &[], &mut Progress::none()).await.unwrap();
        assert!(engine.list(&project, true).await.unwrap().is_empty());
    }
}
