//! Background checker that records which running containers have a newer
//! image upstream.

use crate::docker::Progress;
use crate::docker::containers::{ContainerEngine, ContainerFilter, ContainerView};
use crate::docker::images::{image_id, pull_image};
use crate::docker::pool::HostPool;
use crate::domain::image_updates::ports::ImageUpdateRepository;
use crate::domain::image_updates::service::Service as ImageUpdates;
use crate::domain::user_config::UserConfigRepository;
use crate::error::{Error, Result};
use crate::shared::{HostName, ImageName};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const MIN_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub checked: usize,
    pub updates: usize,
}

/// Image reference to the image ids running containers use for it. Containers
/// started from a bare image id or a digest have nothing to compare against.
pub fn candidates(containers: &[ContainerView]) -> BTreeMap<String, Vec<String>> {
    let mut candidates: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for container in containers.iter().filter(|c| c.is_running()) {
        if container.image.is_empty()
            || container.image.starts_with("sha256:")
            || container.image.contains('@')
        {
            debug!("skipping {}: image {} is pinned", container.name, container.image);
            continue;
        }
        let ids = candidates.entry(container.image.clone()).or_default();
        if !ids.contains(&container.image_id) {
            ids.push(container.image_id.clone());
        }
    }
    candidates
}

pub struct Updater<S: ImageUpdateRepository> {
    store: S,
    tracker: ImageUpdates<S>,
    pool: Arc<HostPool>,
    /// Host to check; the active host when unset.
    host: Option<HostName>,
}

impl<S> Updater<S>
where
    S: ImageUpdateRepository + UserConfigRepository,
{
    pub fn new(
        store: S,
        tracker: ImageUpdates<S>,
        pool: Arc<HostPool>,
        host: Option<HostName>,
    ) -> Self {
        Self {
            store,
            tracker,
            pool,
            host,
        }
    }

    /// Checks on every interval while enabled. A reset of the tracker wakes
    /// the loop so new settings apply at once.
    pub async fn run(self) {
        let reset = self.tracker.reset_signal();
        loop {
            let settings = match self.store.get_user_config().await {
                Ok(config) => config.updater,
                Err(e) => {
                    error!("could not read updater settings: {e}");
                    Default::default()
                }
            };
            if settings.enabled {
                match self.check_once().await {
                    Ok(report) => info!(
                        "checked {} image(s), {} update(s) available",
                        report.checked, report.updates
                    ),
                    Err(e) => error!("image update check failed: {e}"),
                }
            } else {
                debug!("image update checker is disabled");
            }

            let wait = Duration::from_secs(settings.interval_secs).max(MIN_INTERVAL);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = reset.notified() => info!("image update checker settings changed"),
            }
        }
    }

    pub async fn check_once(&self) -> Result<CheckReport> {
        let (host, client) = match &self.host {
            Some(name) => {
                let client = self
                    .pool
                    .get(name)
                    .await
                    .ok_or_else(|| Error::not_found("host", name.as_str()))?;
                (name.clone(), client)
            }
            None => {
                let active = self.pool.active().await?;
                (active.name, active.client)
            }
        };
        let docker = client.docker();
        let containers = ContainerEngine::new(docker.clone(), "")
            .list(&ContainerFilter::default())
            .await?;

        let mut report = CheckReport::default();
        for (image, ids) in candidates(&containers) {
            report.checked += 1;
            let latest = match pull_image(docker, &ImageName::new(image.as_str()), &mut Progress::none())
                .await
            {
                Ok(_) => image_id(docker, &image).await?,
                Err(e) => {
                    warn!("could not pull {image} on {host}: {e}");
                    continue;
                }
            };
            for id in ids {
                if id == latest {
                    self.tracker.delete(&host, &id).await?;
                } else {
                    info!("{image} on {host} has a newer image {latest}");
                    self.tracker.save(&host, &id, &image).await?;
                    report.updates += 1;
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(name: &str, image: &str, image_id: &str, state: &str) -> ContainerView {
        ContainerView {
            name: name.to_string(),
            image: image.to_string(),
            image_id: image_id.to_string(),
            state: state.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn candidates_group_running_containers_by_image() {
        let containers = [
            container("a", "nginx:1.25", "sha256:1", "running"),
            container("b", "nginx:1.25", "sha256:1", "running"),
            container("c", "nginx:1.25", "sha256:0", "running"),
            container("d", "redis:7", "sha256:2", "exited"),
            container("e", "sha256:3", "sha256:3", "running"),
            container("f", "app@sha256:4", "sha256:4", "running"),
        ];
        let found = candidates(&containers);
        assert_eq!(found.len(), 1);
        assert_eq!(found["nginx:1.25"], ["sha256:1", "sha256:0"]);
    }
}
