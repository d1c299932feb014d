use crate::compose::{ComposeEngine, labels};
use crate::dispatch::stream::{LINE_BUFFER, LogsMessage, OperationStream, spawn_lines, spawn_operation};
use crate::dispatch::{Dispatcher, Order, SortField};
use crate::docker::Progress;
use crate::docker::containers::{ContainerEngine, ContainerFilter, ContainerView, annotate};
use crate::docker::exec;
use crate::docker::images::{self, ImageView};
use crate::docker::networks::{self, NetworkView};
use crate::docker::stats::{ContainerStats, sort_stats};
use crate::docker::update::{UpdateOutcome, update_container};
use crate::docker::volumes::{self, VolumeView};
use crate::domain::Store;
use crate::error::{Error, Result};
use crate::git::History;
use crate::shared::ContainerId;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::mpsc;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContainerAction {
    Start,
    Stop,
    Remove,
    Restart,
}

/// Compose file (relative to `root`) and service a container was created
/// from, when it carries compose labels pointing into the root.
pub(crate) fn compose_origin(container: &ContainerView, root: &Path) -> Option<(String, String)> {
    let service = container.labels.get(labels::SERVICE)?;
    let config_files = container.labels.get(labels::CONFIG_FILES)?;
    let first = config_files.split(',').next()?.trim();
    let relative = Path::new(first).strip_prefix(root).ok()?;
    let relative = relative.to_str()?;
    if relative.is_empty() {
        return None;
    }
    Some((relative.to_string(), service.clone()))
}

impl<S: Store, H: History> Dispatcher<S, H> {
    async fn container_engine(&self) -> Result<ContainerEngine> {
        let host = self.active().await?;
        Ok(ContainerEngine::new(
            host.docker().clone(),
            self.options.machine_addr.clone(),
        ))
    }

    /// Containers of the active host with known image updates filled in.
    pub async fn container_list(&self, all: bool) -> Result<Vec<ContainerView>> {
        let host = self.active().await?;
        let engine = ContainerEngine::new(host.docker().clone(), self.options.machine_addr.clone());
        let mut containers = engine
            .list(&ContainerFilter {
                all,
                ..Default::default()
            })
            .await?;
        let ids: Vec<String> = containers.iter().map(|c| c.image_id.clone()).collect();
        let updates = self.tracker.lookup(&host.name, &ids).await?;
        annotate(&mut containers, &updates);
        Ok(containers)
    }

    pub async fn container_action(&self, action: ContainerAction, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Err(Error::invalid("no container ids given"));
        }
        let engine = self.container_engine().await?;
        match action {
            ContainerAction::Start => engine.start(ids).await,
            ContainerAction::Stop => engine.stop(ids).await,
            ContainerAction::Remove => engine.remove(ids).await,
            ContainerAction::Restart => engine.restart(ids).await,
        }
    }

    pub async fn container_stats(&self, field: SortField, order: Order) -> Result<Vec<ContainerStats>> {
        let mut stats = self
            .container_engine()
            .await?
            .stats(&ContainerFilter::default())
            .await?;
        sort_stats(&mut stats, field, order);
        Ok(stats)
    }

    /// Updates each container to the newest version of its image.
    /// Containers of a compose project under the root go through the
    /// project's update; all others are replaced in place.
    pub async fn container_update(&self, ids: Vec<String>) -> Result<OperationStream> {
        if ids.is_empty() {
            return Err(Error::invalid("no container ids given"));
        }
        let host = self.active().await?;
        let engine = ComposeEngine::new(&host, self.files.root(), &self.options.machine_addr);
        let loader = self.loader.clone();
        let tracker = self.tracker.clone();
        let root = self.files.root().to_path_buf();

        Ok(spawn_operation("container update", move |mut pipe| async move {
            let mut progress = Progress::new(&mut pipe);
            for id in ids {
                let filter = ContainerFilter {
                    all: true,
                    ids: vec![id.clone()],
                    ..Default::default()
                };
                let container = engine
                    .containers()
                    .list(&filter)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::not_found("container", id.as_str()))?;

                let updated = match compose_origin(&container, &root) {
                    Some((file, service)) => {
                        info!("updating {} through {file}", container.name);
                        progress.line(format!("updating {} through {file}", container.name)).await;
                        let project = loader.load(&file)?;
                        engine.update(&project, &[service], &mut progress).await?
                    }
                    None => {
                        let outcome = update_container(host.docker(), &container.id, &mut progress).await?;
                        matches!(outcome, UpdateOutcome::Updated { .. })
                    }
                };
                if updated {
                    tracker.delete(&host.name, &container.image_id).await?;
                } else {
                    debug!("{} is up to date", container.name);
                }
            }
            Ok(())
        }))
    }

    /// Follows the output of a container from the last `tail` lines.
    pub async fn container_logs(&self, id: &str, tail: Option<u64>) -> Result<mpsc::Receiver<LogsMessage>> {
        let tail = tail.map(|t| t.to_string()).unwrap_or_else(|| "all".to_string());
        let stream = self.container_engine().await?.logs(id, &tail);
        Ok(spawn_lines(format!("logs of {id}"), stream))
    }

    /// Starts an interactive session in a container and returns its output.
    /// Input goes through [`Dispatcher::exec_input`] and is accepted as soon
    /// as this returns.
    pub async fn exec_output(&self, id: &str, cmd: Vec<String>) -> Result<mpsc::Receiver<LogsMessage>> {
        let (session, input) = self.exec.register(&ContainerId::new(id))?;
        let docker = self.active().await?.docker().clone();
        let (tx, rx) = mpsc::channel(LINE_BUFFER);

        tokio::spawn(async move {
            let container = session.container().clone();
            if let Err(e) = exec::attach(&docker, session, input, cmd, tx.clone()).await {
                warn!("exec in {container} failed: {e}");
                let _ = tx.send(LogsMessage::new(format!("error: {e}"))).await;
            }
        });
        Ok(rx)
    }

    pub async fn exec_input(&self, id: &str, line: String) -> Result<()> {
        self.exec.send_input(&ContainerId::new(id), line).await
    }

    pub async fn image_list(&self) -> Result<Vec<ImageView>> {
        let host = self.active().await?;
        let mut images = images::list(host.docker()).await?;
        let ids: Vec<String> = images.iter().map(|i| i.id.clone()).collect();
        let updates = self.tracker.lookup(&host.name, &ids).await?;
        images::annotate(&mut images, &updates);
        Ok(images)
    }

    /// Removes images and forgets about updates recorded for them.
    pub async fn image_remove(&self, ids: &[String], force: bool) -> Result<Vec<String>> {
        let host = self.active().await?;
        let mut deleted = Vec::new();
        for id in ids {
            deleted.extend(images::remove(host.docker(), id, force).await?);
            self.tracker.delete(&host.name, id).await?;
        }
        Ok(deleted)
    }

    pub async fn image_prune(&self, mode: images::PruneMode) -> Result<images::PruneReport> {
        images::prune(self.active().await?.docker(), mode).await
    }

    pub async fn volume_list(&self) -> Result<Vec<VolumeView>> {
        volumes::list(self.active().await?.docker()).await
    }

    pub async fn volume_create(&self, name: &str, driver: Option<&str>) -> Result<VolumeView> {
        if name.trim().is_empty() {
            return Err(Error::invalid("volume name must not be empty"));
        }
        volumes::create(self.active().await?.docker(), name, driver).await
    }

    pub async fn volume_delete(&self, names: &[String], force: bool) -> Result<()> {
        let host = self.active().await?;
        for name in names {
            volumes::delete(host.docker(), name, force).await?;
        }
        Ok(())
    }

    pub async fn volume_prune(&self, mode: volumes::PruneMode) -> Result<volumes::PruneReport> {
        volumes::prune(self.active().await?.docker(), mode).await
    }

    pub async fn network_list(&self) -> Result<Vec<NetworkView>> {
        networks::list(self.active().await?.docker()).await
    }

    pub async fn network_create(&self, name: &str, driver: Option<&str>) -> Result<String> {
        if name.trim().is_empty() {
            return Err(Error::invalid("network name must not be empty"));
        }
        networks::create(self.active().await?.docker(), name, driver).await
    }

    pub async fn network_delete(&self, ids: &[String]) -> Result<()> {
        let host = self.active().await?;
        for id in ids {
            networks::delete(host.docker(), id).await?;
        }
        Ok(())
    }

    pub async fn network_prune(&self) -> Result<Vec<String>> {
        networks::prune(self.active().await?.docker()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::fixture;
    use crate::error::ErrorKind;
    use std::collections::HashMap;

    fn labelled(labels: &[(&str, &str)]) -> ContainerView {
        ContainerView {
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            ..Default::default()
        }
    }

    #[test]
    fn compose_origin_points_into_the_root() {
        let root = Path::new("/compose");
        let container = labelled(&[
            (labels::SERVICE, "nginx"),
            (labels::CONFIG_FILES, "/compose/web/compose.yaml,/compose/web/override.yaml"),
        ]);
        assert_eq!(
            compose_origin(&container, root),
            Some(("web/compose.yaml".to_string(), "nginx".to_string()))
        );

        let elsewhere = labelled(&[
            (labels::SERVICE, "nginx"),
            (labels::CONFIG_FILES, "/opt/stacks/web/compose.yaml"),
        ]);
        assert_eq!(compose_origin(&elsewhere, root), None);
        assert_eq!(compose_origin(&labelled(&[]), root), None);
    }

    #[tokio::test]
    async fn exec_input_without_a_session_is_not_found() {
        let fx = fixture(&["local"]).await;
        let err = fx
            .dispatcher
            .exec_input("abc", "ls".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn second_exec_session_is_rejected() {
        let fx = fixture(&["local"]).await;
        let (_guard, _input) = fx.dispatcher.exec.register(&ContainerId::new("abc")).unwrap();
        let err = fx
            .dispatcher
            .exec_output("abc", vec![])
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn empty_selections_are_rejected() {
        let fx = fixture(&["local"]).await;
        let err = fx
            .dispatcher
            .container_action(ContainerAction::Stop, &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = fx.dispatcher.volume_create(" ", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn exec_session_accepts_input_once_opened() {
        let fx = fixture(&["local"]).await;
        let _output = fx.dispatcher.exec_output("abc", vec![]).await.unwrap();
        fx.dispatcher
            .exec_input("abc", "ls".to_string())
            .await
            .unwrap();
        let err = fx
            .dispatcher
            .exec_output("abc", vec![])
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn failed_exec_releases_the_session() {
        let fx = fixture(&["local"]).await;
        let mut output = fx.dispatcher.exec_output("abc", vec![]).await.unwrap();
        // the offline daemon refuses the exec
        let line = output.recv().await.unwrap();
        assert!(line.message.starts_with("error:"), "{}", line.message);
        let container = ContainerId::new("abc");
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while fx.dispatcher.exec.is_active(&container) {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
