use crate::compose::{ComposeEngine, Project};
use crate::dispatch::stream::{OperationStream, spawn_operation};
use crate::dispatch::{Dispatcher, Order, SortField};
use crate::docker::Progress;
use crate::docker::containers::{ContainerView, annotate};
use crate::docker::stats::{ContainerStats, sort_stats};
use crate::domain::Store;
use crate::error::{Error, Result};
use crate::git::History;
use log::{debug, info};
use serde::{Deserialize, Serialize};

/// Compose commands that stream their progress.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ComposeOp {
    Start,
    Stop,
    Remove,
    Restart,
    Update,
    Pull,
}

impl ComposeOp {
    pub fn name(&self) -> &'static str {
        match self {
            ComposeOp::Start => "compose start",
            ComposeOp::Stop => "compose stop",
            ComposeOp::Remove => "compose remove",
            ComposeOp::Restart => "compose restart",
            ComposeOp::Update => "compose update",
            ComposeOp::Pull => "compose pull",
        }
    }
}

impl<S: Store, H: History> Dispatcher<S, H> {
    fn load_project(&self, file: &str) -> Result<Project> {
        self.files.resolve(file)?;
        self.loader.load(file)
    }

    async fn compose_engine(&self) -> Result<ComposeEngine> {
        let host = self.active().await?;
        Ok(ComposeEngine::new(
            &host,
            self.files.root(),
            &self.options.machine_addr,
        ))
    }

    /// Loads `file` and runs `op` on the active host. Loading problems are
    /// returned at once; everything after that arrives on the stream. The
    /// operation keeps running when the caller stops reading.
    pub async fn compose(
        &self,
        op: ComposeOp,
        file: &str,
        services: Vec<String>,
    ) -> Result<OperationStream> {
        let project = self.load_project(file)?;
        for service in &services {
            project.service(service)?;
        }
        let engine = self.compose_engine().await?;
        info!("{} {file} {services:?}", op.name());

        Ok(spawn_operation(op.name(), move |mut pipe| async move {
            let mut progress = Progress::new(&mut pipe);
            match op {
                ComposeOp::Start => engine.up(&project, &services, &mut progress).await,
                ComposeOp::Stop => engine.stop(&project, &services, &mut progress).await,
                ComposeOp::Remove => engine.down(&project, &services, &mut progress).await,
                ComposeOp::Restart => engine.restart(&project, &services, &mut progress).await,
                ComposeOp::Pull => engine.pull(&project, &services, &mut progress).await,
                ComposeOp::Update => {
                    let updated = engine.update(&project, &services, &mut progress).await?;
                    debug!("update of {} changed images: {updated}", project.name);
                    Ok(())
                }
            }
        }))
    }

    /// Problems that keep `file` from loading; empty when it is valid.
    pub async fn compose_validate(&self, file: &str) -> Result<Vec<String>> {
        self.files.load_path(file).await?;
        Ok(self.loader.validate(file))
    }

    pub async fn compose_list(&self, file: &str, all: bool) -> Result<Vec<ContainerView>> {
        let project = self.load_project(file)?;
        let host = self.active().await?;
        let engine = ComposeEngine::new(&host, self.files.root(), &self.options.machine_addr);
        let mut containers = engine.list(&project, all).await?;
        let ids: Vec<String> = containers.iter().map(|c| c.image_id.clone()).collect();
        let updates = self.tracker.lookup(&host.name, &ids).await?;
        annotate(&mut containers, &updates);
        Ok(containers)
    }

    pub async fn compose_stats(
        &self,
        file: &str,
        field: SortField,
        order: Order,
    ) -> Result<Vec<ContainerStats>> {
        let project = self.load_project(file)?;
        let mut stats = self
            .compose_engine()
            .await?
            .stats(&project)
            .await
            .map_err(|e| Error::compose("stats", e))?;
        sort_stats(&mut stats, field, order);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::fixture;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn validate_reports_problems_without_docker() {
        let fx = fixture(&["local"]).await;
        std::fs::create_dir_all(fx.root.path().join("web")).unwrap();
        std::fs::write(
            fx.root.path().join("web/compose.yaml"),
            "services:\n  nginx:\n    image: nginx:1.25\n",
        )
        .unwrap();
        std::fs::write(
            fx.root.path().join("web/broken.yaml"),
            "services:\n  nginx:\n    ports: [\"notaport\"]\n",
        )
        .unwrap();

        let d = &fx.dispatcher;
        assert!(d.compose_validate("web/compose.yaml").await.unwrap().is_empty());
        assert!(!d.compose_validate("web/broken.yaml").await.unwrap().is_empty());
        let err = d.compose_validate("web/missing.yaml").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn unknown_service_fails_before_streaming() {
        let fx = fixture(&["local"]).await;
        std::fs::create_dir_all(fx.root.path().join("web")).unwrap();
        std::fs::write(
            fx.root.path().join("web/compose.yaml"),
            "services:\n  nginx:\n    image: nginx:1.25\n",
        )
        .unwrap();

        let err = fx
            .dispatcher
            .compose(ComposeOp::Start, "web/compose.yaml", vec!["db".to_string()])
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = fx
            .dispatcher
            .compose(ComposeOp::Start, "../outside.yaml", vec![])
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn ops_read_lowercase() {
        let op: ComposeOp = serde_json::from_str("\"remove\"").unwrap();
        assert_eq!(op, ComposeOp::Remove);
        assert_eq!(op.name(), "compose remove");
    }
}
