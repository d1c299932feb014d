//! Entry point for every operation the outside world can ask for. Each call
//! resolves the active host at the time it starts and runs against that
//! host's clients until it finishes.

mod compose;
mod containers;
mod files;
mod hosts;
mod settings;
pub mod stream;

pub use compose::ComposeOp;
pub use containers::ContainerAction;
pub use hosts::NewKeyRequest;
pub use settings::{AppInfo, UserSettings};
pub use stream::{LogsMessage, OperationStream};

pub use crate::docker::stats::{Order, SortField};

use crate::docker::exec::ExecSessions;
use crate::docker::pool::{ActiveClient, ActiveHost, HostPool};
use crate::domain::Store;
use crate::domain::image_updates::service::Service as ImageUpdates;
use crate::domain::machines::service::Service as MachineService;
use crate::error::Result;
use crate::files::FileStore;
use crate::compose::Loader;
use crate::git::History;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Address shown for published ports.
    pub machine_addr: String,
    pub preferences_path: PathBuf,
}

pub struct Dispatcher<S: Store, H: History> {
    pool: Arc<HostPool>,
    store: S,
    machines: MachineService<S>,
    tracker: ImageUpdates<S>,
    history: H,
    files: FileStore,
    loader: Loader,
    exec: ExecSessions,
    /// Held while the active host and the worktree branch change together.
    switching: Mutex<()>,
    options: DispatchOptions,
}

impl<S: Store, H: History> Dispatcher<S, H> {
    pub fn new(
        store: S,
        pool: Arc<HostPool>,
        history: H,
        files: FileStore,
        options: DispatchOptions,
    ) -> Self {
        Self {
            machines: MachineService::new(store.clone()),
            tracker: ImageUpdates::new(store.clone()),
            loader: Loader::new(files.root()),
            exec: ExecSessions::new(),
            switching: Mutex::new(()),
            pool,
            store,
            history,
            files,
            options,
        }
    }

    pub fn pool(&self) -> &Arc<HostPool> {
        &self.pool
    }

    /// Shared with the background checker so a settings change wakes it.
    pub fn tracker(&self) -> &ImageUpdates<S> {
        &self.tracker
    }

    pub fn machines(&self) -> &MachineService<S> {
        &self.machines
    }

    async fn active(&self) -> Result<ActiveHost> {
        self.pool.active_client().await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::docker::client::ConnectedClient;
    use crate::git::{Author, Historian};
    use crate::outbound::sqlite::Sqlite;
    use crate::shared::HostName;
    use bollard::Docker;
    use std::time::Duration;
    use tempfile::TempDir;

    pub struct Fixture {
        pub dispatcher: Dispatcher<Sqlite, Historian>,
        pub historian: Historian,
        pub root: TempDir,
        _config: TempDir,
    }

    /// A client that never dials until the first request, so tests that do
    /// not talk to docker need no daemon.
    pub fn offline_client(name: &str) -> ConnectedClient {
        let docker =
            Docker::connect_with_http("tcp://127.0.0.1:1", 1, bollard::API_DEFAULT_VERSION)
                .unwrap();
        ConnectedClient::from_docker(HostName::new(name), docker)
    }

    pub async fn fixture(hosts: &[&str]) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let config = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", config.path().join("dockman.db").display());
        let store = Sqlite::open(&url).await.unwrap();
        let clients = hosts.iter().map(|h| offline_client(h)).collect();
        let pool = Arc::new(HostPool::from_clients(clients, None).unwrap());
        let historian = Historian::open(root.path(), Author::default(), Duration::from_secs(10))
            .await
            .unwrap();
        historian
            .switch_branch(pool.active_name().await.as_str())
            .await
            .unwrap();
        let files = FileStore::open(root.path()).unwrap();
        let options = DispatchOptions {
            machine_addr: "127.0.0.1".to_string(),
            preferences_path: root.path().join(".dockman.yml"),
        };
        Fixture {
            dispatcher: Dispatcher::new(store, pool, historian.clone(), files, options),
            historian,
            root,
            _config: config,
        }
    }
}
