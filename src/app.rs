//! Wires the stores, the host pool and the HTTP adapter together.

use crate::config::Config;
use crate::dispatch::{DispatchOptions, Dispatcher};
use crate::docker::pool::{BootstrapOptions, HostPool};
use crate::domain::machines::models::DEFAULT_KEY_NAME;
use crate::domain::machines::service::Service as MachineService;
use crate::error::{Result, ResultExt};
use crate::files::FileStore;
use crate::git::{Author, Historian};
use crate::inbound::server::{AppState, Credentials, create_app};
use crate::outbound::sqlite::Sqlite;
use crate::updater::Updater;
use log::info;
use std::sync::Arc;
use tokio::net::TcpListener;

pub struct App {
    config: Config,
    dispatcher: Arc<Dispatcher<Sqlite, Historian>>,
    updater: Updater<Sqlite>,
}

impl App {
    pub async fn bootstrap(config: Config) -> Result<Self> {
        let files = FileStore::open(&config.compose_root)?;
        std::fs::create_dir_all(&config.config_dir)
            .context(format!("failed to create {}", config.config_dir.display()))?;

        let url = format!("sqlite://{}", config.database_path().display());
        let store = Sqlite::open(&url).await.context("failed to open database")?;
        let machines = MachineService::new(store.clone());
        machines.get_key(DEFAULT_KEY_NAME).await?;

        let pool = HostPool::bootstrap(
            &machines,
            &BootstrapOptions {
                disable_local: config.disable_local,
                default_host: config.default_host.clone(),
            },
        )
        .await?;
        let pool = Arc::new(pool);

        let author = Author {
            name: config.git.author_name.clone(),
            email: config.git.author_email.clone(),
        };
        let historian =
            Historian::open(&config.compose_root, author, config.staging_timeout()).await?;
        historian
            .switch_branch(pool.active_name().await.as_str())
            .await?;

        let options = DispatchOptions {
            machine_addr: config.machine_addr.clone(),
            preferences_path: config.preferences_path(),
        };
        let dispatcher = Dispatcher::new(store.clone(), pool.clone(), historian, files, options);
        let updater = Updater::new(
            store,
            dispatcher.tracker().clone(),
            pool,
            config.updater_host.clone(),
        );

        Ok(Self {
            config,
            dispatcher: Arc::new(dispatcher),
            updater,
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<Sqlite, Historian>> {
        &self.dispatcher
    }

    pub fn state(&self) -> AppState<Sqlite, Historian> {
        let auth = &self.config.auth;
        AppState {
            dispatcher: self.dispatcher.clone(),
            credentials: auth.enable.then(|| Credentials {
                user: auth.user.clone(),
                pass: auth.pass.clone(),
            }),
            origins: Arc::new(self.config.origins.clone()),
        }
    }

    /// Serves the API until the listener fails. The update checker runs
    /// alongside.
    pub async fn run(self) -> Result<()> {
        let app = create_app(self.state()).await;
        let port = self.config.port;
        tokio::spawn(self.updater.run());

        let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
        info!("Server running on http://0.0.0.0:{port}");
        info!("Health check: http://0.0.0.0:{port}/health (no auth required)");
        if self.config.auth.enable {
            info!("API endpoints require basic auth as {}", self.config.auth.user);
        }
        axum::serve(listener, app).await?;
        Ok(())
    }
}
