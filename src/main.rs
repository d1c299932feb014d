use dockman::app::App;
use dockman::cli;
use dockman::config::Config;
use env_logger::Env;
use log::{error, info};
use std::process;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
    let overrides = cli::parse();
    let config = match Config::load(overrides.config_file.as_deref(), &overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            process::exit(2);
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(config.log.filter())).init();

    #[cfg(target_os = "linux")]
    drop_privileges(config.pgid, config.puid);

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal, gracefully shutting down...");
        if shutdown_tx.try_send(()).is_err() {
            process::exit(1);
        }
    }) {
        error!("could not install the shutdown handler: {e}");
    }

    let app = match App::bootstrap(config).await {
        Ok(app) => app,
        Err(e) => {
            error!("startup failed: {e}");
            process::exit(1);
        }
    };
    let pool = app.dispatcher().pool().clone();

    tokio::select! {
        result = app.run() => {
            if let Err(e) = result {
                error!("server stopped: {e}");
                pool.close_all().await;
                process::exit(1);
            }
        }
        _ = shutdown_rx.recv() => {
            pool.close_all().await;
            info!("all host connections closed");
        }
    }
}

/// Group first, the user id would forbid changing it afterwards.
#[cfg(target_os = "linux")]
fn drop_privileges(pgid: Option<u32>, puid: Option<u32>) {
    if let Some(gid) = pgid {
        info!("Setting GID to {gid}");
        unsafe {
            if libc::setgid(gid) != 0 {
                error!("Failed to set GID to {gid}");
            }
        }
    }
    if let Some(uid) = puid {
        info!("Setting UID to {uid}");
        unsafe {
            if libc::setuid(uid) != 0 {
                error!("Failed to set UID to {uid}");
            }
        }
    }
}
