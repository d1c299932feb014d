pub mod build;
pub mod engine;
pub mod interpolate;
pub mod loader;
pub mod model;
pub mod sync;

pub use engine::ComposeEngine;
pub use loader::Loader;
pub use model::Project;

/// Labels docker compose puts on everything it manages; containers created
/// here carry the same ones so both tools recognise each other's stacks.
pub mod labels {
    pub const PROJECT: &str = "com.docker.compose.project";
    pub const SERVICE: &str = "com.docker.compose.service";
    pub const VERSION: &str = "com.docker.compose.version";
    pub const WORKING_DIR: &str = "com.docker.compose.project.working_dir";
    pub const CONFIG_FILES: &str = "com.docker.compose.project.config_files";
    pub const ONEOFF: &str = "com.docker.compose.oneoff";
    pub const CONTAINER_NUMBER: &str = "com.docker.compose.container-number";

    pub const COMPOSE_VERSION: &str = concat!("dockman-", env!("CARGO_PKG_VERSION"));
}

/// File names recognised as compose manifests, in lookup order.
pub const MANIFEST_NAMES: [&str; 4] = [
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];
