use crate::error::{Error, Result};
use crate::shared::HostName;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DATABASE_FILE: &str = "dockman.db";
pub const PREFERENCES_FILES: [&str; 2] = [".dockman.yml", ".dockman.yaml"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enable: bool,
    pub user: String,
    pub pass: String,
    /// Hours.
    pub cookie_expiry: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enable: false,
            user: String::new(),
            pass: String::new(),
            cookie_expiry: 24 * 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub verbose: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            verbose: false,
        }
    }
}

impl LogConfig {
    pub fn filter(&self) -> &str {
        if self.verbose { "debug" } else { &self.level }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub author_name: String,
    pub author_email: String,
    pub staging_timeout_secs: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            author_name: "dockman".to_string(),
            author_email: "dockman@localhost".to_string(),
            staging_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    #[serde(deserialize_with = "csv")]
    pub origins: Vec<String>,
    pub ui_path: Option<PathBuf>,
    /// Address shown for published ports.
    pub machine_addr: String,
    pub compose_root: PathBuf,
    /// Holds the database.
    pub config_dir: PathBuf,
    pub dockman_yaml_path: Option<PathBuf>,
    pub puid: Option<u32>,
    pub pgid: Option<u32>,
    pub auth: AuthConfig,
    pub updater_host: Option<HostName>,
    pub log: LogConfig,
    pub disable_local: bool,
    pub default_host: Option<HostName>,
    pub git: GitConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8866,
            origins: vec![],
            ui_path: None,
            machine_addr: "0.0.0.0".to_string(),
            compose_root: PathBuf::from("/compose"),
            config_dir: PathBuf::from("/config"),
            dockman_yaml_path: None,
            puid: None,
            pgid: None,
            auth: AuthConfig::default(),
            updater_host: None,
            log: LogConfig::default(),
            disable_local: false,
            default_host: None,
            git: GitConfig::default(),
        }
    }
}

/// Accepts `a,b,c` as well as a list.
fn csv<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Csv {
        Joined(String),
        List(Vec<String>),
    }
    Ok(match Csv::deserialize(deserializer)? {
        Csv::Joined(joined) => joined
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Csv::List(list) => list,
    })
}

impl Config {
    /// Defaults, then the yaml file, then `DOCKMAN_` variables (`__` separates
    /// nested keys), then `overrides`.
    pub fn figment(file: Option<&Path>, overrides: impl Serialize) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(file) = file {
            figment = figment.merge(Yaml::file(file));
        }
        figment
            .merge(Env::prefixed("DOCKMAN_").split("__"))
            .merge(Serialized::defaults(overrides))
    }

    pub fn load(file: Option<&Path>, overrides: impl Serialize) -> Result<Self> {
        let config: Config = Self::figment(file, overrides).extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.compose_root.is_absolute() {
            return Err(Error::invalid(format!(
                "compose root {} must be an absolute path",
                self.compose_root.display()
            )));
        }
        if self.auth.enable && (self.auth.user.is_empty() || self.auth.pass.is_empty()) {
            return Err(Error::invalid("auth is enabled but user or pass is empty"));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.config_dir.join(DATABASE_FILE)
    }

    /// The configured preferences file, else an existing `.dockman.yml` or
    /// `.dockman.yaml` in the compose root, else `.dockman.yml`.
    pub fn preferences_path(&self) -> PathBuf {
        if let Some(path) = &self.dockman_yaml_path {
            return path.clone();
        }
        PREFERENCES_FILES
            .iter()
            .map(|name| self.compose_root.join(name))
            .find(|path| path.exists())
            .unwrap_or_else(|| self.compose_root.join(PREFERENCES_FILES[0]))
    }

    pub fn staging_timeout(&self) -> Duration {
        Duration::from_secs(self.git.staging_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SortPreference {
    pub field: String,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TablePreference {
    pub sort: SortPreference,
}

/// UI preferences kept next to the compose files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Preferences {
    pub pinned_files: BTreeMap<String, i64>,
    pub use_compose_folders: bool,
    pub disable_compose_quick_actions: bool,
    pub tab_limit: u32,
    pub volumes: TablePreference,
    pub networks: TablePreference,
    pub images: TablePreference,
    pub containers: TablePreference,
}

impl Preferences {
    /// Reads the file, or the defaults when it does not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) if content.trim().is_empty() => Ok(Self::default()),
            Ok(content) => Ok(serde_yaml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let dir = path
                .parent()
                .ok_or_else(|| Error::invalid("preferences file has no parent"))?;
            std::fs::create_dir_all(dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            tmp.write_all(content.as_bytes())?;
            tmp.persist(&path).map_err(|e| Error::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Upstream(format!("save task failed: {e}")))?
    }
}
