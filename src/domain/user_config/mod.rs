use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_UPDATER_INTERVAL_SECS: u64 = 12 * 60 * 60;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdaterSettings {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: DEFAULT_UPDATER_INTERVAL_SECS,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UiPreferences {
    #[serde(default)]
    pub pinned_files: BTreeMap<String, i64>,
    #[serde(default)]
    pub sort_orders: BTreeMap<String, String>,
    #[serde(default)]
    pub tab_limit: Option<u32>,
}

/// The single user configuration row (id = 1).
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserConfig {
    #[serde(default)]
    pub updater: UpdaterSettings,
    #[serde(default)]
    pub ui: UiPreferences,
}

pub trait UserConfigRepository: Send + Sync + 'static + Clone {
    /// Returns the stored config, creating the default row when absent.
    fn get_user_config(&self) -> impl Future<Output = Result<UserConfig>> + Send;

    fn save_user_config(&self, config: &UserConfig) -> impl Future<Output = Result<()>> + Send;
}
