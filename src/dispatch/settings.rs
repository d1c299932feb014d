use crate::config::Preferences;
use crate::dispatch::Dispatcher;
use crate::domain::Store;
use crate::domain::user_config::{UserConfig, UserConfigRepository};
use crate::error::{Error, Result};
use crate::git::History;
use crate::shared::HostName;
use log::info;
use serde::{Deserialize, Serialize};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    pub version: String,
    pub active_host: HostName,
}

/// Stored user configuration together with the preferences file of the
/// compose root.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    #[serde(default)]
    pub config: UserConfig,
    #[serde(default)]
    pub preferences: Preferences,
}

impl<S: Store, H: History> Dispatcher<S, H> {
    pub async fn app_info(&self) -> AppInfo {
        AppInfo {
            version: VERSION.to_string(),
            active_host: self.pool.active_name().await,
        }
    }

    pub async fn changelog(&self) -> Result<String> {
        Err(Error::Unimplemented("changelog".to_string()))
    }

    pub fn version(&self) -> &'static str {
        VERSION
    }

    pub async fn user_settings(&self) -> Result<UserSettings> {
        Ok(UserSettings {
            config: self.store.get_user_config().await?,
            preferences: Preferences::load(&self.options.preferences_path).await?,
        })
    }

    /// Stores both halves. A change of the updater settings wakes the
    /// background checker.
    pub async fn save_user_settings(&self, settings: &UserSettings) -> Result<()> {
        let previous = self.store.get_user_config().await?;
        self.store.save_user_config(&settings.config).await?;
        settings
            .preferences
            .save(&self.options.preferences_path)
            .await?;
        if previous.updater != settings.config.updater {
            info!(
                "updater settings changed: enabled={} interval={}s",
                settings.config.updater.enabled, settings.config.updater.interval_secs
            );
            self.tracker.reset();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::fixture;
    use crate::error::ErrorKind;
    use std::time::Duration;

    #[tokio::test]
    async fn changing_updater_settings_wakes_the_checker() {
        let fx = fixture(&["local"]).await;
        let d = &fx.dispatcher;
        let reset = d.tracker().reset_signal();

        let mut settings = d.user_settings().await.unwrap();
        assert_eq!(settings, UserSettings::default());

        settings.preferences.tab_limit = 4;
        d.save_user_settings(&settings).await.unwrap();
        let woken = tokio::time::timeout(Duration::from_millis(50), reset.notified()).await;
        assert!(woken.is_err());

        settings.config.updater.enabled = true;
        d.save_user_settings(&settings).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), reset.notified())
            .await
            .unwrap();

        assert_eq!(d.user_settings().await.unwrap(), settings);
        assert!(fx.root.path().join(".dockman.yml").exists());
    }

    #[tokio::test]
    async fn info_reports_the_active_host() {
        let fx = fixture(&["local"]).await;
        let info = fx.dispatcher.app_info().await;
        assert_eq!(info.active_host, HostName::local());
        assert_eq!(info.version, VERSION);
        let err = fx.dispatcher.changelog().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unimplemented);
    }
}
