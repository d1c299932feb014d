use crate::domain::image_updates::ports::{ImageUpdate, ImageUpdateRepository};
use crate::error::Result;
use crate::shared::HostName;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;

/// Image-update tracker. Reads are served from the repository; the reset
/// hook wakes the background checker so it picks up new settings.
#[derive(Clone)]
pub struct Service<IR: ImageUpdateRepository> {
    repository: IR,
    reset: Arc<Notify>,
}

impl<IR: ImageUpdateRepository> Service<IR> {
    pub fn new(repository: IR) -> Self {
        Self {
            repository,
            reset: Arc::new(Notify::new()),
        }
    }

    /// Returns the subset of `image_ids` for which an update is recorded.
    pub async fn lookup(
        &self,
        host: &HostName,
        image_ids: &[String],
    ) -> Result<HashMap<String, String>> {
        if image_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let updates = self.repository.lookup_updates(host, image_ids).await?;
        Ok(updates
            .into_iter()
            .filter(|(_, u)| !u.update_ref.is_empty())
            .map(|(id, u)| (id, u.update_ref))
            .collect())
    }

    pub async fn save(&self, host: &HostName, image_id: &str, update_ref: &str) -> Result<()> {
        self.repository
            .save_update(&ImageUpdate {
                host: host.clone(),
                image_id: image_id.to_string(),
                update_ref: update_ref.to_string(),
            })
            .await
    }

    pub async fn delete(&self, host: &HostName, image_id: &str) -> Result<()> {
        self.repository.delete_update(host, image_id).await
    }

    pub fn reset(&self) {
        self.reset.notify_one();
    }

    pub fn reset_signal(&self) -> Arc<Notify> {
        self.reset.clone()
    }
}
