use crate::error::Result;
use crate::shared::HostName;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A known newer image for `(host, image_id)`. An empty `update_ref` means
/// no update is known.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageUpdate {
    pub host: HostName,
    pub image_id: String,
    pub update_ref: String,
}

// An image update repository remembers which images have a newer tag upstream
pub trait ImageUpdateRepository: Send + Sync + 'static + Clone {
    fn lookup_updates(
        &self,
        host: &HostName,
        image_ids: &[String],
    ) -> impl Future<Output = Result<HashMap<String, ImageUpdate>>> + Send;

    fn save_update(&self, update: &ImageUpdate) -> impl Future<Output = Result<()>> + Send;

    fn delete_update(
        &self,
        host: &HostName,
        image_id: &str,
    ) -> impl Future<Output = Result<()>> + Send;
}
