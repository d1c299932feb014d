use crate::docker::{Progress, wire};
use crate::error::{Error, ErrorKind, Result};
use crate::shared::ImageName;
use bollard::Docker;
use bollard::query_parameters::{
    CreateImageOptions, ListContainersOptions, ListImagesOptions, PruneImagesOptions,
    RemoveImageOptions,
};
use futures_util::StreamExt;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Deserialize, Debug, Default)]
#[serde(default, rename_all = "PascalCase")]
struct WireImage {
    id: String,
    repo_tags: Option<Vec<String>>,
    repo_digests: Option<Vec<String>>,
    created: i64,
    size: i64,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default, rename_all = "PascalCase")]
struct WireContainerImage {
    #[serde(rename = "ImageID")]
    image_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImageView {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
    pub created: i64,
    pub size: i64,
    pub containers: usize,
    /// Reference of a newer image, empty when none is known.
    pub update_available: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PruneMode {
    /// Every image no container uses.
    #[default]
    Unused,
    /// Dangling images only.
    Untagged,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub deleted: Vec<String>,
    pub space_reclaimed: i64,
}

/// Outcome of a pull.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pulled {
    /// `sha256:` digest reported by the registry, empty if none was reported.
    pub digest: String,
    /// Whether any layer was downloaded.
    pub downloaded: bool,
}

/// Pulls `image`, forwarding the daemon's status messages to `progress`.
pub async fn pull_image(
    docker: &Docker,
    image: &ImageName,
    progress: &mut Progress<'_>,
) -> Result<Pulled> {
    let (name, tag) = image.split();
    let options = CreateImageOptions {
        from_image: Some(name.to_owned()),
        tag: Some(tag.to_owned()),
        ..Default::default()
    };
    info!("pulling {image}");
    let mut pulled = Pulled::default();
    let mut pull_stream = docker.create_image(Some(options), None, None);
    while let Some(result) = pull_stream.next().await {
        let output = result?;
        let Some(status) = output.status else {
            continue;
        };
        if status.contains("Download complete")
            || status.contains("Pull complete")
            || status.contains("Downloaded newer image for")
        {
            pulled.downloaded = true;
        }
        if status.contains("Digest:")
            && let Some(pos) = status.find("sha256:")
        {
            status[pos..].clone_into(&mut pulled.digest);
        }
        match (output.id, output.progress) {
            (Some(id), Some(bar)) => progress.line(format!("{id}: {status} {bar}")).await,
            (Some(id), None) => progress.line(format!("{id}: {status}")).await,
            _ => progress.line(status).await,
        }
    }
    debug!("pulled {image} (digest: {})", pulled.digest);
    Ok(pulled)
}

/// Stable identifier of the local copy of `image`: the first repo digest, else
/// the image id. Images that are not present locally map to an empty string.
pub async fn digest_of(docker: &Docker, image: &str) -> Result<String> {
    match docker.inspect_image(image).await {
        Ok(inspect) => {
            let wire: WireImage = wire(&inspect)?;
            Ok(wire
                .repo_digests
                .unwrap_or_default()
                .into_iter()
                .next()
                .unwrap_or(wire.id))
        }
        Err(e) => {
            let e = Error::from(e);
            if e.kind() == ErrorKind::NotFound {
                Ok(String::new())
            } else {
                Err(e)
            }
        }
    }
}

/// Id of the local image `image` resolves to.
pub async fn image_id(docker: &Docker, image: &str) -> Result<String> {
    let inspect = docker.inspect_image(image).await?;
    Ok(inspect.id.unwrap_or_default())
}

pub async fn list(docker: &Docker) -> Result<Vec<ImageView>> {
    let images = docker
        .list_images(Some(ListImagesOptions {
            all: false,
            ..Default::default()
        }))
        .await?;
    let containers = docker
        .list_containers(Some(ListContainersOptions {
            all: true,
            ..Default::default()
        }))
        .await?;

    let mut usage: HashMap<String, usize> = HashMap::new();
    for container in containers {
        let container: WireContainerImage = wire(&container)?;
        *usage.entry(container.image_id).or_default() += 1;
    }

    let mut views = Vec::with_capacity(images.len());
    for image in images {
        let image: WireImage = wire(&image)?;
        views.push(ImageView {
            containers: usage.get(&image.id).copied().unwrap_or(0),
            id: image.id,
            repo_tags: image.repo_tags.unwrap_or_default(),
            repo_digests: image.repo_digests.unwrap_or_default(),
            created: image.created,
            size: image.size,
            update_available: String::new(),
        });
    }
    views.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.id.cmp(&b.id)));
    Ok(views)
}

/// Annotates each image with a known update reference.
pub fn annotate(images: &mut [ImageView], updates: &HashMap<String, String>) {
    for image in images {
        if let Some(update) = updates.get(&image.id) {
            image.update_available = update.clone();
        }
    }
}

/// Removes one image and returns the ids docker reports as deleted.
pub async fn remove(docker: &Docker, id: &str, force: bool) -> Result<Vec<String>> {
    let deleted = docker
        .remove_image(
            id,
            Some(RemoveImageOptions {
                force,
                ..Default::default()
            }),
            None,
        )
        .await?;
    let mut ids: Vec<String> = deleted.into_iter().filter_map(|d| d.deleted).collect();
    if ids.is_empty() {
        ids.push(id.to_string());
    }
    info!("removed image {id}");
    Ok(ids)
}

pub async fn prune(docker: &Docker, mode: PruneMode) -> Result<PruneReport> {
    let dangling = match mode {
        PruneMode::Unused => "false",
        PruneMode::Untagged => "true",
    };
    let filters = HashMap::from([("dangling".to_string(), vec![dangling.to_string()])]);
    let response = docker
        .prune_images(Some(PruneImagesOptions {
            filters: Some(filters),
        }))
        .await?;

    let deleted: HashSet<String> = response
        .images_deleted
        .unwrap_or_default()
        .into_iter()
        .filter_map(|d| d.deleted)
        .collect();
    let mut deleted: Vec<String> = deleted.into_iter().collect();
    deleted.sort();
    let report = PruneReport {
        deleted,
        space_reclaimed: response.space_reclaimed.unwrap_or(0),
    };
    info!(
        "pruned {} image(s), reclaimed {} bytes",
        report.deleted.len(),
        report.space_reclaimed
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_image_reads_daemon_keys() {
        let image: WireImage = serde_json::from_value(serde_json::json!({
            "Id": "sha256:abc",
            "RepoTags": ["nginx:1.25"],
            "RepoDigests": null,
            "Created": 1700000000,
            "Size": 42,
            "Containers": -1
        }))
        .unwrap();
        assert_eq!(image.id, "sha256:abc");
        assert_eq!(image.repo_tags.unwrap(), ["nginx:1.25"]);
        assert!(image.repo_digests.is_none());
        assert_eq!(image.size, 42);
    }

    #[test]
    fn annotate_marks_known_updates() {
        let mut images = vec![
            ImageView {
                id: "sha256:abc".to_string(),
                ..Default::default()
            },
            ImageView {
                id: "sha256:def".to_string(),
                ..Default::default()
            },
        ];
        let updates = HashMap::from([("sha256:abc".to_string(), "nginx:1.26".to_string())]);
        annotate(&mut images, &updates);
        assert_eq!(images[0].update_available, "nginx:1.26");
        assert_eq!(images[1].update_available, "");
    }
}
