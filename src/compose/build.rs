use crate::compose::model::Service;
use crate::docker::{Progress, wire};
use crate::error::{Error, Result};
use bollard::Docker;
use bollard::query_parameters::BuildImageOptions;
use bytes::Bytes;
use futures_util::StreamExt;
use log::{debug, info};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use walkdir::WalkDir;

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct WireBuildInfo {
    stream: Option<String>,
    status: Option<String>,
    error: Option<String>,
    #[serde(rename = "errorDetail")]
    error_detail: Option<WireErrorDetail>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct WireErrorDetail {
    message: Option<String>,
}

/// Tar archive of a build context. `.git` is left out.
pub fn context_archive(context: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    let walker = WalkDir::new(context)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");
    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        let Ok(relative) = entry.path().strip_prefix(context) else {
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        if entry.file_type().is_dir() {
            builder.append_dir(relative, entry.path())?;
        } else {
            builder.append_path_with_name(entry.path(), relative)?;
        }
    }
    Ok(builder.into_inner()?)
}

/// Builds the image of `service` and tags it with the service's image name.
pub async fn build_service(
    docker: &Docker,
    service: &Service,
    progress: &mut Progress<'_>,
) -> Result<()> {
    let Some(build) = &service.build else {
        return Ok(());
    };
    if !build.context.is_dir() {
        return Err(Error::not_found(
            "build context",
            build.context.display().to_string(),
        ));
    }

    progress.line(format!("building {} for {}", service.image, service.name)).await;
    let context = build.context.clone();
    let archive = tokio::task::spawn_blocking(move || context_archive(&context))
        .await
        .map_err(|e| Error::Upstream(format!("archive task failed: {e}")))??;
    debug!("build context of {} is {} bytes", service.name, archive.len());

    let options = BuildImageOptions {
        dockerfile: build.dockerfile.clone(),
        t: Some(service.image.clone()),
        rm: true,
        buildargs: Some(
            build
                .args
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<_, _>>(),
        ),
        target: build.target.clone().unwrap_or_default(),
        ..Default::default()
    };
    let mut stream = docker.build_image(options, None, Some(bollard::body_full(Bytes::from(archive))));
    while let Some(item) = stream.next().await {
        let info: WireBuildInfo = wire(item?)?;
        if let Some(message) = info.error_detail.and_then(|d| d.message).or(info.error) {
            progress.line(&message).await;
            return Err(Error::Upstream(message));
        }
        if let Some(line) = info.stream.or(info.status) {
            for line in line.lines().filter(|l| !l.trim().is_empty()) {
                progress.line(line).await;
            }
        }
    }
    info!("built {} for {}", service.image, service.name);
    Ok(())
}
