//! Mirrors bind-mounted sources of a project to a remote host, at the same
//! absolute paths, before the project is started there.

use crate::compose::Project;
use crate::docker::Progress;
use crate::error::{Error, Result};
use log::{debug, info};
use russh_sftp::client::SftpSession;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

/// The few filesystem operations the syncer needs on the remote side.
/// Paths are absolute and `/` separated.
pub trait RemoteFs: Send + Sync {
    fn create_dir_all(&self, path: &str) -> impl Future<Output = Result<()>> + Send;
    fn write_file(
        &self,
        path: &str,
        contents: Vec<u8>,
        mode: u32,
    ) -> impl Future<Output = Result<()>> + Send;
}

impl RemoteFs for SftpSession {
    async fn create_dir_all(&self, path: &str) -> Result<()> {
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            if self.try_exists(current.as_str()).await? {
                continue;
            }
            if let Err(e) = self.create_dir(current.as_str()).await {
                // lost a race with another writer
                if !self.try_exists(current.as_str()).await? {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    async fn write_file(&self, path: &str, contents: Vec<u8>, mode: u32) -> Result<()> {
        let mut file = self.create(path).await?;
        file.write_all(&contents).await?;
        file.shutdown().await?;
        let mut attributes = self.metadata(path).await?;
        attributes.permissions = Some(mode);
        self.set_metadata(path, attributes).await?;
        Ok(())
    }
}

struct Entry {
    path: PathBuf,
    is_dir: bool,
    mode: u32,
}

fn remote_path(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| Error::invalid(format!("{} is not valid utf-8", path.display())))
}

fn walk(source: &Path) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(source).follow_links(true) {
        let entry = entry.map_err(std::io::Error::from)?;
        let metadata = entry.metadata().map_err(std::io::Error::from)?;
        entries.push(Entry {
            path: entry.into_path(),
            is_dir: metadata.is_dir(),
            mode: metadata.permissions().mode() & 0o7777,
        });
    }
    Ok(entries)
}

/// Copies one bind source, a file or a whole tree, to the same path remotely.
/// Returns the number of files written.
async fn sync_source<F: RemoteFs>(fs: &F, source: &Path) -> Result<usize> {
    let path = source.to_path_buf();
    let entries = tokio::task::spawn_blocking(move || walk(&path))
        .await
        .map_err(|e| Error::Upstream(format!("walk task failed: {e}")))??;

    let mut written = 0;
    for entry in entries {
        let target = remote_path(&entry.path)?;
        if entry.is_dir {
            fs.create_dir_all(&target).await?;
            continue;
        }
        if let Some(parent) = entry.path.parent() {
            fs.create_dir_all(&remote_path(parent)?).await?;
        }
        let contents = tokio::fs::read(&entry.path).await?;
        fs.write_file(&target, contents, entry.mode).await?;
        written += 1;
    }
    Ok(written)
}

/// Mirrors every bind source of `project` that lives under `root`. Sources
/// that are relative, outside the root or missing are skipped. The first
/// failing source aborts the sync.
pub async fn sync_project<F: RemoteFs>(
    fs: &F,
    root: &Path,
    project: &Project,
    progress: &mut Progress<'_>,
) -> Result<usize> {
    let mut total = 0;
    for service in project.services.values() {
        for source in service.bind_sources() {
            let path = Path::new(source);
            if !path.is_absolute() {
                debug!("skipping relative bind source {source} of {}", service.name);
                continue;
            }
            if !path.starts_with(root) {
                debug!("skipping bind source {source} of {}: outside the compose root", service.name);
                continue;
            }
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                debug!("skipping bind source {source} of {}: does not exist", service.name);
                continue;
            }

            progress.line(format!("syncing {source} for {}", service.name)).await;
            let written = sync_source(fs, path)
                .await
                .map_err(|e| Error::SyncFailed {
                    service: service.name.to_string(),
                    path: path.to_path_buf(),
                    source: Box::new(e),
                })?;
            total += written;
        }
    }
    if total > 0 {
        info!("synced {total} file(s) of project {}", project.name);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::Loader;
    use crate::error::ErrorKind;
    use std::fs;

    /// Remote filesystem rooted in a local directory.
    struct LocalFs {
        root: PathBuf,
    }

    impl LocalFs {
        fn local(&self, path: &str) -> PathBuf {
            self.root.join(path.trim_start_matches('/'))
        }
    }

    impl RemoteFs for LocalFs {
        async fn create_dir_all(&self, path: &str) -> Result<()> {
            Ok(tokio::fs::create_dir_all(self.local(path)).await?)
        }

        async fn write_file(&self, path: &str, contents: Vec<u8>, mode: u32) -> Result<()> {
            let local = self.local(path);
            tokio::fs::write(&local, contents).await?;
            tokio::fs::set_permissions(&local, std::fs::Permissions::from_mode(mode)).await?;
            Ok(())
        }
    }

    /// Always fails to write.
    struct ReadOnlyFs;

    impl RemoteFs for ReadOnlyFs {
        async fn create_dir_all(&self, _path: &str) -> Result<()> {
            Ok(())
        }

        async fn write_file(&self, path: &str, _contents: Vec<u8>, _mode: u32) -> Result<()> {
            Err(Error::Upstream(format!("permission denied: {path}")))
        }
    }

    fn project(root: &Path, compose: &str) -> Project {
        fs::create_dir_all(root.join("app")).unwrap();
        fs::write(root.join("app/compose.yaml"), compose).unwrap();
        Loader::new(root).load("app/compose.yaml").unwrap()
    }

    #[tokio::test]
    async fn mirrors_bind_sources_with_their_mode() {
        let root = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let data = root.path().join("app/data");
        fs::create_dir_all(data.join("nested")).unwrap();
        fs::write(data.join("a.txt"), "hello").unwrap();
        fs::write(data.join("nested/run.sh"), "#!/bin/sh").unwrap();
        fs::set_permissions(data.join("nested/run.sh"), fs::Permissions::from_mode(0o750))
            .unwrap();
        fs::write(root.path().join("app/single.conf"), "k=v").unwrap();

        let project = project(
            root.path(),
            "services:\n  api:\n    image: alpine\n    volumes:\n      - ./data:/data\n      - ./single.conf:/etc/single.conf:ro\n",
        );
        let fs_remote = LocalFs {
            root: remote.path().to_path_buf(),
        };
        let written = sync_project(&fs_remote, root.path(), &project, &mut Progress::none())
            .await
            .unwrap();
        assert_eq!(written, 3);

        let mirrored = fs_remote.local(data.join("a.txt").to_str().unwrap());
        assert_eq!(fs::read_to_string(&mirrored).unwrap(), "hello");
        let script = fs_remote.local(data.join("nested/run.sh").to_str().unwrap());
        assert_eq!(fs::metadata(script).unwrap().permissions().mode() & 0o777, 0o750);
        let single = fs_remote.local(root.path().join("app/single.conf").to_str().unwrap());
        assert_eq!(fs::read_to_string(single).unwrap(), "k=v");
    }

    #[tokio::test]
    async fn skips_sources_outside_the_root_and_missing_ones() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let compose = format!(
            "services:\n  api:\n    image: alpine\n    volumes:\n      - {}:/outside\n      - ./missing:/missing\n      - named:/named\nvolumes:\n  named: {{}}\n",
            outside.path().display()
        );
        fs::write(outside.path().join("secret"), "x").unwrap();
        let project = project(root.path(), &compose);

        let written = sync_project(&ReadOnlyFs, root.path(), &project, &mut Progress::none())
            .await
            .unwrap();
        assert_eq!(written, 0);
    }

    #[tokio::test]
    async fn failure_names_service_and_path() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("app/data")).unwrap();
        fs::write(root.path().join("app/data/a.txt"), "hello").unwrap();
        let project = project(
            root.path(),
            "services:\n  api:\n    image: alpine\n    volumes:\n      - ./data:/data\n",
        );

        let err = sync_project(&ReadOnlyFs, root.path(), &project, &mut Progress::none())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SyncFailed);
        match err {
            Error::SyncFailed { service, path, .. } => {
                assert_eq!(service, "api");
                assert_eq!(path, root.path().join("app/data"));
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
