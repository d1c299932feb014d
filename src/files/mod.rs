//! The compose root on disk. Every name handed to the store is a path relative
//! to the root; names that would leave it are rejected.

pub mod rank;

use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use log::{debug, info};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Entries never shown in listings.
pub const IGNORED: [&str; 1] = [".git"];

/// Joins a relative `name` onto `root`. Absolute names, `..` components and
/// empty names are rejected, as are names that reach outside the root
/// through a symlink.
pub fn safe_join(root: &Path, name: &str) -> Result<PathBuf> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::invalid("empty file name"));
    }
    let relative = Path::new(name);
    let mut joined = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::invalid(format!("{name} escapes the compose root")));
            }
        }
    }
    if joined == root {
        return Err(Error::invalid("empty file name"));
    }
    if !stays_inside(root, &joined) {
        return Err(Error::invalid(format!("{name} escapes the compose root")));
    }
    Ok(joined)
}

/// Resolves the deepest existing ancestor of `path` and checks that it lies
/// under the resolved `root`. Dangling symlinks on the way are refused.
fn stays_inside(root: &Path, path: &Path) -> bool {
    let Ok(root) = root.canonicalize() else {
        return true;
    };
    let mut current = path;
    loop {
        match current.canonicalize() {
            Ok(real) => return real.starts_with(&root),
            Err(_) if current.symlink_metadata().is_ok() => return false,
            Err(_) => match current.parent() {
                Some(parent) => current = parent,
                None => return true,
            },
        }
    }
}

/// Decodes a base64 file name from the wire. Both the standard and the url
/// safe alphabet are accepted.
pub fn decode_filename(encoded: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(encoded)
        .or_else(|_| URL_SAFE.decode(encoded))
        .map_err(|e| Error::invalid(format!("file name is not base64: {e}")))?;
    String::from_utf8(bytes).map_err(|_| Error::invalid("file name is not utf-8"))
}

fn ignored(name: &str) -> bool {
    IGNORED.contains(&name)
}

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens the store, creating the root directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_absolute() {
            return Err(Error::invalid(format!(
                "compose root {} must be an absolute path",
                root.display()
            )));
        }
        std::fs::create_dir_all(&root)?;
        info!("compose root at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        safe_join(&self.root, name)
    }

    /// Top level entries mapped to the files directly inside them. Plain files
    /// map to an empty list; directories without files are left out.
    pub async fn list(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let mut listing = BTreeMap::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if ignored(&name) {
                continue;
            }
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                let mut children = Vec::new();
                let mut inner = tokio::fs::read_dir(entry.path()).await?;
                while let Some(child) = inner.next_entry().await? {
                    let child_name = child.file_name().to_string_lossy().into_owned();
                    if ignored(&child_name) || !child.file_type().await?.is_file() {
                        continue;
                    }
                    children.push(format!("{name}/{child_name}"));
                }
                if children.is_empty() {
                    continue;
                }
                children.sort_by(|a, b| rank::compare(a, false, b, false));
                listing.insert(name, children);
            } else {
                listing.insert(name, vec![]);
            }
        }
        debug!("listed {} entries", listing.len());
        Ok(listing)
    }

    /// Creates an empty file, or a directory when `name` ends in `/`.
    pub async fn create(&self, name: &str) -> Result<()> {
        let path = self.resolve(name)?;
        if tokio::fs::try_exists(&path).await? {
            return Err(Error::already_exists("file", name));
        }
        if name.trim_end().ends_with('/') {
            tokio::fs::create_dir_all(&path).await?;
        } else {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::File::create(&path).await?;
        }
        info!("created {name}");
        Ok(())
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        let path = self.resolve(name)?;
        Ok(tokio::fs::try_exists(path).await?)
    }

    /// Path of an existing entry.
    pub async fn load_path(&self, name: &str) -> Result<PathBuf> {
        let path = self.resolve(name)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(Error::not_found("file", name));
        }
        Ok(path)
    }

    pub async fn load(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.load_path(name).await?;
        if path.is_dir() {
            return Err(Error::invalid(format!("{name} is a directory")));
        }
        Ok(tokio::fs::read(path).await?)
    }

    /// Replaces the contents of `name` with everything `reader` yields. Readers
    /// of the file see either the old or the new contents.
    pub async fn save(&self, name: &str, mut reader: impl AsyncRead + Unpin) -> Result<()> {
        let path = self.resolve(name)?;
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).await?;
        let size = contents.len();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let dir = path.parent().ok_or_else(|| Error::invalid("file has no parent"))?;
            std::fs::create_dir_all(dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            tmp.write_all(&contents)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| Error::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Upstream(format!("save task failed: {e}")))??;
        debug!("saved {name} ({size} bytes)");
        Ok(())
    }

    /// Removes a file or a directory with everything in it.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let path = self.load_path(name).await?;
        if path.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        info!("deleted {name}");
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let source = self.load_path(from).await?;
        let target = self.resolve(to)?;
        if tokio::fs::try_exists(&target).await? {
            return Err(Error::already_exists("file", to));
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&source, &target).await?;
        info!("renamed {from} -> {to}");
        Ok(())
    }

    /// Name of the top level entry `path` lives in, for grouping.
    pub fn top_level(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.root)
            .ok()?
            .components()
            .next()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn save_then_load_returns_the_same_bytes() {
        let (_dir, store) = store();
        for name in ["web/compose.yaml", "ünïcödé/配置.yml", "notes.md"] {
            let contents = format!("services: {{}} # {name}\n").into_bytes();
            store.save(name, contents.as_slice()).await.unwrap();
            assert_eq!(store.load(name).await.unwrap(), contents);
        }
        // overwrite replaces the whole file
        store.save("notes.md", &b"short"[..]).await.unwrap();
        assert_eq!(store.load("notes.md").await.unwrap(), b"short");
    }

    #[tokio::test]
    async fn listing_skips_ignored_and_empty_directories() {
        let (dir, store) = store();
        std::fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();
        std::fs::create_dir_all(dir.path().join("web/nested")).unwrap();
        std::fs::write(dir.path().join("web/compose.yaml"), "").unwrap();
        std::fs::write(dir.path().join("web/.env"), "").unwrap();
        std::fs::write(dir.path().join("web/nested/deep.txt"), "").unwrap();
        std::fs::write(dir.path().join(".dockman.yml"), "").unwrap();

        let listing = store.list().await.unwrap();
        assert!(!listing.contains_key(".git"));
        assert!(!listing.contains_key("empty"));
        assert_eq!(listing[".dockman.yml"], Vec::<String>::new());
        assert_eq!(listing["web"], ["web/.env", "web/compose.yaml"]);
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let (_dir, store) = store();
        for name in ["../outside", "/etc/passwd", "web/../../x", "", "."] {
            let err = store.create(name).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{name}");
        }
        assert!(store.save("../x", &b""[..]).await.is_err());
        assert!(store.rename("a", "../b").await.is_err());
    }

    #[tokio::test]
    async fn symlinks_out_of_the_root_are_rejected() {
        let (dir, store) = store();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), "x").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("gone"), dir.path().join("dangling")).unwrap();

        for name in ["link/secret", "link/new.yaml", "link", "dangling"] {
            let err = store.resolve(name).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{name}");
        }
        assert!(store.save("link/new.yaml", &b"x"[..]).await.is_err());
        assert!(!outside.path().join("new.yaml").exists());

        // links that stay inside are fine
        std::fs::create_dir_all(dir.path().join("web")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("web"), dir.path().join("alias")).unwrap();
        assert!(store.resolve("alias/compose.yaml").is_ok());
        assert!(store.resolve("fresh/dir/compose.yaml").is_ok());
    }

    #[tokio::test]
    async fn create_delete_and_rename() {
        let (_dir, store) = store();
        store.create("app/compose.yaml").await.unwrap();
        let err = store.create("app/compose.yaml").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert!(store.exists("app/compose.yaml").await.unwrap());

        store.rename("app/compose.yaml", "app/docker-compose.yml").await.unwrap();
        assert!(!store.exists("app/compose.yaml").await.unwrap());
        assert!(store.exists("app/docker-compose.yml").await.unwrap());

        store.delete("app").await.unwrap();
        assert!(!store.exists("app").await.unwrap());
        let err = store.delete("app").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn decodes_wire_file_names() {
        assert_eq!(decode_filename("d2ViL2NvbXBvc2UueWFtbA==").unwrap(), "web/compose.yaml");
        assert_eq!(decode_filename("w7xuaWNvZGUueW1s").unwrap(), "ünicode.yml");
        assert!(decode_filename("not base64!").is_err());
    }

    #[test]
    fn top_level_entry_of_a_path() {
        let (dir, store) = store();
        let path = dir.path().join("web/data/a.txt");
        assert_eq!(store.top_level(&path).as_deref(), Some("web"));
        assert_eq!(store.top_level(Path::new("/elsewhere")), None);
    }
}
