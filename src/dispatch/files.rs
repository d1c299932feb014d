use crate::dispatch::Dispatcher;
use crate::domain::Store;
use crate::error::{Error, Result};
use crate::git::{CommitInfo, History};
use log::warn;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::io::AsyncRead;

impl<S: Store, H: History> Dispatcher<S, H> {
    /// Records a finished edit. The edit itself already happened, so a failed
    /// commit is only logged.
    async fn record(&self, message: String, files: Vec<String>) {
        if let Err(e) = self.history.commit_files(&message, files).await {
            warn!("could not commit \"{message}\": {e}");
        }
    }

    pub async fn file_list(&self) -> Result<BTreeMap<String, Vec<String>>> {
        self.files.list().await
    }

    pub async fn file_create(&self, name: &str) -> Result<()> {
        self.files.create(name).await?;
        self.record(format!("create {name}"), vec![name.to_string()])
            .await;
        Ok(())
    }

    pub async fn file_exists(&self, name: &str) -> Result<bool> {
        self.files.exists(name).await
    }

    pub async fn file_delete(&self, name: &str) -> Result<()> {
        let path = self.files.load_path(name).await?;
        let removed = if path.is_dir() {
            tracked_below(&path, name)
        } else {
            vec![name.to_string()]
        };
        self.files.delete(name).await?;
        self.record(format!("delete {name}"), removed).await;
        Ok(())
    }

    pub async fn file_rename(&self, from: &str, to: &str) -> Result<()> {
        let source = self.files.load_path(from).await?;
        let mut touched = if source.is_dir() {
            tracked_below(&source, from)
        } else {
            vec![from.to_string()]
        };
        self.files.rename(from, to).await?;
        let target = self.files.resolve(to)?;
        if target.is_dir() {
            touched.extend(tracked_below(&target, to));
        } else {
            touched.push(to.to_string());
        }
        self.record(format!("rename {from} to {to}"), touched).await;
        Ok(())
    }

    pub async fn file_save(&self, name: &str, contents: impl AsyncRead + Unpin) -> Result<()> {
        self.files.save(name, contents).await?;
        self.record(format!("update {name}"), vec![name.to_string()])
            .await;
        Ok(())
    }

    pub async fn file_load(&self, name: &str) -> Result<Vec<u8>> {
        self.files.load(name).await
    }

    pub async fn file_path(&self, name: &str) -> Result<PathBuf> {
        self.files.load_path(name).await
    }

    /// Commits that changed `name`, newest first.
    pub async fn file_history(&self, name: &str) -> Result<Vec<CommitInfo>> {
        self.files.resolve(name)?;
        self.history.file_history(name).await
    }

    pub async fn file_at_commit(&self, name: &str, hash: &str) -> Result<Vec<u8>> {
        self.files.resolve(name)?;
        if hash.trim().is_empty() {
            return Err(Error::invalid("commit id must not be empty"));
        }
        self.history.file_at_commit(name, hash).await
    }
}

/// Relative names of the files below `dir`, which is `name` in the root.
fn tracked_below(dir: &std::path::Path, name: &str) -> Vec<String> {
    let prefix = name.trim_end_matches('/');
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let relative = e.path().strip_prefix(dir).ok()?.to_str()?.to_string();
            Some(format!("{prefix}/{relative}"))
        })
        .collect()
}
