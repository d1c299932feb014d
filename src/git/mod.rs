//! Git history of the compose root. Every host owns a branch named after it;
//! switching hosts commits pending edits and checks out the host's branch.

use crate::error::{Error, Result};
use crate::shared::HostName;
use chrono::{DateTime, Utc};
use git2::build::CheckoutBuilder;
use git2::{
    BranchType, Commit, ErrorCode, IndexAddOption, Oid, Reference, Repository,
    RepositoryInitOptions, Signature, Sort, Status,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub const DEFAULT_BRANCH: &str = "main";
const AUTO_COMMIT_MESSAGE: &str = "dockman: automatic commit";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub email: String,
}

impl Default for Author {
    fn default() -> Self {
        Self {
            name: "dockman".to_string(),
            email: "dockman@localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    pub hash: String,
    pub author: String,
    pub email: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// What the rest of the application needs from the history of the compose
/// root.
pub trait History: Send + Sync + 'static {
    /// Commits pending edits and moves the worktree to the branch of a host.
    fn commit_on_switch(&self, branch: &HostName) -> impl Future<Output = Result<()>> + Send;

    fn commit_files(
        &self,
        message: &str,
        files: Vec<String>,
    ) -> impl Future<Output = Result<Option<String>>> + Send;

    fn file_history(&self, file: &str) -> impl Future<Output = Result<Vec<CommitInfo>>> + Send;

    fn file_at_commit(
        &self,
        path: &str,
        hash: &str,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

#[derive(Clone)]
pub struct Historian {
    repo: Arc<Mutex<Repository>>,
    root: PathBuf,
    author: Author,
}

impl Historian {
    /// Opens the repository at `root`, initialising it on first start, and
    /// commits whatever the tree holds. Staging that takes longer than
    /// `staging_timeout` fails with StagingDelay.
    ///
    /// The staging job is not cancelled by the timeout. It keeps the
    /// repository locked until it is done and its commit still lands, so a
    /// later `open` of the same root finds the tree already committed.
    pub async fn open(root: &Path, author: Author, staging_timeout: Duration) -> Result<Self> {
        let path = root.to_path_buf();
        let repo = tokio::task::spawn_blocking(move || open_or_init(&path))
            .await
            .map_err(|e| Error::Upstream(format!("git task failed: {e}")))??;
        let historian = Self {
            repo: Arc::new(Mutex::new(repo)),
            root: root.to_path_buf(),
            author,
        };

        let staging = historian.with_repo(|repo, author| {
            stage_all(repo)?;
            commit_index(repo, author, "dockman: track existing files")
        });
        match tokio::time::timeout(staging_timeout, staging).await {
            Ok(result) => {
                if let Some(oid) = result? {
                    info!("committed existing files of the compose root as {oid}");
                }
            }
            Err(_) => {
                warn!(
                    "staging {} did not finish within {}s",
                    historian.root.display(),
                    staging_timeout.as_secs()
                );
                return Err(Error::StagingDelay(staging_timeout.as_secs()));
            }
        }
        Ok(historian)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn with_repo<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Repository, &Author) -> Result<T> + Send + 'static,
    {
        let repo = self.repo.clone();
        let author = self.author.clone();
        tokio::task::spawn_blocking(move || {
            let repo = repo.lock().unwrap_or_else(PoisonError::into_inner);
            f(&repo, &author)
        })
        .await
        .map_err(|e| Error::Upstream(format!("git task failed: {e}")))?
    }

    pub async fn current_branch(&self) -> Result<String> {
        self.with_repo(|repo, _| {
            let head = repo.head()?;
            Ok(head.shorthand().unwrap_or(DEFAULT_BRANCH).to_string())
        })
        .await
    }

    /// Commits all pending changes, then checks out `branch`, creating it
    /// from the current commit when it does not exist yet.
    pub async fn switch_branch(&self, branch: &str) -> Result<()> {
        let branch = branch.to_string();
        self.with_repo(move |repo, author| switch_branch(repo, author, &branch))
            .await
    }

    /// Commits the listed files. Files git does not know and ignored files
    /// are skipped. Returns `None` when nothing changed.
    pub async fn commit(&self, message: &str, files: Vec<String>) -> Result<Option<String>> {
        let message = message.to_string();
        self.with_repo(move |repo, author| {
            let mut index = repo.index()?;
            for file in &files {
                let path = Path::new(file);
                match repo.status_file(path) {
                    Ok(status) if status.contains(Status::IGNORED) => {
                        debug!("not committing ignored file {file}");
                    }
                    Ok(status) if status.intersects(Status::WT_DELETED | Status::INDEX_DELETED) => {
                        index.remove_path(path)?;
                    }
                    Ok(_) => index.add_path(path)?,
                    Err(e) if e.code() == ErrorCode::NotFound => {
                        debug!("not committing absent file {file}");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            index.write()?;
            let oid = commit_index(repo, author, &message)?;
            Ok(oid.map(|o| o.to_string()))
        })
        .await
    }

    /// Stages everything and commits. Returns `None` on a clean tree.
    pub async fn commit_all(&self, message: &str) -> Result<Option<String>> {
        let message = message.to_string();
        self.with_repo(move |repo, author| {
            stage_all(repo)?;
            Ok(commit_index(repo, author, &message)?.map(|o| o.to_string()))
        })
        .await
    }

    /// Commits of the current branch that touched `file`, newest first.
    pub async fn list_commits(&self, file: &str) -> Result<Vec<CommitInfo>> {
        let file = file.to_string();
        self.with_repo(move |repo, _| list_commits(repo, Path::new(&file)))
            .await
    }

    /// Contents of `path` as of commit `hash` (full or abbreviated).
    pub async fn load_file_at_commit(&self, path: &str, hash: &str) -> Result<Vec<u8>> {
        if hash.trim().is_empty() {
            return Err(Error::invalid("missing commit id"));
        }
        let path = path.to_string();
        let hash = hash.to_string();
        self.with_repo(move |repo, _| {
            let commit = repo
                .revparse_single(&hash)
                .and_then(|o| o.peel_to_commit())
                .map_err(|e| match e.code() {
                    ErrorCode::NotFound | ErrorCode::Ambiguous | ErrorCode::InvalidSpec => {
                        Error::not_found("commit", hash.as_str())
                    }
                    _ => e.into(),
                })?;
            let entry = commit
                .tree()?
                .get_path(Path::new(&path))
                .map_err(|_| Error::not_found("file", format!("{path}@{hash}")))?;
            let blob = repo.find_blob(entry.id())?;
            Ok(blob.content().to_vec())
        })
        .await
    }
}

impl History for Historian {
    async fn commit_on_switch(&self, branch: &HostName) -> Result<()> {
        self.switch_branch(branch.as_str()).await
    }

    async fn commit_files(&self, message: &str, files: Vec<String>) -> Result<Option<String>> {
        self.commit(message, files).await
    }

    async fn file_history(&self, file: &str) -> Result<Vec<CommitInfo>> {
        self.list_commits(file).await
    }

    async fn file_at_commit(&self, path: &str, hash: &str) -> Result<Vec<u8>> {
        self.load_file_at_commit(path, hash).await
    }
}

fn open_or_init(root: &Path) -> Result<Repository> {
    match Repository::open(root) {
        Ok(repo) => {
            debug!("opened git repository at {}", root.display());
            Ok(repo)
        }
        Err(e) if e.code() == ErrorCode::NotFound => {
            info!("initialising git repository at {}", root.display());
            let mut options = RepositoryInitOptions::new();
            options.initial_head(DEFAULT_BRANCH);
            Ok(Repository::init_opts(root, &options)?)
        }
        Err(e) => Err(e.into()),
    }
}

fn stage_all(repo: &Repository) -> Result<()> {
    let mut index = repo.index()?;
    index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
    index.update_all(["."].iter(), None)?;
    index.write()?;
    Ok(())
}

fn head_commit(repo: &Repository) -> Result<Option<Commit<'_>>> {
    match repo.head() {
        Ok(head) => Ok(Some(head.peel_to_commit()?)),
        Err(e) if matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Commits the index onto HEAD unless its tree equals HEAD's tree.
fn commit_index(repo: &Repository, author: &Author, message: &str) -> Result<Option<Oid>> {
    let mut index = repo.index()?;
    let tree_id = index.write_tree()?;
    let parent = head_commit(repo)?;
    match &parent {
        Some(parent) if parent.tree_id() == tree_id => return Ok(None),
        None if index.is_empty() => return Ok(None),
        _ => {}
    }
    let tree = repo.find_tree(tree_id)?;
    let signature = Signature::now(&author.name, &author.email)?;
    let parents: Vec<&Commit> = parent.iter().collect();
    let oid = repo.commit(
        Some("HEAD"),
        &signature,
        &signature,
        message,
        &tree,
        &parents,
    )?;
    debug!("committed {oid}: {message}");
    Ok(Some(oid))
}

fn switch_branch(repo: &Repository, author: &Author, branch: &str) -> Result<()> {
    let refname = format!("refs/heads/{branch}");
    if !Reference::is_valid_name(&refname) {
        return Err(Error::invalid(format!("{branch} is not a valid branch name")));
    }

    stage_all(repo)?;
    commit_index(repo, author, AUTO_COMMIT_MESSAGE)?;

    let head = match head_commit(repo)? {
        Some(commit) => commit,
        None => {
            let tree = repo.find_tree(repo.treebuilder(None)?.write()?)?;
            let signature = Signature::now(&author.name, &author.email)?;
            let oid = repo.commit(
                Some("HEAD"),
                &signature,
                &signature,
                "dockman: initial commit",
                &tree,
                &[],
            )?;
            repo.find_commit(oid)?
        }
    };

    if repo.find_branch(branch, BranchType::Local).is_err() {
        info!("creating branch {branch} at {}", head.id());
        repo.branch(branch, &head, false)?;
    }
    repo.set_head(&refname)?;
    repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
    debug!("checked out {branch}");
    Ok(())
}

fn list_commits(repo: &Repository, path: &Path) -> Result<Vec<CommitInfo>> {
    if head_commit(repo)?.is_none() {
        return Ok(vec![]);
    }
    let mut walk = repo.revwalk()?;
    walk.push_head()?;
    walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;

    let mut commits = Vec::new();
    for oid in walk {
        let commit = repo.find_commit(oid?)?;
        let current = commit.tree()?.get_path(path).ok().map(|e| e.id());
        let previous = match commit.parent(0) {
            Ok(parent) => parent.tree()?.get_path(path).ok().map(|e| e.id()),
            Err(_) => None,
        };
        if current == previous {
            continue;
        }
        let author = commit.author();
        commits.push(CommitInfo {
            hash: commit.id().to_string(),
            author: author.name().unwrap_or_default().to_string(),
            email: author.email().unwrap_or_default().to_string(),
            timestamp: DateTime::from_timestamp(commit.time().seconds(), 0).unwrap_or_default(),
            message: commit.summary().unwrap_or_default().to_string(),
        });
    }
    Ok(commits)
}
