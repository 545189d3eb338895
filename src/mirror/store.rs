//! On-disk mirror tree.
//!
//! Mirrors are bare repositories stored at `{root}/{owner}/{name}`.  Nothing
//! besides the repositories themselves is persisted; every [`Repository`]
//! returned here is re-derived from git on demand.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::git::{Commit, GitCommand, MirrorStore, RepoError, RepoResult, Repository};

/// [`MirrorStore`] backed by a directory of `git clone --mirror` repositories.
#[derive(Clone)]
pub struct MirroredRepositories {
    root: PathBuf,
    git: Arc<dyn GitCommand>,
}

impl MirroredRepositories {
    pub fn new(root: impl Into<PathBuf>, git: Arc<dyn GitCommand>) -> Self {
        Self {
            root: root.into(),
            git,
        }
    }

    /// Location of the mirror for `full_name`.
    ///
    /// The name is joined verbatim; callers validate the `owner/name` shape.
    pub fn mirror_path(&self, full_name: &str) -> PathBuf {
        self.root.join(full_name)
    }

    async fn repository_from_dir(&self, full_name: String, path: &Path) -> Repository {
        let master = self.git.current_branch(path).await;
        let mut repo = Repository::mirror(full_name, master);
        repo.latest_master_commit = commit_if_present(self.git.last_commit(path).await);
        repo
    }

    /// `path` relative to the root, with forward slashes.
    fn full_name_of(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        Some(parts.join("/"))
    }
}

fn commit_if_present(commit: Commit) -> Option<Commit> {
    (!commit.is_empty()).then_some(commit)
}

#[async_trait]
impl MirrorStore for MirroredRepositories {
    /// Depth-first walk of the mirror root.  Directories that are
    /// repositories are emitted and not descended into; everything else is
    /// searched for nested mirrors.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    async fn all(&self) -> RepoResult<Vec<Repository>> {
        let mut repos = Vec::new();
        let mut stack = vec![self.root.clone()];

        while let Some(dir) = stack.pop() {
            if dir != self.root && self.git.is_repository(&dir).await {
                match self.full_name_of(&dir) {
                    Some(full_name) => repos.push(self.repository_from_dir(full_name, &dir).await),
                    None => warn!(path = %dir.display(), "skipping mirror with a non UTF-8 path"),
                }
                continue;
            }

            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .with_context(|| format!("failed to read directory: {}", dir.display()))?;

            let mut children = Vec::new();
            while let Some(entry) = entries
                .next_entry()
                .await
                .with_context(|| format!("failed to read directory: {}", dir.display()))?
            {
                let file_type = entry
                    .file_type()
                    .await
                    .with_context(|| format!("failed to stat {}", entry.path().display()))?;
                if file_type.is_dir() {
                    children.push(entry.path());
                }
            }

            // Reverse order on the stack so siblings are visited alphabetically.
            children.sort_unstable_by(|a, b| b.cmp(a));
            stack.extend(children);
        }

        debug!(count = repos.len(), "enumerated mirrors");
        Ok(repos)
    }

    #[instrument(skip(self))]
    async fn get(&self, full_name: &str) -> RepoResult<Repository> {
        let path = self.mirror_path(full_name);
        if !self.git.is_repository(&path).await {
            return Err(RepoError::NotMirrored);
        }

        Ok(self.repository_from_dir(full_name.to_string(), &path).await)
    }

    #[instrument(skip(self))]
    async fn create(&self, full_name: &str, git_url: &str) -> RepoResult<()> {
        let path = self.mirror_path(full_name);

        // A leftover from an earlier (possibly cancelled) clone would make
        // `git clone` refuse to run.
        match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => {
                info!(path = %path.display(), "removing existing mirror directory before clone");
                let removed = if meta.is_dir() {
                    tokio::fs::remove_dir_all(&path).await
                } else {
                    tokio::fs::remove_file(&path).await
                };
                removed.with_context(|| format!("failed to remove {}", path.display()))?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("failed to stat {}", path.display()))
                    .into());
            }
        }

        self.git.clone_mirror(git_url, &path).await?;
        info!(path = %path.display(), "mirror created");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update(&self, full_name: &str) -> RepoResult<()> {
        self.git.update_remote(&self.mirror_path(full_name)).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(dest = %dest.display()))]
    async fn checkout(&self, full_name: &str, dest: &Path) -> RepoResult<()> {
        let path = self.mirror_path(full_name);
        if !self.git.is_repository(&path).await {
            return Err(RepoError::NotMirrored);
        }

        self.git.clone_worktree(&path, dest).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use chrono::{TimeZone, Utc};

    use super::*;

    /// Treats every directory containing a `HEAD` file as a repository.
    #[derive(Default)]
    struct StubGit {
        branch: Option<String>,
        commit: Commit,
        fail_clone: bool,
        checked: Mutex<Vec<PathBuf>>,
        updated: Mutex<Vec<PathBuf>>,
        cloned: Mutex<Vec<(String, PathBuf)>>,
    }

    #[async_trait]
    impl GitCommand for StubGit {
        async fn is_repository(&self, path: &Path) -> bool {
            self.checked.lock().unwrap().push(path.to_path_buf());
            path.is_dir() && path.join("HEAD").is_file()
        }

        async fn current_branch(&self, _path: &Path) -> String {
            self.branch.clone().unwrap_or_else(|| "master".into())
        }

        async fn last_commit(&self, _path: &Path) -> Commit {
            self.commit.clone()
        }

        async fn clone_mirror(&self, url: &str, dest: &Path) -> anyhow::Result<()> {
            if self.fail_clone {
                anyhow::bail!("failed to clone {url} to {}", dest.display());
            }
            std::fs::create_dir_all(dest)?;
            std::fs::write(dest.join("HEAD"), "ref: refs/heads/master\n")?;
            self.cloned
                .lock()
                .unwrap()
                .push((url.to_string(), dest.to_path_buf()));
            Ok(())
        }

        async fn clone_worktree(&self, src: &Path, dest: &Path) -> anyhow::Result<()> {
            std::fs::create_dir_all(dest)?;
            std::fs::write(dest.join("FROM"), src.display().to_string())?;
            Ok(())
        }

        async fn update_remote(&self, path: &Path) -> anyhow::Result<()> {
            self.updated.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }
    }

    fn make_mirror(root: &Path, name: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("HEAD"), "ref: refs/heads/master\n").unwrap();
    }

    fn store(root: &Path, git: Arc<StubGit>) -> MirroredRepositories {
        MirroredRepositories::new(root, git)
    }

    #[tokio::test]
    async fn get_on_non_mirror_directory_is_not_mirrored() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("a/b")).unwrap();

        let store = store(tmp.path(), Arc::new(StubGit::default()));
        assert!(matches!(store.get("a/b").await, Err(RepoError::NotMirrored)));
        assert!(matches!(store.get("x/y").await, Err(RepoError::NotMirrored)));
    }

    #[tokio::test]
    async fn get_on_mirror_returns_branch_and_commit() {
        let tmp = tempfile::tempdir().unwrap();
        make_mirror(tmp.path(), "a/b");

        let commit = Commit {
            sha: "abc123".into(),
            author: "Jon Doe".into(),
            message: "HI MOM".into(),
            date: Utc.with_ymd_and_hms(2016, 4, 23, 16, 12, 39).unwrap(),
            committer: None,
        };
        let git = Arc::new(StubGit {
            branch: Some("production".into()),
            commit: commit.clone(),
            ..StubGit::default()
        });

        let repo = store(tmp.path(), git).get("a/b").await.unwrap();
        assert_eq!(repo.full_name, "a/b");
        assert_eq!(repo.master, "production");
        assert_eq!(repo.latest_master_commit, Some(commit));
        assert!(repo.mirrored());
    }

    #[tokio::test]
    async fn get_without_commit_leaves_it_unset() {
        let tmp = tempfile::tempdir().unwrap();
        make_mirror(tmp.path(), "a/b");

        let repo = store(tmp.path(), Arc::new(StubGit::default()))
            .get("a/b")
            .await
            .unwrap();
        assert!(repo.latest_master_commit.is_none());
    }

    #[tokio::test]
    async fn all_finds_nested_mirrors_without_descending_into_them() {
        let tmp = tempfile::tempdir().unwrap();
        make_mirror(tmp.path(), "alice/one");
        make_mirror(tmp.path(), "alice/two");
        make_mirror(tmp.path(), "bob/three");
        // A directory inside a mirror must never be checked.
        std::fs::create_dir_all(tmp.path().join("alice/one/refs/heads")).unwrap();
        // Stray files and empty owners are ignored.
        std::fs::write(tmp.path().join("alice/notes.txt"), "x").unwrap();
        std::fs::create_dir_all(tmp.path().join("carol")).unwrap();

        let git = Arc::new(StubGit::default());
        let repos = store(tmp.path(), Arc::clone(&git)).all().await.unwrap();

        let names: Vec<&str> = repos.iter().map(|r| r.full_name.as_str()).collect();
        assert_eq!(names, vec!["alice/one", "alice/two", "bob/three"]);

        let checked = git.checked.lock().unwrap();
        assert!(!checked.iter().any(|p| p.starts_with(tmp.path().join("alice/one/refs"))));
        let unique: HashSet<_> = checked.iter().collect();
        assert_eq!(unique.len(), checked.len(), "a directory was checked twice");
    }

    #[tokio::test]
    async fn all_on_empty_root() {
        let tmp = tempfile::tempdir().unwrap();
        let repos = store(tmp.path(), Arc::new(StubGit::default()))
            .all()
            .await
            .unwrap();
        assert!(repos.is_empty());
    }

    #[tokio::test]
    async fn all_fails_when_root_is_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let result = store(&tmp.path().join("missing"), Arc::new(StubGit::default()))
            .all()
            .await;
        assert!(matches!(result, Err(RepoError::Other(_))));
    }

    #[tokio::test]
    async fn create_clones_into_named_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let git = Arc::new(StubGit::default());
        let store = store(tmp.path(), Arc::clone(&git));

        store
            .create("a/b", "git@github.com:a/b.git")
            .await
            .unwrap();

        let cloned = git.cloned.lock().unwrap();
        assert_eq!(
            *cloned,
            vec![("git@github.com:a/b.git".to_string(), tmp.path().join("a/b"))]
        );
        drop(cloned);
        assert_eq!(store.get("a/b").await.unwrap().full_name, "a/b");
    }

    #[tokio::test]
    async fn create_replaces_stale_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let stale = tmp.path().join("a/b");
        std::fs::create_dir_all(stale.join("partial")).unwrap();
        std::fs::write(stale.join("partial/objects"), "junk").unwrap();

        let store = store(tmp.path(), Arc::new(StubGit::default()));
        store.create("a/b", "https://example.com/a/b").await.unwrap();
        // Creating twice is fine as well.
        store.create("a/b", "https://example.com/a/b").await.unwrap();

        assert!(!stale.join("partial").exists());
        assert!(stale.join("HEAD").is_file());
    }

    #[tokio::test]
    async fn create_failure_leaves_no_directory() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("a/b/leftover")).unwrap();

        let git = Arc::new(StubGit {
            fail_clone: true,
            ..StubGit::default()
        });
        let err = store(tmp.path(), git)
            .create("a/b", "https://example.com/a/b")
            .await
            .unwrap_err();

        assert!(matches!(err, RepoError::Other(_)));
        assert!(!tmp.path().join("a/b").exists());
    }

    #[tokio::test]
    async fn update_runs_remote_update_in_mirror() {
        let tmp = tempfile::tempdir().unwrap();
        let git = Arc::new(StubGit::default());
        store(tmp.path(), Arc::clone(&git))
            .update("a/b")
            .await
            .unwrap();
        assert_eq!(*git.updated.lock().unwrap(), vec![tmp.path().join("a/b")]);
    }

    #[tokio::test]
    async fn checkout_requires_mirror() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("out/b");
        let store = store(tmp.path(), Arc::new(StubGit::default()));

        assert!(matches!(
            store.checkout("a/b", &dest).await,
            Err(RepoError::NotMirrored)
        ));

        make_mirror(tmp.path(), "a/b");
        store.checkout("a/b", &dest).await.unwrap();
        assert!(dest.join("FROM").is_file());
    }
}
