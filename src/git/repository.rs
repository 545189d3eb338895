//! Repository and commit model shared by the remote catalog and the local
//! mirror store, plus the capability traits both sides implement.
//!
//! A [`Repository`] can originate from two places: the upstream forge (a
//! *remote* view, which always carries an `html_url`) or the on-disk mirror
//! tree (a *mirror* view, which never does).  Callers compose the three
//! capabilities ([`RemoteCatalog`], [`MirrorStore`], [`PushTracker`])
//! independently; none of them extends another.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Branch name assumed when a repository does not report its default branch.
pub const DEFAULT_MASTER: &str = "master";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Classified failures of repository lookups and mutations.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// The remote forge answered 404 for the requested name.
    #[error("not found")]
    NotFound,
    /// The name does not resolve to a mirror under the mirror root.
    #[error("mirror not found")]
    NotMirrored,
    /// Anything else. The message is safe to log; user-facing code shows a
    /// generic text instead.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type RepoResult<T> = std::result::Result<T, RepoError>;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// A single commit. Immutable once constructed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Commit {
    pub sha: String,
    pub message: String,
    pub author: String,
    pub committer: Option<String>,
    /// Zero value (Unix epoch) when the date could not be parsed.
    pub date: DateTime<Utc>,
}

impl Commit {
    /// `true` for the empty commit returned when git had nothing to report.
    pub fn is_empty(&self) -> bool {
        self.sha.is_empty()
    }

    /// First 7 characters of the SHA, for display.
    pub fn short_sha(&self) -> &str {
        &self.sha[..self.sha.len().min(7)]
    }
}

/// A git repository, either as seen on the remote forge or as a local mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    /// `owner/name`; for mirrors, the path relative to the mirror root.
    pub full_name: String,
    pub description: Option<String>,
    /// Default branch.
    pub master: String,
    /// Link to the repository on the forge. `None` for mirror views.
    pub html_url: Option<String>,
    /// Clone URL chosen by visibility. `None` for mirror views.
    pub git_url: Option<String>,
    pub latest_master_commit: Option<Commit>,
}

impl Repository {
    /// A mirror view of `full_name` with the given default branch.
    pub fn mirror(full_name: impl Into<String>, master: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            description: None,
            master: master.into(),
            html_url: None,
            git_url: None,
            latest_master_commit: None,
        }
    }

    /// Presentation helper: mirror views carry no forge URL.
    pub fn mirrored(&self) -> bool {
        self.html_url.is_none()
    }
}

/// Split `owner/name` once on `/`.
///
/// Callers guarantee the shape (the HTTP layer validates both segments), so a
/// name without a slash yields an empty repository part rather than an error.
pub fn parse_repository_name(full_name: &str) -> (&str, &str) {
    full_name.split_once('/').unwrap_or((full_name, ""))
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Read-only view of the upstream forge's repository collection.
#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    /// Every repository accessible with the configured token.
    async fn all(&self) -> RepoResult<Vec<Repository>>;

    /// A single repository with its latest default-branch commit attached.
    async fn get(&self, full_name: &str) -> RepoResult<Repository>;
}

/// The set of mirrors on local disk.
#[async_trait]
pub trait MirrorStore: Send + Sync {
    async fn all(&self) -> RepoResult<Vec<Repository>>;

    /// Fails with [`RepoError::NotMirrored`] when no mirror exists.
    async fn get(&self, full_name: &str) -> RepoResult<Repository>;

    /// Mirror-clone `git_url` into the slot for `full_name`, replacing any
    /// stale directory there.
    async fn create(&self, full_name: &str, git_url: &str) -> RepoResult<()>;

    /// Synchronise an existing mirror with its upstream.
    async fn update(&self, full_name: &str) -> RepoResult<()>;

    /// Check the mirror out as a working tree into `dest`.
    async fn checkout(&self, full_name: &str, dest: &Path) -> RepoResult<()>;
}

/// Registration of push notifications on the forge.
#[async_trait]
pub trait PushTracker: Send + Sync {
    /// Make sure a `push` webhook pointing at `callback_url` exists.
    async fn track(&self, full_name: &str, callback_url: &str) -> RepoResult<()>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
