//! Mirror actions: `create`, `update` and `track`.
//!
//! [`MirrorActions`] composes the remote catalog, the local mirror store and
//! the (optional) push tracker.  Every failure is classified into an
//! [`ActionError`] whose `Display` text is what the user gets to see; the
//! underlying cause is only logged.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use prometheus_client::encoding::EncodeLabelValue;
use tracing::{error, info, instrument};

use crate::git::{MirrorStore, PushTracker, RemoteCatalog, RepoError};
use crate::metrics::{ActionOutcome, MetricsRegistry};
use crate::ssh::SshKeys;

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Action {
    Create,
    Update,
    Track,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Track => "track",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ActionError;

    /// Case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(Action::Create),
            "update" => Ok(Action::Update),
            "track" => Ok(Action::Track),
            _ => Err(ActionError::Unsupported(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// What the caller should do after a successful action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Send the user to this path (the repository page).
    Redirect(String),
    /// The remote answered 404: most likely a private repository the server
    /// key has no access to yet.
    PrivateAccess {
        full_name: String,
        public_key: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Missing source repository name")]
    MissingRepository,
    #[error("Unsupported action {0:?}")]
    Unsupported(String),
    #[error("Repository {0} was not mirrored yet")]
    NotMirrored(String),
    #[error("Tracking changes not supported")]
    TrackingUnsupported,
    #[error("Failed to set up push web hook, please check logs for details")]
    Track(#[source] RepoError),
    #[error("Internal server error")]
    Internal(#[source] anyhow::Error),
}

impl ActionError {
    fn internal(e: impl Into<anyhow::Error>) -> Self {
        ActionError::Internal(e.into())
    }

    fn outcome(&self) -> ActionOutcome {
        match self {
            ActionError::MissingRepository | ActionError::Unsupported(_) => {
                ActionOutcome::Unsupported
            }
            ActionError::NotMirrored(_) => ActionOutcome::NotMirrored,
            ActionError::TrackingUnsupported => ActionOutcome::Unsupported,
            ActionError::Track(_) | ActionError::Internal(_) => ActionOutcome::Failed,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct MirrorActions {
    remote: Arc<dyn RemoteCatalog>,
    mirrors: Arc<dyn MirrorStore>,
    tracker: Option<Arc<dyn PushTracker>>,
    keys: Arc<SshKeys>,
    metrics: MetricsRegistry,
}

impl MirrorActions {
    pub fn new(
        remote: Arc<dyn RemoteCatalog>,
        mirrors: Arc<dyn MirrorStore>,
        tracker: Option<Arc<dyn PushTracker>>,
        keys: Arc<SshKeys>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            remote,
            mirrors,
            tracker,
            keys,
            metrics,
        }
    }

    pub fn tracking_enabled(&self) -> bool {
        self.tracker.is_some()
    }

    /// Run `action` against `full_name`.
    ///
    /// `track_after_create` asks `create` to also register the push webhook
    /// at `callback_url` when tracking is configured.
    #[instrument(skip(self, callback_url), fields(repo = %full_name))]
    pub async fn run(
        &self,
        full_name: &str,
        action: &str,
        track_after_create: bool,
        callback_url: &str,
    ) -> Result<Outcome, ActionError> {
        if full_name.is_empty() {
            return Err(ActionError::MissingRepository);
        }
        let action: Action = action.parse()?;
        let started = Instant::now();

        let result = match action {
            Action::Create => {
                self.create(full_name, track_after_create, callback_url)
                    .await
            }
            Action::Update => self.update(full_name).await,
            Action::Track => self.track(full_name, callback_url).await,
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(Outcome::Redirect(_)) => {
                self.metrics
                    .metrics
                    .record_action(action, ActionOutcome::Success);
                info!(%action, elapsed_ms, "mirror action complete");
            }
            Ok(Outcome::PrivateAccess { .. }) => {
                self.metrics
                    .metrics
                    .record_action(action, ActionOutcome::PrivateAccess);
                info!(%action, elapsed_ms, "repository not visible, offering server key");
            }
            Err(e) => {
                self.metrics.metrics.record_action(action, e.outcome());
                match e {
                    ActionError::Track(cause) => {
                        error!(%action, error = %cause, "failed to set up push webhook");
                    }
                    ActionError::Internal(cause) => {
                        error!(%action, error = %format!("{cause:#}"), "mirror action failed");
                    }
                    _ => info!(%action, reason = %e, "mirror action rejected"),
                }
            }
        }
        self.metrics
            .metrics
            .mirror_action_duration_seconds
            .get_or_create(&crate::metrics::ActionNameLabels { action })
            .observe(started.elapsed().as_secs_f64());

        result
    }

    async fn create(
        &self,
        full_name: &str,
        track_after_create: bool,
        callback_url: &str,
    ) -> Result<Outcome, ActionError> {
        let repo = match self.remote.get(full_name).await {
            Ok(repo) => repo,
            Err(RepoError::NotFound) => {
                let public_key = self
                    .keys
                    .public_key()
                    .await
                    .map_err(ActionError::internal)?;
                return Ok(Outcome::PrivateAccess {
                    full_name: full_name.to_string(),
                    public_key,
                });
            }
            Err(e) => return Err(ActionError::internal(e)),
        };

        let git_url = repo.git_url.as_deref().ok_or_else(|| {
            ActionError::internal(anyhow::anyhow!(
                "repository {} has no clone URL",
                repo.full_name
            ))
        })?;
        self.mirrors
            .create(&repo.full_name, git_url)
            .await
            .map_err(ActionError::internal)?;

        if track_after_create && self.tracker.is_some() {
            self.track(&repo.full_name, callback_url).await?;
        }

        Ok(Outcome::Redirect(format!("/{}", repo.full_name)))
    }

    async fn update(&self, full_name: &str) -> Result<Outcome, ActionError> {
        let repo = self.mirrored(full_name).await?;
        self.mirrors
            .update(&repo)
            .await
            .map_err(ActionError::internal)?;
        Ok(Outcome::Redirect(format!("/{repo}")))
    }

    async fn track(&self, full_name: &str, callback_url: &str) -> Result<Outcome, ActionError> {
        let tracker = self
            .tracker
            .as_ref()
            .ok_or(ActionError::TrackingUnsupported)?;
        let repo = self.mirrored(full_name).await?;
        tracker
            .track(&repo, callback_url)
            .await
            .map_err(ActionError::Track)?;
        Ok(Outcome::Redirect(format!("/{repo}")))
    }

    /// The mirror's canonical name, or [`ActionError::NotMirrored`].
    async fn mirrored(&self, full_name: &str) -> Result<String, ActionError> {
        match self.mirrors.get(full_name).await {
            Ok(repo) => Ok(repo.full_name),
            Err(RepoError::NotMirrored) => Err(ActionError::NotMirrored(full_name.to_string())),
            Err(e) => Err(ActionError::internal(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::git::{RepoResult, Repository, DEFAULT_MASTER};

    const CALLBACK: &str = "http://mirror.example.com/apihook";

    // ── Stubs ───────────────────────────────────────────────────────────

    /// Knows `a/b` (public) and answers 404 for `a/private`.
    struct StubRemote;

    #[async_trait]
    impl RemoteCatalog for StubRemote {
        async fn all(&self) -> RepoResult<Vec<Repository>> {
            Ok(Vec::new())
        }

        async fn get(&self, full_name: &str) -> RepoResult<Repository> {
            match full_name {
                "a/b" => Ok(Repository {
                    html_url: Some("https://github.com/a/b".into()),
                    git_url: Some("git://github.com/a/b.git".into()),
                    ..Repository::mirror("a/b", DEFAULT_MASTER)
                }),
                "a/private" => Err(RepoError::NotFound),
                _ => Err(anyhow::anyhow!("rate limited").into()),
            }
        }
    }

    #[derive(Default)]
    struct StubStore {
        mirrored: Mutex<HashSet<String>>,
        created: Mutex<Vec<(String, String)>>,
        updated: Mutex<Vec<String>>,
    }

    impl StubStore {
        fn with_mirror(name: &str) -> Self {
            let store = Self::default();
            store.mirrored.lock().unwrap().insert(name.to_string());
            store
        }
    }

    #[async_trait]
    impl MirrorStore for StubStore {
        async fn all(&self) -> RepoResult<Vec<Repository>> {
            Ok(Vec::new())
        }

        async fn get(&self, full_name: &str) -> RepoResult<Repository> {
            if self.mirrored.lock().unwrap().contains(full_name) {
                Ok(Repository::mirror(full_name, DEFAULT_MASTER))
            } else {
                Err(RepoError::NotMirrored)
            }
        }

        async fn create(&self, full_name: &str, git_url: &str) -> RepoResult<()> {
            self.created
                .lock()
                .unwrap()
                .push((full_name.to_string(), git_url.to_string()));
            self.mirrored.lock().unwrap().insert(full_name.to_string());
            Ok(())
        }

        async fn update(&self, full_name: &str) -> RepoResult<()> {
            self.updated.lock().unwrap().push(full_name.to_string());
            Ok(())
        }

        async fn checkout(&self, _full_name: &str, _dest: &Path) -> RepoResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubTracker {
        fail: bool,
        tracked: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl PushTracker for StubTracker {
        async fn track(&self, full_name: &str, callback_url: &str) -> RepoResult<()> {
            if self.fail {
                return Err(anyhow::anyhow!("hook rejected").into());
            }
            self.tracked
                .lock()
                .unwrap()
                .push((full_name.to_string(), callback_url.to_string()));
            Ok(())
        }
    }

    struct Fixture {
        actions: MirrorActions,
        store: Arc<StubStore>,
        tracker: Arc<StubTracker>,
        metrics: MetricsRegistry,
        _keys_dir: tempfile::TempDir,
    }

    fn fixture(store: StubStore, tracker: Option<StubTracker>) -> Fixture {
        let keys_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store);
        let tracker = Arc::new(tracker.unwrap_or_default());
        let metrics = MetricsRegistry::new();
        let actions = MirrorActions::new(
            Arc::new(StubRemote),
            store.clone(),
            Some(tracker.clone() as Arc<dyn PushTracker>),
            Arc::new(SshKeys::new(keys_dir.path().join("id_rsa"))),
            metrics.clone(),
        );
        Fixture {
            actions,
            store,
            tracker,
            metrics,
            _keys_dir: keys_dir,
        }
    }

    fn without_tracker(store: StubStore) -> Fixture {
        let mut f = fixture(store, None);
        f.actions.tracker = None;
        f
    }

    // ── Parsing ─────────────────────────────────────────────────────────

    #[test]
    fn action_parses_case_insensitively() {
        assert_eq!("CrEaTe".parse::<Action>().unwrap(), Action::Create);
        assert_eq!("update".parse::<Action>().unwrap(), Action::Update);
        assert_eq!("TRACK".parse::<Action>().unwrap(), Action::Track);
    }

    #[tokio::test]
    async fn unknown_action_is_rejected() {
        let f = fixture(StubStore::default(), None);
        let err = f.actions.run("a/b", "delete", true, CALLBACK).await.unwrap_err();
        assert!(matches!(err, ActionError::Unsupported(ref a) if a == "delete"));
        assert!(err.to_string().starts_with("Unsupported action"));
    }

    #[tokio::test]
    async fn missing_repository_is_rejected() {
        let f = fixture(StubStore::default(), None);
        let err = f.actions.run("", "create", true, CALLBACK).await.unwrap_err();
        assert_eq!(err.to_string(), "Missing source repository name");
    }

    // ── Create ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn create_mirrors_and_tracks() {
        let f = fixture(StubStore::default(), None);

        let outcome = f.actions.run("a/b", "create", true, CALLBACK).await.unwrap();

        assert_eq!(outcome, Outcome::Redirect("/a/b".into()));
        assert_eq!(
            *f.store.created.lock().unwrap(),
            vec![("a/b".to_string(), "git://github.com/a/b.git".to_string())]
        );
        assert_eq!(
            *f.tracker.tracked.lock().unwrap(),
            vec![("a/b".to_string(), CALLBACK.to_string())]
        );
        let text = f.metrics.encode().unwrap();
        assert!(text.contains(
            "doppelganger_mirror_actions_total{action=\"Create\",outcome=\"Success\"} 1"
        ));
    }

    #[tokio::test]
    async fn create_with_notrack_skips_tracking() {
        let f = fixture(StubStore::default(), None);

        f.actions.run("a/b", "create", false, CALLBACK).await.unwrap();

        assert_eq!(f.store.created.lock().unwrap().len(), 1);
        assert!(f.tracker.tracked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_without_tracker_succeeds() {
        let f = without_tracker(StubStore::default());

        let outcome = f.actions.run("a/b", "create", true, CALLBACK).await.unwrap();
        assert_eq!(outcome, Outcome::Redirect("/a/b".into()));
    }

    #[tokio::test]
    async fn create_twice_is_idempotent() {
        let f = fixture(StubStore::default(), None);

        f.actions.run("a/b", "create", true, CALLBACK).await.unwrap();
        f.actions.run("a/b", "create", true, CALLBACK).await.unwrap();

        assert_eq!(f.store.created.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn create_of_invisible_repository_offers_public_key() {
        let f = fixture(StubStore::default(), None);

        let outcome = f
            .actions
            .run("a/private", "create", true, CALLBACK)
            .await
            .unwrap();

        match outcome {
            Outcome::PrivateAccess {
                full_name,
                public_key,
            } => {
                assert_eq!(full_name, "a/private");
                assert!(public_key.starts_with("ssh-rsa "));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(f.store.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_with_remote_failure_is_internal() {
        let f = fixture(StubStore::default(), None);

        let err = f
            .actions
            .run("a/flaky", "create", true, CALLBACK)
            .await
            .unwrap_err();

        assert!(matches!(err, ActionError::Internal(_)));
        assert_eq!(err.to_string(), "Internal server error");
    }

    #[tokio::test]
    async fn create_with_failing_tracker_reports_hook_error() {
        let f = fixture(
            StubStore::default(),
            Some(StubTracker {
                fail: true,
                ..StubTracker::default()
            }),
        );

        let err = f.actions.run("a/b", "create", true, CALLBACK).await.unwrap_err();
        assert!(matches!(err, ActionError::Track(_)));
    }

    // ── Update ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn update_existing_mirror() {
        let f = fixture(StubStore::with_mirror("a/b"), None);

        let outcome = f.actions.run("a/b", "Update", true, CALLBACK).await.unwrap();

        assert_eq!(outcome, Outcome::Redirect("/a/b".into()));
        assert_eq!(*f.store.updated.lock().unwrap(), vec!["a/b".to_string()]);
    }

    #[tokio::test]
    async fn update_unknown_mirror_is_not_mirrored() {
        let f = fixture(StubStore::default(), None);

        let err = f.actions.run("x/y", "update", true, CALLBACK).await.unwrap_err();

        assert_eq!(err.to_string(), "Repository x/y was not mirrored yet");
        assert!(f.store.updated.lock().unwrap().is_empty());
    }

    // ── Track ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn track_without_tracker_is_unsupported() {
        let f = without_tracker(StubStore::with_mirror("a/b"));

        let err = f.actions.run("a/b", "track", true, CALLBACK).await.unwrap_err();
        assert_eq!(err.to_string(), "Tracking changes not supported");
    }

    #[tokio::test]
    async fn track_unknown_mirror_is_not_mirrored() {
        let f = fixture(StubStore::default(), None);

        let err = f.actions.run("x/y", "track", true, CALLBACK).await.unwrap_err();
        assert!(matches!(err, ActionError::NotMirrored(_)));
        assert!(f.tracker.tracked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn track_existing_mirror() {
        let f = fixture(StubStore::with_mirror("a/b"), None);

        f.actions.run("a/b", "track", false, CALLBACK).await.unwrap();

        assert_eq!(
            *f.tracker.tracked.lock().unwrap(),
            vec![("a/b".to_string(), CALLBACK.to_string())]
        );
    }
}
