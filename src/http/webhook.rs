//! GitHub webhook receiver (`POST /apihook`).
//!
//! Supports `ping` and `push`.  A push to the mirror's default branch runs
//! `git remote update` on the mirror; pushes to any other branch are
//! acknowledged and ignored.  Deliveries for the same repository are not
//! serialized: concurrent updates converge once the last one finishes.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{debug, error, info, instrument, warn};

use crate::git::{parse_repository_name, MirrorStore, RepoError};
use crate::metrics::{MetricsRegistry, WebhookEvent, WebhookOutcome};
use crate::AppState;

use super::handler::is_valid_segment;

pub const EVENT_HEADER: &str = "x-github-event";

const BRANCH_PREFIX: &str = "refs/heads/";

#[derive(Debug, Deserialize)]
struct PushEvent {
    #[serde(rename = "ref")]
    git_ref: String,
    repository: PushRepository,
}

#[derive(Debug, Deserialize)]
struct PushRepository {
    full_name: String,
}

pub struct WebhookDispatcher {
    mirrors: Arc<dyn MirrorStore>,
    metrics: MetricsRegistry,
}

impl WebhookDispatcher {
    pub fn new(mirrors: Arc<dyn MirrorStore>, metrics: MetricsRegistry) -> Self {
        Self { mirrors, metrics }
    }

    /// Handle one delivery of `event` with JSON `body`.
    #[instrument(skip(self, body))]
    pub async fn dispatch(&self, event: &str, body: &[u8]) -> (StatusCode, String) {
        let (outcome, reply) = match event {
            "ping" => (WebhookOutcome::Pong, (StatusCode::OK, "PONG".to_string())),
            "push" => self.push(body).await,
            other => {
                warn!(event = %other, "unsupported webhook event");
                (
                    WebhookOutcome::Rejected,
                    (
                        StatusCode::BAD_REQUEST,
                        format!("Unsupported event {other:?}"),
                    ),
                )
            }
        };
        self.metrics
            .metrics
            .record_webhook(WebhookEvent::from_header(event), outcome);
        reply
    }

    async fn push(&self, body: &[u8]) -> (WebhookOutcome, (StatusCode, String)) {
        let started = Instant::now();

        let event: PushEvent = match serde_json::from_slice(body) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "failed to parse push event payload");
                return (
                    WebhookOutcome::Rejected,
                    (StatusCode::BAD_REQUEST, "Malformed push event".to_string()),
                );
            }
        };
        let full_name = event.repository.full_name;

        let (owner, name) = parse_repository_name(&full_name);
        if !is_valid_segment(owner) || !is_valid_segment(name) {
            warn!(repo = %full_name, "push event names an invalid repository");
            return (
                WebhookOutcome::Rejected,
                (StatusCode::BAD_REQUEST, "Invalid repository name".to_string()),
            );
        }

        let repo = match self.mirrors.get(&full_name).await {
            Ok(repo) => repo,
            Err(RepoError::NotFound | RepoError::NotMirrored) => {
                info!(repo = %full_name, "push event for a repository that is not mirrored");
                return (
                    WebhookOutcome::NotMirrored,
                    (StatusCode::NOT_FOUND, "Not found".to_string()),
                );
            }
            Err(e) => {
                error!(repo = %full_name, error = %e, "failed to look up mirror");
                return internal_error();
            }
        };

        let branch = event
            .git_ref
            .strip_prefix(BRANCH_PREFIX)
            .unwrap_or(&event.git_ref);
        if branch != repo.master {
            debug!(
                repo = %repo.full_name,
                mirrored = %repo.master,
                received = %branch,
                "skipping push to non-default branch"
            );
            return (WebhookOutcome::Skipped, (StatusCode::OK, String::new()));
        }

        if let Err(e) = self.mirrors.update(&repo.full_name).await {
            error!(repo = %repo.full_name, error = %e, "failed to update mirror");
            return internal_error();
        }

        info!(
            repo = %repo.full_name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "updated mirror from push event"
        );
        (WebhookOutcome::Updated, (StatusCode::OK, "OK".to_string()))
    }
}

fn internal_error() -> (WebhookOutcome, (StatusCode, String)) {
    (
        WebhookOutcome::Failed,
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error".to_string(),
        ),
    )
}

/// `POST /apihook`
pub async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let event = headers
        .get(EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    state.webhooks.dispatch(event, &body).await.into_response()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
