//! Main axum router and HTTP request handlers.
//!
//! Routes:
//! - `GET  /`                   - List mirrors
//! - `GET  /src/`               - List GitHub repositories
//! - `GET  /src/:owner/:repo`   - Show a GitHub repository
//! - `GET  /:owner/:repo`       - Show a mirror, or offer to create one
//! - `GET  /:owner/:repo.tar.gz` - Download a mirror's working tree
//! - `POST /mirror`             - Create / update / track a mirror
//! - `POST /apihook`            - GitHub webhook receiver
//! - `GET  /metrics`            - Prometheus metrics

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{rejection::FormRejection, Form, Path, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tracing::{error, field, info, instrument, Span};

use super::archive::ARCHIVE_SUFFIX;
use super::views::{
    render_error, render_template, NewMirrorView, PrivateAccessView, RepoView, ReposView,
};
use crate::action::{Action, ActionError, Outcome};
use crate::git::{parse_repository_name, RepoError};
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Listings
        .route("/", get(list_mirrors))
        .route("/src/", get(list_remote))
        // Single repositories (and `.tar.gz` downloads)
        .route("/src/{owner}/{repo}", get(show_remote))
        .route("/{owner}/{repo}", get(show_mirror))
        // Actions, webhook, metrics
        .route("/mirror", post(handle_mirror_action))
        .route("/apihook", post(super::webhook::handle_webhook))
        .route("/metrics", get(handle_metrics))
        .method_not_allowed_fallback(method_not_allowed)
        .fallback(not_found)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Form types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct MirrorForm {
    #[serde(default)]
    repo: String,
    #[serde(default)]
    action: String,
    #[serde(default)]
    notrack: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /`
#[instrument(skip_all)]
async fn list_mirrors(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let started = Instant::now();
    let repositories = state
        .mirrors
        .all()
        .await
        .map_err(|e| AppError::internal(e).with_back_url(referer(&headers)))?;

    state.metrics.metrics.mirrors_total.set(repositories.len() as i64);
    info!(
        count = repositories.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "listed mirrors"
    );

    Ok(render_template(ReposView {
        repositories,
        mirrors: true,
    }))
}

/// `GET /src/`
#[instrument(skip_all)]
async fn list_remote(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let started = Instant::now();
    let repositories = state
        .remote
        .all()
        .await
        .map_err(|e| AppError::internal(e).with_back_url(referer(&headers)))?;

    info!(
        count = repositories.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "listed GitHub repositories"
    );

    Ok(render_template(ReposView {
        repositories,
        mirrors: false,
    }))
}

/// `GET /src/:owner/:repo`
#[instrument(skip(state, headers), fields(%owner, %repo))]
async fn show_remote(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    validate_path_segment(&owner, "owner")?;
    validate_path_segment(&repo, "repository")?;
    let full_name = format!("{owner}/{repo}");

    match state.remote.get(&full_name).await {
        Ok(repo) => Ok(render_template(RepoView {
            repo,
            tracking: state.actions.tracking_enabled(),
        })),
        Err(RepoError::NotFound) => Err(AppError::NotFound {
            message: format!("No such repository {full_name:?}"),
            back_url: Some("/src/".into()),
        }),
        Err(e) => Err(AppError::internal(e).with_back_url(referer(&headers))),
    }
}

/// `GET /:owner/:repo` and `GET /:owner/:repo.tar.gz`
#[instrument(skip(state, headers), fields(%owner, %repo))]
async fn show_mirror(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    validate_path_segment(&owner, "owner")?;

    if let Some(name) = repo.strip_suffix(ARCHIVE_SUFFIX) {
        validate_path_segment(name, "repository")?;
        return super::archive::handle_archive(state, &owner, name).await;
    }

    validate_path_segment(&repo, "repository")?;
    let full_name = format!("{owner}/{repo}");

    match state.mirrors.get(&full_name).await {
        Ok(repo) => Ok(render_template(RepoView {
            repo,
            tracking: state.actions.tracking_enabled(),
        })),
        Err(RepoError::NotMirrored) => Ok(render_template(NewMirrorView {
            full_name,
            tracking: state.actions.tracking_enabled(),
        })),
        Err(RepoError::NotFound) => Err(AppError::NotFound {
            message: format!("No such repository {full_name:?}"),
            back_url: Some("/".into()),
        }),
        Err(e) => Err(AppError::internal(e).with_back_url(referer(&headers))),
    }
}

/// `POST /mirror`
#[instrument(skip_all, fields(repo = field::Empty, action = field::Empty))]
async fn handle_mirror_action(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    form: Result<Form<MirrorForm>, FormRejection>,
) -> Result<Response, AppError> {
    let back_url = referer(&headers);
    let Form(form) = form.map_err(|rejection| {
        AppError::bad_request(format!("Invalid mirror form: {}", rejection.body_text()))
            .with_back_url(back_url.clone())
    })?;
    Span::current()
        .record("repo", form.repo.as_str())
        .record("action", form.action.as_str());
    if !form.repo.is_empty() {
        validate_full_name(&form.repo).map_err(|e| e.with_back_url(back_url.clone()))?;
    }

    let callback_url = webhook_url(&headers);
    let outcome = state
        .actions
        .run(
            &form.repo,
            &form.action,
            form.notrack.is_empty(),
            &callback_url,
        )
        .await
        .map_err(|e| AppError::from_action(e, back_url))?;

    match outcome {
        Outcome::Redirect(path) => Ok(Redirect::to(&path).into_response()),
        Outcome::PrivateAccess {
            full_name,
            public_key,
        } => Ok(render_template(PrivateAccessView {
            full_name,
            public_key,
            action: Action::Create.as_str(),
        })),
    }
}

async fn method_not_allowed(method: Method) -> AppError {
    AppError::NotImplemented {
        message: format!("Unsupported method {method}"),
        back_url: Some("/".into()),
    }
}

async fn not_found() -> AppError {
    AppError::NotFound {
        message: "Page not found".into(),
        back_url: Some("/".into()),
    }
}

/// `GET /metrics`
///
/// Returns Prometheus metrics in OpenMetrics text format.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// `true` for a single safe path component: non-empty, no separators, no
/// null bytes, not `.` or `..`.
pub(crate) fn is_valid_segment(segment: &str) -> bool {
    !(segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains(['/', '\\', '\0']))
}

/// Validate that an owner or repository path segment is safe.
pub(crate) fn validate_path_segment(segment: &str, label: &str) -> Result<(), AppError> {
    if segment.is_empty() {
        return Err(AppError::bad_request(format!("{label} must not be empty")));
    }
    if !is_valid_segment(segment) {
        return Err(AppError::bad_request(format!("invalid {label}: {segment:?}")));
    }
    Ok(())
}

/// Validate an `owner/name` repository name.
pub(crate) fn validate_full_name(full_name: &str) -> Result<(), AppError> {
    if !full_name.contains('/') {
        return Err(AppError::bad_request(format!(
            "invalid repository name: {full_name:?}"
        )));
    }
    let (owner, name) = parse_repository_name(full_name);
    validate_path_segment(owner, "owner")?;
    validate_path_segment(name, "repository")
}

/// Callback URL for push webhooks, as seen by the client that made this
/// request.
pub(crate) fn webhook_url(headers: &HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let scheme = match headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
    {
        Some(proto) if proto.eq_ignore_ascii_case("https") => "https",
        _ => "http",
    };
    format!("{scheme}://{host}/apihook")
}

fn referer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::REFERER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTML error pages.
#[derive(Debug)]
pub enum AppError {
    /// Malformed or missing request parameters.
    BadRequest {
        message: String,
        back_url: Option<String>,
    },
    NotFound {
        message: String,
        back_url: Option<String>,
    },
    NotImplemented {
        message: String,
        back_url: Option<String>,
    },
    /// An unexpected internal error. Only `message` is shown to the user.
    Internal {
        message: String,
        back_url: Option<String>,
        source: anyhow::Error,
    },
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        AppError::BadRequest {
            message: message.into(),
            back_url: None,
        }
    }

    pub fn internal(source: impl Into<anyhow::Error>) -> Self {
        AppError::Internal {
            message: "Internal server error".into(),
            back_url: None,
            source: source.into(),
        }
    }

    pub fn with_back_url(mut self, url: Option<String>) -> Self {
        match &mut self {
            AppError::BadRequest { back_url, .. }
            | AppError::NotFound { back_url, .. }
            | AppError::NotImplemented { back_url, .. }
            | AppError::Internal { back_url, .. } => *back_url = url,
        }
        self
    }

    fn from_action(err: ActionError, referer: Option<String>) -> Self {
        let message = err.to_string();
        match err {
            ActionError::MissingRepository | ActionError::Unsupported(_) => AppError::BadRequest {
                message,
                back_url: referer,
            },
            ActionError::NotMirrored(name) => AppError::NotFound {
                message,
                back_url: Some(format!("/src/{name}")),
            },
            ActionError::TrackingUnsupported => AppError::NotImplemented {
                message,
                back_url: referer,
            },
            err @ (ActionError::Track(_) | ActionError::Internal(_)) => AppError::Internal {
                message,
                back_url: referer,
                source: err.into(),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest { message, back_url } => {
                render_error(StatusCode::BAD_REQUEST, &message, back_url.as_deref())
            }
            AppError::NotFound { message, back_url } => {
                render_error(StatusCode::NOT_FOUND, &message, back_url.as_deref())
            }
            AppError::NotImplemented { message, back_url } => {
                render_error(StatusCode::NOT_IMPLEMENTED, &message, back_url.as_deref())
            }
            AppError::Internal {
                message,
                back_url,
                source,
            } => {
                error!(error = %format!("{source:#}"), "internal server error");
                render_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &message,
                    back_url.as_deref(),
                )
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
