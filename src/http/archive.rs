//! Working-tree download handler (`GET /:owner/:repo.tar.gz`).
//!
//! The tarball is produced on the fly by [`crate::mirror::archive`] and
//! streamed to the client as it is written; nothing is cached.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{info, instrument};

use super::handler::AppError;
use crate::git::RepoError;
use crate::AppState;

pub const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// Stream the working tree of `owner/name` as a gzipped tarball.
///
/// `name` is the repository name with the `.tar.gz` suffix already removed
/// and both segments already validated.
#[instrument(skip(state))]
pub async fn handle_archive(
    state: Arc<AppState>,
    owner: &str,
    name: &str,
) -> Result<Response, AppError> {
    let full_name = format!("{owner}/{name}");

    let stream = match crate::mirror::archive::export(state.mirrors.as_ref(), &full_name).await {
        Ok(stream) => stream,
        Err(RepoError::NotMirrored | RepoError::NotFound) => {
            return Err(AppError::NotFound {
                message: "No such repository".into(),
                back_url: Some("/".into()),
            });
        }
        Err(e) => return Err(AppError::internal(e)),
    };

    info!(repo = %full_name, "streaming archive");

    let disposition = format!("attachment; filename=\"{name}{ARCHIVE_SUFFIX}\"");
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}
