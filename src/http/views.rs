//! HTML views and the two rendering entry points the handlers use:
//! [`render_template`] for pages and [`render_error`] for error pages.

use askama::Template;
use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};

use crate::git::Repository;

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// Repository listing, shared by the mirror index and the GitHub index.
#[derive(Template)]
#[template(path = "repos/index.html")]
pub struct ReposView {
    pub repositories: Vec<Repository>,
    pub mirrors: bool,
}

#[derive(Template)]
#[template(path = "repo/show.html")]
pub struct RepoView {
    pub repo: Repository,
    /// Offer push tracking; off when no webhook callback is configured.
    pub tracking: bool,
}

/// Offered when a repository has no mirror yet.
#[derive(Template)]
#[template(path = "repo/mirror.html")]
pub struct NewMirrorView {
    pub full_name: String,
    pub tracking: bool,
}

/// Asks the operator to grant the server key access to a private repository.
#[derive(Template)]
#[template(path = "mirror/private_access.html")]
pub struct PrivateAccessView {
    pub full_name: String,
    pub public_key: String,
    pub action: &'static str,
}

#[derive(Template)]
#[template(path = "errors/internal_error.html")]
pub struct InternalErrorView {
    pub message: String,
    pub back_url: Option<String>,
}

#[derive(Template)]
#[template(path = "errors/not_found.html")]
pub struct NotFoundView {
    pub message: String,
    pub back_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Render a page with `200 OK`.
pub fn render_template<T: Template>(template: T) -> Response {
    match template.render() {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "template rendering failed");
            render_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                None,
            )
        }
    }
}

/// Render an error page with `status`, falling back to plain text when the
/// error template itself fails.
pub fn render_error(status: StatusCode, message: &str, back_url: Option<&str>) -> Response {
    let message = message.to_string();
    let back_url = back_url.map(str::to_string);
    let rendered = if status == StatusCode::NOT_FOUND {
        NotFoundView { message: message.clone(), back_url }.render()
    } else {
        InternalErrorView { message: message.clone(), back_url }.render()
    };

    match rendered {
        Ok(html) => (status, Html(html)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to render error view");
            (status, message).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::git::Commit;

    fn repo() -> Repository {
        Repository {
            description: Some("Mirror <everything>".into()),
            latest_master_commit: Some(Commit {
                sha: "0123456789abcdef".into(),
                message: "HI MOM".into(),
                author: "Jon Doe".into(),
                committer: None,
                date: chrono::Utc.with_ymd_and_hms(2016, 4, 23, 16, 12, 39).unwrap(),
            }),
            ..Repository::mirror("a/b", "production")
        }
    }

    #[test]
    fn listing_links_depend_on_origin() {
        let mirrors = ReposView {
            repositories: vec![repo()],
            mirrors: true,
        }
        .render()
        .unwrap();
        assert!(mirrors.contains(r#"href="/a"#));
        assert!(!mirrors.contains(r#"href="/src/a"#));

        let remote = ReposView {
            repositories: vec![repo()],
            mirrors: false,
        }
        .render()
        .unwrap();
        assert!(remote.contains(r#"href="/src/a"#));
    }

    #[test]
    fn repo_page_shows_commit_and_escapes() {
        let html = RepoView {
            repo: repo(),
            tracking: true,
        }
        .render()
        .unwrap();
        assert!(html.contains("0123456"));
        assert!(html.contains("HI MOM"));
        assert!(html.contains("Jon Doe"));
        assert!(html.contains("production"));
        assert!(html.contains("Mirror &lt;everything&gt;"));
        assert!(html.contains(".tar.gz\""));
        assert!(html.contains(r#"value="track""#));
    }

    #[test]
    fn repo_page_hides_tracking_when_disabled() {
        let html = RepoView {
            repo: repo(),
            tracking: false,
        }
        .render()
        .unwrap();
        assert!(html.contains(r#"value="update""#));
        assert!(!html.contains(r#"value="track""#));
        assert!(!html.contains("Track pushes"));
    }

    #[test]
    fn private_access_page_shows_key_and_name() {
        let html = PrivateAccessView {
            full_name: "a/private".into(),
            public_key: "ssh-rsa AAAAB3Nza".into(),
            action: "create",
        }
        .render()
        .unwrap();
        assert!(html.contains("a/private") || html.contains("a&#x2f;private"));
        assert!(html.contains("ssh-rsa AAAAB3Nza"));
    }

    #[test]
    fn render_error_picks_template_by_status() {
        let resp = render_error(StatusCode::NOT_FOUND, "No such repository", Some("/"));
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = render_error(StatusCode::NOT_IMPLEMENTED, "Tracking changes not supported", None);
        assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
    }
}
