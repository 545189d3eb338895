//! GitHub / GitHub Enterprise REST client.
//!
//! Implements [`RemoteCatalog`] (repository listing and lookup) and
//! [`PushTracker`] (push webhook registration) on top of the v3 REST API,
//! authenticated with a static token.

use anyhow::{anyhow, bail, Context, Result};
use reqwest::header::{HeaderMap, ACCEPT, LINK};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::git::{
    parse_repository_name, Commit, PushTracker, RemoteCatalog, RepoError, RepoResult, Repository,
    DEFAULT_MASTER,
};
use crate::metrics::MetricsRegistry;

const PER_PAGE: u32 = 50;
const ACCEPT_JSON: &str = "application/vnd.github+json";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApiRepository {
    full_name: Option<String>,
    description: Option<String>,
    default_branch: Option<String>,
    html_url: Option<String>,
    ssh_url: Option<String>,
    git_url: Option<String>,
    #[serde(default)]
    private: bool,
}

#[derive(Debug, Deserialize)]
struct ApiBranch {
    commit: ApiBranchCommit,
}

#[derive(Debug, Deserialize)]
struct ApiBranchCommit {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct ApiCommit {
    sha: String,
    commit: ApiGitCommit,
}

#[derive(Debug, Deserialize)]
struct ApiGitCommit {
    #[serde(default)]
    message: String,
    author: Option<ApiSignature>,
    committer: Option<ApiSignature>,
}

#[derive(Debug, Deserialize)]
struct ApiSignature {
    name: Option<String>,
    date: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Serialize)]
struct NewHook<'a> {
    name: &'a str,
    active: bool,
    events: [&'a str; 1],
    config: NewHookConfig<'a>,
}

#[derive(Debug, Serialize)]
struct NewHookConfig<'a> {
    url: &'a str,
    content_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiHook {
    #[serde(default)]
    events: Vec<String>,
    #[serde(default)]
    config: ApiHookConfig,
}

#[derive(Debug, Default, Deserialize)]
struct ApiHookConfig {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ApiFieldError>,
}

#[derive(Debug, Deserialize)]
struct ApiFieldError {
    code: Option<String>,
}

impl ApiErrorBody {
    /// GitHub's way of saying "this hook already exists".
    fn is_duplicate_hook(&self) -> bool {
        self.message == "Validation Failed"
            && self.errors.len() == 1
            && self.errors[0].code.as_deref() == Some("custom")
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct GithubRepositories {
    client: reqwest::Client,
    api_url: Url,
    token: String,
    metrics: Option<MetricsRegistry>,
}

impl GithubRepositories {
    /// Build a client for `api_url`. Fails when `token` is empty or `api_url`
    /// is not an absolute URL.
    pub fn new(token: &str, api_url: &str) -> Result<Self> {
        if token.is_empty() {
            bail!("GitHub access token is empty");
        }

        let api_url = Url::parse(api_url)
            .with_context(|| format!("invalid GitHub API URL {api_url:?}"))?;
        if api_url.cannot_be_a_base() {
            bail!("GitHub API URL {api_url} cannot carry a path");
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("doppelganger/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            api_url,
            token: token.to_string(),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// API URL for `segments`, each percent-encoded as one path segment.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("GitHub API URL {} cannot carry a path", self.api_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder> {
        Ok(self
            .client
            .request(method, self.url(segments)?)
            .bearer_auth(&self.token)
            .header(ACCEPT, ACCEPT_JSON))
    }

    async fn send(&self, endpoint: &str, request: RequestBuilder) -> Result<Response> {
        if let Some(metrics) = &self.metrics {
            metrics.metrics.record_remote_call(endpoint);
        }
        request
            .send()
            .await
            .with_context(|| format!("GitHub API request {endpoint} failed"))
    }

    /// Decode a successful response, or turn a failed one into an error with
    /// the body logged.
    async fn decode<T: DeserializeOwned>(&self, endpoint: &str, resp: Response) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(endpoint, %status, %body, "GitHub API returned non-success status");
            return Err(anyhow!("GitHub API request {endpoint} returned {status}"));
        }
        resp.json()
            .await
            .with_context(|| format!("failed to parse GitHub API response for {endpoint}"))
    }

    async fn fetch<T: DeserializeOwned>(&self, endpoint: &str, segments: &[&str]) -> Result<T> {
        let resp = self.send(endpoint, self.request(Method::GET, segments)?).await?;
        self.decode(endpoint, resp).await
    }

    /// Collect every page of a list endpoint, following the `Link` header's
    /// `next` relation.
    async fn paginate<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        segments: &[&str],
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut page = 1;

        loop {
            let request = self
                .request(Method::GET, segments)?
                .query(&[("per_page", PER_PAGE), ("page", page)]);
            let resp = self.send(endpoint, request).await?;
            let next = next_page(resp.headers());
            let batch: Vec<T> = self.decode(endpoint, resp).await?;
            debug!(endpoint, page, count = batch.len(), "fetched page");
            items.extend(batch);

            match next {
                Some(n) if n > page => page = n,
                _ => break,
            }
        }

        Ok(items)
    }

    async fn has_push_hook(&self, owner: &str, name: &str, callback_url: &str) -> Result<bool> {
        let hooks: Vec<ApiHook> = self
            .paginate("hooks.list", &["repos", owner, name, "hooks"])
            .await?;
        Ok(hooks.iter().any(|hook| {
            hook.config.url.as_deref() == Some(callback_url)
                && hook.events.iter().any(|e| e == "push")
        }))
    }
}

#[async_trait::async_trait]
impl RemoteCatalog for GithubRepositories {
    #[instrument(skip(self))]
    async fn all(&self) -> RepoResult<Vec<Repository>> {
        let listed: Vec<ApiRepository> = self.paginate("repos.list", &["user", "repos"]).await?;

        let mut repos = Vec::with_capacity(listed.len());
        for repo in listed {
            let Some(full_name) = repo.full_name else {
                warn!("skipping repository without full name");
                continue;
            };
            let Some(ssh_url) = repo.ssh_url else {
                warn!(repo = %full_name, "skipping repository without SSH URL");
                continue;
            };
            repos.push(Repository {
                full_name,
                description: repo.description,
                master: master_or_default(repo.default_branch),
                html_url: repo.html_url,
                git_url: Some(ssh_url),
                latest_master_commit: None,
            });
        }

        Ok(repos)
    }

    #[instrument(skip(self))]
    async fn get(&self, full_name: &str) -> RepoResult<Repository> {
        let (owner, name) = parse_repository_name(full_name);

        let resp = self
            .send("repos.get", self.request(Method::GET, &["repos", owner, name])?)
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(RepoError::NotFound);
        }
        let repo: ApiRepository = self.decode("repos.get", resp).await?;
        let master = master_or_default(repo.default_branch);

        let branch: ApiBranch = self
            .fetch("branches.get", &["repos", owner, name, "branches", master.as_str()])
            .await?;
        let commit: ApiCommit = self
            .fetch(
                "commits.get",
                &["repos", owner, name, "commits", branch.commit.sha.as_str()],
            )
            .await?;

        let git_url = if repo.private {
            repo.ssh_url
        } else {
            repo.git_url
        };

        Ok(Repository {
            full_name: repo.full_name.unwrap_or_else(|| full_name.to_string()),
            description: repo.description,
            master,
            html_url: repo.html_url,
            git_url,
            latest_master_commit: Some(commit.into()),
        })
    }
}

#[async_trait::async_trait]
impl PushTracker for GithubRepositories {
    #[instrument(skip(self))]
    async fn track(&self, full_name: &str, callback_url: &str) -> RepoResult<()> {
        let (owner, name) = parse_repository_name(full_name);

        let hook = NewHook {
            name: "web",
            active: true,
            events: ["push"],
            config: NewHookConfig {
                url: callback_url,
                content_type: "json",
            },
        };
        let request = self
            .request(Method::POST, &["repos", owner, name, "hooks"])?
            .json(&hook);
        let resp = self.send("hooks.create", request).await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        let parsed: ApiErrorBody = serde_json::from_str(&body).unwrap_or_default();
        if status == StatusCode::UNPROCESSABLE_ENTITY && parsed.is_duplicate_hook() {
            debug!(repo = %full_name, "hook registration rejected, checking existing hooks");
            if self.has_push_hook(owner, name, callback_url).await? {
                return Ok(());
            }
        }

        warn!(repo = %full_name, %status, %body, "failed to register webhook");
        Err(anyhow!("failed to register webhook for {full_name}").into())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn master_or_default(default_branch: Option<String>) -> String {
    default_branch
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| DEFAULT_MASTER.to_string())
}

impl From<ApiCommit> for Commit {
    fn from(c: ApiCommit) -> Self {
        let author = c.commit.author.and_then(|a| a.name).unwrap_or_default();
        let (committer, date) = match c.commit.committer {
            Some(sig) => (sig.name, sig.date),
            None => (None, None),
        };
        Commit {
            sha: c.sha,
            message: c.commit.message,
            author,
            committer,
            date: date.unwrap_or_default(),
        }
    }
}

/// Page number of the `rel="next"` entry of a `Link` header, if any.
fn next_page(headers: &HeaderMap) -> Option<u32> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.split(';').any(|p| p.trim() == r#"rel="next""#) {
            return None;
        }
        let url = Url::parse(target.trim().trim_start_matches('<').trim_end_matches('>')).ok()?;
        url.query_pairs()
            .find(|(k, _)| k == "page")
            .and_then(|(_, v)| v.parse().ok())
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
