mod action;
mod config;
mod forge;
mod git;
mod http;
mod metrics;
mod mirror;
mod ssh;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::action::MirrorActions;
use crate::config::Config;
use crate::forge::GithubRepositories;
use crate::git::{MirrorStore, PushTracker, RemoteCatalog, SystemGit};
use crate::http::webhook::WebhookDispatcher;
use crate::metrics::MetricsRegistry;
use crate::mirror::MirroredRepositories;
use crate::ssh::SshKeys;

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by every request handler.
pub struct AppState {
    pub remote: Arc<dyn RemoteCatalog>,
    pub mirrors: Arc<dyn MirrorStore>,
    pub actions: MirrorActions,
    pub webhooks: WebhookDispatcher,
    pub metrics: MetricsRegistry,
}

impl AppState {
    fn build(config: &Config, token: &str) -> Result<Self> {
        let metrics = MetricsRegistry::new();

        let mut git = SystemGit::new()?;
        if let Some(key) = config.git_ssh_key() {
            git = git.with_ssh_key(key);
        }
        tracing::info!(git = %git.binary().display(), "git binary resolved");

        let mirrors: Arc<dyn MirrorStore> =
            Arc::new(MirroredRepositories::new(&config.mirror, Arc::new(git)));

        let github = Arc::new(
            GithubRepositories::new(token, &config.github_api_url)?.with_metrics(metrics.clone()),
        );
        let remote: Arc<dyn RemoteCatalog> = github.clone();
        let tracker: Arc<dyn PushTracker> = github;

        let keys = Arc::new(SshKeys::new(&config.private_key));

        Ok(Self {
            actions: MirrorActions::new(
                remote.clone(),
                mirrors.clone(),
                Some(tracker),
                keys,
                metrics.clone(),
            ),
            webhooks: WebhookDispatcher::new(mirrors.clone(), metrics.clone()),
            remote,
            mirrors,
            metrics,
        })
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(config: &Config, state: AppState) -> Result<()> {
    let app = http::handler::create_router(Arc::new(state));

    let listen_addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn run(config: Config) -> Result<()> {
    config::validate_config(&config)?;
    let token = config::github_token()?;

    tracing::info!(
        mirror = %config.mirror.display(),
        api_url = %config.github_api_url,
        "starting doppelganger"
    );

    tokio::fs::create_dir_all(&config.mirror)
        .await
        .with_context(|| {
            format!(
                "failed to create mirror directory: {}",
                config.mirror.display()
            )
        })?;

    let state = AppState::build(&config, &token)?;
    run_http_server(&config, state).await?;

    tracing::info!("doppelganger shut down cleanly");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    // ---- CLI ----
    let config = Config::parse();
    if config.version {
        println!("{}", config::version_line());
        return ExitCode::SUCCESS;
    }

    // ---- Tracing ----
    init_tracing(config.log_json);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "doppelganger failed");
            ExitCode::FAILURE
        }
    }
}
