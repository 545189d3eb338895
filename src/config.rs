use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;

/// Environment variable holding the GitHub access token.
pub const TOKEN_ENV: &str = "DOPPELGANGER_GITHUB_TOKEN";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Process configuration, built once from the command line and environment.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "doppelganger",
    about = "Mirror GitHub repositories and keep them up to date",
    disable_version_flag = true
)]
pub struct Config {
    /// Host to listen on. Empty listens on all interfaces.
    #[arg(long, env = "DOPPELGANGER_ADDR", default_value = "")]
    pub addr: String,

    /// Port to listen on.
    #[arg(long, env = "DOPPELGANGER_PORT", default_value_t = 8081)]
    pub port: u16,

    /// Root directory of the mirror tree.
    #[arg(long, env = "DOPPELGANGER_MIRROR_DIR", default_value_os_t = default_mirror_dir())]
    pub mirror: PathBuf,

    /// GitHub REST API root (GitHub Enterprise: `https://<host>/api/v3`).
    #[arg(
        long,
        env = "DOPPELGANGER_GITHUB_API_URL",
        default_value = "https://api.github.com"
    )]
    pub github_api_url: String,

    /// SSH private key used to clone private repositories. Generated on
    /// first use when missing.
    #[arg(long, env = "DOPPELGANGER_PRIVATE_KEY", default_value_os_t = default_private_key())]
    pub private_key: PathBuf,

    /// Emit logs as JSON lines instead of plain text.
    #[arg(long)]
    pub log_json: bool,

    /// Print version and exit.
    #[arg(long)]
    pub version: bool,
}

impl Config {
    /// `host:port` for the HTTP listener.
    pub fn listen_addr(&self) -> String {
        let host = if self.addr.is_empty() {
            "0.0.0.0"
        } else {
            self.addr.as_str()
        };
        format!("{host}:{}", self.port)
    }

    /// Key git should be pinned to, or `None` for `~/.ssh/id_rsa`, which ssh
    /// already tries on its own alongside the agent and `core.sshCommand`.
    pub fn git_ssh_key(&self) -> Option<&Path> {
        (self.private_key != default_private_key()).then_some(self.private_key.as_path())
    }
}

pub fn version_line() -> String {
    format!("Doppelganger, version {}", env!("CARGO_PKG_VERSION"))
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// `$GOPATH/src/github.com`, falling back to `~/go/src/github.com`.
fn default_mirror_dir() -> PathBuf {
    let gopath = std::env::var_os("GOPATH")
        .and_then(|paths| std::env::split_paths(&paths).next())
        .filter(|p| !p.as_os_str().is_empty());
    let base = gopath.unwrap_or_else(|| home().join("go"));
    base.join("src").join("github.com")
}

fn default_private_key() -> PathBuf {
    home().join(".ssh").join("id_rsa")
}

fn home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

// ---------------------------------------------------------------------------
// Loading / validation
// ---------------------------------------------------------------------------

/// Read the GitHub token from [`TOKEN_ENV`].
pub fn github_token() -> Result<String> {
    token_from(std::env::var(TOKEN_ENV).ok())
}

fn token_from(value: Option<String>) -> Result<String> {
    match value {
        Some(token) if !token.trim().is_empty() => Ok(token),
        _ => anyhow::bail!("{TOKEN_ENV} must be set to a GitHub access token"),
    }
}

pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(config.port != 0, "port must be non-zero");
    anyhow::ensure!(
        !config.mirror.as_os_str().is_empty(),
        "mirror directory must not be empty"
    );
    anyhow::ensure!(
        !config.github_api_url.is_empty(),
        "github_api_url must not be empty"
    );
    Ok(())
}
