//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every operation shells out to the system `git` binary, resolved once when
//! [`SystemGit`] is constructed.  Children are spawned with `kill_on_drop`, so
//! dropping an in-flight future (for example because the HTTP client went
//! away) terminates the subprocess as well.
//!
//! Failures that reach callers are sanitised: subprocess output is logged and
//! never embedded in the returned error.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::repository::{Commit, DEFAULT_MASTER};

/// `git log --pretty` template: SHA, author, committer, date, subject.
const PRETTY_FORMAT: &str = "%H\n%an\n%cn\n%cd\n%s";

/// `git log --date` format, rendered like `2016-04-23T16:12:39+0000`.
const DATE_FORMAT: &str = "format:%FT%T%z";

/// chrono equivalent of [`DATE_FORMAT`].
const DATE_LAYOUT: &str = "%Y-%m-%dT%H:%M:%S%z";

/// Number of lines `git log -n 1 --pretty=PRETTY_FORMAT` prints.
const PRETTY_FIELDS: usize = count_newlines(PRETTY_FORMAT) + 1;

const fn count_newlines(s: &str) -> usize {
    let bytes = s.as_bytes();
    let mut count = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\n' {
            count += 1;
        }
        i += 1;
    }
    count
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a git invocation failed.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The process could not be started at all.
    #[error("failed to spawn git: {0}")]
    Spawn(#[source] std::io::Error),
    /// git ran and exited non-zero. `stderr` is for logs only.
    #[error("git exited with {status}")]
    Exit { status: ExitStatus, stderr: String },
}

impl ExecError {
    /// Captured standard error, empty for spawn failures.
    pub fn stderr(&self) -> &str {
        match self {
            ExecError::Spawn(_) => "",
            ExecError::Exit { stderr, .. } => stderr,
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// The git operations the mirror store depends on.
///
/// Every method takes the working directory (or target path) first.
#[async_trait]
pub trait GitCommand: Send + Sync {
    /// `true` iff `path` is a directory in which
    /// `git rev-parse --is-inside-git-dir` prints exactly `true`.
    async fn is_repository(&self, path: &Path) -> bool;

    /// Branch `HEAD` points at, or [`DEFAULT_MASTER`] when that cannot be
    /// determined.
    async fn current_branch(&self, path: &Path) -> String;

    /// Latest commit reachable from `HEAD`.  Returns an empty [`Commit`] when
    /// git fails; the commit is simply unavailable in that case.
    async fn last_commit(&self, path: &Path) -> Commit;

    /// `git clone --mirror url <basename(dest)>` run from `dest`'s parent,
    /// which is created first.
    async fn clone_mirror(&self, url: &str, dest: &Path) -> Result<()>;

    /// Plain (working tree) clone of the repository at `src` into `dest`.
    async fn clone_worktree(&self, src: &Path, dest: &Path) -> Result<()>;

    /// `git remote update` inside `path`.
    async fn update_remote(&self, path: &Path) -> Result<()>;
}

// ---------------------------------------------------------------------------
// System git
// ---------------------------------------------------------------------------

/// Handle to the `git` binary found on `PATH`.
#[derive(Debug, Clone)]
pub struct SystemGit {
    binary: PathBuf,
    ssh_key: Option<PathBuf>,
}

impl SystemGit {
    /// Resolve `git` on `PATH`.  Fails when it is not installed.
    pub fn new() -> Result<Self> {
        let binary = which::which("git").context("git is not found in PATH")?;
        debug!(binary = %binary.display(), "resolved git binary");
        Ok(Self {
            binary,
            ssh_key: None,
        })
    }

    /// Authenticate SSH remotes with `key` instead of the user's defaults.
    pub fn with_ssh_key(mut self, key: impl Into<PathBuf>) -> Self {
        self.ssh_key = Some(key.into());
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Run `git <args>` in `dir` and return its trimmed standard output.
    async fn exec(&self, dir: &Path, args: &[&str]) -> std::result::Result<String, ExecError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env_remove("GIT_DIR")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(key) = &self.ssh_key {
            cmd.env("GIT_SSH_COMMAND", ssh_command(key));
        }

        let output = cmd.output().await.map_err(ExecError::Spawn)?;

        if !output.status.success() {
            return Err(ExecError::Exit {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// `GIT_SSH_COMMAND` value pinning ssh to `key`.  Git runs it through
/// `sh -c`, so the path is single-quoted with embedded quotes escaped.
fn ssh_command(key: &Path) -> String {
    let quoted = key.to_string_lossy().replace('\'', r"'\''");
    format!("ssh -i '{quoted}' -o IdentitiesOnly=yes")
}

#[async_trait]
impl GitCommand for SystemGit {
    #[instrument(skip(self), fields(path = %path.display()))]
    async fn is_repository(&self, path: &Path) -> bool {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return false,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return false,
            Err(e) => {
                warn!(error = %e, "failed to stat");
                return false;
            }
        }

        match self.exec(path, &["rev-parse", "--is-inside-git-dir"]).await {
            Ok(output) => match output.as_str() {
                "true" => true,
                "false" => false,
                other => {
                    warn!(output = %other, "unexpected output from git rev-parse --is-inside-git-dir");
                    false
                }
            },
            Err(e @ ExecError::Spawn(_)) => {
                warn!(error = %e, "git rev-parse --is-inside-git-dir could not run");
                false
            }
            Err(_) => false,
        }
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn current_branch(&self, path: &Path) -> String {
        match self.exec(path, &["symbolic-ref", "HEAD"]).await {
            Ok(ref_name) => branch_from_ref(&ref_name).unwrap_or_else(|| {
                warn!(%ref_name, "unexpected reference name");
                DEFAULT_MASTER.to_string()
            }),
            Err(e) => {
                warn!(error = %e, stderr = %e.stderr(), "git symbolic-ref HEAD failed");
                DEFAULT_MASTER.to_string()
            }
        }
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn last_commit(&self, path: &Path) -> Commit {
        let pretty = format!("--pretty={PRETTY_FORMAT}");
        let date = format!("--date={DATE_FORMAT}");

        let output = match self.exec(path, &["log", "-n", "1", &pretty, &date]).await {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, stderr = %e.stderr(), "git log failed");
                return Commit::default();
            }
        };

        parse_log_output(&output).unwrap_or_else(|| {
            warn!(%output, "unexpected output from git log");
            Commit::default()
        })
    }

    #[instrument(skip(self), fields(%url, dest = %dest.display()))]
    async fn clone_mirror(&self, url: &str, dest: &Path) -> Result<()> {
        let sanitized = || anyhow!("failed to clone {url} to {}", dest.display());

        let (parent, name) = split_dest(dest).ok_or_else(sanitized)?;

        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!(error = %e, parent = %parent.display(), "failed to create mirror parent directory");
            return Err(sanitized());
        }

        if let Err(e) = self.exec(parent, &["clone", "--mirror", url, name]).await {
            warn!(error = %e, stderr = %e.stderr(), "git clone --mirror failed");
            return Err(sanitized());
        }

        debug!("git clone --mirror succeeded");
        Ok(())
    }

    #[instrument(skip(self), fields(src = %src.display(), dest = %dest.display()))]
    async fn clone_worktree(&self, src: &Path, dest: &Path) -> Result<()> {
        let sanitized = || anyhow!("failed to clone {} to {}", src.display(), dest.display());

        let (parent, name) = split_dest(dest).ok_or_else(sanitized)?;
        let src_arg = src.to_str().ok_or_else(sanitized)?;

        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!(error = %e, parent = %parent.display(), "failed to create clone parent directory");
            return Err(sanitized());
        }

        if let Err(e) = self.exec(parent, &["clone", "--quiet", src_arg, name]).await {
            warn!(error = %e, stderr = %e.stderr(), "git clone failed");
            return Err(sanitized());
        }

        debug!("git clone succeeded");
        Ok(())
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn update_remote(&self, path: &Path) -> Result<()> {
        if let Err(e) = self.exec(path, &["remote", "update"]).await {
            warn!(error = %e, stderr = %e.stderr(), "git remote update failed");
            return Err(anyhow!("update failed"));
        }

        debug!("git remote update succeeded");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// `refs/heads/<branch>` → `<branch>`.
fn branch_from_ref(ref_name: &str) -> Option<String> {
    ref_name
        .strip_prefix("refs/heads/")
        .filter(|b| !b.is_empty())
        .map(str::to_string)
}

/// Split a destination into its parent directory and final component.
fn split_dest(dest: &Path) -> Option<(&Path, &str)> {
    let name = dest.file_name()?.to_str()?;
    let parent = dest.parent().filter(|p| !p.as_os_str().is_empty())?;
    Some((parent, name))
}

/// Parse the output of `git log -n 1 --pretty=PRETTY_FORMAT`.
///
/// Returns `None` when fewer than [`PRETTY_FIELDS`] lines are present.  An
/// unparseable date leaves the commit's date at the zero value.
fn parse_log_output(output: &str) -> Option<Commit> {
    let fields: Vec<&str> = output.splitn(PRETTY_FIELDS, '\n').collect();
    if fields.len() < PRETTY_FIELDS {
        return None;
    }

    let date = match DateTime::parse_from_str(fields[3], DATE_LAYOUT) {
        Ok(date) => date.with_timezone(&Utc),
        Err(e) => {
            warn!(date = %fields[3], error = %e, "unexpected date format from git log");
            DateTime::<Utc>::default()
        }
    };

    Some(Commit {
        sha: fields[0].to_string(),
        author: fields[1].to_string(),
        committer: Some(fields[2].to_string()).filter(|c| !c.is_empty()),
        date,
        message: fields[4].to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
