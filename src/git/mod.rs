//! Git command wrappers and the repository model.
//!
//! All operations shell out to the `git` binary using `tokio::process::Command`
//! for non-blocking execution.  The capability traits implemented by the
//! forge client and the mirror store live next to the model they exchange.

pub mod commands;
pub mod repository;

pub use commands::{GitCommand, SystemGit};
pub use repository::{
    parse_repository_name, Commit, MirrorStore, PushTracker, RemoteCatalog, RepoError,
    RepoResult, Repository, DEFAULT_MASTER,
};
