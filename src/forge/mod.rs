//! Upstream forge integration.
//!
//! Only GitHub (and GitHub Enterprise through `--github-api-url`) is
//! supported.  Callers depend on the [`RemoteCatalog`] and [`PushTracker`]
//! capabilities rather than on the concrete client.
//!
//! [`RemoteCatalog`]: crate::git::RemoteCatalog
//! [`PushTracker`]: crate::git::PushTracker

pub mod github;

pub use github::GithubRepositories;
