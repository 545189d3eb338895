//! Local mirror management.
//!
//! [`MirroredRepositories`] owns the mirror tree and delegates every git
//! operation to a [`GitCommand`](crate::git::GitCommand) handle; the archive
//! exporter turns a mirror into a streamed tarball of its working tree.

pub mod archive;
pub mod store;

pub use store::MirroredRepositories;
