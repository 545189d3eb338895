//! HTTP layer for the Doppelganger mirror server.
//!
//! Browsing pages for mirrors and GitHub repositories, the mirror action
//! form endpoint, the GitHub webhook receiver and working-tree downloads.

pub mod archive;
pub mod handler;
pub mod views;
pub mod webhook;
