//! SSH key material used to reach private upstream repositories.

pub mod keys;

pub use keys::SshKeys;
