//! Canonical entity identifiers.
//!
//! Every configuration and audit entity (analyzers, fields, mappings, queued errors, query jobs)
//! is keyed by a UUID rendered in one *canonical* form: **32 lowercase hexadecimal characters**
//! with no hyphens.
//!
//! ## Canonical form
//! - Length: 32
//! - Characters: `0-9` and `a-f` only
//! - Example: `550e8400e29b41d4a716446655440000`
//!
//! Notes:
//! - This is the value produced by `Uuid::new_v4().simple().to_string()`.
//! - Externally supplied identifiers (CLI arguments, seed files, job ids) must already be canonical;
//!   use [`EntityId::parse`] to validate them.
//! - Uppercase or hyphenated values are rejected rather than normalised, so the same entity can
//!   never be addressed by two different strings.

mod service;

pub use service::{EntityId, Uuid};

/// Error type for identifier operations.
#[derive(Debug, thiserror::Error)]
pub enum UuidError {
    /// Invalid input provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for identifier operations.
pub type UuidResult<T> = Result<T, UuidError>;
