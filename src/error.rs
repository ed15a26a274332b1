//! Crate-wide error taxonomy.
//!
//! Most modules define local error types for failures that never leave them
//! (`CodecError`, `CryptoError`, `CacheError`); this enum is the shared
//! vocabulary for everything that crosses a module boundary: HTTP status
//! codes, cursor lifecycle, schema checks, and protocol-level validation.

use std::fmt;

use crate::cache::CacheError;
use crate::codec::CodecError;
use crate::crypto::CryptoError;

/// Errors surfaced by the protocol layer.
#[derive(Debug)]
pub enum GraffitiError {
    /// Absent object, actor service, bucket value, or cursor entry.
    NotFound(String),
    /// Missing or rejected credentials.
    Unauthorized(String),
    /// Valid credentials, disallowed operation (including cross-actor
    /// mutation attempts).
    Forbidden(String),
    /// Envelope over the size gate, or a response body over the caller's
    /// byte limit.
    TooLarge(String),
    /// Server 410, or a cache-version mismatch on an explicit continuation.
    CursorExpired(String),
    /// The supplied schema does not compile.
    InvalidSchema(String),
    /// Object found but fails the caller's schema.
    SchemaMismatch(String),
    /// Media type unacceptable to the caller.
    NotAcceptable(String),
    /// The server or a message broke a protocol invariant: bytes hashing to
    /// the wrong address, missing or extra attestations, mixed
    /// public/private envelope flags, or an object outside the stated
    /// schema.
    ProtocolViolation(String),
    /// Transport-level failure (connect, TLS, body read).
    Transport(String),
    /// Local cache failure.
    Cache(CacheError),
}

impl fmt::Display for GraffitiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraffitiError::NotFound(msg) => write!(f, "not found: {msg}"),
            GraffitiError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            GraffitiError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            GraffitiError::TooLarge(msg) => write!(f, "too large: {msg}"),
            GraffitiError::CursorExpired(msg) => write!(f, "cursor expired: {msg}"),
            GraffitiError::InvalidSchema(msg) => write!(f, "invalid schema: {msg}"),
            GraffitiError::SchemaMismatch(msg) => write!(f, "schema mismatch: {msg}"),
            GraffitiError::NotAcceptable(msg) => write!(f, "not acceptable: {msg}"),
            GraffitiError::ProtocolViolation(msg) => write!(f, "protocol violation: {msg}"),
            GraffitiError::Transport(msg) => write!(f, "transport error: {msg}"),
            GraffitiError::Cache(e) => write!(f, "cache error: {e}"),
        }
    }
}

impl std::error::Error for GraffitiError {}

impl From<CacheError> for GraffitiError {
    fn from(e: CacheError) -> Self {
        GraffitiError::Cache(e)
    }
}

impl From<CodecError> for GraffitiError {
    fn from(e: CodecError) -> Self {
        GraffitiError::ProtocolViolation(format!("codec: {e}"))
    }
}

impl From<CryptoError> for GraffitiError {
    fn from(e: CryptoError) -> Self {
        GraffitiError::ProtocolViolation(format!("crypto: {e}"))
    }
}

impl From<reqwest::Error> for GraffitiError {
    fn from(e: reqwest::Error) -> Self {
        GraffitiError::Transport(e.to_string())
    }
}

impl GraffitiError {
    /// Whether this error denotes a broken cryptographic or schema
    /// invariant. Such failures are never retried.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            GraffitiError::ProtocolViolation(_) | GraffitiError::SchemaMismatch(_)
        )
    }
}
