//! Error taxonomy for coordinator operations.
//!
//! Configuration and authentication failures are terminal for a single call.
//! Transient upstream failures are retried by the caller's policy and only
//! surface here once that policy is exhausted.  Cache misses are never errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// No upstream registry mapping exists for the requested host.
    #[error("no registry configuration for host '{host}'")]
    ConfigNotFound { host: String },

    /// A digest or blob path supplied by the caller is malformed.
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("invalid WWW-Authenticate challenge: {0}")]
    InvalidChallenge(String),

    #[error("token exchange with {realm} failed: {reason}")]
    TokenExchange { realm: String, reason: String },

    /// A second 401 arrived after the token was already refreshed once in
    /// the same call.  The credential is broken or revoked.
    #[error("authentication loop detected for {url}: refreshed token was rejected")]
    AuthLoopDetected { url: String },

    #[error("retries exhausted after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    #[error("upstream {url} returned HTTP {status}")]
    UpstreamStatus { url: String, status: u16 },

    #[error("upstream {url} omitted a usable Content-Length header")]
    MissingContentLength { url: String },

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("layer {digest} size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        digest: String,
        expected: u64,
        actual: u64,
    },

    #[error("layer {digest} not found at {path}")]
    LayerNotFound { digest: String, path: String },

    #[error("peer {endpoint} request failed: {reason}")]
    Peer { endpoint: String, reason: String },

    #[error("lock '{key}' unavailable: {reason}")]
    Lock { key: String, reason: String },

    #[error("shared cache store error: {0:#}")]
    Store(anyhow::Error),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("call cancelled")]
    Cancelled,

    #[error("internal error: {0:#}")]
    Internal(anyhow::Error),
}

impl Error {
    /// Whether the error is a terminal authentication failure.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            Self::InvalidChallenge(_) | Self::TokenExchange { .. } | Self::AuthLoopDetected { .. }
        )
    }
}
