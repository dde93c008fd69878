//! Types shared between the coordinator, the shared store and the peer RPC
//! surface.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How a node materialized a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayerKind {
    /// Byte-for-byte copy pre-synced onto the node's local storage.
    Static,
    /// Reconstructed on demand from an OCI-format source.
    OciDerived,
}

impl LayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::OciDerived => "oci",
        }
    }
}

/// One row of the shared cache store: node `located` holds `digest` at `data`.
///
/// For static layers `data` is an absolute path on that node; for OCI-derived
/// layers it names the OCI source type the node reconstructs from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerLocation {
    pub digest: String,
    pub kind: LayerKind,
    pub located: String,
    pub data: String,
}

/// Where a layer ended up after a download or a successful verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerResult {
    /// Address of the node holding the file.
    pub located: String,
    /// Path of the file on that node.
    pub path: String,
    pub size: u64,
    /// Base64-encoded torrent metainfo, attached for large layers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub torrent: Option<String>,
}

/// A blob download the coordinator either performs or delegates.
#[derive(Clone, PartialEq, Eq)]
pub struct DownloadLayerRequest {
    pub origin_host: String,
    /// Path on the origin, e.g. `/v2/library/nginx/blobs/sha256:...`.
    pub origin_path: String,
    pub bearer_token: Option<String>,
    pub repository: String,
    pub digest: String,
}

impl std::fmt::Debug for DownloadLayerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadLayerRequest")
            .field("origin_host", &self.origin_host)
            .field("origin_path", &self.origin_path)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("repository", &self.repository)
            .field("digest", &self.digest)
            .finish()
    }
}

/// Split `sha256:abcd…` into `("sha256", "abcd…")`.
///
/// Both halves are restricted to lowercase alphanumerics so a digest can be
/// used as a path component.
pub fn split_digest(digest: &str) -> Result<(&str, &str)> {
    let (algo, hex) = digest
        .split_once(':')
        .ok_or_else(|| Error::InvalidDigest(format!("'{digest}' has no algorithm prefix")))?;
    let valid = |s: &str| {
        !s.is_empty()
            && s
                .chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
    };
    if !valid(algo) || !valid(hex) {
        return Err(Error::InvalidDigest(format!("'{digest}' is not <algo>:<hex>")));
    }
    Ok((algo, hex))
}

/// Relative on-disk location for a digest: `<algo>/<hex>`.
pub fn digest_rel_path(digest: &str) -> Result<PathBuf> {
    let (algo, hex) = split_digest(digest)?;
    Ok(PathBuf::from(algo).join(hex))
}
