//! Node-to-node RPC: JSON over HTTP.
//!
//! The coordinator drives peers through [`PeerRequester`]; every node serves
//! the other side through the routes in [`crate::http::handler`].

pub mod client;

use serde::{Deserialize, Serialize};

pub use client::{HttpPeerRequester, PeerRequester};

pub const DOWNLOAD_PATH: &str = "/_peer/v1/layers/download";
pub const CHECK_STATIC_PATH: &str = "/_peer/v1/layers/check-static";
pub const CHECK_OCI_PATH: &str = "/_peer/v1/layers/check-oci";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadLayerBody {
    pub origin_host: String,
    /// Blob path on the origin, e.g. `/v2/app/blobs/sha256:...`.
    pub layer_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl std::fmt::Debug for DownloadLayerBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadLayerBody")
            .field("origin_host", &self.origin_host)
            .field("layer_url", &self.layer_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckStaticBody {
    pub digest: String,
    pub path: String,
    pub expected_length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOciBody {
    pub digest: String,
    pub oci_type: String,
}

/// Body of every non-2xx peer response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
