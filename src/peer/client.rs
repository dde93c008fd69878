use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, instrument};

use super::{
    CheckOciBody, CheckStaticBody, DownloadLayerBody, ErrorBody, CHECK_OCI_PATH,
    CHECK_STATIC_PATH, DOWNLOAD_PATH,
};
use crate::error::{Error, Result};
use crate::model::LayerResult;

#[async_trait]
pub trait PeerRequester: Send + Sync {
    /// Ask `endpoint` to fetch a blob from the origin into its layer store.
    async fn download_layer(
        &self,
        endpoint: &str,
        origin_host: &str,
        layer_url: &str,
        token: Option<&str>,
    ) -> Result<LayerResult>;

    /// Ask `endpoint` to confirm it still holds `path` at `expected_length`.
    async fn check_static_layer(
        &self,
        endpoint: &str,
        digest: &str,
        path: &str,
        expected_length: u64,
    ) -> Result<LayerResult>;

    /// Ask `endpoint` to confirm it can serve `digest` from `oci_type`.
    async fn check_oci_layer(
        &self,
        endpoint: &str,
        digest: &str,
        oci_type: &str,
    ) -> Result<LayerResult>;
}

#[derive(Debug, Clone)]
pub struct HttpPeerRequester {
    http: reqwest::Client,
}

impl HttpPeerRequester {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn call<B: Serialize + Sync>(
        &self,
        endpoint: &str,
        path: &str,
        body: &B,
    ) -> Result<LayerResult> {
        let peer_error = |reason: String| Error::Peer {
            endpoint: endpoint.to_string(),
            reason,
        };
        let url = format!("{}{}", endpoint.trim_end_matches('/'), path);

        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| peer_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let reason = match response.json::<ErrorBody>().await {
                Ok(body) => format!("HTTP {status}: {}", body.error),
                Err(_) => format!("HTTP {status}"),
            };
            return Err(peer_error(reason));
        }

        let result: LayerResult = response
            .json()
            .await
            .map_err(|e| peer_error(format!("malformed response: {e}")))?;
        debug!(located = %result.located, size = result.size, "peer responded");
        Ok(result)
    }
}

#[async_trait]
impl PeerRequester for HttpPeerRequester {
    #[instrument(skip(self, token))]
    async fn download_layer(
        &self,
        endpoint: &str,
        origin_host: &str,
        layer_url: &str,
        token: Option<&str>,
    ) -> Result<LayerResult> {
        let body = DownloadLayerBody {
            origin_host: origin_host.to_string(),
            layer_url: layer_url.to_string(),
            token: token.map(str::to_string),
        };
        self.call(endpoint, DOWNLOAD_PATH, &body).await
    }

    #[instrument(skip(self))]
    async fn check_static_layer(
        &self,
        endpoint: &str,
        digest: &str,
        path: &str,
        expected_length: u64,
    ) -> Result<LayerResult> {
        let body = CheckStaticBody {
            digest: digest.to_string(),
            path: path.to_string(),
            expected_length,
        };
        self.call(endpoint, CHECK_STATIC_PATH, &body).await
    }

    #[instrument(skip(self))]
    async fn check_oci_layer(
        &self,
        endpoint: &str,
        digest: &str,
        oci_type: &str,
    ) -> Result<LayerResult> {
        let body = CheckOciBody {
            digest: digest.to_string(),
            oci_type: oci_type.to_string(),
        };
        self.call(endpoint, CHECK_OCI_PATH, &body).await
    }
}
