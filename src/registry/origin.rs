//! The coordinator's view of an origin registry.
//!
//! [`OriginRegistry`] is the seam the coordinator talks through; the HTTP
//! implementation speaks the registry v2 API with `reqwest`.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, WWW_AUTHENTICATE};
use serde::Deserialize;
use tracing::{debug, instrument};

use super::challenge::BearerChallenge;
use super::client::{with_bearer, RetryingClient};
use crate::config::RegistryCredentials;
use crate::error::{Error, Result};

/// Manifest media types offered in the `Accept` header.
pub const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.docker.distribution.manifest.v2+json";

/// Raw outcome of a single manifest GET.  Status handling is the caller's.
#[derive(Debug, Clone)]
pub struct ManifestResponse {
    pub status: u16,
    pub www_authenticate: Option<String>,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Bearer token issued by a registry's token realm.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub token: String,
    /// Lifetime in seconds, when the realm reports one.
    pub expires_in: Option<u64>,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("token", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

#[async_trait]
pub trait OriginRegistry: Send + Sync {
    /// One GET of a manifest URL.  Never retries.
    async fn fetch_manifest(&self, url: &str, token: Option<&str>) -> Result<ManifestResponse>;

    /// Exchange a Bearer challenge for a token at its realm.
    async fn exchange_token(
        &self,
        challenge: &BearerChallenge,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<TokenGrant>;

    /// HEAD a blob and return its `Content-Length`.
    async fn content_length(&self, url: &str, token: Option<&str>) -> Result<u64>;

    /// Stream a blob into `dest`, returning its size.
    async fn download_blob(&self, url: &str, token: Option<&str>, dest: &Path) -> Result<u64>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct HttpOriginRegistry {
    client: RetryingClient,
}

impl HttpOriginRegistry {
    pub fn new(client: RetryingClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OriginRegistry for HttpOriginRegistry {
    #[instrument(skip(self, token), fields(%url))]
    async fn fetch_manifest(&self, url: &str, token: Option<&str>) -> Result<ManifestResponse> {
        let response = with_bearer(self.client.http().get(url), token)
            .header(ACCEPT, MANIFEST_ACCEPT)
            .send()
            .await?;

        let status = response.status().as_u16();
        let header = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let www_authenticate = header(WWW_AUTHENTICATE);
        let content_type = header(CONTENT_TYPE);
        let body = response.bytes().await?;
        debug!(status, bytes = body.len(), "manifest response");

        Ok(ManifestResponse {
            status,
            www_authenticate,
            content_type,
            body,
        })
    }

    #[instrument(skip(self, challenge, credentials), fields(realm = %challenge.realm))]
    async fn exchange_token(
        &self,
        challenge: &BearerChallenge,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<TokenGrant> {
        let token_error = |reason: String| Error::TokenExchange {
            realm: challenge.realm.clone(),
            reason,
        };

        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(service) = &challenge.service {
            query.push(("service", service.as_str()));
        }
        if let Some(scope) = &challenge.scope {
            query.push(("scope", scope.as_str()));
        }

        let mut request = self.client.http().get(&challenge.realm).query(&query);
        if let Some(creds) = credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| token_error(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(token_error(format!("realm returned HTTP {status}")));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| token_error(format!("malformed token response: {e}")))?;
        let token = parsed
            .token
            .or(parsed.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| token_error("response carried no token".to_string()))?;

        debug!(expires_in = ?parsed.expires_in, "token exchanged");
        Ok(TokenGrant {
            token,
            expires_in: parsed.expires_in,
        })
    }

    #[instrument(skip(self, token), fields(%url))]
    async fn content_length(&self, url: &str, token: Option<&str>) -> Result<u64> {
        let response = self.client.head(url, token).await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(Error::UpstreamStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        // Read the header directly: for HEAD the body size hint is zero.
        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| Error::MissingContentLength {
                url: url.to_string(),
            })
    }

    async fn download_blob(&self, url: &str, token: Option<&str>, dest: &Path) -> Result<u64> {
        self.client.download_to(url, token, dest).await
    }
}
