use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use super::{Coordinator, MANIFEST_MAX_ATTEMPTS, MANIFEST_TTL, RATE_LIMIT_BACKOFF};
use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::metrics::{CacheName, OriginCall};
use crate::registry::ManifestResponse;

/// A manifest body as served by the origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub body: Bytes,
    pub content_type: Option<String>,
}

/// Permission to exchange a fresh token once per manifest fetch.
#[derive(Debug)]
struct AuthRefresh;

/// What a single origin response means for the fetch loop.
enum Step {
    Succeeded(Manifest),
    /// 401 carrying the challenge to answer.
    Unauthorized(Option<String>),
    RateLimited,
    Failed(Error),
}

fn classify(url: &str, response: ManifestResponse) -> Step {
    match response.status {
        200..=299 => Step::Succeeded(Manifest {
            body: response.body,
            content_type: response.content_type,
        }),
        401 => Step::Unauthorized(response.www_authenticate),
        429 => Step::RateLimited,
        status => Step::Failed(Error::UpstreamStatus {
            url: url.to_string(),
            status,
        }),
    }
}

impl Coordinator {
    /// Fetch a manifest, collapsing concurrent requests for the same
    /// `(host, repository, tag)` into a single origin call.
    ///
    /// A 401 triggers at most one token refresh; a second 401 is
    /// [`Error::AuthLoopDetected`].  A 429 backs off for two seconds and
    /// retries with the same token.
    #[instrument(skip(self, ctx, bearer_token))]
    pub async fn get_manifest(
        &self,
        ctx: &CallContext,
        origin_host: &str,
        repository: &str,
        tag: &str,
        manifest_path: &str,
        bearer_token: Option<&str>,
    ) -> Result<Manifest> {
        let registry = self.config.registry(origin_host)?;
        let key = (
            origin_host.to_string(),
            repository.to_string(),
            tag.to_string(),
        );

        if let Some(manifest) = self.manifests.get(&key) {
            self.metrics.cache_lookup(CacheName::Manifest, true);
            return Ok(manifest);
        }

        let _guard = self
            .lock(ctx, format!("manifest:{origin_host}:{repository}:{tag}"))
            .await?;
        if let Some(manifest) = self.manifests.get(&key) {
            self.metrics.cache_lookup(CacheName::Manifest, true);
            debug!("manifest populated while waiting for lock");
            return Ok(manifest);
        }
        self.metrics.cache_lookup(CacheName::Manifest, false);

        let url = registry.url(manifest_path);
        let mut token = bearer_token.map(str::to_string);
        let mut refresh = Some(AuthRefresh);
        let mut last_failure = String::new();

        for attempt in 1..=MANIFEST_MAX_ATTEMPTS {
            self.metrics.origin_call(OriginCall::Manifest);
            let response = ctx
                .run(self.origin.fetch_manifest(&url, token.as_deref()))
                .await?;

            match classify(&url, response) {
                Step::Succeeded(manifest) => {
                    info!(attempt, bytes = manifest.body.len(), "manifest fetched");
                    self.manifests.set(key, manifest.clone(), MANIFEST_TTL);
                    return Ok(manifest);
                }
                Step::Unauthorized(challenge) => {
                    if refresh.take().is_none() {
                        warn!(attempt, "refreshed token rejected");
                        return Err(Error::AuthLoopDetected { url });
                    }
                    let challenge = challenge.ok_or_else(|| {
                        Error::InvalidChallenge("401 without WWW-Authenticate".to_string())
                    })?;
                    if let Some(rejected) = &token {
                        self.forget_token(origin_host, &challenge, rejected);
                    }
                    debug!(attempt, "origin demanded auth, refreshing token");
                    token = Some(self.auth_registry(ctx, origin_host, &challenge).await?);
                    last_failure = "HTTP 401".to_string();
                }
                Step::RateLimited => {
                    self.metrics.origin_rate_limited.inc();
                    warn!(
                        attempt,
                        backoff_secs = RATE_LIMIT_BACKOFF.as_secs(),
                        "origin rate limited manifest fetch"
                    );
                    last_failure = "HTTP 429".to_string();
                    if attempt < MANIFEST_MAX_ATTEMPTS {
                        ctx.sleep(RATE_LIMIT_BACKOFF).await?;
                    }
                }
                Step::Failed(e) => return Err(e),
            }
        }

        Err(Error::RetriesExhausted {
            attempts: MANIFEST_MAX_ATTEMPTS,
            reason: format!("{url}: last response {last_failure}"),
        })
    }
}
