use std::time::Duration;

use tracing::{debug, info, instrument};

use super::{Coordinator, DEFAULT_TOKEN_TTL};
use crate::context::CallContext;
use crate::error::Result;
use crate::metrics::{CacheName, OriginCall};
use crate::registry::BearerChallenge;

impl Coordinator {
    /// Resolve a bearer token for the registry behind `origin_host`, given
    /// the `WWW-Authenticate` challenge it answered with.
    ///
    /// Tokens are cached per `(host, repository)`.  Only one exchange per key
    /// runs at a time; concurrent callers wait and reuse its result.
    #[instrument(skip(self, ctx, www_authenticate))]
    pub async fn auth_registry(
        &self,
        ctx: &CallContext,
        origin_host: &str,
        www_authenticate: &str,
    ) -> Result<String> {
        let registry = self.config.registry(origin_host)?;
        let challenge = BearerChallenge::parse(www_authenticate)?;
        let key = (
            origin_host.to_string(),
            challenge.repository().unwrap_or_default().to_string(),
        );

        if let Some(token) = self.tokens.get(&key) {
            self.metrics.cache_lookup(CacheName::Auth, true);
            return Ok(token);
        }

        let _guard = self.lock(ctx, format!("auth:{}:{}", key.0, key.1)).await?;
        if let Some(token) = self.tokens.get(&key) {
            self.metrics.cache_lookup(CacheName::Auth, true);
            debug!("token populated while waiting for lock");
            return Ok(token);
        }
        self.metrics.cache_lookup(CacheName::Auth, false);

        self.metrics.origin_call(OriginCall::Token);
        let credentials = registry.credentials();
        let grant = ctx
            .run(self.origin.exchange_token(&challenge, credentials.as_ref()))
            .await?;

        let ttl = grant
            .expires_in
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_TTL);
        info!(repository = %key.1, ttl_secs = ttl.as_secs(), "registry token issued");
        self.tokens.set(key, grant.token.clone(), ttl);
        Ok(grant.token)
    }

    /// Drop a cached token the origin just rejected, so the next
    /// [`auth_registry`](Self::auth_registry) performs a fresh exchange.
    pub(super) fn forget_token(&self, origin_host: &str, www_authenticate: &str, rejected: &str) {
        let Ok(challenge) = BearerChallenge::parse(www_authenticate) else {
            return;
        };
        let key = (
            origin_host.to_string(),
            challenge.repository().unwrap_or_default().to_string(),
        );
        if self.tokens.get(&key).as_deref() == Some(rejected) {
            self.tokens.remove(&key);
        }
    }
}
