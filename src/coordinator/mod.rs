//! The coordinator: request collapsing in front of origin registries and
//! layer placement across the node fleet.
//!
//! One [`Coordinator`] is built at startup and shared by `Arc`.  It owns the
//! three TTL caches and the per-peer task counters; locks and the shared
//! layer store are injected so a single node can run with in-process
//! implementations while a fleet shares KeyDB.
//!
//! Concurrent callers for the same key are serialized by the keyed mutex and
//! re-check the relevant cache once they hold it, so at most one upstream
//! call per key is in flight at any moment.

mod auth;
mod layer;
mod manifest;

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cache::TtlCache;
use crate::config::Config;
use crate::context::CallContext;
use crate::coordination::{KeyGuard, KeyedMutex, NodeBalancer, SharedCacheStore};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::node::NodeService;
use crate::peer::PeerRequester;
use crate::registry::OriginRegistry;

pub use layer::CacheLookup;
pub use manifest::Manifest;

/// Token lifetime when the realm does not report `expires_in`.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(30);
pub const MANIFEST_TTL: Duration = Duration::from_secs(30);
pub const CONTENT_LENGTH_TTL: Duration = Duration::from_secs(10);
pub const MANIFEST_MAX_ATTEMPTS: u32 = 5;
pub const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(2);

/// `(registry_host, repository)`
type TokenKey = (String, String);
/// `(registry_host, repository, tag)`
type ManifestKey = (String, String, String);
/// `(registry_host, digest)`
type LengthKey = (String, String);

pub struct Coordinator {
    config: Arc<Config>,
    tokens: TtlCache<TokenKey, String>,
    manifests: TtlCache<ManifestKey, Manifest>,
    content_lengths: TtlCache<LengthKey, u64>,
    locks: Arc<dyn KeyedMutex>,
    store: Arc<dyn SharedCacheStore>,
    peers: Arc<dyn PeerRequester>,
    origin: Arc<dyn OriginRegistry>,
    node: Arc<NodeService>,
    balancer: NodeBalancer,
    metrics: Arc<Metrics>,
}

impl Coordinator {
    pub fn new(
        config: Arc<Config>,
        node: Arc<NodeService>,
        origin: Arc<dyn OriginRegistry>,
        locks: Arc<dyn KeyedMutex>,
        store: Arc<dyn SharedCacheStore>,
        peers: Arc<dyn PeerRequester>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            tokens: TtlCache::new("auth"),
            manifests: TtlCache::new("manifest"),
            content_lengths: TtlCache::new("content-length"),
            locks,
            store,
            peers,
            origin,
            node,
            balancer: NodeBalancer::new(),
            metrics,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn balancer(&self) -> &NodeBalancer {
        &self.balancer
    }

    /// Context for manifest and auth calls.
    pub fn metadata_context(&self) -> CallContext {
        CallContext::with_timeout(Duration::from_secs(self.config.timeouts.metadata_secs))
    }

    /// Context for a full layer fetch.
    pub fn layer_context(&self) -> CallContext {
        CallContext::with_timeout(Duration::from_secs(self.config.timeouts.layer_secs))
    }

    async fn lock(&self, ctx: &CallContext, key: String) -> Result<KeyGuard> {
        match self.locks.lock(ctx, &key).await {
            Ok(guard) => {
                self.metrics.lock_acquisitions.inc();
                debug!(%key, "lock acquired");
                Ok(guard)
            }
            Err(e) => {
                self.metrics.lock_failures.inc();
                Err(e)
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn set_balancer(&mut self, balancer: NodeBalancer) {
        self.balancer = balancer;
    }
}

#[cfg(test)]
pub(crate) mod testing;
