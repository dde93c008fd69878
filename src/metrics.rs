use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheLabels {
    pub cache: CacheName,
    pub result: LookupResult,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CacheName {
    Auth,
    Manifest,
    ContentLength,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum LookupResult {
    Hit,
    Miss,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OriginLabels {
    pub call: OriginCall,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum OriginCall {
    Manifest,
    Token,
    Head,
    Blob,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DispatchLabels {
    pub target: DispatchTarget,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum DispatchTarget {
    Local,
    Peer,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LayerHitLabels {
    pub kind: LayerHitKind,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum LayerHitKind {
    Static,
    Oci,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by a pullcache node.
pub struct Metrics {
    // -- in-process caches --
    pub cache_lookups: Family<CacheLabels, Counter>,

    // -- origin --
    pub origin_calls: Family<OriginLabels, Counter>,
    pub origin_rate_limited: Counter,

    // -- locks --
    pub lock_acquisitions: Counter,
    pub lock_failures: Counter,

    // -- layers --
    pub layer_cache_hits: Family<LayerHitLabels, Counter>,
    pub layer_dispatches: Family<DispatchLabels, Counter>,
    pub layer_fetch_duration_seconds: Histogram,
    pub stale_evictions: Counter,
    pub downloaded_bytes: Counter,

    // -- torrents --
    pub torrent_generations: Counter,
    pub torrent_failures: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let cache_lookups = Family::<CacheLabels, Counter>::default();
        registry.register(
            "pullcache_cache_lookups",
            "In-process cache lookups by cache and result",
            cache_lookups.clone(),
        );

        let origin_calls = Family::<OriginLabels, Counter>::default();
        registry.register(
            "pullcache_origin_calls",
            "Calls made to origin registries by kind",
            origin_calls.clone(),
        );

        let origin_rate_limited = Counter::default();
        registry.register(
            "pullcache_origin_rate_limited",
            "HTTP 429 responses received from origin registries",
            origin_rate_limited.clone(),
        );

        let lock_acquisitions = Counter::default();
        registry.register(
            "pullcache_lock_acquisitions",
            "Keyed lock acquisitions",
            lock_acquisitions.clone(),
        );

        let lock_failures = Counter::default();
        registry.register(
            "pullcache_lock_failures",
            "Keyed lock waits that ended without the lock",
            lock_failures.clone(),
        );

        let layer_cache_hits = Family::<LayerHitLabels, Counter>::default();
        registry.register(
            "pullcache_layer_cache_hits",
            "Layer requests served from a verified peer copy",
            layer_cache_hits.clone(),
        );

        let layer_dispatches = Family::<DispatchLabels, Counter>::default();
        registry.register(
            "pullcache_layer_dispatches",
            "Layer downloads by executing node",
            layer_dispatches.clone(),
        );

        let layer_fetch_duration_seconds = Histogram::new(exponential_buckets(0.05, 2.0, 16));
        registry.register(
            "pullcache_layer_fetch_duration_seconds",
            "End-to-end layer fetch latency in seconds",
            layer_fetch_duration_seconds.clone(),
        );

        let stale_evictions = Counter::default();
        registry.register(
            "pullcache_stale_evictions",
            "Shared store rows removed after failed verification",
            stale_evictions.clone(),
        );

        let downloaded_bytes = Counter::default();
        registry.register(
            "pullcache_downloaded_bytes",
            "Layer bytes downloaded from origin by this node",
            downloaded_bytes.clone(),
        );

        let torrent_generations = Counter::default();
        registry.register(
            "pullcache_torrent_generations",
            "Torrent metainfo documents generated",
            torrent_generations.clone(),
        );

        let torrent_failures = Counter::default();
        registry.register(
            "pullcache_torrent_failures",
            "Torrent metainfo generations that failed",
            torrent_failures.clone(),
        );

        Self {
            cache_lookups,
            origin_calls,
            origin_rate_limited,
            lock_acquisitions,
            lock_failures,
            layer_cache_hits,
            layer_dispatches,
            layer_fetch_duration_seconds,
            stale_evictions,
            downloaded_bytes,
            torrent_generations,
            torrent_failures,
        }
    }

    pub fn cache_lookup(&self, cache: CacheName, hit: bool) {
        let result = if hit {
            LookupResult::Hit
        } else {
            LookupResult::Miss
        };
        self.cache_lookups
            .get_or_create(&CacheLabels { cache, result })
            .inc();
    }

    pub fn origin_call(&self, call: OriginCall) {
        self.origin_calls.get_or_create(&OriginLabels { call }).inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry as OpenMetrics text.
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)
            .map_err(|e| anyhow::anyhow!("metrics encoding failed: {e}"))?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
