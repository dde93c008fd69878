use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{Coordinator, CONTENT_LENGTH_TTL};
use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::metrics::{
    CacheName, DispatchLabels, DispatchTarget, LayerHitKind, LayerHitLabels, OriginCall,
};
use crate::model::{DownloadLayerRequest, LayerKind, LayerLocation, LayerResult};

/// Outcome of probing the shared store for a verified copy of a layer.
#[derive(Debug, Default)]
pub struct CacheLookup {
    /// First candidate whose holder confirmed it, with the holder's answer.
    pub hit: Option<(LayerLocation, LayerResult)>,
    /// Candidates that failed verification, in the order they were tried.
    pub stale: Vec<LayerLocation>,
}

impl Coordinator {
    /// Size of a blob on its origin, cached per `(host, digest)` for ten
    /// seconds.
    #[instrument(skip(self, ctx, bearer_token))]
    pub async fn layer_content_length(
        &self,
        ctx: &CallContext,
        origin_host: &str,
        layer_path: &str,
        digest: &str,
        bearer_token: Option<&str>,
    ) -> Result<u64> {
        let registry = self.config.registry(origin_host)?;
        let key = (origin_host.to_string(), digest.to_string());

        if let Some(length) = self.content_lengths.get(&key) {
            self.metrics.cache_lookup(CacheName::ContentLength, true);
            return Ok(length);
        }

        let _guard = self
            .lock(ctx, format!("length:{origin_host}:{digest}"))
            .await?;
        if let Some(length) = self.content_lengths.get(&key) {
            self.metrics.cache_lookup(CacheName::ContentLength, true);
            return Ok(length);
        }
        self.metrics.cache_lookup(CacheName::ContentLength, false);

        self.metrics.origin_call(OriginCall::Head);
        let length = ctx
            .run(
                self.origin
                    .content_length(&registry.url(layer_path), bearer_token),
            )
            .await?;
        debug!(length, "layer length from origin");
        self.content_lengths.set(key, length, CONTENT_LENGTH_TTL);
        Ok(length)
    }

    /// Look for a node that still holds `digest` at `expected_length`.
    ///
    /// Static copies are tried before OCI-derived ones, each in store order;
    /// the first confirmed candidate wins.  Candidates that fail to verify
    /// are returned in [`CacheLookup::stale`] for the caller to evict.
    #[instrument(skip(self, ctx))]
    pub async fn check_layer_has_cached(
        &self,
        ctx: &CallContext,
        digest: &str,
        expected_length: u64,
    ) -> Result<CacheLookup> {
        let mut lookup = CacheLookup::default();

        for kind in [LayerKind::Static, LayerKind::OciDerived] {
            let candidates = match self.store.query(kind, digest).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(kind = kind.as_str(), error = %format!("{e:#}"), "shared store query failed");
                    Vec::new()
                }
            };

            for location in candidates {
                match self.verify_location(ctx, &location, expected_length).await {
                    Ok(result) => {
                        debug!(located = %location.located, kind = kind.as_str(), "verified cached layer");
                        lookup.hit = Some((location, result));
                        return Ok(lookup);
                    }
                    // Our own deadline or cancellation, not a candidate failure.
                    Err(e @ (Error::DeadlineExceeded | Error::Cancelled)) => return Err(e),
                    Err(e) => {
                        info!(located = %location.located, kind = kind.as_str(), error = %e, "cached layer failed verification");
                        lookup.stale.push(location);
                    }
                }
            }
        }
        Ok(lookup)
    }

    async fn verify_location(
        &self,
        ctx: &CallContext,
        location: &LayerLocation,
        expected_length: u64,
    ) -> Result<LayerResult> {
        let local = location.located == self.node.address();
        let result = match location.kind {
            LayerKind::Static if local => {
                ctx.run(self.node.check_static_layer(&location.digest, &location.data, expected_length))
                    .await?
            }
            LayerKind::Static => {
                self.ask_peer(
                    ctx,
                    &location.located,
                    self.peers.check_static_layer(
                        &location.located,
                        &location.digest,
                        &location.data,
                        expected_length,
                    ),
                )
                .await?
            }
            LayerKind::OciDerived if local => {
                ctx.run(self.node.check_oci_layer(&location.digest, &location.data))
                    .await?
            }
            LayerKind::OciDerived => {
                self.ask_peer(
                    ctx,
                    &location.located,
                    self.peers
                        .check_oci_layer(&location.located, &location.digest, &location.data),
                )
                .await?
            }
        };

        if result.size != expected_length {
            return Err(Error::SizeMismatch {
                digest: location.digest.clone(),
                expected: expected_length,
                actual: result.size,
            });
        }
        Ok(result)
    }

    /// Run one peer verification under the per-peer budget.  Running out of
    /// that budget fails the candidate; the caller's own deadline and
    /// cancellation still propagate.
    async fn ask_peer<F>(&self, ctx: &CallContext, endpoint: &str, call: F) -> Result<LayerResult>
    where
        F: Future<Output = Result<LayerResult>>,
    {
        let budget = Duration::from_secs(self.config.timeouts.peer_check_secs);
        match tokio::time::timeout(budget, ctx.run(call)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Peer {
                endpoint: endpoint.to_string(),
                reason: format!("no answer within {}s", budget.as_secs()),
            }),
        }
    }

    /// Best-effort removal of the rows in `lookup.stale`.
    ///
    /// Torrent metadata is keyed by digest alone, so it is dropped only when
    /// the lookup found no verified holder.
    pub async fn evict_stale(&self, lookup: &CacheLookup) {
        let mut evicted: Option<&str> = None;
        for location in &lookup.stale {
            let deleted = match location.kind {
                LayerKind::Static => self.store.delete_static(location).await,
                LayerKind::OciDerived => self.store.delete_oci(location).await,
            };
            if let Err(e) = deleted {
                warn!(digest = %location.digest, located = %location.located, error = %format!("{e:#}"), "failed to evict stale layer row");
                continue;
            }
            evicted = Some(location.digest.as_str());
            self.metrics.stale_evictions.inc();
            info!(digest = %location.digest, located = %location.located, kind = location.kind.as_str(), "evicted stale layer row");
        }

        if let (Some(digest), None) = (evicted, &lookup.hit) {
            if let Err(e) = self.store.delete_torrent(digest).await {
                warn!(digest, error = %format!("{e:#}"), "failed to drop torrent metadata");
            }
        }
    }

    /// Materialize a layer somewhere in the fleet.
    ///
    /// Layers under the small-file cutoff are downloaded by this node.
    /// Larger ones go to the least-loaded peer, whose answer is returned
    /// unchanged.  With no peers configured this node downloads them itself.
    #[instrument(skip(self, ctx), fields(digest = %request.digest))]
    pub async fn distribute_download_layer_task(
        &self,
        ctx: &CallContext,
        request: &DownloadLayerRequest,
        length: u64,
    ) -> Result<LayerResult> {
        let token = request.bearer_token.as_deref();

        if length < self.config.distribution.small_file_cutoff_bytes {
            return self
                .download_here(ctx, request, &self.config.storage.small_files_dir)
                .await;
        }

        let Some(slot) = self.balancer.distribute_node(&self.config.peers) else {
            debug!(length, "no peers configured, downloading large layer locally");
            return self
                .download_here(ctx, request, &self.config.storage.layers_dir)
                .await;
        };

        if slot.endpoint() == self.node.address() {
            return self
                .download_here(ctx, request, &self.config.storage.layers_dir)
                .await;
        }

        self.metrics
            .layer_dispatches
            .get_or_create(&DispatchLabels {
                target: DispatchTarget::Peer,
            })
            .inc();
        info!(peer = slot.endpoint(), length, "delegating layer download");
        let result = ctx
            .run(self.peers.download_layer(
                slot.endpoint(),
                &request.origin_host,
                &request.origin_path,
                token,
            ))
            .await;
        drop(slot);
        result
    }

    async fn download_here(
        &self,
        ctx: &CallContext,
        request: &DownloadLayerRequest,
        root: &std::path::Path,
    ) -> Result<LayerResult> {
        self.metrics
            .layer_dispatches
            .get_or_create(&DispatchLabels {
                target: DispatchTarget::Local,
            })
            .inc();
        ctx.run(self.node.download_layer_into(
            root,
            &request.origin_host,
            &request.origin_path,
            request.bearer_token.as_deref(),
        ))
        .await
    }

    /// Resolve a blob to a node holding it: reuse a verified copy when one
    /// exists, otherwise download it and record where it landed.
    ///
    /// Serialized per digest so concurrent pulls of one layer trigger a
    /// single download.
    #[instrument(skip(self, ctx), fields(digest = %request.digest, origin_host = %request.origin_host))]
    pub async fn fetch_layer(
        &self,
        ctx: &CallContext,
        request: &DownloadLayerRequest,
    ) -> Result<LayerResult> {
        let started = Instant::now();
        let _guard = self.lock(ctx, format!("layer:{}", request.digest)).await?;

        let length = self
            .layer_content_length(
                ctx,
                &request.origin_host,
                &request.origin_path,
                &request.digest,
                request.bearer_token.as_deref(),
            )
            .await?;

        let lookup = self
            .check_layer_has_cached(ctx, &request.digest, length)
            .await?;
        self.evict_stale(&lookup).await;

        if let Some((location, mut result)) = lookup.hit {
            let kind = match location.kind {
                LayerKind::Static => LayerHitKind::Static,
                LayerKind::OciDerived => LayerHitKind::Oci,
            };
            self.metrics
                .layer_cache_hits
                .get_or_create(&LayerHitLabels { kind })
                .inc();
            if result.torrent.is_none() && length >= self.config.distribution.torrent_cutoff_bytes {
                result.torrent = self.store.get_torrent(&request.digest).await.unwrap_or_else(|e| {
                    warn!(error = %format!("{e:#}"), "failed to read torrent metadata");
                    None
                });
            }
            info!(located = %result.located, size = length, "serving layer from cache");
            return Ok(result);
        }

        let result = self
            .distribute_download_layer_task(ctx, request, length)
            .await?;
        if result.size != length {
            return Err(Error::SizeMismatch {
                digest: request.digest.clone(),
                expected: length,
                actual: result.size,
            });
        }

        if let Err(e) = self
            .store
            .save_static(&request.digest, &result.path, &result.located)
            .await
        {
            warn!(error = %format!("{e:#}"), "failed to record layer location");
        }
        if let Some(torrent) = &result.torrent {
            if let Err(e) = self.store.save_torrent(&request.digest, torrent).await {
                warn!(error = %format!("{e:#}"), "failed to record torrent metadata");
            }
        }

        self.metrics
            .layer_fetch_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        info!(located = %result.located, size = result.size, torrent = result.torrent.is_some(), "layer fetched");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use super::super::testing::{Harness, PEER_A, PEER_B};
    use super::*;
    use crate::coordination::{NodeBalancer, SharedCacheStore};

    const MB: u64 = 1024 * 1024;

    fn request(digest: &str) -> DownloadLayerRequest {
        DownloadLayerRequest {
            origin_host: "docker.io".into(),
            origin_path: format!("/v2/library/nginx/blobs/{digest}"),
            bearer_token: Some("tok".into()),
            repository: "library/nginx".into(),
            digest: digest.into(),
        }
    }

    fn static_row(digest: &str, located: &str, path: &str) -> LayerLocation {
        LayerLocation {
            digest: digest.into(),
            kind: LayerKind::Static,
            located: located.into(),
            data: path.into(),
        }
    }

    async fn length_of(h: &Harness, ctx: &CallContext) -> Result<u64> {
        h.coordinator
            .layer_content_length(ctx, "docker.io", "/v2/app/blobs/sha256:aa", "sha256:aa", None)
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn content_length_is_cached_for_ten_seconds() {
        let h = Harness::new();
        h.origin.set_length(42);
        let ctx = h.coordinator.layer_context();

        assert_eq!(length_of(&h, &ctx).await.unwrap(), 42);
        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(length_of(&h, &ctx).await.unwrap(), 42);
        assert_eq!(h.origin.head_calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        length_of(&h, &ctx).await.unwrap();
        assert_eq!(h.origin.head_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_static_row_is_evicted_and_next_candidate_wins() {
        let h = Harness::new();
        let digest = "sha256:aa";
        let stale = static_row(digest, PEER_A, "/layers/sha256/aa");
        let healthy = static_row(digest, PEER_B, "/layers/sha256/aa");
        h.store.save(&stale).await.unwrap();
        h.store.save(&healthy).await.unwrap();
        h.store.save_torrent(digest, "old-torrent").await.unwrap();
        h.peers.fail_checks_on(PEER_A);

        let ctx = h.coordinator.layer_context();
        let lookup = h
            .coordinator
            .check_layer_has_cached(&ctx, digest, 100)
            .await
            .unwrap();
        let (hit, result) = lookup.hit.clone().unwrap();
        assert_eq!(hit, healthy);
        assert_eq!(result.located, PEER_B);
        assert_eq!(lookup.stale, vec![stale.clone()]);

        h.coordinator.evict_stale(&lookup).await;
        assert_eq!(h.store.query_static(digest).await.unwrap(), vec![healthy]);
        assert_eq!(
            h.store.get_torrent(digest).await.unwrap().as_deref(),
            Some("old-torrent")
        );
    }

    #[tokio::test]
    async fn torrent_dropped_when_every_candidate_is_stale() {
        let h = Harness::new();
        let digest = "sha256:a0";
        h.store
            .save(&static_row(digest, PEER_A, "/layers/sha256/a0"))
            .await
            .unwrap();
        h.store.save_torrent(digest, "old-torrent").await.unwrap();
        h.peers.fail_checks_on(PEER_A);

        let ctx = h.coordinator.layer_context();
        let lookup = h
            .coordinator
            .check_layer_has_cached(&ctx, digest, 100)
            .await
            .unwrap();
        assert!(lookup.hit.is_none());

        h.coordinator.evict_stale(&lookup).await;
        assert!(h.store.query_static(digest).await.unwrap().is_empty());
        assert_eq!(h.store.get_torrent(digest).await.unwrap(), None);
    }

    #[tokio::test]
    async fn hit_after_stale_row_keeps_stored_torrent() {
        let h = Harness::new();
        let digest = "sha256:a1";
        let length = 300 * MB;
        h.origin.set_length(length);
        h.store
            .save(&static_row(digest, PEER_A, "/layers/sha256/a1"))
            .await
            .unwrap();
        h.store
            .save(&static_row(digest, PEER_B, "/layers/sha256/a1"))
            .await
            .unwrap();
        h.store.save_torrent(digest, "c3RvcmVk").await.unwrap();
        h.peers.fail_checks_on(PEER_A);

        let ctx = h.coordinator.layer_context();
        let result = h
            .coordinator
            .fetch_layer(&ctx, &request(digest))
            .await
            .unwrap();
        assert_eq!(result.located, PEER_B);
        assert_eq!(result.torrent.as_deref(), Some("c3RvcmVk"));
        assert_eq!(
            h.store.query_static(digest).await.unwrap(),
            vec![static_row(digest, PEER_B, "/layers/sha256/a1")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_fails_its_candidate_only() {
        let h = Harness::new();
        let digest = "sha256:a2";
        let silent = static_row(digest, PEER_A, "/layers/sha256/a2");
        let healthy = static_row(digest, PEER_B, "/layers/sha256/a2");
        h.store.save(&silent).await.unwrap();
        h.store.save(&healthy).await.unwrap();
        h.peers.never_answer_checks_on(PEER_A);

        let ctx = h.coordinator.layer_context();
        let start = Instant::now();
        let lookup = h
            .coordinator
            .check_layer_has_cached(&ctx, digest, 100)
            .await
            .unwrap();

        let (hit, _) = lookup.hit.unwrap();
        assert_eq!(hit, healthy);
        assert_eq!(lookup.stale, vec![silent]);
        let budget = Duration::from_secs(h.coordinator.config().timeouts.peer_check_secs);
        assert_eq!(start.elapsed(), budget);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_deadline_still_wins_over_peer_budget() {
        let h = Harness::new();
        let digest = "sha256:a3";
        h.store
            .save(&static_row(digest, PEER_A, "/layers/sha256/a3"))
            .await
            .unwrap();
        h.peers.never_answer_checks_on(PEER_A);

        let ctx = CallContext::with_timeout(Duration::from_secs(2));
        let err = h
            .coordinator
            .check_layer_has_cached(&ctx, digest, 100)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded), "got {err}");
    }

    #[tokio::test]
    async fn size_mismatch_marks_candidate_stale_and_misses() {
        let h = Harness::new();
        let digest = "sha256:bb";
        let row = static_row(digest, PEER_A, "/layers/sha256/bb");
        h.store.save(&row).await.unwrap();
        h.peers.set_reported_size(99);

        let ctx = h.coordinator.layer_context();
        let lookup = h
            .coordinator
            .check_layer_has_cached(&ctx, digest, 100)
            .await
            .unwrap();
        assert!(lookup.hit.is_none());
        assert_eq!(lookup.stale, vec![row]);
    }

    #[tokio::test]
    async fn static_candidates_are_preferred_over_oci() {
        let h = Harness::new();
        let digest = "sha256:cc";
        h.store.save_oci(digest, "containerd", PEER_A).await.unwrap();
        h.store
            .save_static(digest, "/layers/sha256/cc", PEER_B)
            .await
            .unwrap();

        let ctx = h.coordinator.layer_context();
        let lookup = h
            .coordinator
            .check_layer_has_cached(&ctx, digest, 100)
            .await
            .unwrap();
        let (hit, _) = lookup.hit.unwrap();
        assert_eq!(hit.kind, LayerKind::Static);
        assert_eq!(h.peers.oci_checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn oci_candidate_used_when_no_static_copy() {
        let h = Harness::new();
        let digest = "sha256:dd";
        h.store.save_oci(digest, "containerd", PEER_A).await.unwrap();

        let ctx = h.coordinator.layer_context();
        let lookup = h
            .coordinator
            .check_layer_has_cached(&ctx, digest, 100)
            .await
            .unwrap();
        let (hit, result) = lookup.hit.unwrap();
        assert_eq!(hit.kind, LayerKind::OciDerived);
        assert_eq!(result.located, PEER_A);
    }

    #[tokio::test]
    async fn small_layer_downloads_into_small_file_area() {
        let h = Harness::new();
        h.origin.set_length(MB);

        let ctx = h.coordinator.layer_context();
        let result = h
            .coordinator
            .fetch_layer(&ctx, &request("sha256:ee"))
            .await
            .unwrap();

        let expected = h.dir.path().join("small").join("sha256").join("ee");
        assert_eq!(result.path, expected.to_string_lossy());
        assert_eq!(result.located, h.coordinator.config().node.advertise_address);
        assert_eq!(h.peers.downloads.load(Ordering::SeqCst), 0);
        assert_eq!(
            h.store.query_static("sha256:ee").await.unwrap(),
            vec![static_row("sha256:ee", &result.located, &result.path)]
        );
        assert_eq!(
            h.origin.download_urls(),
            vec!["https://registry-1.docker.io/v2/library/nginx/blobs/sha256:ee".to_string()]
        );
        let metrics = h.metrics.encode().unwrap();
        assert!(metrics.contains(r#"pullcache_origin_calls_total{call="Blob"} 1"#), "{metrics}");
    }

    #[tokio::test]
    async fn large_first_time_layer_goes_to_least_loaded_peer() {
        let mut h = Harness::new();
        let length = 300 * MB;
        h.origin.set_length(length);
        h.peers.set_download_result(LayerResult {
            located: PEER_B.into(),
            path: "/layers/sha256/ff".into(),
            size: length,
            torrent: Some("bWV0YWluZm8=".into()),
        });
        h.with_coordinator(|c| c.set_balancer(NodeBalancer::with_loads([(PEER_A, 1), (PEER_B, 0)])));

        let ctx = h.coordinator.layer_context();
        let result = h
            .coordinator
            .fetch_layer(&ctx, &request("sha256:ff"))
            .await
            .unwrap();

        assert_eq!(result.located, PEER_B);
        assert_eq!(result.size, length);
        assert_eq!(result.torrent.as_deref(), Some("bWV0YWluZm8="));
        assert_eq!(h.peers.download_endpoints(), vec![PEER_B.to_string()]);
        assert_eq!(h.origin.head_calls.load(Ordering::SeqCst), 1);
        assert!(h.origin.download_urls().is_empty());
        let metrics = h.metrics.encode().unwrap();
        assert!(!metrics.contains(r#"pullcache_origin_calls_total{call="Blob"}"#), "{metrics}");
        assert!(metrics.contains(r#"pullcache_origin_calls_total{call="Head"} 1"#), "{metrics}");

        assert_eq!(h.coordinator.balancer().load(PEER_B), Some(0));
        assert_eq!(h.coordinator.balancer().load(PEER_A), Some(1));
        assert_eq!(
            h.store.query_static("sha256:ff").await.unwrap(),
            vec![static_row("sha256:ff", PEER_B, "/layers/sha256/ff")]
        );
        assert_eq!(
            h.store.get_torrent("sha256:ff").await.unwrap().as_deref(),
            Some("bWV0YWluZm8=")
        );
    }

    #[tokio::test]
    async fn verified_hit_skips_download() {
        let h = Harness::new();
        h.origin.set_length(100);
        h.store
            .save_static("sha256:ab", "/layers/sha256/ab", PEER_A)
            .await
            .unwrap();

        let ctx = h.coordinator.layer_context();
        let result = h
            .coordinator
            .fetch_layer(&ctx, &request("sha256:ab"))
            .await
            .unwrap();
        assert_eq!(result.located, PEER_A);
        assert!(h.origin.download_urls().is_empty());
        assert_eq!(h.peers.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn large_layer_without_peers_downloads_locally_with_torrent() {
        let h = Harness::with_peers(&[]);
        let length = 250 * MB;
        h.origin.set_length(length);

        let ctx = h.coordinator.layer_context();
        let result = h
            .coordinator
            .fetch_layer(&ctx, &request("sha256:abcd"))
            .await
            .unwrap();
        let expected = h.dir.path().join("layers").join("sha256").join("abcd");
        assert_eq!(result.path, expected.to_string_lossy());
        assert_eq!(result.torrent.as_deref(), Some("torrent-for-sha256:abcd"));
        assert_eq!(h.torrents.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_peer_download_releases_slot() {
        let h = Harness::new();
        h.origin.set_length(300 * MB);
        h.peers.fail_downloads();

        let ctx = h.coordinator.layer_context();
        let err = h
            .coordinator
            .fetch_layer(&ctx, &request("sha256:0f"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Peer { .. }));
        assert_eq!(h.coordinator.balancer().load(PEER_A), Some(0));
        assert!(h.store.query_static("sha256:0f").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_fetches_of_one_digest_download_once() {
        let h = Harness::new();
        h.origin.set_length(MB);
        h.origin.set_download_delay(Duration::from_millis(50));

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let coordinator = Arc::clone(&h.coordinator);
            tasks.push(tokio::spawn(async move {
                let ctx = coordinator.layer_context();
                coordinator.fetch_layer(&ctx, &request("sha256:99")).await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().size, MB);
        }
        assert_eq!(h.origin.download_urls().len(), 1);
    }
}
