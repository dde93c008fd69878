//! In-crate fakes for coordinator tests.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::Coordinator;
use crate::config::{parse_config, RegistryCredentials};
use crate::coordination::{LocalKeyedMutex, MemoryCacheStore};
use crate::error::{Error, Result};
use crate::metrics::MetricsRegistry;
use crate::model::LayerResult;
use crate::node::tests::FakeTorrents;
use crate::node::NodeService;
use crate::peer::PeerRequester;
use crate::registry::{BearerChallenge, ManifestResponse, OriginRegistry, TokenGrant};

pub(crate) const SELF_ADDR: &str = "http://10.0.0.1:7070";
pub(crate) const PEER_A: &str = "http://10.0.0.2:7070";
pub(crate) const PEER_B: &str = "http://10.0.0.3:7070";

pub(crate) fn challenge_for(auth_base: &str, repository: &str) -> String {
    format!(
        r#"Bearer realm="{auth_base}/token",service="registry.docker.io",scope="repository:{repository}:pull""#
    )
}

pub(crate) fn manifest_ok(body: &[u8]) -> ManifestResponse {
    ManifestResponse {
        status: 200,
        www_authenticate: None,
        content_type: Some("application/vnd.oci.image.manifest.v1+json".to_string()),
        body: Bytes::copy_from_slice(body),
    }
}

pub(crate) fn status(code: u16, www_authenticate: Option<&str>) -> ManifestResponse {
    ManifestResponse {
        status: code,
        www_authenticate: www_authenticate.map(str::to_string),
        content_type: None,
        body: Bytes::new(),
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Origin
// ---------------------------------------------------------------------------

pub(crate) struct FakeOrigin {
    manifests: Mutex<VecDeque<ManifestResponse>>,
    manifest_delay: Mutex<Duration>,
    seen_tokens: Mutex<Vec<Option<String>>>,
    pub manifest_calls: AtomicUsize,
    grant: Mutex<TokenGrant>,
    token_delay: Mutex<Duration>,
    pub token_calls: AtomicUsize,
    length: AtomicU64,
    pub head_calls: AtomicUsize,
    downloads: Mutex<Vec<String>>,
    download_delay: Mutex<Duration>,
}

impl Default for FakeOrigin {
    fn default() -> Self {
        Self {
            manifests: Mutex::default(),
            manifest_delay: Mutex::default(),
            seen_tokens: Mutex::default(),
            manifest_calls: AtomicUsize::new(0),
            grant: Mutex::new(TokenGrant {
                token: "issued-token".to_string(),
                expires_in: None,
            }),
            token_delay: Mutex::default(),
            token_calls: AtomicUsize::new(0),
            length: AtomicU64::new(0),
            head_calls: AtomicUsize::new(0),
            downloads: Mutex::default(),
            download_delay: Mutex::default(),
        }
    }
}

impl FakeOrigin {
    pub fn push_manifest(&self, response: ManifestResponse) {
        lock(&self.manifests).push_back(response);
    }

    pub fn set_manifest_delay(&self, delay: Duration) {
        *lock(&self.manifest_delay) = delay;
    }

    pub fn manifest_tokens(&self) -> Vec<Option<String>> {
        lock(&self.seen_tokens).clone()
    }

    pub fn set_grant(&self, grant: TokenGrant) {
        *lock(&self.grant) = grant;
    }

    pub fn set_token_delay(&self, delay: Duration) {
        *lock(&self.token_delay) = delay;
    }

    pub fn set_length(&self, length: u64) {
        self.length.store(length, Ordering::SeqCst);
    }

    pub fn set_download_delay(&self, delay: Duration) {
        *lock(&self.download_delay) = delay;
    }

    pub fn download_urls(&self) -> Vec<String> {
        lock(&self.downloads).clone()
    }
}

#[async_trait]
impl OriginRegistry for FakeOrigin {
    async fn fetch_manifest(&self, _url: &str, token: Option<&str>) -> Result<ManifestResponse> {
        self.manifest_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.seen_tokens).push(token.map(str::to_string));
        let delay = *lock(&self.manifest_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(lock(&self.manifests)
            .pop_front()
            .unwrap_or_else(|| status(500, None)))
    }

    async fn exchange_token(
        &self,
        _challenge: &BearerChallenge,
        _credentials: Option<&RegistryCredentials>,
    ) -> Result<TokenGrant> {
        self.token_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.token_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(lock(&self.grant).clone())
    }

    async fn content_length(&self, _url: &str, _token: Option<&str>) -> Result<u64> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.length.load(Ordering::SeqCst))
    }

    async fn download_blob(&self, url: &str, _token: Option<&str>, dest: &Path) -> Result<u64> {
        lock(&self.downloads).push(url.to_string());
        let delay = *lock(&self.download_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let size = self.length.load(Ordering::SeqCst);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(dest).await?;
        file.set_len(size).await?;
        Ok(size)
    }
}

// ---------------------------------------------------------------------------
// Peers
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct FakePeers {
    failing: Mutex<HashSet<String>>,
    silent: Mutex<HashSet<String>>,
    reported_size: Mutex<Option<u64>>,
    download_result: Mutex<Option<LayerResult>>,
    download_fails: AtomicBool,
    endpoints: Mutex<Vec<String>>,
    pub static_checks: AtomicUsize,
    pub oci_checks: AtomicUsize,
    pub downloads: AtomicUsize,
}

impl FakePeers {
    pub fn fail_checks_on(&self, endpoint: &str) {
        lock(&self.failing).insert(endpoint.to_string());
    }

    /// Checks sent to `endpoint` are accepted but never answered.
    pub fn never_answer_checks_on(&self, endpoint: &str) {
        lock(&self.silent).insert(endpoint.to_string());
    }

    async fn maybe_hang(&self, endpoint: &str) {
        let silent = lock(&self.silent).contains(endpoint);
        if silent {
            std::future::pending::<()>().await;
        }
    }

    /// Size every check reports instead of the expected length.
    pub fn set_reported_size(&self, size: u64) {
        *lock(&self.reported_size) = Some(size);
    }

    pub fn set_download_result(&self, result: LayerResult) {
        *lock(&self.download_result) = Some(result);
    }

    pub fn fail_downloads(&self) {
        self.download_fails.store(true, Ordering::SeqCst);
    }

    pub fn download_endpoints(&self) -> Vec<String> {
        lock(&self.endpoints).clone()
    }

    fn check(&self, endpoint: &str, path: &str, expected: u64) -> Result<LayerResult> {
        if lock(&self.failing).contains(endpoint) {
            return Err(Error::Peer {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(LayerResult {
            located: endpoint.to_string(),
            path: path.to_string(),
            size: lock(&self.reported_size).unwrap_or(expected),
            torrent: None,
        })
    }
}

#[async_trait]
impl PeerRequester for FakePeers {
    async fn download_layer(
        &self,
        endpoint: &str,
        _origin_host: &str,
        _layer_url: &str,
        _token: Option<&str>,
    ) -> Result<LayerResult> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        lock(&self.endpoints).push(endpoint.to_string());
        if self.download_fails.load(Ordering::SeqCst) {
            return Err(Error::Peer {
                endpoint: endpoint.to_string(),
                reason: "HTTP 502 Bad Gateway".to_string(),
            });
        }
        lock(&self.download_result).clone().ok_or_else(|| Error::Peer {
            endpoint: endpoint.to_string(),
            reason: "no download result scripted".to_string(),
        })
    }

    async fn check_static_layer(
        &self,
        endpoint: &str,
        _digest: &str,
        path: &str,
        expected_length: u64,
    ) -> Result<LayerResult> {
        self.static_checks.fetch_add(1, Ordering::SeqCst);
        self.maybe_hang(endpoint).await;
        self.check(endpoint, path, expected_length)
    }

    async fn check_oci_layer(
        &self,
        endpoint: &str,
        digest: &str,
        oci_type: &str,
    ) -> Result<LayerResult> {
        self.oci_checks.fetch_add(1, Ordering::SeqCst);
        self.maybe_hang(endpoint).await;
        let path = format!("/oci/{oci_type}/{digest}");
        // OCI checks carry no expected length; the coordinator compares.
        let size = lock(&self.reported_size).unwrap_or(100);
        self.check(endpoint, &path, size)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub(crate) struct Harness {
    pub dir: tempfile::TempDir,
    pub origin: Arc<FakeOrigin>,
    pub peers: Arc<FakePeers>,
    pub store: Arc<MemoryCacheStore>,
    pub torrents: Arc<FakeTorrents>,
    pub metrics: MetricsRegistry,
    pub node: Arc<NodeService>,
    pub coordinator: Arc<Coordinator>,
}

impl Harness {
    /// A coordinator with two peers configured.
    pub fn new() -> Self {
        Self::with_peers(&[PEER_A, PEER_B])
    }

    pub fn with_peers(peers: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let peer_list = peers
            .iter()
            .map(|p| format!("  - \"{p}\"\n"))
            .collect::<String>();
        let yaml = format!(
            r#"
node:
  advertise_address: "{SELF_ADDR}"
registries:
  docker.io:
    upstream: "https://registry-1.docker.io"
peers:
{peers}
storage:
  small_files_dir: {root}/small
  layers_dir: {root}/layers
  oci_dir: {root}/oci
"#,
            peers = if peer_list.is_empty() { "  []\n".to_string() } else { peer_list },
            root = dir.path().display(),
        );
        let config = Arc::new(parse_config(&yaml).unwrap());

        let origin = Arc::new(FakeOrigin::default());
        let peers = Arc::new(FakePeers::default());
        let store = Arc::new(MemoryCacheStore::new());
        let torrents = Arc::new(FakeTorrents::default());
        let metrics = MetricsRegistry::new();

        let node = Arc::new(NodeService::new(
            Arc::clone(&config),
            origin.clone(),
            torrents.clone(),
            Arc::clone(&metrics.metrics),
        ));
        let coordinator = Arc::new(Coordinator::new(
            config,
            Arc::clone(&node),
            origin.clone(),
            Arc::new(LocalKeyedMutex::new()),
            store.clone(),
            peers.clone(),
            Arc::clone(&metrics.metrics),
        ));

        Self {
            dir,
            origin,
            peers,
            store,
            torrents,
            metrics,
            node,
            coordinator,
        }
    }

    pub fn origin_url(&self) -> String {
        "https://auth.docker.io".to_string()
    }

    /// Adjust the coordinator before any task shares it.
    pub fn with_coordinator(&mut self, f: impl FnOnce(&mut Coordinator)) {
        let coordinator = Arc::get_mut(&mut self.coordinator)
            .expect("coordinator already shared");
        f(coordinator);
    }
}
