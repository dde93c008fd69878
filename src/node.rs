//! Local layer operations every node performs on behalf of the coordinator.
//!
//! These back the peer RPC routes.  The coordinator also calls them directly
//! when it is the node holding (or fetching) a layer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::{Metrics, OriginCall};
use crate::model::{digest_rel_path, split_digest, LayerResult};
use crate::registry::OriginRegistry;
use crate::torrent::{torrent_path, TorrentGenerator};

/// Identity of this process, used as the KeyDB lock holder prefix.
pub fn node_id() -> String {
    let host = gethostname::gethostname().to_string_lossy().into_owned();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

/// Extract the digest from a blob path such as `/v2/app/blobs/sha256:ab`.
pub fn digest_from_blob_path(layer_url: &str) -> Result<&str> {
    let digest = layer_url
        .rsplit_once("/blobs/")
        .map(|(_, digest)| digest)
        .ok_or_else(|| Error::InvalidDigest(format!("not a blob path: '{layer_url}'")))?;
    split_digest(digest)?;
    Ok(digest)
}

pub struct NodeService {
    config: Arc<Config>,
    origin: Arc<dyn OriginRegistry>,
    torrents: Arc<dyn TorrentGenerator>,
    metrics: Arc<Metrics>,
}

impl NodeService {
    pub fn new(
        config: Arc<Config>,
        origin: Arc<dyn OriginRegistry>,
        torrents: Arc<dyn TorrentGenerator>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            origin,
            torrents,
            metrics,
        }
    }

    /// The address recorded as `located` for layers held by this node.
    pub fn address(&self) -> &str {
        &self.config.node.advertise_address
    }

    /// Download a blob into this node's layer store.
    pub async fn download_layer(
        &self,
        origin_host: &str,
        layer_url: &str,
        token: Option<&str>,
    ) -> Result<LayerResult> {
        self.download_layer_into(&self.config.storage.layers_dir, origin_host, layer_url, token)
            .await
    }

    /// Download a blob to `<root>/<algo>/<hex>`, attaching torrent metadata
    /// when the layer is large enough.
    #[instrument(skip(self, token), fields(root = %root.display()))]
    pub async fn download_layer_into(
        &self,
        root: &Path,
        origin_host: &str,
        layer_url: &str,
        token: Option<&str>,
    ) -> Result<LayerResult> {
        let registry = self.config.registry(origin_host)?;
        let digest = digest_from_blob_path(layer_url)?;
        let dest = root.join(digest_rel_path(digest)?);

        self.metrics.origin_call(OriginCall::Blob);
        let size = self
            .origin
            .download_blob(&registry.url(layer_url), token, &dest)
            .await?;
        self.metrics.downloaded_bytes.inc_by(size);
        info!(digest, size, path = %dest.display(), "layer downloaded");

        let torrent = self.attach_torrent(digest, &dest, size).await;
        Ok(LayerResult {
            located: self.address().to_string(),
            path: dest.to_string_lossy().into_owned(),
            size,
            torrent,
        })
    }

    /// Confirm a static layer is still present at `path` with the expected
    /// size.
    #[instrument(skip(self))]
    pub async fn check_static_layer(
        &self,
        digest: &str,
        path: &str,
        expected_length: u64,
    ) -> Result<LayerResult> {
        let file = PathBuf::from(path);
        let size = stat_layer(digest, &file).await?;
        if size != expected_length {
            return Err(Error::SizeMismatch {
                digest: digest.to_string(),
                expected: expected_length,
                actual: size,
            });
        }

        let torrent = self.attach_torrent(digest, &file, size).await;
        Ok(LayerResult {
            located: self.address().to_string(),
            path: path.to_string(),
            size,
            torrent,
        })
    }

    /// Confirm an OCI-derived layer exists under `<oci_dir>/<oci_type>`.
    #[instrument(skip(self))]
    pub async fn check_oci_layer(&self, digest: &str, oci_type: &str) -> Result<LayerResult> {
        let valid_type = !oci_type.is_empty()
            && oci_type != "."
            && oci_type != ".."
            && !oci_type.contains(['/', '\\']);
        if !valid_type {
            return Err(Error::LayerNotFound {
                digest: digest.to_string(),
                path: format!("<invalid oci type '{oci_type}'>"),
            });
        }

        let file = self
            .config
            .storage
            .oci_dir
            .join(oci_type)
            .join(digest_rel_path(digest)?);
        let size = stat_layer(digest, &file).await?;
        Ok(LayerResult {
            located: self.address().to_string(),
            path: file.to_string_lossy().into_owned(),
            size,
            torrent: None,
        })
    }

    /// Torrent metadata for a layer above the cutoff.  Reuses an existing
    /// `<file>.torrent`.  Failures are logged and yield `None`.
    pub async fn attach_torrent(&self, digest: &str, path: &Path, size: u64) -> Option<String> {
        let distribution = &self.config.distribution;
        if !distribution.torrent_enabled || size < distribution.torrent_cutoff_bytes {
            return None;
        }

        if let Ok(existing) = tokio::fs::read(torrent_path(path)).await {
            return Some(base64::engine::general_purpose::STANDARD.encode(existing));
        }

        match self.torrents.generate(digest, path).await {
            Ok(metadata) => {
                self.metrics.torrent_generations.inc();
                Some(metadata)
            }
            Err(e) => {
                self.metrics.torrent_failures.inc();
                warn!(digest, error = %e, "torrent generation failed");
                None
            }
        }
    }
}

async fn stat_layer(digest: &str, file: &Path) -> Result<u64> {
    let not_found = || Error::LayerNotFound {
        digest: digest.to_string(),
        path: file.display().to_string(),
    };
    match tokio::fs::metadata(file).await {
        Ok(meta) if meta.is_file() => Ok(meta.len()),
        Ok(_) => Err(not_found()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found()),
        Err(e) => Err(Error::Io(e)),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::config::parse_config;
    use crate::metrics::MetricsRegistry;
    use crate::registry::{BearerChallenge, ManifestResponse, TokenGrant};

    /// Records generate calls and returns a fixed payload.
    #[derive(Default)]
    pub(crate) struct FakeTorrents {
        pub calls: AtomicUsize,
        pub fail: bool,
    }

    #[async_trait]
    impl TorrentGenerator for FakeTorrents {
        async fn generate(&self, digest: &str, _path: &Path) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::ensure!(!self.fail, "generator offline");
            Ok(format!("torrent-for-{digest}"))
        }
    }

    /// Origin that only serves blob downloads, writing `size` zero bytes.
    #[derive(Default)]
    struct BlobOrigin {
        size: u64,
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl OriginRegistry for BlobOrigin {
        async fn fetch_manifest(&self, _: &str, _: Option<&str>) -> Result<ManifestResponse> {
            unreachable!("manifest not used")
        }
        async fn exchange_token(
            &self,
            _: &BearerChallenge,
            _: Option<&crate::config::RegistryCredentials>,
        ) -> Result<TokenGrant> {
            unreachable!("token not used")
        }
        async fn content_length(&self, _: &str, _: Option<&str>) -> Result<u64> {
            Ok(self.size)
        }
        async fn download_blob(&self, url: &str, _: Option<&str>, dest: &Path) -> Result<u64> {
            self.urls.lock().unwrap().push(url.to_string());
            tokio::fs::create_dir_all(dest.parent().unwrap()).await?;
            let file = tokio::fs::File::create(dest).await?;
            file.set_len(self.size).await?;
            Ok(self.size)
        }
    }

    fn config_in(dir: &Path, torrent_cutoff: u64) -> Arc<Config> {
        let yaml = format!(
            r#"
node:
  advertise_address: "http://10.0.0.9:7070"
registries:
  docker.io:
    upstream: "https://registry-1.docker.io"
distribution:
  torrent_cutoff_bytes: {torrent_cutoff}
storage:
  small_files_dir: {root}/small
  layers_dir: {root}/layers
  oci_dir: {root}/oci
"#,
            root = dir.display()
        );
        Arc::new(parse_config(&yaml).unwrap())
    }

    fn service(config: Arc<Config>, size: u64, torrents: Arc<FakeTorrents>) -> NodeService {
        NodeService::new(
            config,
            Arc::new(BlobOrigin {
                size,
                ..Default::default()
            }),
            torrents,
            MetricsRegistry::new().metrics,
        )
    }

    #[test]
    fn blob_path_digest_extraction() {
        assert_eq!(
            digest_from_blob_path("/v2/library/nginx/blobs/sha256:ab12").unwrap(),
            "sha256:ab12"
        );
        assert!(digest_from_blob_path("/v2/library/nginx/manifests/latest").is_err());
        assert!(digest_from_blob_path("/v2/x/blobs/sha256:../../etc").is_err());
    }

    #[test]
    fn node_id_has_host_prefix() {
        let id = node_id();
        let host = gethostname::gethostname().to_string_lossy().into_owned();
        assert!(id.starts_with(&host));
        assert_ne!(id, node_id());
    }

    #[tokio::test]
    async fn download_lands_in_layer_store_with_torrent() {
        let dir = tempfile::tempdir().unwrap();
        let torrents = Arc::new(FakeTorrents::default());
        let node = service(config_in(dir.path(), 1024), 4096, torrents.clone());

        let result = node
            .download_layer("docker.io", "/v2/app/blobs/sha256:cafe", None)
            .await
            .unwrap();

        let expected = dir.path().join("layers").join("sha256").join("cafe");
        assert_eq!(result.path, expected.to_string_lossy());
        assert_eq!(result.located, "http://10.0.0.9:7070");
        assert_eq!(result.size, 4096);
        assert_eq!(result.torrent.as_deref(), Some("torrent-for-sha256:cafe"));
        assert_eq!(torrents.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn download_rejects_path_without_digest() {
        let dir = tempfile::tempdir().unwrap();
        let node = service(config_in(dir.path(), 1024), 1, Arc::default());
        for layer_url in ["/v2/app/manifests/latest", "/v2/app/blobs/sha256:../../x"] {
            let err = node
                .download_layer("docker.io", layer_url, None)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidDigest(_)), "{layer_url}: {err}");
        }
    }

    #[tokio::test]
    async fn download_for_unknown_registry_fails() {
        let dir = tempfile::tempdir().unwrap();
        let node = service(config_in(dir.path(), 1024), 1, Arc::default());
        let err = node
            .download_layer("quay.io", "/v2/app/blobs/sha256:cafe", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound { .. }));
    }

    #[tokio::test]
    async fn check_static_verifies_size() {
        let dir = tempfile::tempdir().unwrap();
        let node = service(config_in(dir.path(), u64::MAX), 0, Arc::default());
        let file = dir.path().join("layer");
        std::fs::write(&file, b"0123456789").unwrap();
        let path = file.to_string_lossy().into_owned();

        let ok = node.check_static_layer("sha256:aa", &path, 10).await.unwrap();
        assert_eq!(ok.size, 10);
        assert!(ok.torrent.is_none());

        let err = node.check_static_layer("sha256:aa", &path, 11).await.unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { expected: 11, actual: 10, .. }));

        let missing = dir.path().join("gone").to_string_lossy().into_owned();
        let err = node.check_static_layer("sha256:aa", &missing, 10).await.unwrap_err();
        assert!(matches!(err, Error::LayerNotFound { .. }));
    }

    #[tokio::test]
    async fn existing_torrent_sidecar_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let torrents = Arc::new(FakeTorrents::default());
        let node = service(config_in(dir.path(), 4), 0, torrents.clone());
        let file = dir.path().join("layer");
        std::fs::write(&file, b"12345678").unwrap();
        std::fs::write(torrent_path(&file), b"d4:infode").unwrap();

        let result = node
            .check_static_layer("sha256:aa", &file.to_string_lossy(), 8)
            .await
            .unwrap();
        assert_eq!(result.torrent.as_deref(), Some("ZDQ6aW5mb2Rl"));
        assert_eq!(torrents.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn torrent_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let torrents = Arc::new(FakeTorrents {
            fail: true,
            ..Default::default()
        });
        let node = service(config_in(dir.path(), 1), 64, torrents.clone());
        let result = node
            .download_layer("docker.io", "/v2/app/blobs/sha256:beef", None)
            .await
            .unwrap();
        assert!(result.torrent.is_none());
        assert_eq!(torrents.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn check_oci_resolves_type_directory() {
        let dir = tempfile::tempdir().unwrap();
        let node = service(config_in(dir.path(), u64::MAX), 0, Arc::default());
        let layer = dir.path().join("oci").join("containerd").join("sha256").join("ab");
        std::fs::create_dir_all(layer.parent().unwrap()).unwrap();
        std::fs::write(&layer, b"oci-bytes").unwrap();

        let result = node.check_oci_layer("sha256:ab", "containerd").await.unwrap();
        assert_eq!(result.size, 9);
        assert_eq!(result.path, layer.to_string_lossy());

        assert!(matches!(
            node.check_oci_layer("sha256:ab", "podman").await,
            Err(Error::LayerNotFound { .. })
        ));
        assert!(matches!(
            node.check_oci_layer("sha256:ab", "../oci").await,
            Err(Error::LayerNotFound { .. })
        ));
    }
}
