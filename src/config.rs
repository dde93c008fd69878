use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    /// Origin registry mapping, keyed by the host name clients pull from
    /// (e.g. `docker.io`, `ghcr.io`).
    pub registries: HashMap<String, RegistryConfig>,
    /// Base URLs of the peer nodes that accept delegated downloads.
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default)]
    pub distribution: DistributionConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub keydb: Option<KeyDbConfig>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Config {
    /// Resolve the registry mapping for `host`.
    pub fn registry(&self, host: &str) -> std::result::Result<&RegistryConfig, Error> {
        self.registries.get(host).ok_or_else(|| Error::ConfigNotFound {
            host: host.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Node identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Base URL other nodes use to reach this node's peer RPC surface.  Also
    /// recorded as the `located` value for layers this node holds.
    pub advertise_address: String,
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:7070`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "0.0.0.0:7070".to_string()
}

// ---------------------------------------------------------------------------
// Origin registries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Base URL of the origin registry (e.g. `https://registry-1.docker.io`).
    pub upstream: String,
    /// Environment variable holding the username for token exchange.
    #[serde(default)]
    pub username_env: Option<String>,
    /// Environment variable holding the password for token exchange.
    #[serde(default)]
    pub password_env: Option<String>,
}

/// Basic credentials presented to a registry's token realm.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl RegistryConfig {
    /// Read the configured credentials from the environment.  Returns `None`
    /// for anonymous registries or when either variable is unset.
    pub fn credentials(&self) -> Option<RegistryCredentials> {
        let username = std::env::var(self.username_env.as_ref()?).ok()?;
        let password = std::env::var(self.password_env.as_ref()?).ok()?;
        Some(RegistryCredentials { username, password })
    }

    /// Absolute URL for `path` on this registry.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.upstream.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

// ---------------------------------------------------------------------------
// Distribution thresholds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct DistributionConfig {
    /// Layers below this size are downloaded by the coordinator itself.
    #[serde(default = "default_small_file_cutoff")]
    pub small_file_cutoff_bytes: u64,
    /// Layers at or above this size get torrent metadata.
    #[serde(default = "default_torrent_cutoff")]
    pub torrent_cutoff_bytes: u64,
    #[serde(default = "bool_true")]
    pub torrent_enabled: bool,
    /// Torrent piece length in bytes.  Power of two, at least 16 KiB.
    #[serde(default = "default_piece_length")]
    pub torrent_piece_length: u64,
    /// Optional tracker announce URL written into generated metainfo.
    #[serde(default)]
    pub torrent_announce: Option<String>,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            small_file_cutoff_bytes: default_small_file_cutoff(),
            torrent_cutoff_bytes: default_torrent_cutoff(),
            torrent_enabled: true,
            torrent_piece_length: default_piece_length(),
            torrent_announce: None,
        }
    }
}

fn default_small_file_cutoff() -> u64 {
    20 * 1024 * 1024
}

fn default_torrent_cutoff() -> u64 {
    200 * 1024 * 1024
}

fn default_piece_length() -> u64 {
    4 * 1024 * 1024
}

fn bool_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Local storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Where the coordinator places small layers it downloads directly.
    pub small_files_dir: PathBuf,
    /// Where this node places layers downloaded on a peer's behalf.
    pub layers_dir: PathBuf,
    /// Root of OCI-derived layers, laid out as `<oci_type>/<algo>/<hex>`.
    pub oci_dir: PathBuf,
}

// ---------------------------------------------------------------------------
// Coordination backends
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    #[default]
    Local,
    Keydb,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Keydb,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinationConfig {
    #[serde(default)]
    pub lock_backend: LockBackend,
    #[serde(default)]
    pub store_backend: StoreBackend,
    /// Expiry (seconds) of KeyDB lock keys, bounding a crashed holder.  Must
    /// cover `timeouts.layer_secs` since a layer lock spans the download.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            lock_backend: LockBackend::default(),
            store_backend: StoreBackend::default(),
            lock_ttl: default_lock_ttl(),
        }
    }
}

fn default_lock_ttl() -> u64 {
    1800
}

// ---------------------------------------------------------------------------
// KeyDB / Redis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct KeyDbConfig {
    /// Connection string (e.g. `rediss://keydb.local:6380`).
    pub endpoint: String,
    #[serde(default = "bool_true")]
    pub tls: bool,
    /// Name of the environment variable that holds the KeyDB auth token.
    #[serde(default = "default_keydb_auth_env")]
    pub auth_token_env: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_keydb_auth_env() -> String {
    "KEYDB_AUTH_TOKEN".to_string()
}

fn default_pool_size() -> usize {
    4
}

// ---------------------------------------------------------------------------
// Deadlines
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// Deadline (seconds) for manifest and auth calls.
    #[serde(default = "default_metadata_timeout")]
    pub metadata_secs: u64,
    /// Deadline (seconds) for a full layer fetch, including delegation.
    #[serde(default = "default_layer_timeout")]
    pub layer_secs: u64,
    /// Budget (seconds) for one peer verification.  A peer that does not
    /// answer in time counts as a failed candidate.
    #[serde(default = "default_peer_check_timeout")]
    pub peer_check_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            metadata_secs: default_metadata_timeout(),
            layer_secs: default_layer_timeout(),
            peer_check_secs: default_peer_check_timeout(),
        }
    }
}

fn default_metadata_timeout() -> u64 {
    60
}

fn default_layer_timeout() -> u64 {
    1800
}

fn default_peer_check_timeout() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("invalid config file: {}", path.display()))
}

/// Parse and validate a YAML document.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("failed to parse config")?;
    validate_config(&config)?;
    Ok(config)
}

/// Sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.registries.is_empty(),
        "at least one registry mapping is required"
    );
    for (host, registry) in &config.registries {
        anyhow::ensure!(
            registry.upstream.starts_with("http://") || registry.upstream.starts_with("https://"),
            "registry '{host}' upstream must be an http(s) URL"
        );
        anyhow::ensure!(
            registry.username_env.is_some() == registry.password_env.is_some(),
            "registry '{host}' must set both username_env and password_env or neither"
        );
    }
    let piece = config.distribution.torrent_piece_length;
    anyhow::ensure!(
        piece >= 16 * 1024 && piece.is_power_of_two(),
        "torrent_piece_length must be a power of two of at least 16384"
    );
    anyhow::ensure!(
        config.distribution.small_file_cutoff_bytes > 0,
        "small_file_cutoff_bytes must be positive"
    );
    let needs_keydb = config.coordination.lock_backend == LockBackend::Keydb
        || config.coordination.store_backend == StoreBackend::Keydb;
    anyhow::ensure!(
        !needs_keydb || config.keydb.is_some(),
        "a keydb section is required when a keydb backend is selected"
    );
    anyhow::ensure!(
        config.coordination.lock_backend != LockBackend::Keydb
            || config.coordination.lock_ttl >= config.timeouts.layer_secs,
        "coordination.lock_ttl ({}s) must be at least timeouts.layer_secs ({}s)",
        config.coordination.lock_ttl,
        config.timeouts.layer_secs
    );
    anyhow::ensure!(
        config.timeouts.peer_check_secs > 0,
        "timeouts.peer_check_secs must be positive"
    );
    Ok(())
}
