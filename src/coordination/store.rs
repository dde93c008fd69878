//! Cluster-visible registry of which node holds which layer.
//!
//! Rows are grouped per `(kind, digest)` and returned in insertion order, so
//! the coordinator's first-match-wins lookup is stable across calls.  The
//! store is multi-writer: any node may add or remove rows at any time, and
//! readers must treat a row that vanished mid-lookup as a normal miss.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fred::interfaces::{KeysInterface, ListInterface};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::model::{LayerKind, LayerLocation};

#[async_trait]
pub trait SharedCacheStore: Send + Sync {
    /// All rows for `digest` of the given kind, oldest first.
    async fn query(&self, kind: LayerKind, digest: &str) -> Result<Vec<LayerLocation>>;

    /// Add a row.  Saving an identical row again moves it to the end.
    async fn save(&self, location: &LayerLocation) -> Result<()>;

    /// Remove exactly this row; other nodes' rows for the digest stay.
    async fn delete(&self, location: &LayerLocation) -> Result<()>;

    async fn save_torrent(&self, digest: &str, metadata: &str) -> Result<()>;

    async fn get_torrent(&self, digest: &str) -> Result<Option<String>>;

    async fn delete_torrent(&self, digest: &str) -> Result<()>;

    async fn query_static(&self, digest: &str) -> Result<Vec<LayerLocation>> {
        self.query(LayerKind::Static, digest).await
    }

    async fn query_oci(&self, digest: &str) -> Result<Vec<LayerLocation>> {
        self.query(LayerKind::OciDerived, digest).await
    }

    async fn save_static(&self, digest: &str, path: &str, located: &str) -> Result<()> {
        self.save(&LayerLocation {
            digest: digest.to_string(),
            kind: LayerKind::Static,
            located: located.to_string(),
            data: path.to_string(),
        })
        .await
    }

    async fn save_oci(&self, digest: &str, oci_type: &str, located: &str) -> Result<()> {
        self.save(&LayerLocation {
            digest: digest.to_string(),
            kind: LayerKind::OciDerived,
            located: located.to_string(),
            data: oci_type.to_string(),
        })
        .await
    }

    async fn delete_static(&self, location: &LayerLocation) -> Result<()> {
        anyhow::ensure!(
            location.kind == LayerKind::Static,
            "delete_static called with a {} row",
            location.kind.as_str()
        );
        self.delete(location).await
    }

    async fn delete_oci(&self, location: &LayerLocation) -> Result<()> {
        anyhow::ensure!(
            location.kind == LayerKind::OciDerived,
            "delete_oci called with a {} row",
            location.kind.as_str()
        );
        self.delete(location).await
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Single-process store used when no KeyDB is configured, and in tests.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    rows: Mutex<HashMap<(LayerKind, String), Vec<LayerLocation>>>,
    torrents: Mutex<HashMap<String, String>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedCacheStore for MemoryCacheStore {
    async fn query(&self, kind: LayerKind, digest: &str) -> Result<Vec<LayerLocation>> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        Ok(rows
            .get(&(kind, digest.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, location: &LayerLocation) -> Result<()> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let list = rows
            .entry((location.kind, location.digest.clone()))
            .or_default();
        list.retain(|row| row != location);
        list.push(location.clone());
        Ok(())
    }

    async fn delete(&self, location: &LayerLocation) -> Result<()> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let key = (location.kind, location.digest.clone());
        if let Some(list) = rows.get_mut(&key) {
            list.retain(|row| row != location);
            if list.is_empty() {
                rows.remove(&key);
            }
        }
        Ok(())
    }

    async fn save_torrent(&self, digest: &str, metadata: &str) -> Result<()> {
        self.torrents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(digest.to_string(), metadata.to_string());
        Ok(())
    }

    async fn get_torrent(&self, digest: &str) -> Result<Option<String>> {
        Ok(self
            .torrents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(digest)
            .cloned())
    }

    async fn delete_torrent(&self, digest: &str) -> Result<()> {
        self.torrents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(digest);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// KeyDB store
// ---------------------------------------------------------------------------

/// What is persisted per list element; digest and kind live in the key.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRow {
    located: String,
    data: String,
}

pub(crate) fn layer_key(kind: LayerKind, digest: &str) -> String {
    format!("pullcache:layer:{}:{digest}", kind.as_str())
}

pub(crate) fn torrent_key(digest: &str) -> String {
    format!("pullcache:torrent:{digest}")
}

fn encode_row(location: &LayerLocation) -> Result<String> {
    serde_json::to_string(&StoredRow {
        located: location.located.clone(),
        data: location.data.clone(),
    })
    .context("encode layer row")
}

/// Shared store backed by KeyDB lists, one list per `(kind, digest)`.
#[derive(Clone)]
pub struct KeyDbCacheStore {
    pool: fred::clients::Pool,
}

impl KeyDbCacheStore {
    pub fn new(pool: fred::clients::Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SharedCacheStore for KeyDbCacheStore {
    async fn query(&self, kind: LayerKind, digest: &str) -> Result<Vec<LayerLocation>> {
        let key = layer_key(kind, digest);
        let raw: Vec<String> = self
            .pool
            .lrange(&key, 0, -1)
            .await
            .with_context(|| format!("LRANGE {key}"))?;

        let rows = raw
            .into_iter()
            .filter_map(|value| match serde_json::from_str::<StoredRow>(&value) {
                Ok(row) => Some(LayerLocation {
                    digest: digest.to_string(),
                    kind,
                    located: row.located,
                    data: row.data,
                }),
                Err(e) => {
                    warn!(%key, error = %e, "skipping unreadable layer row");
                    None
                }
            })
            .collect::<Vec<_>>();
        trace!(%key, count = rows.len(), "queried layer rows");
        Ok(rows)
    }

    async fn save(&self, location: &LayerLocation) -> Result<()> {
        let key = layer_key(location.kind, &location.digest);
        let value = encode_row(location)?;
        let _: i64 = self
            .pool
            .lrem(&key, 0, value.as_str())
            .await
            .with_context(|| format!("LREM {key}"))?;
        let _: i64 = self
            .pool
            .rpush(&key, value.as_str())
            .await
            .with_context(|| format!("RPUSH {key}"))?;
        debug!(%key, located = %location.located, "layer row saved");
        Ok(())
    }

    async fn delete(&self, location: &LayerLocation) -> Result<()> {
        let key = layer_key(location.kind, &location.digest);
        let value = encode_row(location)?;
        let removed: i64 = self
            .pool
            .lrem(&key, 0, value.as_str())
            .await
            .with_context(|| format!("LREM {key}"))?;
        debug!(%key, located = %location.located, removed, "layer row deleted");
        Ok(())
    }

    async fn save_torrent(&self, digest: &str, metadata: &str) -> Result<()> {
        let key = torrent_key(digest);
        let _: () = self
            .pool
            .set(&key, metadata, None, None, false)
            .await
            .with_context(|| format!("SET {key}"))?;
        Ok(())
    }

    async fn get_torrent(&self, digest: &str) -> Result<Option<String>> {
        let key = torrent_key(digest);
        let value: Option<String> = self
            .pool
            .get(&key)
            .await
            .with_context(|| format!("GET {key}"))?;
        Ok(value)
    }

    async fn delete_torrent(&self, digest: &str) -> Result<()> {
        let key = torrent_key(digest);
        let _: i64 = self
            .pool
            .del(&key)
            .await
            .with_context(|| format!("DEL {key}"))?;
        Ok(())
    }
}
