//! Cluster-local pull coordinator for container images.
//!
//! Collapses concurrent registry traffic (auth, manifests, blob metadata)
//! behind keyed locks and TTL caches, and places blob downloads on the
//! least-loaded node of the cluster.

pub mod cache;
pub mod config;
pub mod context;
pub mod coordination;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod http;
pub mod metrics;
pub mod model;
pub mod node;
pub mod peer;
pub mod registry;
pub mod torrent;

use std::sync::Arc;

pub use error::{Error, Result};

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::health::HealthState;
use crate::metrics::MetricsRegistry;
use crate::node::NodeService;

/// State shared by every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// This node's side of the peer RPC surface.
    pub node: Arc<NodeService>,
    pub coordinator: Arc<Coordinator>,
    pub metrics: MetricsRegistry,
    pub health: HealthState,
}
