//! Cluster coordination primitives.
//!
//! Keyed locking (local or KeyDB-backed), the shared layer-location store,
//! the least-loaded peer balancer, and the KeyDB connection pool they share
//! when the cluster runs with a KeyDB backend.

pub mod balancer;
pub mod locks;
pub mod redis;
pub mod store;

pub use balancer::{NodeBalancer, NodeSlot};
pub use locks::{KeyDbKeyedMutex, KeyGuard, KeyedMutex, LocalKeyedMutex};
pub use store::{KeyDbCacheStore, MemoryCacheStore, SharedCacheStore};
