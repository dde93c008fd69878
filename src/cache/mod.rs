//! In-process caches owned by the coordinator.
//!
//! Each cache is its own concurrency domain.  The coordinator keeps three
//! instances (auth tokens, manifests, content lengths) and never wraps them
//! in a shared lock, so unrelated keys do not contend.

pub mod ttl;

pub use ttl::TtlCache;
