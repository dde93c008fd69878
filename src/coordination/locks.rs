//! Keyed mutual exclusion.
//!
//! [`KeyedMutex`] grants at most one holder per string key.  Callers hold the
//! returned [`KeyGuard`] for the critical section; dropping it releases the
//! key on every exit path.  Two implementations exist:
//!
//! - [`LocalKeyedMutex`]: per-key `tokio` mutexes inside this process.
//! - [`KeyDbKeyedMutex`]: `SET NX EX` locks in KeyDB, shared by every node.
//!
//! Both honor the caller's [`CallContext`] while waiting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use fred::interfaces::{KeysInterface, LuaInterface};
use tracing::{debug, warn};

use crate::context::CallContext;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Trait + guard
// ---------------------------------------------------------------------------

#[async_trait]
pub trait KeyedMutex: Send + Sync {
    /// Block until the caller is the sole holder of `key` or `ctx` ends.
    async fn lock(&self, ctx: &CallContext, key: &str) -> Result<KeyGuard>;
}

/// Exclusive hold on one key.  Released on drop.
#[must_use = "the key is released as soon as the guard is dropped"]
pub struct KeyGuard {
    key: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl KeyGuard {
    pub fn new(key: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            key: key.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the key now rather than at end of scope.
    pub fn unlock(self) {}
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish()
    }
}

// ---------------------------------------------------------------------------
// Local implementation
// ---------------------------------------------------------------------------

type Slot = Arc<tokio::sync::Mutex<()>>;

/// In-process keyed mutex.  Slots are created on first use and dropped again
/// once no holder or waiter references them.
#[derive(Debug, Clone, Default)]
pub struct LocalKeyedMutex {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl LocalKeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held or waited on.
    pub fn active_keys(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn slot(&self, key: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(slots.entry(key.to_string()).or_default())
    }
}

fn prune_slot(slots: &Mutex<HashMap<String, Slot>>, key: &str, slot: Slot) {
    let mut map = slots.lock().unwrap_or_else(|e| e.into_inner());
    // The map and `slot` are the only references left: nobody holds or waits.
    if let Some(existing) = map.get(key) {
        if Arc::ptr_eq(existing, &slot) && Arc::strong_count(&slot) == 2 {
            map.remove(key);
        }
    }
}

#[async_trait]
impl KeyedMutex for LocalKeyedMutex {
    async fn lock(&self, ctx: &CallContext, key: &str) -> Result<KeyGuard> {
        let slot = self.slot(key);
        let acquired = ctx
            .run(async { Ok(Arc::clone(&slot).lock_owned().await) })
            .await;

        let guard = match acquired {
            Ok(guard) => guard,
            Err(e) => {
                prune_slot(&self.slots, key, slot);
                debug!(%key, error = %e, "gave up waiting for local lock");
                return Err(e);
            }
        };

        let slots = Arc::clone(&self.slots);
        let owned_key = key.to_string();
        Ok(KeyGuard::new(key, move || {
            drop(guard);
            prune_slot(&slots, &owned_key, slot);
        }))
    }
}

// ---------------------------------------------------------------------------
// KeyDB implementation
// ---------------------------------------------------------------------------

/// The three KeyDB operations a distributed lock needs.
#[async_trait]
pub(crate) trait LockServer: Send + Sync {
    async fn try_acquire(&self, key: &str, holder: &str, ttl_secs: u64) -> AnyResult<bool>;
    async fn release(&self, key: &str, holder: &str) -> AnyResult<()>;
    async fn wait(&self, key: &str, timeout: Duration) -> AnyResult<bool>;
}

#[async_trait]
impl LockServer for fred::clients::Pool {
    async fn try_acquire(&self, key: &str, holder: &str, ttl_secs: u64) -> AnyResult<bool> {
        acquire_lock(self, key, holder, ttl_secs).await
    }

    async fn release(&self, key: &str, holder: &str) -> AnyResult<()> {
        release_lock(self, key, holder).await
    }

    async fn wait(&self, key: &str, timeout: Duration) -> AnyResult<bool> {
        wait_for_lock(self, key, timeout).await
    }
}

/// Distributed keyed mutex stored in KeyDB.
///
/// Each acquisition writes `{holder}:{timestamp}` under
/// `pullcache:lock:{key}` with an expiry so a crashed holder cannot wedge the
/// key forever.  Release is owner-checked and asynchronous.  A caller whose
/// context ends mid-acquire also releases by holder id, since the `SET NX`
/// may have been applied even though its reply never arrived.
#[derive(Clone)]
pub struct KeyDbKeyedMutex {
    server: Arc<dyn LockServer>,
    node_id: String,
    ttl_secs: u64,
    poll_interval: Duration,
}

impl KeyDbKeyedMutex {
    pub fn new(pool: fred::clients::Pool, node_id: String, ttl_secs: u64) -> Self {
        Self::with_server(Arc::new(pool), node_id, ttl_secs)
    }

    pub(crate) fn with_server(server: Arc<dyn LockServer>, node_id: String, ttl_secs: u64) -> Self {
        Self {
            server,
            node_id,
            ttl_secs,
            poll_interval: Duration::from_millis(250),
        }
    }
}

pub(crate) fn lock_key(key: &str) -> String {
    format!("pullcache:lock:{key}")
}

fn spawn_release(server: Arc<dyn LockServer>, redis_key: String, holder: String) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!(key = %redis_key, "no runtime to release lock; it will expire");
        return;
    };
    runtime.spawn(async move {
        if let Err(e) = server.release(&redis_key, &holder).await {
            warn!(key = %redis_key, error = %e, "lock release failed; it will expire");
        }
    });
}

#[async_trait]
impl KeyedMutex for KeyDbKeyedMutex {
    async fn lock(&self, ctx: &CallContext, key: &str) -> Result<KeyGuard> {
        let redis_key = lock_key(key);
        // Unique per acquisition so concurrent tasks on one node never
        // release each other's hold.
        let holder = format!("{}/{}", self.node_id, uuid::Uuid::new_v4());

        let acquired = ctx
            .run(async {
                loop {
                    let acquired = self
                        .server
                        .try_acquire(&redis_key, &holder, self.ttl_secs)
                        .await
                        .map_err(|e| Error::Lock {
                            key: key.to_string(),
                            reason: format!("{e:#}"),
                        })?;
                    if acquired {
                        return Ok(());
                    }
                    self.server
                        .wait(&redis_key, self.poll_interval)
                        .await
                        .map_err(|e| Error::Lock {
                            key: key.to_string(),
                            reason: format!("{e:#}"),
                        })?;
                }
            })
            .await;

        if let Err(e) = acquired {
            debug!(key = %redis_key, %holder, error = %e, "acquire abandoned; releasing by holder");
            spawn_release(Arc::clone(&self.server), redis_key, holder);
            return Err(e);
        }

        let server = Arc::clone(&self.server);
        Ok(KeyGuard::new(key, move || {
            spawn_release(server, redis_key, holder);
        }))
    }
}

/// Attempt to acquire a distributed lock using SET NX EX.
///
/// Returns `true` if the lock was acquired, `false` if another holder has it.
pub async fn acquire_lock(
    pool: &fred::clients::Pool,
    key: &str,
    holder: &str,
    ttl_secs: u64,
) -> AnyResult<bool> {
    let value = format!("{holder}:{}", chrono::Utc::now().timestamp());
    let result: Option<String> = pool
        .set(
            key,
            value.as_str(),
            Some(fred::types::Expiration::EX(ttl_secs as i64)),
            Some(fred::types::SetOptions::NX),
            false,
        )
        .await
        .context("SET NX lock")?;
    let acquired = result.is_some();
    debug!(%key, %holder, acquired, "acquire_lock");
    Ok(acquired)
}

/// Release a lock only if it is still owned by `holder`.
///
/// The check-and-delete runs as one Lua script.
pub async fn release_lock(pool: &fred::clients::Pool, key: &str, holder: &str) -> AnyResult<()> {
    let script = r#"
        local val = redis.call('GET', KEYS[1])
        if val and string.find(val, ARGV[1] .. ":", 1, true) == 1 then
            redis.call('DEL', KEYS[1])
            return 1
        end
        return 0
    "#;
    let released: i64 = pool
        .eval(script, vec![key.to_string()], vec![holder.to_string()])
        .await
        .context("lock release script failed")?;
    if released == 1 {
        debug!(%key, %holder, "lock released");
    } else {
        warn!(%key, %holder, "lock release: key missing or owned by another holder");
    }
    Ok(())
}

/// Wait until `key` disappears or `timeout` elapses, polling every 250ms.
///
/// Returns `true` if the key was released before the timeout.
pub async fn wait_for_lock(
    pool: &fred::clients::Pool,
    key: &str,
    timeout: Duration,
) -> AnyResult<bool> {
    let deadline = tokio::time::Instant::now() + timeout;
    let poll_interval = Duration::from_millis(250);

    loop {
        let exists: bool = pool.exists(key).await.context("EXISTS lock")?;
        if !exists {
            return Ok(true);
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        tokio::time::sleep(poll_interval.min(remaining)).await;
    }
}
