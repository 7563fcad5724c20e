/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! A bounded pool of per-user stores.
//!
//! Each uid maps to exactly one handle; the handle's async mutex is the
//! serialization point, so any number of users proceed in parallel while
//! operations against the same user queue. The pool is sharded by a hash
//! of the uid so one slow user never contends on another's shard index.
//! Stores are opened lazily, evicted least-recently-used when a shard is
//! at capacity, and reaped after sitting idle.

use crate::db::UserStore;
use crate::error::{Error, Result};
use crate::path::db_file;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Fraction of free pages that triggers a vacuum when an idle store is
/// being closed by the reaper.
const VACUUM_THRESHOLD: f32 = 0.1;

/// Cooperative cancellation for a pending acquisition. Firing it while a
/// caller is still queued (behind the user's handle, or waiting for an
/// eviction slot) makes the acquisition abort without ever taking the
/// handle; an operation already handed to the blocking pool runs to
/// completion regardless.
#[derive(Clone, Default)]
pub struct CancelSignal {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the signal has fired.
    async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Directory the per-user database tree lives under.
    pub basepath: PathBuf,
    /// Number of independent sub-pools.
    pub num: usize,
    /// Upper bound on concurrently open stores, per sub-pool.
    pub max_size: usize,
    /// How long a store may sit idle before the reaper closes it.
    pub ttl_idle: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            basepath: PathBuf::from("."),
            num: 8,
            max_size: 25,
            ttl_idle: Duration::from_secs(300),
        }
    }
}

pub struct UserHandle {
    uid: String,
    path: PathBuf,
    store: tokio::sync::Mutex<Option<UserStore>>,
    last_used: Mutex<Instant>,
}

impl UserHandle {
    fn new(uid: &str, path: PathBuf) -> Self {
        Self {
            uid: uid.to_string(),
            path,
            store: tokio::sync::Mutex::new(None),
            last_used: Mutex::new(Instant::now()),
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }
}

struct ShardState {
    handles: HashMap<String, Arc<UserHandle>>,
    /// Stores currently open in this shard. Reservations are taken under
    /// the state lock before a store is actually opened, which is what
    /// makes `max_size` a hard bound.
    open: usize,
}

struct Shard {
    state: Mutex<ShardState>,
    /// Signalled whenever a store closes and capacity frees up.
    capacity: Notify,
}

impl Shard {
    fn new() -> Self {
        Self {
            state: Mutex::new(ShardState {
                handles: HashMap::new(),
                open: 0,
            }),
            capacity: Notify::new(),
        }
    }
}

pub struct Pool {
    config: PoolConfig,
    shards: Vec<Shard>,
    stopped: AtomicBool,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Self {
        let num = config.num.max(1);
        Self {
            shards: (0..num).map(|_| Shard::new()).collect(),
            config: PoolConfig { num, ..config },
            stopped: AtomicBool::new(false),
        }
    }

    fn shard(&self, uid: &str) -> &Shard {
        // FNV-1a; stable across runs, cheap, good enough spread for uids.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for b in uid.as_bytes() {
            hash ^= u64::from(*b);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        &self.shards[(hash % self.shards.len() as u64) as usize]
    }

    /// The unique handle for a uid, creating it on first sight. The bool
    /// reports whether this call created it.
    pub fn get_element(&self, uid: &str) -> Result<(Arc<UserHandle>, bool)> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let shard = self.shard(uid);
        let mut state = shard.state.lock();
        if let Some(handle) = state.handles.get(uid) {
            return Ok((Arc::clone(handle), false));
        }
        let handle = Arc::new(UserHandle::new(uid, db_file(&self.config.basepath, uid)));
        state.handles.insert(uid.to_string(), Arc::clone(&handle));
        Ok((handle, true))
    }

    /// Run `f` against the user's store, opening it if needed. Operations
    /// for one uid execute strictly one at a time, in lock-acquisition
    /// order; the SQLite work itself runs on the blocking thread pool and,
    /// once started, always runs to completion even if the caller goes
    /// away.
    pub async fn with_store<T, F>(&self, uid: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut UserStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.with_store_cancellable(uid, None, f).await
    }

    /// As [`Pool::with_store`], aborting with `Cancelled` if the signal
    /// fires before the acquisition completes. The handle is not taken in
    /// that case; a signal that fires later has no effect on the running
    /// operation.
    pub async fn with_store_cancellable<T, F>(
        &self,
        uid: &str,
        cancel: Option<&CancelSignal>,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut UserStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if cancel.is_some_and(CancelSignal::is_cancelled) {
            return Err(Error::Cancelled);
        }
        let (handle, _) = self.get_element(uid)?;
        let mut slot = match cancel {
            Some(cancel) => tokio::select! {
                slot = handle.store.lock() => slot,
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            },
            None => handle.store.lock().await,
        };
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        if slot.is_none() {
            self.reserve_capacity(uid, cancel).await?;
            let path = handle.path.clone();
            let opened = tokio::task::spawn_blocking(move || UserStore::open(path)).await;
            match opened {
                Ok(Ok(store)) => *slot = Some(store),
                Ok(Err(e)) => {
                    self.release_capacity(uid);
                    return Err(e);
                }
                Err(e) => {
                    self.release_capacity(uid);
                    return Err(Error::IoError(std::io::Error::other(e)));
                }
            }
        }

        let mut store = slot.take().expect("slot was just filled");
        let joined = tokio::task::spawn_blocking(move || {
            let result = f(&mut store);
            (store, result)
        })
        .await;

        let result = match joined {
            Ok((store, Ok(value))) => {
                *slot = Some(store);
                Ok(value)
            }
            Ok((store, Err(e))) => {
                if e.is_backend() {
                    // Drop the store so the next request reopens the file.
                    log::warn!("closing store for uid {} after backend error: {}", uid, e);
                    self.close_store(uid, store);
                } else {
                    *slot = Some(store);
                }
                Err(e)
            }
            Err(join_err) => {
                // The task panicked and took the store down with it.
                self.release_capacity(uid);
                Err(Error::IoError(std::io::Error::other(join_err)))
            }
        };
        drop(slot);
        handle.touch();
        // This handle just went idle, which may unblock a waiter looking
        // for an eviction candidate.
        self.shard(uid).capacity.notify_waiters();
        result
    }

    /// Take (or free up) one open-store slot in the uid's shard. Blocks
    /// waiting for capacity when every open store is busy; bails out with
    /// `Cancelled` if the caller's signal fires while waiting.
    async fn reserve_capacity(&self, uid: &str, cancel: Option<&CancelSignal>) -> Result<()> {
        let shard = self.shard(uid);
        loop {
            // Register for capacity wakeups before looking, so a close that
            // lands between the check and the await isn't missed.
            let notified = shard.capacity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = shard.state.lock();
                if state.open < self.config.max_size {
                    state.open += 1;
                    return Ok(());
                }
                if let Some(victim) = lru_idle_victim(&state.handles, uid) {
                    // try_lock succeeding is what makes the victim idle;
                    // a busy handle can never be evicted.
                    if let Ok(mut victim_slot) = victim.store.try_lock() {
                        if let Some(store) = victim_slot.take() {
                            drop_store_in_background(store);
                            // Their slot becomes ours; `open` is unchanged.
                            return Ok(());
                        }
                    }
                }
            }
            if self.stopped.load(Ordering::SeqCst) {
                return Err(Error::Closed);
            }
            if cancel.is_some_and(CancelSignal::is_cancelled) {
                return Err(Error::Cancelled);
            }
            match cancel {
                Some(cancel) => tokio::select! {
                    _ = &mut notified => {}
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                },
                None => notified.await,
            }
        }
    }

    fn release_capacity(&self, uid: &str) {
        let shard = self.shard(uid);
        shard.state.lock().open -= 1;
        shard.capacity.notify_waiters();
    }

    fn close_store(&self, uid: &str, store: UserStore) {
        drop_store_in_background(store);
        self.release_capacity(uid);
    }

    /// How many stores are open across all shards.
    pub fn open_stores(&self) -> usize {
        self.shards.iter().map(|s| s.state.lock().open).sum()
    }

    /// Close stores that have sat idle past `ttl_idle` (giving them a purge
    /// and a compaction pass on the way out) and drop handles nobody
    /// references any more.
    pub async fn reap(&self) {
        for shard in &self.shards {
            let handles: Vec<Arc<UserHandle>> = {
                let state = shard.state.lock();
                state.handles.values().cloned().collect()
            };
            for handle in handles {
                if handle.idle_for() < self.config.ttl_idle {
                    continue;
                }
                let Ok(mut slot) = handle.store.try_lock() else {
                    continue;
                };
                if let Some(store) = slot.take() {
                    drop(slot);
                    let uid = handle.uid.clone();
                    let _ = tokio::task::spawn_blocking(move || {
                        let mut store = store;
                        if let Err(e) = store.purge_expired() {
                            log::warn!("purge for uid {} failed: {}", uid, e);
                        }
                        if let Err(e) = store.optimize(VACUUM_THRESHOLD) {
                            log::warn!("optimize for uid {} failed: {}", uid, e);
                        }
                    })
                    .await;
                    shard.state.lock().open -= 1;
                    shard.capacity.notify_waiters();
                }
            }
            // Forget fully-idle handles: closed store, no outside refs.
            let mut state = shard.state.lock();
            state.handles.retain(|_, h| {
                Arc::strong_count(h) > 1
                    || h.store.try_lock().map(|s| s.is_some()).unwrap_or(true)
            });
        }
    }

    /// Stop accepting work, wait for in-flight operations to finish, and
    /// close every store. Callers put a deadline around this.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        for shard in &self.shards {
            // Unpark anyone waiting for capacity so they see the flag.
            shard.capacity.notify_waiters();
            let handles: Vec<Arc<UserHandle>> = {
                let state = shard.state.lock();
                state.handles.values().cloned().collect()
            };
            for handle in handles {
                // Locking drains whatever operation is in flight.
                let mut slot = handle.store.lock().await;
                if let Some(store) = slot.take() {
                    drop_store_in_background(store);
                    shard.state.lock().open -= 1;
                }
            }
            shard.state.lock().handles.clear();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Pick the least-recently-used idle candidate to evict, skipping the uid
/// asking for the slot.
fn lru_idle_victim(
    handles: &HashMap<String, Arc<UserHandle>>,
    skip_uid: &str,
) -> Option<Arc<UserHandle>> {
    handles
        .values()
        .filter(|h| h.uid != skip_uid)
        .filter(|h| h.store.try_lock().map(|s| s.is_some()).unwrap_or(false))
        .min_by_key(|h| *h.last_used.lock())
        .cloned()
}

/// Closing a store runs `PRAGMA optimize`, so push the drop off the async
/// threads.
fn drop_store_in_background(store: UserStore) {
    tokio::task::spawn_blocking(move || drop(store));
}
