#![forbid(unsafe_code)]

//! # Hive Lease
//!
//! Short-lived, owner-stamped exclusive leases on runs, plus the same
//! primitive as a general-purpose advisory lock on arbitrary keys.
//!
//! The store is the single source of truth for mutual exclusion: acquire is
//! set-if-absent, release is compare-and-delete by owner, extend is
//! compare-and-extend by owner. Expired entries are reclaimed lazily on
//! access and by a periodic sweep, so an abandoned lease never outlives its
//! TTL by more than one sweep interval.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hive_types::error::LeaseError;
use hive_types::lease::{Lease, Lock};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct Entry {
    owner: String,
    expires_at: DateTime<Utc>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// The in-process lease and lock store.
///
/// A single store instance serves the whole control plane; every operation
/// holds one mutex for the duration of a map access, which keeps
/// acquire/release/extend linearizable.
#[derive(Debug, Default)]
pub struct LeaseStore {
    leases: Mutex<HashMap<String, Entry>>,
    locks: Mutex<HashMap<String, Entry>>,
}

fn validate_key_owner(key: &str, owner: &str, ttl_seconds: i64) -> Result<(), LeaseError> {
    if key.trim().is_empty() {
        return Err(LeaseError::Validation("key must not be empty".to_string()));
    }
    if owner.trim().is_empty() {
        return Err(LeaseError::Validation("owner must not be empty".to_string()));
    }
    if ttl_seconds <= 0 {
        return Err(LeaseError::Validation(format!(
            "ttl must be positive, got {ttl_seconds}"
        )));
    }
    Ok(())
}

// Set-if-absent with lazy eviction of an expired incumbent.
fn acquire(
    map: &Mutex<HashMap<String, Entry>>,
    key: &str,
    owner: &str,
    ttl_seconds: i64,
) -> Result<bool, LeaseError> {
    validate_key_owner(key, owner, ttl_seconds)?;
    let now = Utc::now();
    let mut map = map.lock();
    if let Some(existing) = map.get(key) {
        if !existing.is_expired(now) {
            return Ok(false);
        }
    }
    map.insert(
        key.to_string(),
        Entry {
            owner: owner.to_string(),
            expires_at: now + ChronoDuration::seconds(ttl_seconds),
        },
    );
    Ok(true)
}

// Compare-and-delete by owner.
fn release(map: &Mutex<HashMap<String, Entry>>, key: &str, owner: &str) -> bool {
    let now = Utc::now();
    let mut map = map.lock();
    match map.get(key) {
        Some(entry) if !entry.is_expired(now) && entry.owner == owner => {
            map.remove(key);
            true
        }
        Some(entry) if entry.is_expired(now) => {
            map.remove(key);
            false
        }
        _ => false,
    }
}

// Compare-and-extend by owner.
fn extend(
    map: &Mutex<HashMap<String, Entry>>,
    key: &str,
    owner: &str,
    additional_seconds: i64,
) -> Result<bool, LeaseError> {
    validate_key_owner(key, owner, additional_seconds)?;
    let now = Utc::now();
    let mut map = map.lock();
    match map.get_mut(key) {
        Some(entry) if !entry.is_expired(now) && entry.owner == owner => {
            entry.expires_at += ChronoDuration::seconds(additional_seconds);
            Ok(true)
        }
        _ => Ok(false),
    }
}

impl LeaseStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    // --- Run leases ---

    /// Atomically acquires the lease on `run_id` for `node_id` iff it is
    /// absent or expired. Returns `true` exactly when the caller became the
    /// owner. Safe to retry.
    pub fn acquire_lease(
        &self,
        run_id: &str,
        node_id: &str,
        ttl_seconds: i64,
    ) -> Result<bool, LeaseError> {
        acquire(&self.leases, run_id, node_id, ttl_seconds)
    }

    /// Returns the current lease on `run_id`, or `None` if absent or expired.
    pub fn get_lease(&self, run_id: &str) -> Option<Lease> {
        let now = Utc::now();
        let mut leases = self.leases.lock();
        match leases.get(run_id) {
            Some(entry) if !entry.is_expired(now) => Some(Lease {
                run_id: run_id.to_string(),
                node_id: entry.owner.clone(),
                expires_at: entry.expires_at,
            }),
            Some(_) => {
                leases.remove(run_id);
                None
            }
            None => None,
        }
    }

    /// Extends the lease iff `node_id` is the live owner.
    pub fn extend_lease(
        &self,
        run_id: &str,
        node_id: &str,
        additional_seconds: i64,
    ) -> Result<bool, LeaseError> {
        extend(&self.leases, run_id, node_id, additional_seconds)
    }

    /// Releases the lease iff `node_id` is the live owner.
    pub fn release_lease(&self, run_id: &str, node_id: &str) -> bool {
        release(&self.leases, run_id, node_id)
    }

    /// Unconditionally removes the lease. Reserved for control-plane
    /// reconciliation (lease expiry, node reaping); worker-facing paths must
    /// use the owner-checked [`Self::release_lease`].
    pub fn admin_release(&self, run_id: &str) -> bool {
        self.leases.lock().remove(run_id).is_some()
    }

    // --- Advisory locks ---

    /// Acquires the advisory lock `key` for `owner_id`.
    pub fn acquire_lock(
        &self,
        key: &str,
        owner_id: &str,
        ttl_seconds: i64,
    ) -> Result<bool, LeaseError> {
        acquire(&self.locks, key, owner_id, ttl_seconds)
    }

    /// Releases the lock iff `owner_id` is the live owner.
    pub fn release_lock(&self, key: &str, owner_id: &str) -> bool {
        release(&self.locks, key, owner_id)
    }

    /// Extends the lock iff `owner_id` is the live owner.
    pub fn extend_lock(
        &self,
        key: &str,
        owner_id: &str,
        additional_seconds: i64,
    ) -> Result<bool, LeaseError> {
        extend(&self.locks, key, owner_id, additional_seconds)
    }

    /// Whether the lock `key` is currently held.
    pub fn is_locked(&self, key: &str) -> bool {
        let now = Utc::now();
        self.locks
            .lock()
            .get(key)
            .map(|e| !e.is_expired(now))
            .unwrap_or(false)
    }

    /// Returns the current holder of `key`, or `None`.
    pub fn get_lock(&self, key: &str) -> Option<Lock> {
        let now = Utc::now();
        let locks = self.locks.lock();
        locks.get(key).filter(|e| !e.is_expired(now)).map(|e| Lock {
            key: key.to_string(),
            owner_id: e.owner.clone(),
            expires_at: e.expires_at,
        })
    }

    /// Drops every expired entry. Called by the sweep task; callers do not
    /// depend on it for correctness because reads evict lazily.
    pub fn sweep(&self) {
        let now = Utc::now();
        let mut evicted = 0usize;
        for map in [&self.leases, &self.locks] {
            let mut map = map.lock();
            let before = map.len();
            map.retain(|_, entry| !entry.is_expired(now));
            evicted += before - map.len();
        }
        if evicted > 0 {
            tracing::debug!(target: "lease", evicted, "swept expired entries");
        }
    }

    /// Spawns the periodic sweep task until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => store.sweep(),
                }
            }
        })
    }
}
