// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! The process-wide table of locks this process currently holds.
//!
//! One [`Lock`] record per held `canonical_key`. The registry itself is a
//! plain `std::sync::Mutex`-guarded map: linearizable ordering is required
//! per key, which a mutex gives for free, and the registry is only ever held
//! for the duration of a map lookup/insert/remove — never across an
//! `.await` — so a blocking mutex does not stall the runtime.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::CompromisedCallback;
use crate::prober::Precision;

/// In-memory state for a lock this process currently holds.
pub struct Lock {
    /// The resolved sentinel path.
    pub sentinel_path: PathBuf,
    /// The mtime this process last wrote (or observed at acquisition).
    pub mtime_ms: u64,
    /// The device's mtime precision, fixed at acquisition.
    pub precision: Precision,
    /// Staleness threshold used to decide over-threshold compromise.
    pub stale_ms: Option<u64>,
    /// Refresh interval; `None` disables the refresh loop entirely.
    pub update_ms: Option<u64>,
    /// Invoked if the refresher determines the lock has been lost.
    pub on_compromised: CompromisedCallback,
    /// Set once by explicit unlock or by a fired compromise; checked by the
    /// refresher after every suspension point.
    pub released: Arc<std::sync::atomic::AtomicBool>,
    /// Signalled when `released` flips, so the refresh task can wake from
    /// its sleep immediately instead of waiting out the remaining delay.
    pub released_notify: Arc<Notify>,
    /// Handle to the background refresh task, for cancellation on unlock.
    pub refresh_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("sentinel_path", &self.sentinel_path)
            .field("mtime_ms", &self.mtime_ms)
            .field("precision", &self.precision)
            .field("stale_ms", &self.stale_ms)
            .field("update_ms", &self.update_ms)
            .field(
                "released",
                &self.released.load(std::sync::atomic::Ordering::SeqCst),
            )
            .finish_non_exhaustive()
    }
}

type Table = HashMap<String, Lock>;

static REGISTRY: OnceLock<Mutex<Table>> = OnceLock::new();

fn table() -> &'static Mutex<Table> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Error returned when a caller tries to insert a record for a key this
/// process already holds (a second acquisition for a key this process
/// already holds is a programming error and must be reported as a
/// collision).
#[derive(Debug)]
pub struct AlreadyHeld;

/// Inserts `lock` under `canonical_key`. Fails if this process already
/// holds that key.
pub fn insert(canonical_key: String, lock: Lock) -> Result<(), AlreadyHeld> {
    let mut guard = table().lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    if guard.contains_key(&canonical_key) {
        return Err(AlreadyHeld);
    }
    guard.insert(canonical_key, lock);
    Ok(())
}

/// Removes and returns the record for `canonical_key`, if present.
pub fn remove(canonical_key: &str) -> Option<Lock> {
    table()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .remove(canonical_key)
}

/// Runs `f` against the record for `canonical_key`, if this process holds
/// it. Used by the refresher to read/update `mtime_ms`/`last_refresh_at`
/// without removing the record.
pub fn with_mut<R>(canonical_key: &str, f: impl FnOnce(&mut Lock) -> R) -> Option<R> {
    let mut guard = table().lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    guard.get_mut(canonical_key).map(f)
}

/// True if this process currently holds `canonical_key`.
#[must_use]
pub fn contains(canonical_key: &str) -> bool {
    table()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .contains_key(canonical_key)
}

/// Synchronously removes every held lock's sentinel directory, ignoring all
/// errors on process exit. Intended to run from a signal
/// handler or at the end of `main`.
pub fn remove_all_sentinels_best_effort() {
    let mut guard = table().lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    for (canonical_key, lock) in guard.drain() {
        if let Some(task) = lock.refresh_task {
            task.abort();
        }
        lock.released.store(true, std::sync::atomic::Ordering::SeqCst);
        tracing::debug!(canonical_key, path = %lock.sentinel_path.display(), "exit cleanup: removing sentinel");
        let _ = std::fs::remove_dir(&lock.sentinel_path);
    }
}

/// Returns the set of canonical keys currently held by this process.
#[cfg(any(test, feature = "test-support"))]
#[must_use]
pub fn snapshot_keys() -> Vec<String> {
    table()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .keys()
        .cloned()
        .collect()
}

/// Marks every held record released, aborts its refresh task, and clears the
/// registry, without touching the filesystem. For resetting state between
/// test scenarios.
#[cfg(any(test, feature = "test-support"))]
pub fn unlock_all_for_tests() {
    let mut guard = table().lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    for (_, lock) in guard.drain() {
        lock.released.store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(task) = lock.refresh_task {
            task.abort();
        }
    }
}
