// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! The background refresh loop for a single held lock.
//!
//! Each acquired lock gets its own `tokio::task`, sleeping between ticks via
//! [`tokio::time::sleep`] raced against a [`tokio::sync::Notify`] so an
//! explicit unlock can wake the task early instead of waiting out a stale
//! delay before observing `released`. `last_refresh_at` is tracked with
//! [`tokio::time::Instant`] (monotonic) rather than wall-clock time, per the
//! Open Question resolved in the design notes: a backward clock step must
//! not make a healthy refresh loop believe it has gone over threshold.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::CompromisedCallback;
use crate::error::{Compromised, CompromisedKind};
use crate::fs_adapter::FsAdapter;
use crate::prober::Precision;
use crate::registry;

const QUICK_RETRY_MS: u64 = 1_000;

/// Parameters a refresh task needs; a narrower view than the full
/// `registry::Lock` record so this module doesn't need to know about the
/// registry's internal locking.
pub struct RefreshHandle {
    pub canonical_key: String,
    pub sentinel_path: std::path::PathBuf,
    pub update_ms: u64,
    pub released: Arc<std::sync::atomic::AtomicBool>,
    pub released_notify: Arc<Notify>,
    pub on_compromised: CompromisedCallback,
}

/// Spawns the refresh task for a newly acquired lock. Returns the task
/// handle so the caller can cancel it on explicit unlock.
pub fn spawn(fs: Arc<dyn FsAdapter>, handle: RefreshHandle) -> JoinHandle<()> {
    tokio::spawn(run(fs, handle))
}

async fn run(fs: Arc<dyn FsAdapter>, handle: RefreshHandle) {
    let mut next_delay_ms = handle.update_ms;
    let mut last_refresh_at = Instant::now();

    loop {
        let sleep = tokio::time::sleep(Duration::from_millis(next_delay_ms));
        tokio::select! {
            () = sleep => {}
            () = handle.released_notify.notified() => {}
        }

        if handle.released.load(Ordering::SeqCst) {
            return;
        }

        let stale_ms = registry::with_mut(&handle.canonical_key, |lock| lock.stale_ms).flatten();
        let over_threshold = stale_ms.is_some_and(|stale_ms| {
            last_refresh_at.elapsed() > Duration::from_millis(stale_ms)
        });

        let stat = match fs.stat(&handle.sentinel_path).await {
            Ok(stat) => stat,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                compromise(&handle, CompromisedKind::NotFound);
                return;
            }
            Err(err) => {
                if over_threshold {
                    compromise(&handle, CompromisedKind::Threshold);
                    return;
                }
                tracing::warn!(
                    canonical_key = %handle.canonical_key,
                    error = %err,
                    "transient error stat-ing sentinel, retrying"
                );
                next_delay_ms = QUICK_RETRY_MS;
                continue;
            }
        };

        if over_threshold {
            compromise(&handle, CompromisedKind::Threshold);
            return;
        }

        let Some((recorded_mtime, precision)) =
            registry::with_mut(&handle.canonical_key, |lock| (lock.mtime_ms, lock.precision))
        else {
            return;
        };

        if !precision.mtimes_match(stat.mtime_ms, recorded_mtime) {
            compromise(&handle, CompromisedKind::NotMine);
            return;
        }

        if handle.released.load(Ordering::SeqCst) {
            return;
        }

        let now_ms = now_ms();
        let write_mtime = precision.write_mtime(now_ms);

        match fs.utimes(&handle.sentinel_path, write_mtime, write_mtime).await {
            Ok(()) => {
                if handle.released.load(Ordering::SeqCst) {
                    // Explicit unlock raced the refresh in flight; the write
                    // already landed, but we must not touch the record or
                    // reschedule on behalf of a lock we no longer hold.
                    return;
                }
                registry::with_mut(&handle.canonical_key, |lock| {
                    lock.mtime_ms = write_mtime;
                });
                last_refresh_at = Instant::now();
                next_delay_ms = handle.update_ms;
                tracing::debug!(
                    canonical_key = %handle.canonical_key,
                    mtime_ms = write_mtime,
                    "refreshed sentinel"
                );
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                compromise(&handle, CompromisedKind::NotFound);
                return;
            }
            Err(err) => {
                let now_over_threshold = stale_ms.is_some_and(|stale_ms| {
                    last_refresh_at.elapsed() > Duration::from_millis(stale_ms)
                });
                if now_over_threshold {
                    compromise(&handle, CompromisedKind::Threshold);
                    return;
                }
                tracing::warn!(
                    canonical_key = %handle.canonical_key,
                    error = %err,
                    "transient error refreshing sentinel, retrying"
                );
                next_delay_ms = QUICK_RETRY_MS;
            }
        }
    }
}

fn compromise(handle: &RefreshHandle, kind: CompromisedKind) {
    handle.released.store(true, Ordering::SeqCst);
    registry::remove(&handle.canonical_key);
    tracing::error!(
        canonical_key = %handle.canonical_key,
        ?kind,
        "lock compromised"
    );
    (handle.on_compromised)(Compromised {
        canonical_key: handle.canonical_key.clone(),
        kind,
    });
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    u64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .unwrap_or(u64::MAX)
}
