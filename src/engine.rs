// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! The acquisition/staleness algorithm, independent of the registry
//! or refresher.
//!
//! `try_acquire`/`try_acquire_sync` are pure with respect to process state —
//! they touch only the filesystem adapter and the precision cache — so the
//! cross-process race in the test suite is driven straight through this
//! module, bypassing [`crate::registry`] entirely.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::fs_adapter::{FsAdapter, SyncFsAdapter};
use crate::prober::{self, Precision};

/// The outcome of a successful `try_acquire`.
#[derive(Debug, Clone, Copy)]
pub struct Acquired {
    /// The mtime written (or observed) on the sentinel at acquisition.
    pub mtime_ms: u64,
    /// The device's mtime precision, for later refresh comparisons.
    pub precision: Precision,
}

/// The outcome of `try_acquire`/`try_acquire_sync`.
#[derive(Debug)]
pub enum AcquireOutcome {
    /// The sentinel was created (or a stale one reclaimed) by this call.
    Acquired(Acquired),
    /// A live sentinel already exists at this path.
    Collision,
    /// An unrecoverable filesystem error.
    Io(std::io::Error),
}

/// Attempts to acquire the sentinel at `sentinel_path`, following the
/// create-then-reclaim-if-stale sequence described in the module docs.
///
/// `stale_ms` of `None` disables staleness reclaim entirely: any existing
/// sentinel is an unconditional collision.
pub async fn try_acquire(
    fs: &dyn FsAdapter,
    sentinel_path: &Path,
    stale_ms: Option<u64>,
) -> AcquireOutcome {
    try_acquire_inner(fs, sentinel_path, stale_ms, true).await
}

async fn try_acquire_inner(
    fs: &dyn FsAdapter,
    sentinel_path: &Path,
    stale_ms: Option<u64>,
    allow_reclaim: bool,
) -> AcquireOutcome {
    match fs.mkdir(sentinel_path).await {
        Ok(()) => match prober::probe(fs, sentinel_path, now_ms()).await {
            Ok((mtime_ms, precision)) => {
                tracing::debug!(path = %sentinel_path.display(), "acquired sentinel");
                AcquireOutcome::Acquired(Acquired { mtime_ms, precision })
            }
            Err(err) => AcquireOutcome::Io(err),
        },
        Err(err) if err.kind() != std::io::ErrorKind::AlreadyExists => AcquireOutcome::Io(err),
        Err(_) => {
            let Some(stale_ms) = stale_ms else {
                tracing::warn!(path = %sentinel_path.display(), "collision, staleness disabled");
                return AcquireOutcome::Collision;
            };

            let stat = match fs.stat(sentinel_path).await {
                Ok(stat) => stat,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return if allow_reclaim {
                        Box::pin(try_acquire_inner(fs, sentinel_path, None, false)).await
                    } else {
                        AcquireOutcome::Collision
                    };
                }
                Err(err) => return AcquireOutcome::Io(err),
            };

            let is_stale = u128::from(stat.mtime_ms) + u128::from(stale_ms) < u128::from(now_ms());
            if !is_stale {
                tracing::warn!(path = %sentinel_path.display(), "collision, sentinel not stale");
                return AcquireOutcome::Collision;
            }

            tracing::info!(path = %sentinel_path.display(), "reclaiming stale sentinel");
            match fs.rmdir(sentinel_path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return AcquireOutcome::Io(err),
            }

            if allow_reclaim {
                Box::pin(try_acquire_inner(fs, sentinel_path, None, false)).await
            } else {
                AcquireOutcome::Collision
            }
        }
    }
}

/// Synchronous counterpart of [`try_acquire`].
pub fn try_acquire_sync(
    fs: &dyn SyncFsAdapter,
    sentinel_path: &Path,
    stale_ms: Option<u64>,
) -> AcquireOutcome {
    try_acquire_sync_inner(fs, sentinel_path, stale_ms, true)
}

fn try_acquire_sync_inner(
    fs: &dyn SyncFsAdapter,
    sentinel_path: &Path,
    stale_ms: Option<u64>,
    allow_reclaim: bool,
) -> AcquireOutcome {
    match fs.mkdir(sentinel_path) {
        Ok(()) => match prober::probe_sync(fs, sentinel_path, now_ms()) {
            Ok((mtime_ms, precision)) => {
                tracing::debug!(path = %sentinel_path.display(), "acquired sentinel");
                AcquireOutcome::Acquired(Acquired { mtime_ms, precision })
            }
            Err(err) => AcquireOutcome::Io(err),
        },
        Err(err) if err.kind() != std::io::ErrorKind::AlreadyExists => AcquireOutcome::Io(err),
        Err(_) => {
            let Some(stale_ms) = stale_ms else {
                tracing::warn!(path = %sentinel_path.display(), "collision, staleness disabled");
                return AcquireOutcome::Collision;
            };

            let stat = match fs.stat(sentinel_path) {
                Ok(stat) => stat,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return if allow_reclaim {
                        try_acquire_sync_inner(fs, sentinel_path, None, false)
                    } else {
                        AcquireOutcome::Collision
                    };
                }
                Err(err) => return AcquireOutcome::Io(err),
            };

            let is_stale = u128::from(stat.mtime_ms) + u128::from(stale_ms) < u128::from(now_ms());
            if !is_stale {
                tracing::warn!(path = %sentinel_path.display(), "collision, sentinel not stale");
                return AcquireOutcome::Collision;
            }

            tracing::info!(path = %sentinel_path.display(), "reclaiming stale sentinel");
            match fs.rmdir(sentinel_path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return AcquireOutcome::Io(err),
            }

            if allow_reclaim {
                try_acquire_sync_inner(fs, sentinel_path, None, false)
            } else {
                AcquireOutcome::Collision
            }
        }
    }
}

/// The outcome of `check`/`check_sync`: whether a live (non-stale) sentinel
/// currently exists.
pub async fn check(
    fs: &dyn FsAdapter,
    sentinel_path: &Path,
    stale_ms: Option<u64>,
) -> std::io::Result<bool> {
    match fs.stat(sentinel_path).await {
        Ok(stat) => Ok(is_locked(stat.mtime_ms, stale_ms)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Synchronous counterpart of [`check`].
pub fn check_sync(
    fs: &dyn SyncFsAdapter,
    sentinel_path: &Path,
    stale_ms: Option<u64>,
) -> std::io::Result<bool> {
    match fs.stat(sentinel_path) {
        Ok(stat) => Ok(is_locked(stat.mtime_ms, stale_ms)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

fn is_locked(mtime_ms: u64, stale_ms: Option<u64>) -> bool {
    match stale_ms {
        None => true,
        Some(stale_ms) => u128::from(mtime_ms) + u128::from(stale_ms) >= u128::from(now_ms()),
    }
}

fn now_ms() -> u64 {
    u64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .unwrap_or(u64::MAX)
}
