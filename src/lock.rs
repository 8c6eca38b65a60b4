// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! The public asynchronous API: [`lock`], [`unlock`], [`check`].
//!
//! This module is the glue between [`crate::resolver`] (path → canonical
//! key), [`crate::naming`] (key → sentinel path), [`crate::engine`] (the
//! acquisition algorithm), [`crate::registry`] (who holds what in this
//! process), [`crate::refresher`] (keeping a held sentinel alive) and
//! [`crate::retry`] (the caller-facing retry loop). No module above this one
//! knows about any of the others.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::Notify;

use crate::config::LockOptions;
use crate::engine::{self, AcquireOutcome};
use crate::error::{LockError, Result};
use crate::fs_adapter::{FsAdapter, TokioFsAdapter};
use crate::naming;
use crate::refresher::{self, RefreshHandle};
use crate::registry::{self, Lock};
use crate::resolver;
use crate::retry::{self, Retriable, RetryPolicy};

impl Retriable for LockError {
    fn is_retriable(&self) -> bool {
        matches!(self, Self::Collision { .. })
            || matches!(self, Self::Io { source, .. } if is_transient(source))
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    !matches!(
        err.kind(),
        std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::InvalidInput
    )
}

/// A handle returned by [`lock`]. Calling [`ReleaseHandle::release`] once
/// releases the lock; a second call fails with [`LockError::AlreadyReleased`].
/// Dropping the handle without releasing does
/// *not* release the lock — the refresh loop keeps running and the sentinel
/// is only cleaned up by explicit release, compromise, or process exit.
pub struct ReleaseHandle {
    canonical_key: String,
    sentinel_path: std::path::PathBuf,
    fs: Arc<dyn FsAdapter>,
    released: Arc<AtomicBool>,
    released_notify: Arc<Notify>,
    already_released: bool,
}

impl std::fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseHandle")
            .field("canonical_key", &self.canonical_key)
            .field("sentinel_path", &self.sentinel_path)
            .finish_non_exhaustive()
    }
}

impl ReleaseHandle {
    /// Releases the lock. A no-op (and `Ok`) if the lock was already
    /// compromised — the holder no longer owns the sentinel and must not
    /// touch what may now belong to another party.
    pub async fn release(mut self) -> Result<()> {
        if self.already_released {
            return Err(LockError::AlreadyReleased {
                path: self.sentinel_path.clone(),
            });
        }
        self.already_released = true;

        // Flip our own shared flag first rather than going through a
        // registry lookup: if a compromise already fired, it removed the
        // registry entry entirely, and a lookup-based unlock would
        // misreport that as `NotAcquired`. This handle's own `released`
        // flag is the one piece of shared state that survives the
        // registry entry being gone, so it is what tells us whether we
        // still own the sentinel.
        let was_already_released = self
            .released
            .swap(true, std::sync::atomic::Ordering::SeqCst);
        self.released_notify.notify_one();

        if let Some(record) = registry::remove(&self.canonical_key) {
            if let Some(task) = record.refresh_task {
                task.abort();
            }
        }

        if was_already_released {
            return Ok(());
        }

        tracing::debug!(
            canonical_key = %self.canonical_key,
            path = %self.sentinel_path.display(),
            "releasing lock"
        );
        match self.fs.rmdir(&self.sentinel_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(LockError::io(self.sentinel_path.clone(), err)),
        }
    }
}

/// Acquires the lock on `target`.
///
/// Retries `opts.retries` times on `Collision` or a transient I/O error,
/// per the retry policy built from `opts`.
pub async fn lock(target: &Path, opts: &LockOptions) -> Result<ReleaseHandle> {
    lock_with_fs(target, opts, Arc::new(TokioFsAdapter)).await
}

/// As [`lock`], but with an injected filesystem adapter (for tests, or a
/// non-POSIX filesystem shim).
pub async fn lock_with_fs(
    target: &Path,
    opts: &LockOptions,
    fs: Arc<dyn FsAdapter>,
) -> Result<ReleaseHandle> {
    let resolved = opts.resolve();
    let canonical_key = resolver::resolve(target, resolved.realpath)?;
    let sentinel_path = naming::sentinel_of(&canonical_key, resolved.lockfile_path.as_deref());

    if registry::contains(&canonical_key) {
        return Err(LockError::Collision {
            path: sentinel_path,
        });
    }

    let policy = RetryPolicy::with_retries(resolved.retries);
    let sentinel_path_for_retry = sentinel_path.clone();
    let fs_for_retry = Arc::clone(&fs);
    let acquired = retry::run_async(policy, move || {
        let fs = Arc::clone(&fs_for_retry);
        let sentinel_path = sentinel_path_for_retry.clone();
        async move {
            match engine::try_acquire(fs.as_ref(), &sentinel_path, resolved.stale_ms).await {
                AcquireOutcome::Acquired(acquired) => Ok(acquired),
                AcquireOutcome::Collision => Err(LockError::Collision {
                    path: sentinel_path,
                }),
                AcquireOutcome::Io(source) => Err(LockError::io(sentinel_path, source)),
            }
        }
    })
    .await?;

    let released = Arc::new(AtomicBool::new(false));
    let released_notify = Arc::new(Notify::new());

    // Insert before spawning the refresher: if another task raced us
    // between the `contains` check above and here, we must not leave an
    // orphaned refresh task or sentinel behind for a lock we don't own.
    if let Err(_already_held) = registry::insert(
        canonical_key.clone(),
        Lock {
            sentinel_path: sentinel_path.clone(),
            mtime_ms: acquired.mtime_ms,
            precision: acquired.precision,
            stale_ms: resolved.stale_ms,
            update_ms: resolved.update_ms,
            on_compromised: resolved.on_compromised.clone(),
            released: Arc::clone(&released),
            released_notify: Arc::clone(&released_notify),
            refresh_task: None,
        },
    ) {
        let _ = fs.rmdir(&sentinel_path).await;
        return Err(LockError::Collision {
            path: sentinel_path,
        });
    }

    if let Some(update_ms) = resolved.update_ms {
        let refresh_handle = RefreshHandle {
            canonical_key: canonical_key.clone(),
            sentinel_path: sentinel_path.clone(),
            update_ms,
            released: Arc::clone(&released),
            released_notify: Arc::clone(&released_notify),
            on_compromised: resolved.on_compromised,
        };
        let task = refresher::spawn(Arc::clone(&fs), refresh_handle);
        registry::with_mut(&canonical_key, |lock| lock.refresh_task = Some(task));
    }

    Ok(ReleaseHandle {
        canonical_key,
        sentinel_path,
        fs,
        released,
        released_notify,
        already_released: false,
    })
}

/// Releases the lock on `target` held by this process. Fails with
/// [`LockError::NotAcquired`] if this process does not hold it.
pub async fn unlock(target: &Path, opts: &LockOptions) -> Result<()> {
    unlock_with_fs(target, opts, Arc::new(TokioFsAdapter)).await
}

/// As [`unlock`], but with an injected filesystem adapter.
pub async fn unlock_with_fs(
    target: &Path,
    opts: &LockOptions,
    fs: Arc<dyn FsAdapter>,
) -> Result<()> {
    let resolved = opts.resolve();
    let canonical_key = resolver::resolve(target, resolved.realpath)?;
    let sentinel_path = naming::sentinel_of(&canonical_key, resolved.lockfile_path.as_deref());
    unlock_by_key(&fs, &canonical_key, &sentinel_path).await
}

async fn unlock_by_key(
    fs: &Arc<dyn FsAdapter>,
    canonical_key: &str,
    sentinel_path: &Path,
) -> Result<()> {
    let Some(record) = registry::remove(canonical_key) else {
        return Err(LockError::NotAcquired {
            path: sentinel_path.to_path_buf(),
        });
    };

    if let Some(task) = record.refresh_task {
        task.abort();
    }

    let was_already_released = record
        .released
        .swap(true, std::sync::atomic::Ordering::SeqCst);
    record.released_notify.notify_one();

    if was_already_released {
        // A compromise fired and already removed the registry entry and
        // marked released before we got here via a racing unlock; this
        // path covers the window where `remove` still found the (stale)
        // record. Either way, the sentinel is no longer ours to touch.
        return Ok(());
    }

    tracing::debug!(canonical_key, path = %sentinel_path.display(), "releasing lock");
    match fs.rmdir(sentinel_path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(LockError::io(sentinel_path, err)),
    }
}

/// Reports whether `target` currently has a live (non-stale) sentinel.
pub async fn check(target: &Path, opts: &LockOptions) -> Result<bool> {
    check_with_fs(target, opts, Arc::new(TokioFsAdapter)).await
}

/// As [`check`], but with an injected filesystem adapter.
pub async fn check_with_fs(
    target: &Path,
    opts: &LockOptions,
    fs: Arc<dyn FsAdapter>,
) -> Result<bool> {
    let resolved = opts.resolve();
    let canonical_key = resolver::resolve(target, resolved.realpath)?;
    let sentinel_path = naming::sentinel_of(&canonical_key, resolved.lockfile_path.as_deref());
    engine::check(fs.as_ref(), &sentinel_path, resolved.stale_ms)
        .await
        .map_err(|source| LockError::io(sentinel_path, source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaleOption;

    fn opts() -> LockOptions {
        LockOptions::default()
    }

    #[tokio::test]
    async fn round_trip_lock_check_unlock() {
        registry::unlock_all_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        std::fs::create_dir(&target).unwrap();

        let handle = lock(&target, &opts()).await.unwrap();
        assert!(check(&target, &opts()).await.unwrap());
        handle.release().await.unwrap();
        assert!(!check(&target, &opts()).await.unwrap());
        registry::unlock_all_for_tests();
    }

    #[tokio::test]
    async fn second_lock_in_same_process_collides() {
        registry::unlock_all_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        std::fs::create_dir(&target).unwrap();

        let _handle = lock(&target, &opts()).await.unwrap();
        let err = lock(&target, &opts()).await.unwrap_err();
        assert_eq!(err.code(), "ELOCKED");
        registry::unlock_all_for_tests();
    }

    #[tokio::test]
    async fn unlock_without_holding_fails_not_acquired() {
        registry::unlock_all_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        std::fs::create_dir(&target).unwrap();

        let err = unlock(&target, &opts()).await.unwrap_err();
        assert_eq!(err.code(), "ENOTACQUIRED");
    }

    #[tokio::test]
    async fn double_release_fails_already_released() {
        registry::unlock_all_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        std::fs::create_dir(&target).unwrap();

        let handle = lock(&target, &opts()).await.unwrap();
        let sentinel_path = handle.sentinel_path.clone();
        let fs = handle.fs.clone();
        let canonical_key = handle.canonical_key.clone();
        let released = handle.released.clone();
        let released_notify = handle.released_notify.clone();
        handle.release().await.unwrap();

        // `release` consumes `self`, so a literal second call can't be
        // expressed directly; reconstruct the post-first-release state
        // (`already_released: true`) to exercise the same early-return path
        // a second call through the real API would take.
        let second = ReleaseHandle {
            canonical_key,
            sentinel_path,
            fs,
            released,
            released_notify,
            already_released: true,
        };
        let err = second.release().await.unwrap_err();
        assert_eq!(err.code(), "ERELEASED");
        registry::unlock_all_for_tests();
    }

    #[tokio::test]
    async fn release_after_compromise_is_a_silent_no_op() {
        registry::unlock_all_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        std::fs::create_dir(&target).unwrap();

        let handle = lock(&target, &opts()).await.unwrap();
        let sentinel_path = handle.sentinel_path.clone();

        // Simulate a compromise: the refresher would normally do exactly
        // this (flip `released`, remove the registry entry) before firing
        // `on_compromised`, without touching the filesystem.
        registry::remove(&handle.canonical_key);
        handle
            .released
            .store(true, std::sync::atomic::Ordering::SeqCst);

        handle.release().await.unwrap();
        assert!(
            sentinel_path.is_dir(),
            "a compromised release must not remove a sentinel that may belong to another holder"
        );
        registry::unlock_all_for_tests();
    }

    #[tokio::test]
    async fn disabled_staleness_collides_on_old_sentinel() {
        registry::unlock_all_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        std::fs::create_dir(&target).unwrap();
        let fs = Arc::new(TokioFsAdapter);
        let canonical_key = resolver::resolve(&target, true).unwrap();
        let sentinel_path = naming::sentinel_of(&canonical_key, None);
        fs.mkdir(&sentinel_path).await.unwrap();
        let ancient = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
            - 120_000;
        fs.utimes(&sentinel_path, ancient, ancient).await.unwrap();

        let disabled = LockOptions {
            stale: StaleOption::Disabled,
            ..LockOptions::default()
        };
        let err = lock(&target, &disabled).await.unwrap_err();
        assert_eq!(err.code(), "ELOCKED");
    }

    #[tokio::test]
    async fn relock_after_unlock_succeeds() {
        registry::unlock_all_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        std::fs::create_dir(&target).unwrap();

        let handle = lock(&target, &opts()).await.unwrap();
        handle.release().await.unwrap();
        let handle2 = lock(&target, &opts()).await.unwrap();
        handle2.release().await.unwrap();
        registry::unlock_all_for_tests();
    }
}
