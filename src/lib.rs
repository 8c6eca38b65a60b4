// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Cross-process, cross-machine advisory file locking over a shared
//! filesystem.
//!
//! A lock is a sentinel directory created with an atomic `mkdir` — the one
//! primitive this crate relies on every filesystem to provide correctly.
//! Since there is no cross-process notification mechanism on a bare shared
//! filesystem (no flock over NFS, no inotify across machines), staleness is
//! detected by comparing the sentinel's mtime against a threshold, and a
//! held lock is kept alive by a background task that periodically rewrites
//! that mtime.
//!
//! ```no_run
//! # async fn example() -> Result<(), sentrylock::LockError> {
//! use sentrylock::LockOptions;
//!
//! let handle = sentrylock::lock(std::path::Path::new("/shared/target"), &LockOptions::default()).await?;
//! // ... do work while holding the lock ...
//! handle.release().await?;
//! # Ok(())
//! # }
//! ```
//!
//! For callers without a Tokio runtime, [`lock_sync`]/[`unlock_sync`]/
//! [`check_sync`] provide the same operations without a refresh loop (see
//! [`sync_api`] for why that loop cannot exist on the blocking side).
//!
//! # Compromise
//!
//! A held lock can be lost without an explicit `unlock`: another party may
//! reclaim its sentinel as stale, overwrite its mtime, or the refresh loop
//! may simply fail to keep up. When the background refresher detects this,
//! it invokes the `on_compromised` callback from [`LockOptions`] with a
//! [`Compromised`] value describing why. A caller that never sets one gets
//! the library's default handler, which logs at `error!` and panics inside
//! the refresh task — the closest in-process analogue to "the process
//! should not continue believing it owns this lock."

mod config;
mod engine;
mod error;
mod exit_guard;
mod fs_adapter;
mod lock;
mod naming;
mod prober;
mod refresher;
mod registry;
mod resolver;
mod retry;
mod sync_api;

pub use config::{CompromisedCallback, GlobalDefaults, LockOptions, ResolvedOptions, StaleOption, UpdateOption};
pub use error::{Compromised, CompromisedKind, LockError};
pub use exit_guard::run_until_signal;
pub use fs_adapter::{DeviceId, FsAdapter, Stat, StdFsAdapter, SyncFsAdapter, TokioFsAdapter};
pub use lock::{check, check_with_fs, lock, lock_with_fs, unlock, unlock_with_fs, ReleaseHandle};
pub use prober::Precision;
pub use retry::{Retriable, RetryPolicy};
pub use sync_api::{
    check_sync, check_sync_with_fs, lock_sync, lock_sync_with_fs, unlock_sync,
    unlock_sync_with_fs, SyncReleaseHandle,
};

/// Test-only registry introspection: a restricted reader usable only from
/// test or `test-support`-enabled contexts.
#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    pub use crate::registry::{snapshot_keys, unlock_all_for_tests};
}
