// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! The only I/O surface the core touches.
//!
//! Callers may inject an alternative implementation of `mkdir`/`rmdir`/
//! `stat`/`utimes`/`realpath` — useful for fault injection in tests, or to
//! route through a non-POSIX filesystem shim. The async trait backs
//! [`crate::lock`]/[`crate::unlock`]/[`crate::check`]; [`SyncFsAdapter`]
//! backs the `_sync` counterparts. Both ship a production default built on
//! `tokio::fs`/`std::fs` plus `filetime` for `utimes` (tokio has no native
//! utimes; std doesn't either, hence the pack-standard `filetime` crate).

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

/// Opaque per-device identifier used to key the mtime-precision cache.
///
/// `u64` covers both Unix's `dev_t` and a zero-extended Windows volume
/// serial number; platforms with neither concept report a constant so the
/// cache degenerates to "probe once, trust it forever" rather than probing
/// per call.
pub type DeviceId = u64;

/// The result of `stat`-ing a sentinel: its mtime and the device it lives
/// on.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    /// Modification time, in milliseconds since the Unix epoch.
    pub mtime_ms: u64,
    /// Device the sentinel resides on, for the precision cache.
    pub device_id: DeviceId,
}

/// Async filesystem operations the core needs. See the module docs.
#[async_trait]
pub trait FsAdapter: Send + Sync {
    /// Atomically creates an empty directory at `path`. Must fail with
    /// [`io::ErrorKind::AlreadyExists`] if the path already exists, and
    /// must not partially succeed (this is the only primitive correctness
    /// rests on).
    async fn mkdir(&self, path: &Path) -> io::Result<()>;

    /// Removes the (empty) directory at `path`.
    async fn rmdir(&self, path: &Path) -> io::Result<()>;

    /// Returns the mtime and device id of `path`.
    async fn stat(&self, path: &Path) -> io::Result<Stat>;

    /// Sets both atime and mtime of `path` to `_ms` milliseconds since the
    /// Unix epoch.
    async fn utimes(&self, path: &Path, atime_ms: u64, mtime_ms: u64) -> io::Result<()>;

    /// Resolves symlinks and relative components, requiring `path` to
    /// exist.
    async fn realpath(&self, path: &Path) -> io::Result<PathBuf>;
}

/// Synchronous counterpart of [`FsAdapter`], backing the blocking API.
pub trait SyncFsAdapter: Send + Sync {
    /// See [`FsAdapter::mkdir`].
    fn mkdir(&self, path: &Path) -> io::Result<()>;
    /// See [`FsAdapter::rmdir`].
    fn rmdir(&self, path: &Path) -> io::Result<()>;
    /// See [`FsAdapter::stat`].
    fn stat(&self, path: &Path) -> io::Result<Stat>;
    /// See [`FsAdapter::utimes`].
    fn utimes(&self, path: &Path, atime_ms: u64, mtime_ms: u64) -> io::Result<()>;
    /// See [`FsAdapter::realpath`].
    fn realpath(&self, path: &Path) -> io::Result<PathBuf>;
}

/// The default async adapter, built on `tokio::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioFsAdapter;

#[async_trait]
impl FsAdapter for TokioFsAdapter {
    async fn mkdir(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir(path).await
    }

    async fn rmdir(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_dir(path).await
    }

    async fn stat(&self, path: &Path) -> io::Result<Stat> {
        let metadata = tokio::fs::metadata(path).await?;
        Ok(metadata_to_stat(&metadata))
    }

    async fn utimes(&self, path: &Path, atime_ms: u64, mtime_ms: u64) -> io::Result<()> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || set_file_times(&path, atime_ms, mtime_ms))
            .await
            .map_err(|e| io::Error::other(e.to_string()))?
    }

    async fn realpath(&self, path: &Path) -> io::Result<PathBuf> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || path.canonicalize())
            .await
            .map_err(|e| io::Error::other(e.to_string()))?
    }
}

/// The default sync adapter, built on `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFsAdapter;

impl SyncFsAdapter for StdFsAdapter {
    fn mkdir(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir(path)
    }

    fn rmdir(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir(path)
    }

    fn stat(&self, path: &Path) -> io::Result<Stat> {
        let metadata = std::fs::metadata(path)?;
        Ok(metadata_to_stat(&metadata))
    }

    fn utimes(&self, path: &Path, atime_ms: u64, mtime_ms: u64) -> io::Result<()> {
        set_file_times(path, atime_ms, mtime_ms)
    }

    fn realpath(&self, path: &Path) -> io::Result<PathBuf> {
        path.canonicalize()
    }
}

fn set_file_times(path: &Path, atime_ms: u64, mtime_ms: u64) -> io::Result<()> {
    let atime = filetime::FileTime::from_unix_time(
        (atime_ms / 1000) as i64,
        ((atime_ms % 1000) * 1_000_000) as u32,
    );
    let mtime = filetime::FileTime::from_unix_time(
        (mtime_ms / 1000) as i64,
        ((mtime_ms % 1000) * 1_000_000) as u32,
    );
    filetime::set_file_times(path, atime, mtime)
}

fn metadata_to_stat(metadata: &std::fs::Metadata) -> Stat {
    let mtime = filetime::FileTime::from_last_modification_time(metadata);
    #[allow(
        clippy::cast_sign_loss,
        reason = "mtimes before the epoch are not a case this crate supports"
    )]
    let mtime_ms = (mtime.seconds().max(0) as u64) * 1000 + u64::from(mtime.nanoseconds() / 1_000_000);

    Stat {
        mtime_ms,
        device_id: device_id_of(metadata),
    }
}

#[cfg(unix)]
fn device_id_of(metadata: &std::fs::Metadata) -> DeviceId {
    use std::os::unix::fs::MetadataExt;
    metadata.dev()
}

#[cfg(windows)]
fn device_id_of(metadata: &std::fs::Metadata) -> DeviceId {
    use std::os::windows::fs::MetadataExt;
    u64::from(metadata.volume_serial_number().unwrap_or(0))
}

#[cfg(not(any(unix, windows)))]
fn device_id_of(_metadata: &std::fs::Metadata) -> DeviceId {
    0
}
