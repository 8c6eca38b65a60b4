// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! The error surface crossing the public API boundary.
//!
//! Every variant carries the stable error code from the wire/CLI contract
//! (`ELOCKED`, `ENOTACQUIRED`, ...) so that callers embedding this crate in a
//! larger service can match on the code without depending on message text.

use std::io;
use std::path::PathBuf;

/// Errors returned by [`crate::lock`], [`crate::unlock`], [`crate::check`]
/// and their synchronous counterparts.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// A sentinel exists at the target and is not stale. Retriable by the
    /// caller's retry policy.
    #[error("{path} is locked by another holder")]
    Collision {
        /// The target's sentinel path.
        path: PathBuf,
    },

    /// `unlock` was called for a key this process does not hold.
    #[error("{path} is not locked by this process")]
    NotAcquired {
        /// The target's sentinel path.
        path: PathBuf,
    },

    /// A release handle was invoked a second time.
    #[error("lock on {path} was already released")]
    AlreadyReleased {
        /// The target's sentinel path.
        path: PathBuf,
    },

    /// The synchronous API was asked to retry, which it cannot do without an
    /// executor to sleep on.
    #[error("the synchronous API does not support retries > 0")]
    SyncRetriesUnsupported,

    /// Any other underlying filesystem error, passed through unchanged.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The path the operation was acting on.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}

impl LockError {
    /// The stable, documented error code for this variant.
    ///
    /// Underlying I/O errors pass through their `std::io::ErrorKind` instead
    /// (e.g. `ENOENT`).
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Collision { .. } => "ELOCKED",
            Self::NotAcquired { .. } => "ENOTACQUIRED",
            Self::AlreadyReleased { .. } => "ERELEASED",
            Self::SyncRetriesUnsupported => "ESYNC",
            Self::Io { source, .. } => io_error_code(source),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Maps an [`io::ErrorKind`] to the POSIX-style error code callers expect.
fn io_error_code(err: &io::Error) -> &'static str {
    match err.kind() {
        io::ErrorKind::NotFound => "ENOENT",
        io::ErrorKind::AlreadyExists => "EEXIST",
        io::ErrorKind::PermissionDenied => "EACCES",
        _ => "EIO",
    }
}

/// A kind of lock compromise, delivered to the `on_compromised` callback.
///
/// The holder has lost the lock; it must not continue to act as owner. See
/// the conditions under which each kind fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompromisedKind {
    /// The sentinel vanished from under us (removed externally, or by a
    /// party that reclaimed it as stale).
    NotFound,
    /// The sentinel exists but its mtime no longer matches what we last
    /// wrote: someone else reclaimed it as stale, or forced its mtime.
    NotMine,
    /// We could not refresh the sentinel for longer than `stale_ms`; another
    /// party may already consider it abandoned.
    Threshold,
}

impl CompromisedKind {
    /// A short, human-readable reason, used in log lines and in the default
    /// `on_compromised` handler's panic message.
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            Self::NotFound => "sentinel not found",
            Self::NotMine => "sentinel mtime no longer matches this holder",
            Self::Threshold => "refresh exceeded the stale threshold",
        }
    }
}

/// A compromise notification delivered to `on_compromised`.
#[derive(Debug, Clone)]
pub struct Compromised {
    /// The canonical key of the lock that was lost.
    pub canonical_key: String,
    /// Which condition triggered the compromise.
    pub kind: CompromisedKind,
}

impl std::fmt::Display for Compromised {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ECOMPROMISED: lock on {} compromised: {}",
            self.canonical_key,
            self.kind.reason()
        )
    }
}

pub(crate) type Result<T> = std::result::Result<T, LockError>;
