// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Maps a caller-supplied target path to the canonical key it is tracked
//! under in-process.
//!
//! By default two different paths that alias the same file resolve to the
//! same canonical key and therefore compete for the same sentinel. Callers
//! locking a conceptual name with no backing file disable `realpath`.

use std::path::{Path, PathBuf};

use crate::error::{LockError, Result};

/// Resolves `path` to the canonical key it will be tracked under.
///
/// When `realpath` is `true` (the default), symlinks and relative
/// components are resolved against the filesystem; the target must exist.
/// When `false`, the path is normalized lexically (`.`/`..` collapsed, made
/// absolute against the current directory) without touching the filesystem,
/// so a nonexistent target is fine.
pub fn resolve(path: &Path, realpath: bool) -> Result<String> {
    if realpath {
        let canonical = path
            .canonicalize()
            .map_err(|e| LockError::io(path, e))?;
        Ok(canonical.to_string_lossy().into_owned())
    } else {
        Ok(normalize_lexically(path).to_string_lossy().into_owned())
    }
}

/// Collapses `.`/`..` components and makes the path absolute against the
/// current directory, without resolving symlinks and without requiring the
/// path to exist.
fn normalize_lexically(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        use std::path::Component;
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // Pop the last real component, but never climb past root.
                if !matches!(normalized.components().last(), Some(Component::RootDir) | None) {
                    normalized.pop();
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
