// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Derives the sentinel path from a canonical key.

use std::path::{Path, PathBuf};

/// Returns the sentinel path for `canonical_key`.
///
/// Returns `override_path` verbatim if supplied (allowing the sentinel to
/// live inside the locked directory, e.g. `dir/dir.lock`, without colliding
/// with the parent namespace); otherwise `<canonical_key>.lock`.
pub fn sentinel_of(canonical_key: &str, override_path: Option<&Path>) -> PathBuf {
    match override_path {
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(format!("{canonical_key}.lock")),
    }
}
