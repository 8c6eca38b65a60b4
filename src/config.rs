// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Per-call lock options, their clamps, and process-wide defaults.
//!
//! The per-call [`LockOptions`] table is the primary configuration surface.
//! [`GlobalDefaults`] adds the ambient layer: a way to retune the defaults
//! for an entire process without touching every call site — a
//! `config::Config` builder over built-in defaults, an optional
//! `$XDG_CONFIG_HOME` file, then environment variables, in increasing
//! priority.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use serde::Deserialize;

use crate::error::Compromised;

/// Default `stale` threshold, in milliseconds.
pub const DEFAULT_STALE_MS: u64 = 10_000;
/// Minimum `stale` threshold once clamped.
pub const MIN_STALE_MS: u64 = 2_000;
/// Minimum `update` interval once clamped.
pub const MIN_UPDATE_MS: u64 = 1_000;

/// How the caller specified the `stale` threshold.
#[derive(Debug, Clone, Copy, Default)]
pub enum StaleOption {
    /// Not specified — use the effective default (process defaults, else
    /// [`DEFAULT_STALE_MS`]).
    #[default]
    UseDefault,
    /// Explicitly disabled: a sentinel is never considered stale, and
    /// collisions are never reclaimed.
    Disabled,
    /// An explicit value in milliseconds, clamped to at least
    /// [`MIN_STALE_MS`].
    Millis(u64),
}

/// How the caller specified the `update` (refresh) interval.
#[derive(Debug, Clone, Copy, Default)]
pub enum UpdateOption {
    /// Not specified — derive `stale_ms / 2`.
    #[default]
    UseDefault,
    /// Explicitly disabled: the sentinel is never refreshed after
    /// acquisition (it will eventually go stale on its own).
    Disabled,
    /// An explicit value in milliseconds, clamped into `[MIN_UPDATE_MS,
    /// stale_ms / 2]`.
    Millis(u64),
}

/// Callback invoked when the refresher determines this holder has lost the
/// lock. See [`crate::error::Compromised`].
pub type CompromisedCallback = Arc<dyn Fn(Compromised) + Send + Sync>;

/// Per-call options accepted by [`crate::lock`], [`crate::unlock`] and
/// [`crate::check`] (and their `_sync` counterparts).
#[derive(Clone, Default)]
pub struct LockOptions {
    /// Staleness threshold. See [`StaleOption`].
    pub stale: StaleOption,
    /// Refresh interval. See [`UpdateOption`].
    pub update: UpdateOption,
    /// How many times the caller's retry policy should re-invoke
    /// acquisition on `Collision`/transient I/O errors. The engine itself
    /// does not retry; this is metadata for the retry adapter
    /// (`crate::retry`). The synchronous API rejects any value `> 0`.
    pub retries: u32,
    /// Resolve symlinks and relative components before locking (default
    /// `true`, unless overridden by [`GlobalDefaults`]).
    pub realpath: Option<bool>,
    /// Explicit sentinel path, overriding `<target>.lock`.
    pub lockfile_path: Option<PathBuf>,
    /// Invoked (at most once) if the refresher detects this holder has lost
    /// the lock. If unset, the default handler logs at `error!` and panics
    /// inside the refresh task — the closest in-process analogue to
    /// "rethrow into host" for a library with no process of its own to
    /// crash.
    pub on_compromised: Option<CompromisedCallback>,
}

impl std::fmt::Debug for LockOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockOptions")
            .field("stale", &self.stale)
            .field("update", &self.update)
            .field("retries", &self.retries)
            .field("realpath", &self.realpath)
            .field("lockfile_path", &self.lockfile_path)
            .field("on_compromised", &self.on_compromised.is_some())
            .finish()
    }
}

/// Fully resolved, clamped options for a single acquisition/check/unlock.
#[derive(Debug, Clone)]
pub struct ResolvedOptions {
    /// `None` means staleness detection is disabled for this call.
    pub stale_ms: Option<u64>,
    /// `None` means the sentinel is never refreshed after acquisition.
    pub update_ms: Option<u64>,
    /// Remaining retry budget for the caller's retry policy.
    pub retries: u32,
    /// Whether the target path was resolved through symlinks.
    pub realpath: bool,
    /// Explicit sentinel path, if one was supplied.
    pub lockfile_path: Option<PathBuf>,
    /// Callback to invoke on compromise.
    pub on_compromised: CompromisedCallback,
}

impl LockOptions {
    /// Applies the documented clamps, filling in unset fields from
    /// [`GlobalDefaults`].
    #[must_use]
    pub fn resolve(&self) -> ResolvedOptions {
        let defaults = GlobalDefaults::get();

        let stale_ms = match self.stale {
            StaleOption::Disabled => None,
            StaleOption::UseDefault => Some(defaults.stale_ms.max(MIN_STALE_MS)),
            StaleOption::Millis(ms) => Some(ms.max(MIN_STALE_MS)),
        };

        let update_ms = match self.update {
            UpdateOption::Disabled => None,
            UpdateOption::UseDefault => stale_ms.map(|stale| {
                defaults
                    .update_ms
                    .unwrap_or(stale / 2)
                    .clamp(MIN_UPDATE_MS, (stale / 2).max(MIN_UPDATE_MS))
            }),
            UpdateOption::Millis(ms) => {
                stale_ms.map(|stale| ms.clamp(MIN_UPDATE_MS, (stale / 2).max(MIN_UPDATE_MS)))
            }
        };

        ResolvedOptions {
            stale_ms,
            update_ms,
            retries: self.retries,
            realpath: self.realpath.unwrap_or(defaults.realpath),
            lockfile_path: self.lockfile_path.clone(),
            on_compromised: self
                .on_compromised
                .clone()
                .unwrap_or_else(default_compromised_handler),
        }
    }
}

fn default_compromised_handler() -> CompromisedCallback {
    Arc::new(|compromised: Compromised| {
        tracing::error!(
            canonical_key = %compromised.canonical_key,
            kind = ?compromised.kind,
            "{compromised}"
        );
        // No handler was supplied: rethrow into the host by unwinding the
        // refresh task. The caller who never registered `on_compromised`
        // gets a loud, unmissable failure instead of silent data loss.
        #[allow(
            clippy::panic,
            reason = "default rethrow-into-host behavior when the caller opts out of on_compromised"
        )]
        std::panic::panic_any(compromised);
    })
}

/// Process-wide defaults, overridable without touching call sites.
///
/// Loaded once, lazily, from (lowest to highest priority): built-in
/// defaults, `$XDG_CONFIG_HOME/sentrylock/config.toml`, then
/// `SENTRYLOCK_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalDefaults {
    #[serde(default = "default_stale_ms")]
    stale_ms: u64,
    #[serde(default)]
    update_ms: Option<u64>,
    #[serde(default = "default_realpath")]
    realpath: bool,
}

fn default_stale_ms() -> u64 {
    DEFAULT_STALE_MS
}

fn default_realpath() -> bool {
    true
}

impl Default for GlobalDefaults {
    fn default() -> Self {
        Self {
            stale_ms: default_stale_ms(),
            update_ms: None,
            realpath: default_realpath(),
        }
    }
}

static GLOBAL_DEFAULTS: OnceLock<GlobalDefaults> = OnceLock::new();

impl GlobalDefaults {
    /// Returns the process-wide defaults, loading them on first use.
    #[must_use]
    pub fn get() -> &'static GlobalDefaults {
        GLOBAL_DEFAULTS.get_or_init(Self::load)
    }

    fn load() -> Self {
        let built = Self::try_load();
        built.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "falling back to built-in lock defaults");
            Self::default()
        })
    }

    fn try_load() -> std::result::Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("stale_ms", i64::try_from(DEFAULT_STALE_MS).unwrap_or(i64::MAX))?
            .set_default("realpath", true)?;

        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join("sentrylock").join("config.toml");
            if config_path.exists() {
                builder = builder.add_source(config::File::from(config_path));
            }
        }

        builder
            .add_source(config::Environment::with_prefix("SENTRYLOCK"))
            .build()
            .and_then(config::Config::try_deserialize)
    }
}
