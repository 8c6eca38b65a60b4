// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Cooperative process-exit cleanup on process exit.
//!
//! A crashed holder must not outlive its lock by more than `stale_ms` —
//! that fallback is unconditional and needs nothing from this module, since
//! any other participant will reclaim the sentinel once it goes stale. This
//! module only shrinks the *common* case to zero: a process that exits
//! cleanly, or that receives `SIGINT`/`SIGTERM` and is given the chance to
//! react, can remove its sentinels immediately instead of waiting out the
//! threshold.
//!
//! `unsafe_code = "forbid"` at the workspace level rules out an
//! `atexit`-style hook, so there is no way to guarantee cleanup runs on
//! every exit path (a bare `std::process::exit`, a `panic = "abort"` host,
//! a `kill -9`). Embedding applications that want the best-effort guarantee
//! should `tokio::spawn` [`run_until_signal`] (or call
//! [`crate::registry::remove_all_sentinels_best_effort`] directly from
//! their own shutdown path) before falling through to the end of `main`.

use tokio::signal;

/// Waits for `SIGINT` (or `SIGTERM` on Unix) and then synchronously removes
/// every sentinel this process currently holds, ignoring all errors. Exposed
/// as a library-owned helper so an embedding binary can `tokio::spawn` it
/// instead of racing its own signal futures inline in `main`.
pub async fn run_until_signal() {
    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, removing held sentinels");
    crate::registry::remove_all_sentinels_best_effort();
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    let mut terminate = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(error = %err, "failed to install SIGTERM handler, watching ctrl_c only");
            let _ = signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
