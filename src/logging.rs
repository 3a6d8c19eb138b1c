//! Centralized logging setup.
//!
//! A server with per-thread producers (ingest, player, encode, HTTP) and the
//! single-summarizing-warning behavior the frame store and catalog need
//! wants structured, filterable output rather than bare `println!`. `tracing` +
//! `tracing-subscriber` fill that role, grounded on `starpact-tlc`'s
//! `tlc-video`/`tlc-server` crates and on the comparable realtime media
//! servers `SentryShot-sentryshot` and `miquels-hls-server`, both of which
//! pair the same two crates.
//!
//! Kept intentionally small, a single init function rather than a logging
//! framework of its own.

use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber. Respects `RUST_LOG`, defaulting
/// to `info` so ingest/player/encode-thread activity is visible without
/// configuration.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        // Already installed (e.g. a test harness set one up first); not fatal.
        tracing::debug!("tracing subscriber already installed");
    }
}
