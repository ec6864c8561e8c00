// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Logging setup via `tracing-subscriber`'s `EnvFilter` + `fmt` layer.
//! Simplified from the teacher's custom JSON `FormatEvent`/fastrace-compat
//! machinery: this crate has no downstream log aggregation pipeline to feed
//! a structured JSON shape to, so plain human-readable output is enough.
//! See DESIGN.md.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// `-v` count to a `tracing` level filter: 0 = `info`, 1 = `debug`, 2+ =
/// `trace`. `RUST_LOG`, if set, always wins.
fn level_for_verbosity(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Initializes the global `tracing` subscriber. Returns a `WorkerGuard` the
/// caller must keep alive for the process lifetime (dropping it flushes and
/// stops the non-blocking writer).
pub fn init_logger(verbose: u8) -> Result<WorkerGuard> {
    let default_level = level_for_verbosity(verbose);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("installing global tracing subscriber")?;

    Ok(guard)
}
