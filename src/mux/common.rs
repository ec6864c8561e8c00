// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shared plumbing for suspension points in `mux::stream` and `mux::session`:
//! every "await data, or death, or a deadline" point in the spec is this one
//! race, generalized from a fixed timeout (as `client::common::io_with_timeout`
//! does it in the teacher) to an optional wall-clock deadline.

use std::future::Future;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outcome of racing a future against cancellation and an optional deadline.
pub(crate) enum Race<T> {
    Ready(T),
    Dead,
    TimedOut,
}

/// Awaits `fut` until it resolves, `die` is cancelled, or `deadline` elapses
/// — whichever happens first. `deadline = None` means "no deadline".
pub(crate) async fn race<F, T>(
    fut: F,
    deadline: Option<Instant>,
    die: &CancellationToken,
) -> Race<T>
where
    F: Future<Output = T>,
{
    tokio::pin!(fut);
    match deadline {
        Some(instant) => {
            tokio::select! {
                _ = die.cancelled() => Race::Dead,
                _ = tokio::time::sleep_until(instant) => Race::TimedOut,
                v = &mut fut => Race::Ready(v),
            }
        }
        None => {
            tokio::select! {
                _ = die.cancelled() => Race::Dead,
                v = &mut fut => Race::Ready(v),
            }
        }
    }
}
