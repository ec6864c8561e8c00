// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Error kinds observable at the multiplexer's boundary.

use thiserror::Error;

/// Errors surfaced by the `wire` codecs and the `mux` session/stream/pool
/// layer. Transport I/O errors are folded in via `#[from]` rather than
/// exposed as a distinct variant to callers above the frame codec.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("invalid frame version {0}")]
    InvalidVersion(u8),

    #[error("invalid frame command {0}")]
    InvalidCmd(u8),

    #[error("invalid frame length {length} for command {cmd}")]
    InvalidLength { cmd: u8, length: u16 },

    #[error("invalid hello network {0}")]
    InvalidNetwork(u8),

    #[error("empty hello address")]
    EmptyAddr,

    #[error("hello address is not valid utf-8")]
    InvalidAddr,

    #[error("stream is dead")]
    StreamDead,

    #[error("session is dead")]
    SessionDead,

    #[error("operation timed out")]
    Timeout,

    #[error("write failed after {written} bytes")]
    PartialWrite {
        written: usize,
        #[source]
        source: Box<MuxError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
