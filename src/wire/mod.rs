//! Wire-format codecs: the frame header that carries every multiplexed
//! command, and the Hello announcement carried in the first `PSH` of a
//! client-opened stream.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Frame header encode/decode.
pub mod frame;
/// Hello (destination announcement) encode/decode.
pub mod hello;
