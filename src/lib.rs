// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A stream-multiplexed TCP tunnel: a local SOCKS5/HTTP proxy endpoint and a
//! remote endpoint connected over one authenticated transport carrying many
//! logical bidirectional byte streams.

/// Configuration, CLI parsing, and logging.
pub mod cfg;
/// Error kinds observable at the multiplexer's boundary.
pub mod error;
/// Stream/session/pool lifecycle and concurrency.
pub mod mux;
/// Client-facing SOCKS5 and HTTP proxy adapters.
pub mod proxy;
/// Transport establishment, including mutual TLS.
pub mod transport;
/// On-wire frame and Hello codecs.
pub mod wire;
