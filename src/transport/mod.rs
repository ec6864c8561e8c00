//! Transport establishment: a type-erased duplex byte stream (`Transport`/
//! `BoxedTransport`) so `mux::pool` can hold a session regardless of whether
//! it rides plaintext TCP or TLS 1.3, plus the `Connector` closure type the
//! pool dials through.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{future::Future, pin::Pin, sync::Arc};

use tokio::io::{AsyncRead, AsyncWrite};

/// Mutual-TLS transport setup, grounded on the modern `rustls`
/// `pki_types`-based API.
pub mod tls;

/// Anything that behaves like a duplex byte stream: a plain `TcpStream` or a
/// `tokio_rustls` `TlsStream<TcpStream>`, used interchangeably once
/// established.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// A `Transport` behind a single allocation, so `Session::client`/`server`
/// don't need to be generic over the concrete stream type at the pool
/// boundary.
pub type BoxedTransport = Box<dyn Transport>;

/// A zero-argument async "dial" function producing a new authenticated
/// transport. `mux::pool::Pool` calls this whenever no existing session has
/// spare capacity. Boxed rather than expressed via `async_trait` or a
/// generic type parameter so `Pool` itself stays a concrete, non-generic
/// type — no extra dependency required beyond `std`.
pub type Connector = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<BoxedTransport>> + Send>> + Send + Sync,
>;
