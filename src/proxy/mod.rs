// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Thin client-facing adapters that sit in front of the multiplexer: SOCKS5
//! (`proxy::socks5`) and HTTP/HTTPS forward-proxy (`proxy::http`). Both
//! reduce to the same shape once a stream is open: pipe client bytes onto
//! the stream and stream bytes back to the client, per spec.md §5's "each
//! opened stream spawns two concurrent copy tasks at the endpoint runners".

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::mux::stream::Stream;

/// SOCKS5 handshake per RFC 1928 (subset: no auth, `CONNECT` only).
pub mod http;
/// HTTP/1.1 forward-proxy adapter, including `CONNECT` tunneling.
pub mod socks5;

/// Blindly copies bytes in both directions between `client` and `stream`
/// until either side closes or errs. Used after a SOCKS5 `CONNECT` handshake
/// and after an HTTP `CONNECT` tunnel is established.
pub async fn pipe_client_stream<S>(client: &mut S, stream: &Arc<Stream>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);

    let upload = async {
        let mut buf = [0u8; 8192];
        loop {
            let n = match client_rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if stream.write(&buf[..n]).await.is_err() {
                break;
            }
        }
        stream.close();
    };

    let download = async {
        let mut buf = [0u8; 8192];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "pipe: stream read ended");
                    break;
                }
            };
            if client_wr.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
        let _ = client_wr.shutdown().await;
    };

    tokio::join!(upload, download);
}
