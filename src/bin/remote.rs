// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Remote endpoint: accepts sessions from the local endpoint, reads each
//! stream's Hello to learn its destination, dials that destination, and
//! pipes bytes between the two.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet,
};
use tracing::{error, info, warn};
use tunnelmux::{
    cfg::{
        cli::RemoteArgs,
        config::{Config, RemoteSettings},
        logger,
    },
    mux::session::{Session, SessionConfig},
    proxy::pipe_client_stream,
    transport::tls,
};

/// How long the accept loop waits for in-flight sessions to finish after a
/// shutdown signal before giving up on them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let args = RemoteArgs::parse();
    let file_config = Config::load_optional(args.config.as_ref())?;
    let settings = RemoteSettings::resolve(&args, &file_config)?;

    let _guard = logger::init_logger(settings.verbose)?;

    let acceptor = if settings.use_tls {
        tls::install_default_crypto_provider();
        let cert = settings.cert.clone().context("TLS enabled without --cert")?;
        let key = settings.key.clone().context("TLS enabled without --key")?;
        let ca = settings.ca.clone().context("TLS enabled without --ca")?;
        Some(tls::server_acceptor(&cert, &key, &ca)?)
    } else {
        None
    };

    let listener = TcpListener::bind(("0.0.0.0", settings.port))
        .await
        .with_context(|| format!("binding remote listener on port {}", settings.port))?;
    info!(port = settings.port, tls = settings.use_tls, "remote endpoint listening");

    let mut inflight = JoinSet::new();
    loop {
        let (sock, peer) = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                break;
            }
            res = terminate_signal() => {
                let _ = res;
                info!("received SIGTERM, shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    continue;
                }
            },
        };
        sock.set_nodelay(true).ok();

        let acceptor = acceptor.clone();
        inflight.spawn(async move {
            if let Err(e) = handle_connection(sock, acceptor).await {
                warn!(%peer, error = %e, "session ended with error");
            }
        });
    }

    drain_inflight(inflight).await;
    Ok(())
}

/// Awaits every still-running session task up to `SHUTDOWN_GRACE`, logging
/// and abandoning whatever remains once the grace period elapses.
async fn drain_inflight(mut inflight: JoinSet<()>) {
    if inflight.is_empty() {
        return;
    }
    info!(pending = inflight.len(), "draining in-flight sessions before shutdown");
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while inflight.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = inflight.len(), "shutdown grace period elapsed with sessions still in flight");
    }
}

#[cfg(unix)]
async fn terminate_signal() -> std::io::Result<()> {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn terminate_signal() -> std::io::Result<()> {
    std::future::pending().await
}

async fn handle_connection(sock: TcpStream, acceptor: Option<tokio_rustls::TlsAcceptor>) -> Result<()> {
    let session = match acceptor {
        Some(acceptor) => {
            let tls_stream = acceptor.accept(sock).await.context("TLS handshake with local endpoint failed")?;
            Session::server(tls_stream, SessionConfig::default())
        }
        None => Session::server(sock, SessionConfig::default()),
    };

    while let Some(stream) = session.accept_stream().await {
        tokio::spawn(async move {
            let (_network, addr) = match stream.read_hello().await {
                Ok(hello) => hello,
                Err(e) => {
                    warn!(error = %e, "stream closed without a valid hello");
                    return;
                }
            };
            let mut dest = match TcpStream::connect(addr.as_str()).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(%addr, error = %e, "dialing destination failed");
                    stream.close();
                    return;
                }
            };
            dest.set_nodelay(true).ok();
            pipe_client_stream(&mut dest, &stream).await;
        });
    }
    Ok(())
}
