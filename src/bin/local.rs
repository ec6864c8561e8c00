// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Local endpoint: accepts SOCKS5 connections on `--socks5` and HTTP proxy
//! connections on `--http`, forwarding each through a pooled multiplexed
//! session to the remote endpoint.

use std::{pin::Pin, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tunnelmux::{
    cfg::{
        cli::LocalArgs,
        config::{Config, LocalSettings},
        logger,
    },
    mux::{pool::Pool, session::SessionConfig, stream::Stream},
    proxy::{http, pipe_client_stream, socks5},
    transport::{BoxedTransport, Connector, tls},
    wire::hello::{NETWORK_TCP, encode_hello},
};

/// How long the accept loops wait for in-flight connections to finish after
/// a shutdown signal before giving up on them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let args = LocalArgs::parse();
    let file_config = Config::load_optional(args.config.as_ref())?;
    let settings = LocalSettings::resolve(&args, &file_config)?;

    let _guard = logger::init_logger(settings.verbose)?;
    if settings.use_tls {
        tls::install_default_crypto_provider();
    }

    let pool = Arc::new(Pool::new(build_connector(&settings)?, SessionConfig::default()));
    let shutdown = CancellationToken::new();

    let socks5_listener = TcpListener::bind(("0.0.0.0", settings.socks5_port))
        .await
        .with_context(|| format!("binding SOCKS5 listener on port {}", settings.socks5_port))?;
    let http_listener = TcpListener::bind(("0.0.0.0", settings.http_port))
        .await
        .with_context(|| format!("binding HTTP listener on port {}", settings.http_port))?;
    info!(
        socks5_port = settings.socks5_port,
        http_port = settings.http_port,
        remote = %settings.remote,
        "local endpoint listening"
    );

    let socks5_pool = Arc::clone(&pool);
    let socks5_shutdown = shutdown.clone();
    let mut socks5_task = tokio::spawn(async move {
        let mut inflight = JoinSet::new();
        loop {
            tokio::select! {
                _ = socks5_shutdown.cancelled() => break,
                accepted = socks5_listener.accept() => match accepted {
                    Ok((sock, peer)) => {
                        let pool = Arc::clone(&socks5_pool);
                        inflight.spawn(async move {
                            if let Err(e) = handle_socks5(sock, pool).await {
                                warn!(%peer, error = %e, "socks5 connection ended with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "socks5 accept failed"),
                },
            }
        }
        drain_inflight(inflight, "socks5").await;
    });

    let http_pool = Arc::clone(&pool);
    let http_shutdown = shutdown.clone();
    let mut http_task = tokio::spawn(async move {
        let mut inflight = JoinSet::new();
        loop {
            tokio::select! {
                _ = http_shutdown.cancelled() => break,
                accepted = http_listener.accept() => match accepted {
                    Ok((sock, peer)) => {
                        let pool = Arc::clone(&http_pool);
                        inflight.spawn(async move {
                            if let Err(e) = handle_http(sock, pool).await {
                                warn!(%peer, error = %e, "http connection ended with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "http accept failed"),
                },
            }
        }
        drain_inflight(inflight, "http").await;
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        res = terminate_signal() => { let _ = res; info!("received SIGTERM, shutting down"); }
        _ = &mut socks5_task => {}
        _ = &mut http_task => {}
    }

    shutdown.cancel();
    let _ = socks5_task.await;
    let _ = http_task.await;

    Ok(())
}

/// Awaits every still-running connection task up to `SHUTDOWN_GRACE`,
/// logging and abandoning whatever remains once the grace period elapses.
async fn drain_inflight(mut inflight: JoinSet<()>, listener_name: &str) {
    if inflight.is_empty() {
        return;
    }
    info!(listener = listener_name, pending = inflight.len(), "draining in-flight connections before shutdown");
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while inflight.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            listener = listener_name,
            remaining = inflight.len(),
            "shutdown grace period elapsed with connections still in flight"
        );
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

fn build_connector(settings: &LocalSettings) -> Result<Connector> {
    let remote = settings.remote.clone();
    if settings.use_tls {
        let cert = settings.cert.clone().context("TLS enabled without --cert")?;
        let key = settings.key.clone().context("TLS enabled without --key")?;
        let connector = tls::client_connector(&cert, &key)?;
        let server_name = host_only(&remote);
        Ok(Arc::new(move || {
            let remote = remote.clone();
            let connector = connector.clone();
            let server_name = server_name.clone();
            Box::pin(async move {
                let tcp = TcpStream::connect(remote.as_str()).await?;
                tcp.set_nodelay(true).ok();
                let name = rustls::pki_types::ServerName::try_from(server_name)
                    .map_err(|e| anyhow::anyhow!("invalid remote host name for TLS SNI: {e}"))?;
                let tls_stream = connector.connect(name, tcp).await?;
                Ok(Box::new(tls_stream) as BoxedTransport)
            }) as Pin<Box<dyn std::future::Future<Output = Result<BoxedTransport>> + Send>>
        }))
    } else {
        Ok(Arc::new(move || {
            let remote = remote.clone();
            Box::pin(async move {
                let tcp = TcpStream::connect(remote.as_str()).await?;
                tcp.set_nodelay(true).ok();
                Ok(Box::new(tcp) as BoxedTransport)
            }) as Pin<Box<dyn std::future::Future<Output = Result<BoxedTransport>> + Send>>
        }))
    }
}

fn host_only(hostport: &str) -> String {
    hostport.rsplit_once(':').map(|(h, _)| h.to_string()).unwrap_or_else(|| hostport.to_string())
}

async fn open_stream_to(pool: &Pool, addr: &str) -> Result<Arc<Stream>> {
    let session = pool.get().await?;
    let stream = session.open_stream().await.context("opening stream on pooled session")?;
    let hello = encode_hello(NETWORK_TCP, addr);
    stream.write(&hello).await.context("writing hello to stream")?;
    Ok(stream)
}

async fn handle_socks5(mut sock: TcpStream, pool: Arc<Pool>) -> Result<()> {
    sock.set_nodelay(true).ok();
    let addr = socks5::handshake(&mut sock).await?;
    let stream = open_stream_to(&pool, &addr).await?;
    pipe_client_stream(&mut sock, &stream).await;
    Ok(())
}

async fn handle_http(mut sock: TcpStream, pool: Arc<Pool>) -> Result<()> {
    sock.set_nodelay(true).ok();
    http::serve(&mut sock, move |addr: String| {
        let pool = Arc::clone(&pool);
        Box::pin(async move { open_stream_to(&pool, &addr).await })
            as Pin<Box<dyn std::future::Future<Output = Result<Arc<Stream>>> + Send>>
    })
    .await
}
