// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! End-to-end scenarios exercising the multiplexer, its stream/session
//! lifecycle, and the SOCKS5/HTTP adapters together, the way the two
//! endpoint binaries compose them.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tunnelmux::{
    error::MuxError,
    mux::{
        session::{Session, SessionConfig},
        stream::Stream,
    },
    proxy::{http, pipe_client_stream, socks5},
    wire::hello::{NETWORK_TCP, encode_hello},
};

async fn paired_sessions(config: SessionConfig) -> (Arc<Session>, Arc<Session>) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let initiator = Session::client(a, config.clone());
    let responder = Session::server(b, config);
    (initiator, responder)
}

async fn spawn_echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                loop {
                    let n = match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if sock.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Spawns the remote-side loop: accepts streams, reads their Hello, dials
/// the announced destination, and pipes.
fn spawn_remote_dispatch(responder: Arc<Session>) {
    tokio::spawn(async move {
        while let Some(stream) = responder.accept_stream().await {
            tokio::spawn(async move {
                let (_network, addr) = match stream.read_hello().await {
                    Ok(h) => h,
                    Err(_) => return,
                };
                if let Ok(mut dest) = TcpStream::connect(addr).await {
                    pipe_client_stream(&mut dest, &stream).await;
                }
            });
        }
    });
}

/// **E1 SOCKS5 echo**: local accepts a SOCKS5 `CONNECT` request; an
/// in-process echo server returns anything sent; the client writes and
/// reads back the same bytes.
#[tokio::test]
async fn e1_socks5_echo() {
    let echo_addr = spawn_echo_server().await;
    let (initiator, responder) = paired_sessions(SessionConfig::default()).await;
    spawn_remote_dispatch(responder);

    let (mut client_side, mut local_side) = tokio::io::duplex(4096);

    let client_task = tokio::spawn(async move {
        client_side.write_all(&[5, 1, 0]).await.expect("write greeting");
        let mut method_reply = [0u8; 2];
        client_side.read_exact(&mut method_reply).await.expect("read method reply");
        assert_eq!(method_reply, [5, 0]);

        let std::net::SocketAddr::V4(v4) = echo_addr else {
            panic!("expected an IPv4 echo address");
        };
        let mut req = vec![5, 1, 0, 1];
        req.extend_from_slice(&v4.ip().octets());
        req.extend_from_slice(&v4.port().to_be_bytes());
        client_side.write_all(&req).await.expect("write connect request");

        let mut reply = [0u8; 10];
        client_side.read_exact(&mut reply).await.expect("read connect reply");
        assert_eq!(reply[1], 0, "connect reply must report success");

        client_side.write_all(b"ping").await.expect("write ping");
        let mut echoed = [0u8; 4];
        client_side.read_exact(&mut echoed).await.expect("read echo");
        assert_eq!(&echoed, b"ping");
    });

    let addr = socks5::handshake(&mut local_side).await.expect("socks5 handshake");
    assert_eq!(addr, echo_addr.to_string());

    let stream = initiator.open_stream().await.expect("open stream");
    stream
        .write(&encode_hello(NETWORK_TCP, &addr))
        .await
        .expect("write hello");
    pipe_client_stream(&mut local_side, &stream).await;

    client_task.await.expect("client task panicked");
}

/// **E2 Multiplex**: many streams on one session concurrently, each
/// exchanging distinct bytes with its own echo port, verifying per-stream
/// byte equality and no cross-stream interleaving. Uses a smaller per-stream
/// payload than the production-scale "1 MiB" scenario to keep the suite
/// fast; the multiplexing logic under test does not depend on payload size.
#[tokio::test]
async fn e2_multiplex_many_streams() {
    const STREAMS: usize = 50;
    const PAYLOAD_LEN: usize = 64 * 1024;

    let (initiator, responder) = paired_sessions(SessionConfig::default()).await;
    spawn_remote_dispatch(responder);

    let mut echo_addrs = Vec::with_capacity(STREAMS);
    for _ in 0..STREAMS {
        echo_addrs.push(spawn_echo_server().await);
    }

    let mut tasks = Vec::with_capacity(STREAMS);
    for (i, echo_addr) in echo_addrs.into_iter().enumerate() {
        let initiator = Arc::clone(&initiator);
        tasks.push(tokio::spawn(async move {
            let payload: Vec<u8> = (0..PAYLOAD_LEN).map(|j| ((i * 7 + j) % 256) as u8).collect();

            let stream = initiator.open_stream().await.expect("open stream");
            stream
                .write(&encode_hello(NETWORK_TCP, &echo_addr.to_string()))
                .await
                .expect("write hello");
            stream.write(&payload).await.expect("write payload");

            let mut received = vec![0u8; PAYLOAD_LEN];
            let mut filled = 0;
            while filled < PAYLOAD_LEN {
                let n = stream.read(&mut received[filled..]).await.expect("read echo");
                filled += n;
            }
            assert_eq!(received, payload, "stream {i} saw corrupted or interleaved bytes");
        }));
    }

    for task in tasks {
        task.await.expect("stream task panicked");
    }
}

/// **E3 Large frame split**: a single `stream.write` of 100000 bytes must
/// appear on the wire as at least `ceil(100000/32768) = 4` `PSH` frames
/// whose payloads concatenate back to the input.
#[tokio::test]
async fn e3_large_write_splits_into_multiple_psh_frames() {
    use tunnelmux::wire::frame::{self, CMD_PSH};

    let (a, mut b) = tokio::io::duplex(512 * 1024);
    let initiator = Session::client(a, SessionConfig::default());

    let stream = initiator.open_stream().await.expect("open stream");
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let write_task = tokio::spawn({
        let payload = payload.clone();
        async move { stream.write(&payload).await.expect("write large payload") }
    });

    let mut psh_payloads: Vec<u8> = Vec::with_capacity(payload.len());
    let mut psh_count = 0usize;
    while psh_payloads.len() < payload.len() {
        let frame = frame::decode(&mut b).await.expect("decode wire frame");
        if frame.cmd == CMD_PSH {
            psh_count += 1;
            psh_payloads.extend_from_slice(&frame.payload);
        }
    }

    assert!(psh_count >= 4, "expected at least 4 PSH frames, saw {psh_count}");
    assert_eq!(psh_payloads, payload);
    write_task.await.expect("write task panicked");
}

/// **E4 Early close**: closing a stream locally mid-transfer lets the peer
/// drain already-buffered bytes before its read observes `StreamDead`; no
/// further frames for that stream id are processed afterward.
#[tokio::test]
async fn e4_early_close_drains_then_stream_dead() {
    let (initiator, responder) = paired_sessions(SessionConfig::default()).await;

    let local_stream = initiator.open_stream().await.expect("open stream");
    local_stream.write(b"buffered-before-close").await.expect("write");

    let remote_stream = loop {
        if let Some(s) = responder.accept_stream().await {
            break s;
        }
    };

    // Give the recv loop a beat to deliver the PSH before FIN follows.
    tokio::time::sleep(Duration::from_millis(20)).await;
    local_stream.close();

    let mut buf = [0u8; 64];
    let n = remote_stream.read(&mut buf).await.expect("drain buffered bytes");
    assert_eq!(&buf[..n], b"buffered-before-close");

    let err = remote_stream.read(&mut buf).await.expect_err("stream must be dead after draining");
    assert!(matches!(err, MuxError::StreamDead));
}

/// **E5 Session timeout**: if no frames arrive within `KeepAliveInterval`,
/// the session closes; pending stream operations return dead errors, and
/// the pool's next `get()` dials a fresh session. Uses a millisecond-scale
/// interval rather than the production 40s default so the test completes
/// quickly.
#[tokio::test]
async fn e5_session_times_out_without_keepalive_frames() {
    use tunnelmux::mux::pool::Pool;

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback listener");
    let addr = listener.local_addr().expect("local addr");

    // Accept connections but never read from them, so no NOP pings the
    // initiator sends are ever answered and the initiator's own keepalive
    // watchdog is what has to fire.
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((sock, _)) => {
                    // Hold the socket open without servicing it.
                    tokio::spawn(async move {
                        let _sock = sock;
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    let short_keepalive = SessionConfig {
        ping_interval: Duration::from_secs(3600),
        keepalive_interval: Duration::from_millis(50),
        ..SessionConfig::default()
    };

    let connector: tunnelmux::transport::Connector = Arc::new(move || {
        Box::pin(async move {
            let stream = TcpStream::connect(addr).await?;
            Ok(Box::new(stream) as Box<dyn tunnelmux::transport::Transport>)
        }) as Pin<Box<dyn Future<Output = anyhow::Result<Box<dyn tunnelmux::transport::Transport>>> + Send>>
    });

    let pool = Pool::new(connector, short_keepalive);
    let first = pool.get().await.expect("first get dials a session");
    let stream = first.open_stream().await.expect("open stream");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(first.is_dead(), "session should have closed after keepalive timeout");

    let err = stream.read(&mut [0u8; 1]).await.expect_err("stream must report dead");
    assert!(matches!(err, MuxError::StreamDead));

    let second = pool.get().await.expect("pool dials a new session after the old one died");
    assert!(!Arc::ptr_eq(&first, &second));
}

/// **E7 Deadline non-leak**: a `Timeout` on a read with no data pending
/// leaves the stream otherwise usable — a later read or write with no
/// deadline set still succeeds.
#[tokio::test]
async fn e7_timeout_then_stream_still_usable() {
    let (initiator, responder) = paired_sessions(SessionConfig::default()).await;

    let local_stream = initiator.open_stream().await.expect("open stream");
    let remote_stream = loop {
        if let Some(s) = responder.accept_stream().await {
            break s;
        }
    };

    local_stream.set_read_deadline(Some(tokio::time::Instant::now() + Duration::from_millis(20)));
    let err = local_stream.read(&mut [0u8; 16]).await.expect_err("idle read must time out");
    assert!(matches!(err, MuxError::Timeout));

    local_stream.set_read_deadline(None);
    local_stream.write(b"still alive").await.expect("write after timeout");
    let mut buf = [0u8; 32];
    let mut filled = 0;
    while filled < b"still alive".len() {
        let n = remote_stream.read(&mut buf[filled..]).await.expect("remote read after timeout");
        filled += n;
    }
    assert_eq!(&buf[..filled], b"still alive");
}

/// **E6 HTTP keep-alive**: two `GET` requests on one client connection with
/// `Proxy-Connection: keep-alive` both succeed over the same upstream
/// stream, with keep-alive headers echoed back.
#[tokio::test]
async fn e6_http_keep_alive_two_requests_one_stream() {
    let (initiator, responder) = paired_sessions(SessionConfig::default()).await;

    tokio::spawn(async move {
        let Some(stream) = responder.accept_stream().await else {
            return;
        };
        for i in 0..2 {
            let mut buf = vec![0u8; 4096];
            let mut filled = 0;
            loop {
                let n = stream.read(&mut buf[filled..]).await.expect("read request");
                filled += n;
                if buf[..filled].windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let body = format!("response-{i}");
            let response =
                format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}", body.len(), body);
            stream.write(response.as_bytes()).await.expect("write response");
        }
    });

    let dial_session = Arc::clone(&initiator);
    let dial = move |_addr: String| {
        let dial_session = Arc::clone(&dial_session);
        Box::pin(async move { dial_session.open_stream().await.map_err(anyhow::Error::from) })
            as Pin<Box<dyn Future<Output = anyhow::Result<Arc<Stream>>> + Send>>
    };

    let (mut client_side, mut local_side) = tokio::io::duplex(8192);

    let client_task = tokio::spawn(async move {
        for i in 0..2 {
            let req = "GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\n\r\n";
            client_side.write_all(req.as_bytes()).await.expect("write request");

            let mut buf = vec![0u8; 4096];
            let mut filled = 0;
            let head_end = loop {
                let n = client_side.read(&mut buf[filled..]).await.expect("read response");
                filled += n;
                if let Some(pos) = buf[..filled].windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let head = String::from_utf8_lossy(&buf[..head_end]);
            assert!(head.contains("Connection: keep-alive"), "response {i} head: {head}");
            assert!(head.contains("Keep-Alive: timeout=60"), "response {i} head: {head}");
            assert!(head.contains("200 OK"));
        }
    });

    http::serve(&mut local_side, dial).await.expect("http serve loop");
    client_task.await.expect("client task panicked");
}
