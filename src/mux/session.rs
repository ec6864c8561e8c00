// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::{Mutex as AsyncMutex, mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::MuxError,
    mux::stream::Stream,
    wire::frame::{self, CMD_FIN, CMD_NOP, CMD_PSH, CMD_SYN, Frame, MAX_FRAME_SIZE},
};

/// Runtime tunables for a session, mirroring spec.md's `{Backlog,
/// MaxFrameSize, WriteQueueSize, PingInterval, KeepAliveInterval}`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub backlog: usize,
    pub max_frame_size: usize,
    pub write_queue_size: usize,
    pub ping_interval: Duration,
    pub keepalive_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backlog: 1024,
            max_frame_size: MAX_FRAME_SIZE,
            write_queue_size: 1024,
            ping_interval: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

/// A queued outbound frame plus a one-shot channel the send loop reports the
/// outcome on. Enforces total ordering of frames on the wire: one consumer
/// (the send loop) drains this queue and performs the write.
pub(crate) struct WriteRequest {
    pub(crate) cmd: u8,
    pub(crate) stream_id: u32,
    pub(crate) payload: Bytes,
    pub(crate) resp: oneshot::Sender<Result<usize, MuxError>>,
}

/// Multiplexing context bound to exactly one transport connection. Owns the
/// transport exclusively: the send loop is its only writer, the receive loop
/// its only reader. Three tasks (`recv_loop`, `send_loop`, `keepalive_loop`)
/// run for the session's lifetime; any one of them exiting calls `close()`,
/// which the other two observe via the shared `die` token.
pub struct Session {
    role: Role,
    next_id: AtomicU32,
    streams: DashMap<u32, Arc<Stream>>,
    accept_tx: Option<mpsc::Sender<Arc<Stream>>>,
    accept_rx: Option<AsyncMutex<mpsc::Receiver<Arc<Stream>>>>,
    write_tx: mpsc::Sender<WriteRequest>,
    active_flag: AtomicBool,
    die: CancellationToken,
    config: SessionConfig,
}

impl Session {
    /// Starts an initiator session: allocates stream ids, does not populate
    /// an accept queue.
    pub fn client<T>(transport: T, config: SessionConfig) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn(transport, config, Role::Initiator)
    }

    /// Starts a responder session: populates an accept queue, does not
    /// allocate ids.
    pub fn server<T>(transport: T, config: SessionConfig) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn(transport, config, Role::Responder)
    }

    fn spawn<T>(transport: T, config: SessionConfig, role: Role) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(transport);
        let (write_tx, write_rx) = mpsc::channel(config.write_queue_size);
        let (accept_tx, accept_rx) = if role == Role::Responder {
            let (tx, rx) = mpsc::channel(config.backlog);
            (Some(tx), Some(AsyncMutex::new(rx)))
        } else {
            (None, None)
        };

        let session = Arc::new(Session {
            role,
            next_id: AtomicU32::new(1),
            streams: DashMap::new(),
            accept_tx,
            accept_rx,
            write_tx,
            active_flag: AtomicBool::new(false),
            die: CancellationToken::new(),
            config,
        });

        tokio::spawn(Arc::clone(&session).recv_loop(read_half));
        tokio::spawn(Arc::clone(&session).send_loop(write_rx, write_half));
        tokio::spawn(Arc::clone(&session).keepalive_loop());

        session
    }

    /// Allocates a fresh stream id (initiator only), registers the stream,
    /// and submits `SYN` best-effort. The stream is returned even if the
    /// `SYN` enqueue fails — a subsequent session death reaps it.
    pub async fn open_stream(self: &Arc<Self>) -> Result<Arc<Stream>, MuxError> {
        if self.die.is_cancelled() {
            return Err(MuxError::SessionDead);
        }
        let sid = self.next_id.fetch_add(1, Ordering::SeqCst);
        let stream = Arc::new(Stream::new(
            sid,
            Arc::downgrade(self),
            &self.die,
            self.config.max_frame_size,
            self.write_tx.clone(),
        ));
        self.streams.insert(sid, Arc::clone(&stream));
        let _ = self.submit_write(CMD_SYN, sid, Bytes::new(), None).await;
        Ok(stream)
    }

    /// Awaits either the accept queue or session death (responder only).
    pub async fn accept_stream(self: &Arc<Self>) -> Option<Arc<Stream>> {
        let accept_rx = self.accept_rx.as_ref()?;
        let mut rx = accept_rx.lock().await;
        tokio::select! {
            _ = self.die.cancelled() => None,
            item = rx.recv() => item,
        }
    }

    /// Number of streams currently registered (used by the pool's capacity
    /// check).
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn is_dead(&self) -> bool {
        self.die.is_cancelled()
    }

    pub(crate) fn remove_stream(&self, sid: u32) {
        self.streams.remove(&sid);
    }

    /// Idempotent. Latches `die`, which cascades to every stream's own
    /// (child) token, and drops the stream map. The transport itself closes
    /// when `recv_loop`/`send_loop` observe `die` and their halves drop.
    fn close_sync(&self) {
        if self.die.is_cancelled() {
            return;
        }
        self.die.cancel();
        self.streams.clear();
    }

    async fn submit_write(
        &self,
        cmd: u8,
        stream_id: u32,
        payload: Bytes,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<usize, MuxError> {
        use crate::mux::common::{Race, race};

        if self.die.is_cancelled() {
            return Err(MuxError::SessionDead);
        }
        let (resp_tx, resp_rx) = oneshot::channel();
        let req = WriteRequest {
            cmd,
            stream_id,
            payload,
            resp: resp_tx,
        };
        match race(self.write_tx.send(req), deadline, &self.die).await {
            Race::Dead => return Err(MuxError::SessionDead),
            Race::TimedOut => return Err(MuxError::Timeout),
            Race::Ready(Err(_)) => return Err(MuxError::SessionDead),
            Race::Ready(Ok(())) => {}
        }
        match race(resp_rx, deadline, &self.die).await {
            Race::Dead => Err(MuxError::SessionDead),
            Race::TimedOut => Err(MuxError::Timeout),
            Race::Ready(Ok(inner)) => inner,
            Race::Ready(Err(_)) => Err(MuxError::SessionDead),
        }
    }

    async fn submit_nop(&self) {
        let (resp_tx, resp_rx) = oneshot::channel();
        let req = WriteRequest {
            cmd: CMD_NOP,
            stream_id: 0,
            payload: Bytes::new(),
            resp: resp_tx,
        };
        if self.write_tx.send(req).await.is_ok() {
            let _ = resp_rx.await;
        }
    }

    async fn recv_loop(self: Arc<Self>, mut reader: impl AsyncRead + Unpin) {
        loop {
            let frame = tokio::select! {
                _ = self.die.cancelled() => break,
                res = frame::decode(&mut reader) => match res {
                    Ok(f) => f,
                    Err(e) => {
                        debug!(error = %e, "recv loop exiting on decode error");
                        break;
                    }
                },
            };
            self.active_flag.store(true, Ordering::Relaxed);
            self.dispatch(frame).await;
        }
        self.close_sync();
    }

    async fn dispatch(self: &Arc<Self>, frame: Frame) {
        match frame.cmd {
            CMD_SYN => {
                if self.streams.contains_key(&frame.stream_id) {
                    return;
                }
                let Some(accept_tx) = &self.accept_tx else {
                    // Only responders accept SYN; a SYN arriving on an
                    // initiator session is protocol noise from a
                    // misbehaving peer.
                    return;
                };
                let stream = Arc::new(Stream::new(
                    frame.stream_id,
                    Arc::downgrade(self),
                    &self.die,
                    self.config.max_frame_size,
                    self.write_tx.clone(),
                ));
                self.streams.insert(frame.stream_id, Arc::clone(&stream));
                tokio::select! {
                    _ = self.die.cancelled() => {}
                    _ = accept_tx.send(stream) => {}
                }
            }
            CMD_FIN => {
                if let Some(stream) = self.streams.get(&frame.stream_id) {
                    stream.on_fin();
                }
            }
            CMD_PSH => {
                if let Some(stream) = self.streams.get(&frame.stream_id) {
                    stream.on_data(frame.payload);
                }
            }
            CMD_NOP => {}
            other => warn!(cmd = other, "dispatch received an already-validated unknown cmd"),
        }
    }

    async fn send_loop(self: Arc<Self>, mut rx: mpsc::Receiver<WriteRequest>, mut writer: impl AsyncWrite + Unpin) {
        loop {
            let req = tokio::select! {
                _ = self.die.cancelled() => break,
                req = rx.recv() => match req {
                    Some(r) => r,
                    None => break,
                },
            };
            let payload_len = req.payload.len();
            let bytes = frame::encode(req.cmd, req.stream_id, &req.payload);
            let result = writer.write_all(&bytes).await.map(|()| payload_len).map_err(MuxError::from);
            let failed = result.is_err();
            let _ = req.resp.send(result);
            if failed {
                break;
            }
        }
        let _ = writer.shutdown().await;
        self.close_sync();
    }

    async fn keepalive_loop(self: Arc<Self>) {
        let mut ping = tokio::time::interval(self.config.ping_interval);
        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        // The first tick of `interval` fires immediately; consume it so the
        // very first keepalive check doesn't fire before any traffic has had
        // a chance to arrive.
        ping.tick().await;
        keepalive.tick().await;

        loop {
            tokio::select! {
                _ = self.die.cancelled() => break,
                _ = ping.tick() => {
                    self.submit_nop().await;
                }
                _ = keepalive.tick() => {
                    if !self.active_flag.swap(false, Ordering::Relaxed) {
                        debug!("no frames received within keepalive interval, closing session");
                        break;
                    }
                }
            }
        }
        self.close_sync();
    }
}
