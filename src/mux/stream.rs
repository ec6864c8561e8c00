// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::VecDeque,
    sync::{Mutex, Weak},
};

use bytes::Bytes;
use tokio::{
    sync::{Notify, mpsc, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::MuxError,
    mux::{
        common::{Race, race},
        session::{Session, WriteRequest},
    },
    wire::frame::{CMD_FIN, CMD_PSH},
};

/// One logical bidirectional byte flow multiplexed over a `Session`.
///
/// A stream's terminal state is a single `CancellationToken` (`die`), a
/// child of its session's own `die` token: cancelling the session cascades
/// to every stream automatically, with no manual walk required. Locally
/// driven close (`close()`) and remote-driven close (`FIN` received) both
/// cancel the *same* token, which is why the spec's three-state diagram
/// (`Open` / `HalfClosedRemote` / `Closed`) collapses here to "is `die`
/// cancelled" plus "is `inbound` still non-empty" — `read()` checks the
/// buffer before it checks `die`, so a reader always drains buffered bytes
/// before observing `StreamDead`, matching `HalfClosedRemote` without a
/// separate state field.
pub struct Stream {
    id: u32,
    session: Weak<Session>,
    inbound: Mutex<VecDeque<Bytes>>,
    read_wake: Notify,
    die: CancellationToken,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
    max_frame_size: usize,
    write_tx: mpsc::Sender<WriteRequest>,
}

impl Stream {
    pub(crate) fn new(
        id: u32,
        session: Weak<Session>,
        parent_die: &CancellationToken,
        max_frame_size: usize,
        write_tx: mpsc::Sender<WriteRequest>,
    ) -> Self {
        Self {
            id,
            session,
            inbound: Mutex::new(VecDeque::new()),
            read_wake: Notify::new(),
            die: parent_die.child_token(),
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
            max_frame_size,
            write_tx,
        }
    }

    /// Stream identifier, unique within the owning session's lifetime.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Reads 1..=`buf.len()` bytes from the head of the inbound buffer. If
    /// empty, awaits new data, stream death, or the read deadline. Never
    /// returns `Ok(0)` — a spurious wake with an empty buffer re-awaits.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, MuxError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut inbound = self.inbound.lock().expect("stream inbound mutex poisoned");
                if let Some(front) = inbound.front_mut() {
                    let n = front.len().min(buf.len());
                    buf[..n].copy_from_slice(&front[..n]);
                    if n == front.len() {
                        inbound.pop_front();
                    } else {
                        *front = front.slice(n..);
                    }
                    if n > 0 {
                        return Ok(n);
                    }
                }
            }
            if self.die.is_cancelled() {
                return Err(MuxError::StreamDead);
            }
            let deadline = *self.read_deadline.lock().expect("read deadline mutex poisoned");
            match race(self.read_wake.notified(), deadline, &self.die).await {
                Race::TimedOut => return Err(MuxError::Timeout),
                Race::Dead | Race::Ready(()) => {}
            }
        }
    }

    /// Splits `buf` into chunks of at most `max_frame_size` and submits each
    /// as a `PSH` write request, awaiting completion. Returns the cumulative
    /// payload bytes the session reports written; a failure mid-stream
    /// returns that partial count alongside the error.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, MuxError> {
        if self.die.is_cancelled() {
            return Err(MuxError::StreamDead);
        }
        let mut total = 0usize;
        for chunk in buf.chunks(self.max_frame_size.max(1)) {
            match self.submit(CMD_PSH, Bytes::copy_from_slice(chunk)).await {
                Ok(n) => total += n,
                Err(e) if total == 0 => return Err(e),
                Err(e) => {
                    return Err(MuxError::PartialWrite {
                        written: total,
                        source: Box::new(e),
                    });
                }
            }
        }
        Ok(total)
    }

    /// Idempotent. Latches `die`, submits a best-effort `FIN`, and requests
    /// removal from the session's stream map.
    pub fn close(&self) {
        if self.die.is_cancelled() {
            return;
        }
        self.die.cancel();
        let session = self.session.clone();
        let id = self.id;
        let write_tx = self.write_tx.clone();
        tokio::spawn(async move {
            let (resp_tx, _resp_rx) = oneshot::channel();
            let _ = write_tx
                .send(WriteRequest {
                    cmd: CMD_FIN,
                    stream_id: id,
                    payload: Bytes::new(),
                    resp: resp_tx,
                })
                .await;
            if let Some(session) = session.upgrade() {
                session.remove_stream(id);
            }
        });
    }

    /// Zero means "no deadline". Applies to both read and write.
    pub fn set_deadline(&self, at: Option<Instant>) {
        *self.read_deadline.lock().expect("read deadline mutex poisoned") = at;
        *self.write_deadline.lock().expect("write deadline mutex poisoned") = at;
    }

    pub fn set_read_deadline(&self, at: Option<Instant>) {
        *self.read_deadline.lock().expect("read deadline mutex poisoned") = at;
    }

    pub fn set_write_deadline(&self, at: Option<Instant>) {
        *self.write_deadline.lock().expect("write deadline mutex poisoned") = at;
    }

    /// Driven by the session's receive loop on `PSH(id, data)`.
    pub(crate) fn on_data(&self, data: Bytes) {
        if self.die.is_cancelled() {
            return;
        }
        self.inbound.lock().expect("stream inbound mutex poisoned").push_back(data);
        self.read_wake.notify_one();
    }

    /// Driven by the session's receive loop on `FIN(id)`. Buffered data is
    /// already enqueued before this runs (the recv loop processes frames in
    /// order), so a blocked reader drains it before seeing `StreamDead`.
    pub(crate) fn on_fin(&self) {
        self.read_wake.notify_one();
        self.die.cancel();
    }

    /// Reads exactly `buf.len()` bytes, looping over `read()` until filled.
    async fn read_exact(&self, buf: &mut [u8]) -> Result<(), MuxError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            filled += n;
        }
        Ok(())
    }

    /// Reads the Hello announcement that must be the first application
    /// payload on a stream opened by the initiator: `[network:1]
    /// [addr_len:u16 BE][addr]`. Implemented directly against `Stream`'s
    /// reassembled byte flow (rather than delegating to
    /// `wire::hello::decode_hello`, which wants a raw `AsyncRead`) since a
    /// `Stream` is not a raw transport, it replays reassembled `PSH`
    /// payloads.
    pub async fn read_hello(&self) -> Result<(u8, String), MuxError> {
        let mut head = [0u8; 3];
        self.read_exact(&mut head).await?;
        let network = head[0];
        if network != crate::wire::hello::NETWORK_TCP {
            return Err(MuxError::InvalidNetwork(network));
        }
        let addr_len = u16::from_be_bytes([head[1], head[2]]) as usize;
        if addr_len == 0 {
            return Err(MuxError::EmptyAddr);
        }
        let mut addr_buf = vec![0u8; addr_len];
        self.read_exact(&mut addr_buf).await?;
        let addr = String::from_utf8(addr_buf).map_err(|_| MuxError::InvalidAddr)?;
        Ok((network, addr))
    }

    async fn submit(&self, cmd: u8, payload: Bytes) -> Result<usize, MuxError> {
        let deadline = *self.write_deadline.lock().expect("write deadline mutex poisoned");
        let (resp_tx, resp_rx) = oneshot::channel();
        let req = WriteRequest {
            cmd,
            stream_id: self.id,
            payload,
            resp: resp_tx,
        };
        match race(self.write_tx.send(req), deadline, &self.die).await {
            Race::Dead => return Err(MuxError::StreamDead),
            Race::TimedOut => return Err(MuxError::Timeout),
            Race::Ready(Err(_)) => return Err(MuxError::StreamDead),
            Race::Ready(Ok(())) => {}
        }
        match race(resp_rx, deadline, &self.die).await {
            Race::Dead => Err(MuxError::StreamDead),
            Race::TimedOut => Err(MuxError::Timeout),
            Race::Ready(Ok(inner)) => inner.map_err(|_| MuxError::StreamDead),
            Race::Ready(Err(_)) => Err(MuxError::StreamDead),
        }
    }
}
