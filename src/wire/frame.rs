// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use zerocopy::{FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U16, U32};

use crate::error::MuxError;

/// `SYN` opens a new stream; payload is always empty.
pub const CMD_SYN: u8 = 1;
/// `FIN` half-closes a stream from the sender's side; payload is always empty.
pub const CMD_FIN: u8 = 2;
/// `PSH` carries stream payload bytes.
pub const CMD_PSH: u8 = 3;
/// `NOP` is a session-level liveness probe; `stream_id` is always 0.
pub const CMD_NOP: u8 = 4;

/// Current (only) protocol version.
pub const VERSION: u8 = 1;

/// Upper bound on a single `PSH` frame's payload, and the chunk size
/// `Stream::write` splits larger buffers into.
pub const MAX_FRAME_SIZE: usize = 32_768;

/// Size of the fixed frame header on the wire.
pub const HEADER_LEN: usize = 8;

/// `[ver:1][cmd:1][length:u16 LE][stream_id:u32 LE]`, exactly as it appears
/// on the wire. Little-endian throughout (unlike `Hello`'s `addr_len` — see
/// `wire::hello`, the mismatch is deliberate and part of the wire contract).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
struct FrameHeader {
    ver: u8,
    cmd: u8,
    length: U16<LittleEndian>,
    stream_id: U32<LittleEndian>,
}

/// A single decoded frame: command, addressed stream (0 for `NOP`), and
/// payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

fn validate_cmd_length(cmd: u8, length: u16) -> Result<(), MuxError> {
    match cmd {
        CMD_SYN | CMD_FIN | CMD_NOP => {
            if length != 0 {
                return Err(MuxError::InvalidLength { cmd, length });
            }
        }
        CMD_PSH => {
            if length == 0 {
                return Err(MuxError::InvalidLength { cmd, length });
            }
        }
        other => return Err(MuxError::InvalidCmd(other)),
    }
    Ok(())
}

/// Encodes a frame as a single contiguous buffer (header followed by
/// payload) ready for one transport write. `payload.len() > MAX_FRAME_SIZE`
/// is a caller bug, not a recoverable condition — it can only happen if
/// `Stream::write` fails to chunk correctly — so this asserts rather than
/// returning a `Result`.
pub fn encode(cmd: u8, stream_id: u32, payload: &[u8]) -> Bytes {
    assert!(
        payload.len() <= MAX_FRAME_SIZE,
        "frame payload {} exceeds MAX_FRAME_SIZE {}",
        payload.len(),
        MAX_FRAME_SIZE
    );
    let header = FrameHeader {
        ver: VERSION,
        cmd,
        length: U16::new(payload.len() as u16),
        stream_id: U32::new(stream_id),
    };
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(header.as_bytes());
    buf.put_slice(payload);
    buf.freeze()
}

/// Reads exactly one frame from `reader`. A short read, an unsupported
/// `ver`/`cmd`, or a disallowed `(cmd, length)` pairing is terminal — the
/// caller (`Session::recv_loop`) must close the session on any `Err`.
pub async fn decode<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, MuxError> {
    let mut header_buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut header_buf).await?;

    let header = FrameHeader::ref_from_bytes(&header_buf)
        .map_err(|_| MuxError::InvalidLength { cmd: 0, length: 0 })?;

    if header.ver != VERSION {
        return Err(MuxError::InvalidVersion(header.ver));
    }
    let cmd = header.cmd;
    let length = header.length.get();
    validate_cmd_length(cmd, length)?;

    let payload = if length == 0 {
        Bytes::new()
    } else {
        let mut data = vec![0u8; length as usize];
        reader.read_exact(&mut data).await?;
        Bytes::from(data)
    };

    Ok(Frame {
        cmd,
        stream_id: header.stream_id.get(),
        payload,
    })
}
