// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use zerocopy::{BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16};

use crate::error::MuxError;

/// TCP destination (the only network kind actually dialed by either
/// endpoint).
pub const NETWORK_TCP: u8 = 1;
/// Reserved for future use; `wire::hello` accepts it on the wire but neither
/// endpoint dials it.
pub const NETWORK_UDP: u8 = 2;

/// `[network:1][addr_len:u16 BE]`. Note the endianness: the frame header
/// that wraps this payload is little-endian throughout, but `addr_len` here
/// is big-endian — a deliberate mismatch inherited from the wire format this
/// crate is compatible with, not a bug.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
struct HelloHeader {
    network: u8,
    addr_len: U16<BigEndian>,
}

/// Encodes a Hello announcement: network kind plus a `host:port` string.
pub fn encode_hello(network: u8, addr: &str) -> Bytes {
    assert!(
        !addr.is_empty() && addr.len() <= u16::MAX as usize,
        "hello addr length {} out of range",
        addr.len()
    );
    let header = HelloHeader {
        network,
        addr_len: U16::new(addr.len() as u16),
    };
    let mut buf = BytesMut::with_capacity(header.as_bytes().len() + addr.len());
    buf.put_slice(header.as_bytes());
    buf.put_slice(addr.as_bytes());
    buf.freeze()
}

/// Reads one Hello from `reader`: `network`, `addr_len` (big-endian), then
/// `addr_len` bytes of UTF-8 `host:port`. A malformed Hello is fatal to the
/// *stream* it was read on, not the session — callers (the remote stream
/// handler) must close only that stream on `Err`.
pub async fn decode_hello<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(u8, String), MuxError> {
    let mut header_buf = [0u8; 3];
    reader.read_exact(&mut header_buf).await?;

    let header = HelloHeader::ref_from_bytes(&header_buf)
        .map_err(|_| MuxError::InvalidNetwork(header_buf[0]))?;

    if header.network != NETWORK_TCP {
        return Err(MuxError::InvalidNetwork(header.network));
    }
    let addr_len = header.addr_len.get();
    if addr_len == 0 {
        return Err(MuxError::EmptyAddr);
    }

    let mut addr_buf = vec![0u8; addr_len as usize];
    reader.read_exact(&mut addr_buf).await?;
    let addr = String::from_utf8(addr_buf).map_err(|_| MuxError::InvalidAddr)?;

    Ok((header.network, addr))
}
