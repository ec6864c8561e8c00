// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! RFC 1928 SOCKS5 subset: no auth, `CONNECT` only, IPv4 or domain `ATYP`.
//! Grounded on spec.md §4.6 and `original_source/socks5/socks5.go`.

use std::net::Ipv4Addr;

use anyhow::{Context, Result, anyhow, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const VERSION: u8 = 5;
const METHOD_NO_AUTH: u8 = 0;
const CMD_CONNECT: u8 = 1;
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;

/// Runs the greeting + request exchange on `client`, replying with method
/// selection `(5, 0)` and, on a valid request, a success reply that echoes
/// back the `ATYP`/`BND.ADDR`/`BND.PORT` exactly as received. Returns the
/// `"host:port"` destination. Any protocol violation returns `Err`; the
/// caller is responsible for closing the client connection.
pub async fn handshake<S>(client: &mut S) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await?;
    let [ver, nmethods] = greeting;
    if ver != VERSION {
        bail!("socks5: unsupported version {ver}");
    }
    if nmethods == 0 {
        bail!("socks5: NMETHODS must be non-zero");
    }
    let mut methods = vec![0u8; nmethods as usize];
    client.read_exact(&mut methods).await?;

    client.write_all(&[VERSION, METHOD_NO_AUTH]).await?;

    let mut request_head = [0u8; 4];
    client.read_exact(&mut request_head).await?;
    let [ver, cmd, _rsv, atyp] = request_head;
    if ver != VERSION {
        bail!("socks5: unsupported request version {ver}");
    }
    if cmd != CMD_CONNECT {
        bail!("socks5: unsupported command {cmd}");
    }

    let (host, addr_bytes) = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            client.read_exact(&mut octets).await?;
            (Ipv4Addr::from(octets).to_string(), octets.to_vec())
        }
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            client.read_exact(&mut len_buf).await?;
            let len = len_buf[0] as usize;
            let mut name = vec![0u8; len];
            client.read_exact(&mut name).await?;
            let host = String::from_utf8(name.clone())
                .map_err(|_| anyhow!("socks5: domain name is not valid utf-8"))?;
            let mut bytes = vec![len_buf[0]];
            bytes.extend_from_slice(&name);
            (host, bytes)
        }
        other => bail!("socks5: unsupported ATYP {other}"),
    };

    let mut port_buf = [0u8; 2];
    client.read_exact(&mut port_buf).await?;
    let port = u16::from_be_bytes(port_buf);

    let mut reply = Vec::with_capacity(4 + addr_bytes.len() + 2);
    reply.extend_from_slice(&[VERSION, 0, 0, atyp]);
    reply.extend_from_slice(&addr_bytes);
    reply.extend_from_slice(&port_buf);
    client
        .write_all(&reply)
        .await
        .context("socks5: writing success reply")?;

    Ok(format!("{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_ipv4_connect_request() -> Result<()> {
        let (mut a, mut b) = tokio::io::duplex(256);
        let client_side = tokio::spawn(async move {
            a.write_all(&[5, 1, 0]).await?;
            a.write_all(&[5, 1, 0, 1, 127, 0, 0, 1, 0, 7]).await?;
            let mut reply = [0u8; 10];
            a.read_exact(&mut reply).await?;
            Ok::<_, std::io::Error>(reply)
        });

        let dest = handshake(&mut b).await?;
        assert_eq!(dest, "127.0.0.1:7");

        let reply = client_side.await??;
        assert_eq!(reply, [5, 0, 0, 1, 127, 0, 0, 1, 0, 7]);
        Ok(())
    }

    #[tokio::test]
    async fn parses_domain_connect_request() -> Result<()> {
        let (mut a, mut b) = tokio::io::duplex(256);
        let domain = b"example.com";
        let client_side = tokio::spawn(async move {
            a.write_all(&[5, 1, 0]).await?;
            let mut req = vec![5, 1, 0, 3, domain.len() as u8];
            req.extend_from_slice(domain);
            req.extend_from_slice(&443u16.to_be_bytes());
            a.write_all(&req).await?;
            let mut reply = vec![0u8; 4 + 1 + domain.len() + 2];
            a.read_exact(&mut reply).await?;
            Ok::<_, std::io::Error>(reply)
        });

        let dest = handshake(&mut b).await?;
        assert_eq!(dest, "example.com:443");
        client_side.await??;
        Ok(())
    }

    #[tokio::test]
    async fn rejects_wrong_version() {
        let (mut a, mut b) = tokio::io::duplex(256);
        tokio::spawn(async move {
            let _ = a.write_all(&[4, 1, 0]).await;
        });
        assert!(handshake(&mut b).await.is_err());
    }
}
