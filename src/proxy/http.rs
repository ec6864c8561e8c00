// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Forward-proxy HTTP(S) adapter. Grounded on spec.md §4.7 and
//! `original_source/httpx/http.go`'s `Transfer`/`RemoveHopByHopHeaders`: the
//! hop-by-hop header list, the `User-Agent: ""`-if-absent quirk, and the 503
//! synthesis shape all come from that file. The keep-alive rewrite condition
//! follows spec.md's literal wording (gated on the request's
//! `Proxy-Connection: keep-alive` header *and* a known response
//! content-length) rather than the original Go, which drops the request-side
//! condition and decides purely on content-length.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::mux::stream::Stream;

const HOP_BY_HOP: &[&str] = &[
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

const MAX_HEAD_LEN: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;

/// One parsed HTTP/1.x request line plus headers, with the body left
/// unconsumed on `body_reader` for the caller to forward verbatim.
struct RequestHead {
    method: String,
    target: String,
    version_minor: u8,
    headers: Vec<(String, String)>,
    content_length: Option<u64>,
}

struct ResponseHead {
    status: String,
    version_minor: u8,
    headers: Vec<(String, String)>,
    content_length: Option<u64>,
}

fn header_get<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn header_set(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    if let Some(entry) = headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        entry.1 = value.to_string();
    } else {
        headers.push((name.to_string(), value.to_string()));
    }
}

fn remove_hop_by_hop(headers: &mut Vec<(String, String)>) {
    headers.retain(|(k, _)| !HOP_BY_HOP.contains(&k.to_ascii_lowercase().as_str()));
}

/// Reads bytes from `client` into `buf` until a full header block
/// (terminated by `\r\n\r\n`) has been accumulated, returning the byte
/// offset where the body begins. Returns `Ok(None)` on a clean EOF before
/// any bytes arrive (the client closed the connection between requests).
async fn read_head<S>(client: &mut S, buf: &mut Vec<u8>) -> Result<Option<usize>>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(pos) = find_head_end(buf) {
            return Ok(Some(pos));
        }
        if buf.len() > MAX_HEAD_LEN {
            bail!("http: request head exceeds {MAX_HEAD_LEN} bytes");
        }
        let n = client.read(&mut chunk).await?;
        if n == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                bail!("http: connection closed mid-header")
            };
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn parse_request(head: &[u8]) -> Result<RequestHead> {
    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut raw_headers);
    let status = req.parse(head).context("http: malformed request line or headers")?;
    if status.is_partial() {
        bail!("http: incomplete request head");
    }
    let method = req.method.context("http: missing method")?.to_string();
    let target = req.path.context("http: missing request target")?.to_string();
    let version_minor = req.version.context("http: missing version")?;
    let headers = req
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect::<Vec<_>>();
    let content_length = header_get(&headers, "content-length")
        .and_then(|v| v.trim().parse::<u64>().ok());
    Ok(RequestHead {
        method,
        target,
        version_minor,
        headers,
        content_length,
    })
}

fn parse_response(head: &[u8]) -> Result<ResponseHead> {
    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut rsp = httparse::Response::new(&mut raw_headers);
    let status = rsp.parse(head).context("http: malformed status line or headers")?;
    if status.is_partial() {
        bail!("http: incomplete response head");
    }
    let code = rsp.code.context("http: missing status code")?;
    let reason = rsp.reason.unwrap_or("");
    let version_minor = rsp.version.context("http: missing version")?;
    let headers = rsp
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect::<Vec<_>>();
    let content_length = header_get(&headers, "content-length").and_then(|v| v.trim().parse::<u64>().ok());
    Ok(ResponseHead {
        status: format!("{code} {reason}"),
        version_minor,
        headers,
        content_length,
    })
}

/// `host[:port]` -> `host:port`, applying `default_port` when absent.
/// Grounded on `httpx.Host2Addr`.
fn host_to_addr(hostport: &str, default_port: u16) -> String {
    if hostport.is_empty() {
        return hostport.to_string();
    }
    match hostport.rsplit_once(':') {
        // `[::1]:8080`, `example.com:8080`, or a bare IPv6 literal like
        // `::1` where the last `:` is part of the address, not a port
        // separator. `rsplit_once` on a bracketed literal still finds the
        // real port separator since it scans from the right.
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            format!("{host}:{port}")
        }
        _ => format!("{hostport}:{default_port}"),
    }
}

/// Extracts `host:port` from a request target, which may be absolute-form
/// (`http://host:port/path`, used by forward proxies) or origin-form (a bare
/// path relying on the `Host` header).
fn target_to_addr(target: &str, headers: &[(String, String)], default_port: u16) -> Result<String> {
    if let Some(rest) = target.strip_prefix("http://").or_else(|| target.strip_prefix("https://")) {
        let authority = rest.split(['/', '?']).next().unwrap_or(rest);
        return Ok(host_to_addr(authority, default_port));
    }
    let host = header_get(headers, "host").context("http: request has no Host header and no absolute-form target")?;
    Ok(host_to_addr(host, default_port))
}

/// Runs the proxy adapter for one client connection already identified as
/// HTTP (not SOCKS5). `dial` opens a fresh multiplexed stream to `addr` and
/// writes the Hello announcement; called once per upstream connection (once
/// for the lifetime of a `CONNECT` tunnel, once per request otherwise unless
/// keep-alive reuses the same stream).
pub async fn serve<C, S>(client: &mut S, mut dial: C) -> Result<()>
where
    C: FnMut(String) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Arc<Stream>>> + Send>>,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut leftover = Vec::new();
    loop {
        let head_end = match read_head(client, &mut leftover).await? {
            Some(pos) => pos,
            None => return Ok(()),
        };
        let req = parse_request(&leftover[..head_end])?;

        if req.method.eq_ignore_ascii_case("CONNECT") {
            let addr = host_to_addr(&req.target, 443);
            return handle_connect(client, addr, dial).await;
        }

        let addr = target_to_addr(&req.target, &req.headers, 80)?;
        let stream = match dial(addr).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, "http: dial failed, synthesizing 503");
                write_503(client).await?;
                return Ok(());
            }
        };

        let keep_requested = header_get(&req.headers, "proxy-connection")
            .map(|v| v.eq_ignore_ascii_case("keep-alive"))
            .unwrap_or(false);

        let body_start = head_end;
        let body_len = req.content_length.unwrap_or(0) as usize;
        while leftover.len() < body_start + body_len {
            let mut chunk = [0u8; 4096];
            let n = client.read(&mut chunk).await?;
            if n == 0 {
                bail!("http: connection closed mid-body");
            }
            leftover.extend_from_slice(&chunk[..n]);
        }
        let body = leftover[body_start..body_start + body_len].to_vec();

        let keep = match forward_request(&stream, &req, &body, client, keep_requested).await {
            Ok(keep) => keep,
            Err(e) => {
                debug!(error = %e, "http: upstream transfer failed, synthesizing 503");
                write_503(client).await?;
                false
            }
        };

        leftover.drain(..body_start + body_len);
        if !keep {
            return Ok(());
        }
    }
}

async fn handle_connect<C, S>(client: &mut S, addr: String, mut dial: C) -> Result<()>
where
    C: FnMut(String) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Arc<Stream>>> + Send>>,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let stream = match dial(addr).await {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, "http: CONNECT dial failed");
            write_503(client).await?;
            return Ok(());
        }
    };
    client
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;
    super::pipe_client_stream(client, &stream).await;
    Ok(())
}

/// Writes the rewritten request to `stream`, reads the response head and
/// body back, rewrites the response, and forwards it to `client`. Returns
/// whether the connection should stay open for another request. A response
/// with no `Content-Length` is an error here rather than a truncated
/// forward — the caller's `Err` branch synthesizes the 503.
async fn forward_request<S>(
    stream: &Arc<Stream>,
    req: &RequestHead,
    body: &[u8],
    client: &mut S,
    keep_requested: bool,
) -> Result<bool>
where
    S: AsyncWrite + Unpin,
{
    let mut headers = req.headers.clone();
    remove_hop_by_hop(&mut headers);
    if header_get(&headers, "user-agent").is_none() {
        header_set(&mut headers, "User-Agent", "");
    }

    let mut out = format!("{} {} HTTP/1.{}\r\n", req.method, req.target, req.version_minor);
    for (k, v) in &headers {
        out.push_str(k);
        out.push_str(": ");
        out.push_str(v);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    let mut wire = out.into_bytes();
    wire.extend_from_slice(body);
    stream.write(&wire).await.context("http: writing request to upstream stream")?;

    let mut rsp_buf = Vec::new();
    let head_end = read_stream_head(stream, &mut rsp_buf).await?;
    let rsp = parse_response(&rsp_buf[..head_end])?;

    let Some(rsp_body_len) = rsp.content_length else {
        bail!("http: upstream response has no content length");
    };
    let mut rsp_headers = rsp.headers.clone();
    remove_hop_by_hop(&mut rsp_headers);

    if keep_requested {
        header_set(&mut rsp_headers, "Connection", "keep-alive");
        header_set(&mut rsp_headers, "Proxy-Connection", "keep-alive");
        header_set(&mut rsp_headers, "Keep-Alive", "timeout=60");
    }

    let body_len = rsp_body_len as usize;
    while rsp_buf.len() < head_end + body_len {
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.context("http: reading response body from upstream stream")?;
        if n == 0 {
            bail!("http: upstream stream closed mid-body");
        }
        rsp_buf.extend_from_slice(&chunk[..n]);
    }

    let mut out = format!("HTTP/1.{} {}\r\n", rsp.version_minor, rsp.status);
    for (k, v) in &rsp_headers {
        out.push_str(k);
        out.push_str(": ");
        out.push_str(v);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    client.write_all(out.as_bytes()).await?;
    client.write_all(&rsp_buf[head_end..head_end + body_len]).await?;

    Ok(keep_requested)
}

async fn read_stream_head(stream: &Arc<Stream>, buf: &mut Vec<u8>) -> Result<usize> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(pos) = find_head_end(buf) {
            return Ok(pos);
        }
        if buf.len() > MAX_HEAD_LEN {
            bail!("http: response head exceeds {MAX_HEAD_LEN} bytes");
        }
        let n = stream.read(&mut chunk).await.context("http: reading response head from upstream stream")?;
        if n == 0 {
            bail!("http: upstream stream closed before a full response head arrived");
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn write_503<S>(client: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    client
        .write_all(
            b"HTTP/1.1 503 Service Unavailable\r\n\
              Connection: close\r\n\
              Proxy-Connection: close\r\n\
              Content-Length: 0\r\n\
              \r\n",
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_to_addr_adds_default_port() {
        assert_eq!(host_to_addr("example.com", 80), "example.com:80");
        assert_eq!(host_to_addr("example.com:8080", 80), "example.com:8080");
        assert_eq!(host_to_addr("127.0.0.1", 443), "127.0.0.1:443");
    }

    #[test]
    fn target_to_addr_prefers_absolute_form() {
        let headers = vec![("Host".to_string(), "fallback.example:9".to_string())];
        let addr = target_to_addr("http://example.com:81/a/b", &headers, 80).expect("parse");
        assert_eq!(addr, "example.com:81");
    }

    #[test]
    fn target_to_addr_falls_back_to_host_header() {
        let headers = vec![("Host".to_string(), "example.com".to_string())];
        let addr = target_to_addr("/a/b", &headers, 80).expect("parse");
        assert_eq!(addr, "example.com:80");
    }

    #[test]
    fn remove_hop_by_hop_strips_listed_headers() {
        let mut headers = vec![
            ("Proxy-Connection".to_string(), "keep-alive".to_string()),
            ("Content-Type".to_string(), "text/plain".to_string()),
        ];
        remove_hop_by_hop(&mut headers);
        assert_eq!(headers, vec![("Content-Type".to_string(), "text/plain".to_string())]);
    }

    #[test]
    fn parse_request_reads_method_target_and_headers() {
        let raw = b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\n\r\n";
        let req = parse_request(raw).expect("parse");
        assert_eq!(req.method, "GET");
        assert_eq!(req.target, "http://example.com/");
        assert_eq!(header_get(&req.headers, "host"), Some("example.com"));
    }
}
