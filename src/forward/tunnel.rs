//! CONNECT tunneling through upstream proxies
//!
//! The primary path speaks the literal CONNECT exchange (or a SOCKS5
//! handshake for SOCKS upstreams); the fallback re-dials and adds
//! `Proxy-Connection: keep-alive` for upstreams that want the older
//! proxy-style CONNECT.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

use crate::error::{Result, VeilError};
use crate::models::Proxy;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// Byte stream to an upstream-side tunnel endpoint
pub trait TunnelConn: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug + 'static {}

impl TunnelConn for TcpStream {}
impl TunnelConn for Socks5Stream<TcpStream> {}

/// Establish a tunnel to `host:port` through the upstream proxy.
///
/// HTTP upstreams get the bare CONNECT exchange; SOCKS upstreams are
/// dialed with the SOCKS5 handshake, which already lands on the target
/// (SOCKS4 records are dialed the same way and will mostly fail).
///
/// Errors: `UpstreamFailure` means the dial itself failed;
/// `ConnectFailed` means the upstream spoke but refused or garbled the
/// CONNECT, which is the cue for the fallback path.
pub async fn open_tunnel(proxy: &Proxy, host: &str, port: u16) -> Result<Box<dyn TunnelConn>> {
    if proxy.kind.is_socks() {
        let stream = tokio::time::timeout(
            DIAL_TIMEOUT,
            Socks5Stream::connect(proxy.address().as_str(), (host, port)),
        )
        .await
        .map_err(|_| VeilError::Timeout)?
        .map_err(|e| VeilError::UpstreamFailure(format!("SOCKS connect failed: {e}")))?;

        debug!(upstream = %proxy.address(), target = %host, "SOCKS tunnel established");
        return Ok(Box::new(stream));
    }

    let mut stream = dial_tcp(&proxy.address()).await?;

    let request = build_connect_request(host, port, false);
    exchange_connect(&mut stream, &request).await?;

    debug!(upstream = %proxy.address(), target = %host, "CONNECT tunnel established");
    Ok(Box::new(stream))
}

/// Fallback CONNECT for upstreams that rejected the primary exchange
pub async fn open_tunnel_fallback(
    proxy: &Proxy,
    host: &str,
    port: u16,
) -> Result<Box<dyn TunnelConn>> {
    let mut stream = dial_tcp(&proxy.address()).await?;

    let request = build_connect_request(host, port, true);
    exchange_connect(&mut stream, &request).await?;

    debug!(upstream = %proxy.address(), target = %host, "Fallback CONNECT tunnel established");
    Ok(Box::new(stream))
}

async fn dial_tcp(address: &str) -> Result<TcpStream> {
    tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(address))
        .await
        .map_err(|_| VeilError::Timeout)?
        .map_err(|e| VeilError::UpstreamFailure(format!("TCP connect failed: {e}")))
}

/// Write the CONNECT request and require a 200 in the first response line
async fn exchange_connect(stream: &mut TcpStream, request: &str) -> Result<()> {
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| VeilError::UpstreamFailure(format!("Failed to send CONNECT: {e}")))?;

    let head = read_response_head(stream).await?;

    match parse_connect_status(&head) {
        Some(200) => Ok(()),
        Some(status) => Err(VeilError::ConnectFailed(format!(
            "upstream answered HTTP {status}"
        ))),
        None => Err(VeilError::ConnectFailed(format!(
            "malformed CONNECT response: {:?}",
            head.lines().next().unwrap_or_default()
        ))),
    }
}

fn build_connect_request(host: &str, port: u16, keep_alive: bool) -> String {
    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if keep_alive {
        request.push_str("Proxy-Connection: keep-alive\r\n");
    }
    request.push_str("\r\n");
    request
}

/// Read until the end of the response headers (or the size cap)
async fn read_response_head(stream: &mut TcpStream) -> Result<String> {
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];

    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| VeilError::UpstreamFailure(format!("Failed to read CONNECT response: {e}")))?;

        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() >= MAX_CONNECT_RESPONSE {
            break;
        }
    }

    if buf.is_empty() {
        return Err(VeilError::ConnectFailed(
            "upstream closed before answering CONNECT".into(),
        ));
    }

    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Status code from the first line of an HTTP response, if it parses
fn parse_connect_status(head: &str) -> Option<u16> {
    let first_line = head.lines().next()?;
    let mut parts = first_line.split_whitespace();

    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }

    parts.next()?.parse::<u16>().ok()
}

/// Splice bytes between client and upstream until both directions finish.
///
/// Each copy half-closes its peer on exit, so a half-open upstream can
/// never pin the opposite loop. Returns (client→upstream, upstream→client)
/// byte counts.
pub async fn copy_bidirectional<C, S>(client: C, upstream: S) -> Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_upstream = async {
        let result = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        result
    };

    let upstream_to_client = async {
        let result = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    };

    let (sent, received) = tokio::join!(client_to_upstream, upstream_to_client);

    let sent = sent.unwrap_or_else(|e| {
        debug!("client to upstream copy ended: {e}");
        0
    });
    let received = received.unwrap_or_else(|e| {
        debug!("upstream to client copy ended: {e}");
        0
    });

    debug!(sent, received, "Tunnel closed");
    Ok((sent, received))
}
