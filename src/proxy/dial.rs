//! Outbound dialing through upstream proxies
//!
//! Opens a raw byte stream to a target host:port by way of one upstream:
//! an HTTP CONNECT handshake for http/https upstreams, a SOCKS5 handshake
//! for socks5 upstreams.

use hyper::Uri;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

use crate::error::{GyreError, Result};
use crate::models::{Upstream, UpstreamProtocol};

/// Open a tunnel to `target_host:target_port` through the given upstream
pub async fn open_tunnel(
    upstream: &Upstream,
    target_host: &str,
    target_port: u16,
) -> Result<TcpStream> {
    match upstream.protocol {
        UpstreamProtocol::Http | UpstreamProtocol::Https => {
            connect_via_http(upstream, target_host, target_port).await
        }
        UpstreamProtocol::Socks5 => connect_via_socks5(upstream, target_host, target_port).await,
    }
}

async fn connect_via_http(
    upstream: &Upstream,
    target_host: &str,
    target_port: u16,
) -> Result<TcpStream> {
    debug!(upstream = %upstream.address, "dialing HTTP upstream");

    let mut stream = TcpStream::connect(&upstream.address).await.map_err(|e| {
        GyreError::UpstreamConnectFailed(format!("TCP connect to {} failed: {}", upstream.address, e))
    })?;

    let request = connect_request(upstream, target_host, target_port);
    stream.write_all(request.as_bytes()).await.map_err(|e| {
        GyreError::UpstreamConnectFailed(format!("failed to send CONNECT: {}", e))
    })?;

    let mut response = vec![0u8; 1024];
    let n = stream.read(&mut response).await.map_err(|e| {
        GyreError::UpstreamConnectFailed(format!("failed to read CONNECT response: {}", e))
    })?;
    if n == 0 {
        return Err(GyreError::ConnectRejected("empty CONNECT response".into()));
    }

    let response_str = String::from_utf8_lossy(&response[..n]);
    if !response_str.starts_with("HTTP/1.1 200") && !response_str.starts_with("HTTP/1.0 200") {
        return Err(GyreError::ConnectRejected(
            response_str
                .lines()
                .next()
                .unwrap_or("unknown error")
                .to_string(),
        ));
    }

    debug!(upstream = %upstream.address, "CONNECT tunnel established");
    Ok(stream)
}

/// Build the CONNECT request line and headers for an upstream
fn connect_request(upstream: &Upstream, target_host: &str, target_port: u16) -> String {
    let authority = format_authority(target_host, target_port);
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority);

    if let Some(credentials) = upstream.basic_credentials() {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", credentials));
    }

    request.push_str("\r\n");
    request
}

async fn connect_via_socks5(
    upstream: &Upstream,
    target_host: &str,
    target_port: u16,
) -> Result<TcpStream> {
    debug!(upstream = %upstream.address, "dialing SOCKS5 upstream");

    let socket = TcpStream::connect(&upstream.address).await.map_err(|e| {
        GyreError::UpstreamConnectFailed(format!("TCP connect to {} failed: {}", upstream.address, e))
    })?;

    let stream = match (&upstream.username, &upstream.password) {
        (Some(username), Some(password)) => Socks5Stream::connect_with_password_and_socket(
            socket,
            (target_host, target_port),
            username,
            password,
        )
        .await,
        _ => Socks5Stream::connect_with_socket(socket, (target_host, target_port)).await,
    }
    .map_err(|e| GyreError::UpstreamConnectFailed(format!("SOCKS5 connect failed: {}", e)))?;

    debug!(upstream = %upstream.address, "SOCKS5 tunnel established");
    Ok(stream.into_inner())
}

/// Host and port from an absolute-form request URI
pub fn parse_target(uri: &Uri) -> Result<(String, u16)> {
    let host = uri
        .host()
        .ok_or_else(|| GyreError::InvalidRequest("missing host in URI".to_string()))?
        .to_string();

    let port = uri.port_u16().unwrap_or_else(|| match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    });

    Ok((host, port))
}

/// Host and port from a CONNECT authority; the port defaults to 443
pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
    // Bracketed IPv6 needs URL-style parsing, not a plain rsplit.
    let url = url::Url::parse(&format!("http://{}", authority)).map_err(|e| {
        GyreError::InvalidRequest(format!("invalid CONNECT target '{}': {}", authority, e))
    })?;

    let host = url
        .host_str()
        .ok_or_else(|| {
            GyreError::InvalidRequest(format!("invalid CONNECT target '{}': missing host", authority))
        })?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();

    Ok((host, url.port().unwrap_or(443)))
}

/// host:port, bracketing bare IPv6 hosts
pub fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
