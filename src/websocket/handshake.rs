//! HTTP/1.1 upgrade handshake for both ends of a connection.
//!
//! The server reads the client's request head (bounded), answers with
//! `101 Switching Protocols` and the derived accept key. The client sends a
//! request with a random key and checks for a `101` response.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use sha1::{Digest, Sha1};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::{debug, trace};

use super::channel::ConnectionChannel;
use super::frame::Role;
use super::tls::{self, TlsError};

/// Fixed GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on a request or response head.
pub const MAX_HEAD_SIZE: usize = 4096;

/// Upgrade handshake errors.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("upgrade request has no Sec-WebSocket-Key header")]
    MissingKey,

    #[error("handshake head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("connection closed before handshake")]
    Closed,

    #[error("upgrade rejected: {0}")]
    Rejected(String),

    #[error("Sec-WebSocket-Accept does not match the request key")]
    AcceptMismatch,

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Derive the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

/// A fresh client key: 16 random bytes, base64 encoded.
pub fn generate_key() -> String {
    BASE64_STANDARD.encode(rand::random::<[u8; 16]>())
}

/// Read a request or response head up to the blank line.
///
/// Stops early at end of stream; an empty head means the peer closed
/// without sending anything.
async fn read_head<R>(reader: &mut R) -> Result<String, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(512);

    loop {
        let remaining = MAX_HEAD_SIZE - head.len();
        if remaining == 0 {
            return Err(HandshakeError::HeadTooLarge(MAX_HEAD_SIZE));
        }

        let n = (&mut *reader)
            .take(remaining as u64)
            .read_until(b'\n', &mut head)
            .await?;
        if n == 0 {
            break;
        }
        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            break;
        }
    }

    if head.is_empty() {
        return Err(HandshakeError::Closed);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// Find a header value by case-insensitive name, skipping the start line.
fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines()
        .skip(1)
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case(name))
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

/// Server side: answer an upgrade request on an accepted stream.
///
/// Without a `Sec-WebSocket-Key` the stream is shut down and no channel is
/// produced.
pub async fn accept<S>(stream: S) -> Result<ConnectionChannel<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let request = read_head(&mut reader).await?;
    trace!(request = %request.lines().next().unwrap_or_default(), "Upgrade request");

    let Some(key) = header_value(&request, "Sec-WebSocket-Key") else {
        debug!("Upgrade request without Sec-WebSocket-Key");
        if let Err(e) = reader.get_mut().shutdown().await {
            trace!(error = %e, "Stream shutdown failed");
        }
        return Err(HandshakeError::MissingKey);
    };

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    );
    let stream = reader.get_mut();
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    Ok(ConnectionChannel::from_buffered(reader, Role::Server))
}

/// Client side: request an upgrade over a connected stream.
///
/// `host` is sent verbatim as the `Host` header.
pub async fn connect<S>(stream: S, host: &str, path: &str) -> Result<ConnectionChannel<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    );

    let mut reader = BufReader::new(stream);
    let stream = reader.get_mut();
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let response = match read_head(&mut reader).await {
        Err(HandshakeError::Closed) => {
            return Err(HandshakeError::Rejected("no response".to_string()))
        }
        other => other?,
    };

    let status = response.lines().next().unwrap_or_default();
    if status.split_whitespace().nth(1) != Some("101") {
        return Err(HandshakeError::Rejected(status.to_string()));
    }
    if let Some(accept) = header_value(&response, "Sec-WebSocket-Accept") {
        if accept != accept_key(&key) {
            return Err(HandshakeError::AcceptMismatch);
        }
    }

    Ok(ConnectionChannel::from_buffered(reader, Role::Client))
}

/// Open a plain TCP connection and upgrade it.
pub async fn connect_tcp(
    host: &str,
    port: u16,
    path: &str,
) -> Result<ConnectionChannel<TcpStream>, HandshakeError> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    connect(stream, &format!("{host}:{port}"), path).await
}

/// Open a TLS connection without verifying the server and upgrade it.
///
/// Development only: see `tls::insecure_connector`.
pub async fn connect_tls(
    host: &str,
    port: u16,
    path: &str,
) -> Result<ConnectionChannel<TlsStream<TcpStream>>, HandshakeError> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;

    let server_name = tls::server_name(host)?;
    let stream = tls::insecure_connector().connect(server_name, stream).await?;
    connect(stream, &format!("{host}:{port}"), path).await
}
