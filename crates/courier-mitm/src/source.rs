//! Connection sourcing
//!
//! The dispatcher never hijacks sockets itself. A [`ConnectionSource`]
//! yields both the parsed first request and the underlying duplex byte
//! stream together, so the proxy does not care whether the detachment was
//! mechanical (a plain listener, as here) or native to some embedding HTTP
//! server.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Cap on the size of a request head.
const MAX_HEAD_SIZE: usize = 64 * 1024;

const HEAD_FAILURE_RESPONSE: &[u8] =
  b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n";

/// The request line and headers of one parsed HTTP/1.1 request.
#[derive(Debug, Clone)]
pub struct RequestHead {
  /// Request method
  pub method: http::Method,
  /// Request target exactly as it appeared on the request line:
  /// absolute-form for proxied requests, `host:port` for CONNECT,
  /// origin-form inside an established tunnel
  pub target: String,
  /// Protocol version
  pub version: http::Version,
  /// Request headers
  pub headers: http::HeaderMap,
}

/// One sourced connection: the client's first request head plus the raw
/// duplex stream, already buffered. Bytes following the head (a body, or
/// tunneled data) are still in the stream.
#[derive(Debug)]
pub struct SourcedRequest<S> {
  /// The parsed request head
  pub head: RequestHead,
  /// The buffered byte stream the head was read from
  pub stream: BufReader<S>,
  /// Peer address, when the source knows it
  pub peer: Option<SocketAddr>,
}

impl<S> SourcedRequest<S>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  /// Source a request from a raw duplex stream.
  ///
  /// This is the mechanical hijack: read and parse one request head and
  /// hand back head and stream together. If no head can be read, a 500 is
  /// written to the stream on a best-effort basis and the connection is
  /// given up.
  pub async fn from_stream(stream: S) -> Result<Self> {
    let mut reader = BufReader::new(stream);
    match read_head(&mut reader).await {
      Ok(Some(head)) => Ok(SourcedRequest {
        head,
        stream: reader,
        peer: None,
      }),
      Ok(None) => Err(Error::hijack_error("connection closed before a request")),
      Err(e) => {
        let _ = reader.write_all(HEAD_FAILURE_RESPONSE).await;
        let _ = reader.flush().await;
        Err(Error::hijack_error(format!(
          "could not source a request head: {}",
          e
        )))
      }
    }
  }
}

/// Yields hijacked client requests to the dispatcher.
#[async_trait]
pub trait ConnectionSource {
  /// The duplex stream type this source produces.
  type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

  /// Wait for the next client and return its first request together with
  /// the raw stream.
  async fn accept(&mut self) -> Result<SourcedRequest<Self::Stream>>;
}

/// A `ConnectionSource` over a plain TCP listener.
pub struct TcpConnectionSource {
  listener: TcpListener,
}

impl TcpConnectionSource {
  /// Bind a listener on `addr`.
  pub async fn bind(addr: &str) -> Result<Self> {
    let listener = TcpListener::bind(addr).await?;
    Ok(Self { listener })
  }

  /// The bound local address.
  pub fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }
}

#[async_trait]
impl ConnectionSource for TcpConnectionSource {
  type Stream = TcpStream;

  async fn accept(&mut self) -> Result<SourcedRequest<TcpStream>> {
    let (stream, peer) = self.listener.accept().await?;
    let mut sourced = SourcedRequest::from_stream(stream).await?;
    sourced.peer = Some(peer);
    Ok(sourced)
  }
}

/// Read one request head off a buffered stream.
///
/// Returns `Ok(None)` when the stream is already at EOF, which callers use
/// to detect the orderly end of a kept-open tunnel.
pub(crate) async fn read_head<R>(reader: &mut R) -> Result<Option<RequestHead>>
where
  R: AsyncBufRead + Unpin,
{
  let mut buf = Vec::new();
  loop {
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
      if buf.is_empty() {
        return Ok(None);
      }
      return Err(Error::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed inside a request head",
      )));
    }
    buf.extend_from_slice(&line);
    if buf.len() > MAX_HEAD_SIZE {
      return Err(Error::hijack_error("request head too large"));
    }
    if line == b"\r\n" || line == b"\n" {
      break;
    }
  }
  parse_head(&buf).map(Some)
}

fn parse_head(buf: &[u8]) -> Result<RequestHead> {
  let mut headers = [httparse::EMPTY_HEADER; 64];
  let mut request = httparse::Request::new(&mut headers);
  match request.parse(buf) {
    Ok(httparse::Status::Complete(_)) => {}
    Ok(httparse::Status::Partial) => {
      return Err(Error::hijack_error("incomplete request head"));
    }
    Err(e) => {
      return Err(Error::hijack_error(format!("invalid request head: {}", e)));
    }
  }
  let method = request
    .method
    .ok_or_else(|| Error::hijack_error("request head has no method"))?
    .parse::<http::Method>()
    .map_err(|e| Error::hijack_error(format!("invalid method: {}", e)))?;
  let target = request
    .path
    .ok_or_else(|| Error::hijack_error("request head has no target"))?
    .to_string();
  let version = match request.version {
    Some(0) => http::Version::HTTP_10,
    _ => http::Version::HTTP_11,
  };
  let mut header_map = http::HeaderMap::new();
  for header in request.headers.iter() {
    if let (Ok(name), Ok(value)) = (
      http::HeaderName::from_bytes(header.name.as_bytes()),
      http::HeaderValue::from_bytes(header.value),
    ) {
      header_map.append(name, value);
    }
  }
  Ok(RequestHead {
    method,
    target,
    version,
    headers: header_map,
  })
}
