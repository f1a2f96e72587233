//! WebSocket interception relay
//!
//! Entered after the dispatcher has recognized an upgrade request. The
//! relay completes the handshake with both endpoints, then runs two
//! directional pumps that decode, transform and re-encode every frame.

use crate::error::{Error, Result};
use crate::frame::WebsocketFragment;
use crate::handlers::{FrameHandler, Handlers};
use crate::source::RequestHead;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::Rng;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// WebSocket magic string for the handshake (RFC 6455 section 4.2.2).
const KEY_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Derive the `Sec-WebSocket-Accept` value for a client key.
pub fn compute_accept_key(key: &str) -> String {
  let mut hasher = Sha1::new();
  hasher.update(key.as_bytes());
  hasher.update(KEY_GUID.as_bytes());
  BASE64.encode(hasher.finalize())
}

/// Generate a random `Sec-WebSocket-Key` for the upstream handshake.
fn generate_websocket_key() -> String {
  let key: [u8; 16] = rand::thread_rng().gen();
  BASE64.encode(key)
}

/// Whether `headers` ask for a WebSocket upgrade: `Connection` contains
/// `upgrade` and `Upgrade` contains `websocket`, case-insensitively.
pub fn is_websocket_upgrade(headers: &http::HeaderMap) -> bool {
  header_contains(headers, http::header::CONNECTION, "upgrade")
    && header_contains(headers, http::header::UPGRADE, "websocket")
}

fn header_contains(headers: &http::HeaderMap, name: http::HeaderName, value: &str) -> bool {
  headers.get_all(name).iter().any(|v| {
    v.to_str()
      .map(|v| v.split(',').any(|s| s.trim().eq_ignore_ascii_case(value)))
      .unwrap_or(false)
  })
}

/// Splice a frame-level relay between `client` and the upgrade target.
///
/// The client side has already sent its upgrade request (`head`); the
/// upstream side is dialed in plaintext from the request's `Host`. Frames
/// flow through the installed handlers until either direction ends.
pub(crate) async fn serve_websocket<S>(
  head: &RequestHead,
  client: BufReader<S>,
  handlers: &Handlers,
  max_payload: Option<u64>,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
  let target = upgrade_target(head)?;
  tracing::debug!("[MITM] splicing websocket relay to {}", target);
  let upstream = TcpStream::connect(&target)
    .await
    .map_err(|e| Error::handshake_error(format!("cannot dial {}: {}", target, e)))?;
  let (client, upstream) = websocket_handshake(head, client, upstream).await?;
  relay(
    client,
    upstream,
    handlers.ws_request.clone(),
    handlers.ws_response.clone(),
    max_payload,
  )
  .await;
  Ok(())
}

/// The plaintext `host:port` the relay dials, from the request `Host`.
fn upgrade_target(head: &RequestHead) -> Result<String> {
  let host = head
    .headers
    .get(http::header::HOST)
    .and_then(|h| h.to_str().ok())
    .ok_or_else(|| Error::handshake_error("upgrade request has no Host header"))?;
  Ok(if host.contains(':') {
    host.to_string()
  } else {
    format!("{}:80", host)
  })
}

/// Complete the upgrade with both endpoints.
///
/// The client gets a `101 Switching Protocols` carrying the accept key
/// derived from its `Sec-WebSocket-Key`. The upstream side gets a fresh
/// GET upgrade request with a newly generated key; anything but a 101
/// reply aborts the relay.
async fn websocket_handshake<S>(
  head: &RequestHead,
  mut client: BufReader<S>,
  upstream: TcpStream,
) -> Result<(BufReader<S>, BufReader<TcpStream>)>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let client_key = head
    .headers
    .get("sec-websocket-key")
    .and_then(|k| k.to_str().ok())
    .ok_or_else(|| Error::handshake_error("missing Sec-WebSocket-Key"))?;
  let accept = compute_accept_key(client_key);
  let response = format!(
    "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
    accept
  );
  client.write_all(response.as_bytes()).await?;
  client.flush().await?;

  let mut upstream = BufReader::new(upstream);
  let request = format!(
    "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: {}\r\n\r\n",
    head.target,
    head
      .headers
      .get(http::header::HOST)
      .and_then(|h| h.to_str().ok())
      .unwrap_or_default(),
    generate_websocket_key()
  );
  upstream.write_all(request.as_bytes()).await?;
  upstream.flush().await?;

  let mut status_line = Vec::new();
  upstream.read_until(b'\n', &mut status_line).await?;
  let status = std::str::from_utf8(&status_line)
    .ok()
    .and_then(|line| line.split_whitespace().nth(1))
    .unwrap_or_default();
  if status != "101" {
    return Err(Error::handshake_error(format!(
      "upstream refused the upgrade: {}",
      String::from_utf8_lossy(&status_line).trim()
    )));
  }
  // drain the remaining upstream handshake headers; frames follow
  loop {
    let mut line = Vec::new();
    let n = upstream.read_until(b'\n', &mut line).await?;
    if n == 0 || line == b"\r\n" || line == b"\n" {
      break;
    }
  }
  Ok((client, upstream))
}

/// Run both directional pumps until either terminates.
///
/// Each pump owns its source's read half and its sink's write half. When
/// one exits the other is aborted, and dropping the halves closes both
/// sockets, so the peers observe EOF promptly.
async fn relay<C, U>(
  client: C,
  upstream: U,
  on_request: Option<FrameHandler>,
  on_response: Option<FrameHandler>,
  max_payload: Option<u64>,
) where
  C: AsyncRead + AsyncWrite + Send + 'static,
  U: AsyncRead + AsyncWrite + Send + 'static,
{
  let (client_read, client_write) = tokio::io::split(client);
  let (upstream_read, upstream_write) = tokio::io::split(upstream);
  let mut client_to_upstream = tokio::spawn(pump(
    client_read,
    upstream_write,
    on_request,
    max_payload,
    "client -> upstream",
  ));
  let mut upstream_to_client = tokio::spawn(pump(
    upstream_read,
    client_write,
    on_response,
    max_payload,
    "upstream -> client",
  ));
  tokio::select! {
    _ = &mut client_to_upstream => upstream_to_client.abort(),
    _ = &mut upstream_to_client => client_to_upstream.abort(),
  }
}

/// One relay direction: decode, transform, re-encode, forward.
async fn pump<R, W>(
  mut source: R,
  mut sink: W,
  handler: Option<FrameHandler>,
  max_payload: Option<u64>,
  direction: &'static str,
) where
  R: AsyncRead + Unpin + Send,
  W: AsyncWrite + Unpin + Send,
{
  loop {
    let fragment = match WebsocketFragment::read_from(&mut source, max_payload).await {
      Ok(fragment) => fragment,
      Err(e) => {
        tracing::debug!("[MITM] websocket {} pump done: {}", direction, e);
        break;
      }
    };
    let fragment = match &handler {
      Some(handler) => handler(fragment),
      None => fragment,
    };
    if let Err(e) = fragment.write_to(&mut sink).await {
      tracing::debug!("[MITM] websocket {} pump done: {}", direction, e);
      break;
    }
    if let Err(e) = sink.flush().await {
      tracing::debug!("[MITM] websocket {} pump done: {}", direction, e);
      break;
    }
  }
}
