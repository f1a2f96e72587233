//! The request dispatcher
//!
//! Per sourced connection: classify plaintext versus CONNECT; inside a
//! CONNECT tunnel, probe the target for TLS and either terminate toward the
//! client with a minted leaf or fall back to plaintext WebSocket splicing.

use crate::ca::{CertificateAuthority, LeafStore};
use crate::error::{Error, Result};
use crate::handlers::Handlers;
use crate::proxy::MitmConfig;
use crate::source::{read_head, ConnectionSource, RequestHead, SourcedRequest};
use crate::tls;
use crate::websocket::{is_websocket_upgrade, serve_websocket};
use courier::redirect::Policy;
use courier::{Body, Client, Connector, ConnectorBuilder, Request, Response};
use http::{HeaderValue, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Tunnel acknowledgment, written before the target is probed.
const OK_HEADER: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// The interception dataplane behind a [`crate::MitmProxy`].
///
/// One value serves every connection; per-connection state lives on the
/// task spawned in [`ProxyServer::run`].
pub struct ProxyServer {
  config: MitmConfig,
  authority: Arc<CertificateAuthority>,
  leaves: LeafStore,
  handlers: Handlers,
  client: Client,
  probe: Connector,
  session: AtomicU64,
}

impl ProxyServer {
  /// Create a dispatcher with the given configuration, signing CA and
  /// interception handlers.
  pub fn new(
    config: MitmConfig,
    authority: CertificateAuthority,
    handlers: Handlers,
  ) -> Result<Self> {
    let mut builder = Client::builder()
      .timeout(Some(config.upstream_timeout))
      .redirect(Policy::none())
      .danger_accept_invalid_certs(true);
    if let Some(proxy) = &config.upstream_proxy {
      builder = builder.proxy(proxy.clone());
    }
    let client = builder.build()?;
    let probe = ConnectorBuilder::default()
      .connect_timeout(Some(config.probe_timeout))
      .certs_verification(false)
      .build()?;
    Ok(Self {
      config,
      authority: Arc::new(authority),
      leaves: LeafStore::new(),
      handlers,
      client,
      probe,
      session: AtomicU64::new(0),
    })
  }

  /// The signing CA.
  pub fn authority(&self) -> &CertificateAuthority {
    &self.authority
  }

  /// Accept connections from `source` forever, serving each on its own
  /// task.
  pub async fn run<C>(self: Arc<Self>, mut source: C) -> Result<()>
  where
    C: ConnectionSource + Send,
  {
    loop {
      match source.accept().await {
        Ok(sourced) => {
          let server = self.clone();
          tokio::spawn(async move {
            if let Err(e) = server.serve(sourced).await {
              tracing::error!("[MITM] connection error: {}", e);
            }
          });
        }
        Err(e) => {
          tracing::error!("[MITM] failed to source a connection: {}", e);
        }
      }
    }
  }

  /// Serve one sourced connection to completion.
  pub async fn serve<S>(&self, sourced: SourcedRequest<S>) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    let SourcedRequest { head, stream, peer } = sourced;
    tracing::debug!(
      "[MITM] {} {} from {:?}",
      head.method,
      head.target,
      peer
    );
    if head.method == http::Method::CONNECT {
      self.tunnel(head, stream).await
    } else {
      self.forward_plaintext(head, stream).await
    }
  }

  fn next_session(&self) -> u64 {
    self.session.fetch_add(1, Ordering::SeqCst)
  }

  /// Forward one plaintext proxied request and write the response back.
  async fn forward_plaintext<S>(&self, head: RequestHead, mut stream: BufReader<S>) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let session = self.next_session();
    let mut request = match self.request_from_head(&head, &mut stream, None).await {
      Ok(request) => request,
      Err(e) => {
        write_error_response(&mut stream, StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
          .await?;
        return Ok(());
      }
    };
    match self.exchange(session, &mut request).await {
      Ok(response) => write_response(&mut stream, response).await,
      Err(e) => {
        tracing::debug!("[MITM] session {} upstream exchange failed: {}", session, e);
        write_error_response(&mut stream, StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).await
      }
    }
  }

  /// Run one request/response pair through the handler pair and, unless
  /// short-circuited, the upstream transport.
  async fn exchange(&self, session: u64, request: &mut Request) -> Result<Response> {
    if let Some(handler) = &self.handlers.request {
      if let Some(mut response) = handler(session, request) {
        if let Some(handler) = &self.handlers.response {
          handler(session, request, &mut response);
        }
        return Ok(response);
      }
    }
    let mut response = self.client.execute(request.clone()).await?;
    if let Some(handler) = &self.handlers.response {
      handler(session, request, &mut response);
    }
    Ok(response)
  }

  /// CONNECT entry: acknowledge the tunnel, then classify it.
  ///
  /// The acknowledgment deliberately precedes the probe, so the client
  /// learns nothing about upstream reachability from the CONNECT reply.
  async fn tunnel<S>(&self, head: RequestHead, mut stream: BufReader<S>) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    let target = head.target.clone();
    stream.write_all(OK_HEADER).await?;
    stream.flush().await?;
    if self.probe_target(&target).await {
      let (host, _) = split_authority(&target);
      let tls_stream = tls::terminate(
        stream,
        self.authority.clone(),
        self.leaves.clone(),
        Some(host),
      )
      .await?;
      self.tls_loop(target, tls_stream).await
    } else {
      self.plain_ws(stream).await
    }
  }

  /// Whether the tunnel target completes a TLS handshake within the probe
  /// deadline. The probe connection is discarded either way.
  async fn probe_target(&self, target: &str) -> bool {
    let uri: http::Uri = match format!("https://{}", target).parse() {
      Ok(uri) => uri,
      Err(_) => return false,
    };
    match self.probe.connect(&uri).await {
      Ok(_discarded) => true,
      Err(e) => {
        tracing::debug!("[MITM] tls probe of {} failed: {}", target, e);
        false
      }
    }
  }

  /// Service decrypted requests until the client ends the tunnel.
  ///
  /// A WebSocket upgrade hands the stream to the relay; everything else is
  /// forwarded like a plaintext request with an `https` target.
  async fn tls_loop<S>(
    &self,
    target: String,
    tls_stream: tokio_rustls::server::TlsStream<BufReader<S>>,
  ) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    let mut reader = BufReader::new(tls_stream);
    loop {
      let head = match read_head(&mut reader).await {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(()),
        Err(e) => {
          tracing::debug!("[MITM] could not read a tunneled request: {}", e);
          return Ok(());
        }
      };
      if is_websocket_upgrade(&head.headers) {
        return serve_websocket(&head, reader, &self.handlers, self.config.max_frame_payload)
          .await;
      }
      let session = self.next_session();
      let mut request = match self
        .request_from_head(&head, &mut reader, Some(&target))
        .await
      {
        Ok(request) => request,
        Err(e) => {
          write_error_response(&mut reader, StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
            .await?;
          continue;
        }
      };
      match self.exchange(session, &mut request).await {
        Ok(response) => write_response(&mut reader, response).await?,
        Err(e) => {
          tracing::debug!("[MITM] session {} upstream exchange failed: {}", session, e);
          write_error_response(&mut reader, StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
            .await?;
        }
      }
    }
  }

  /// Tunnel target that did not speak TLS: the only thing serviced on the
  /// raw socket is a plaintext WebSocket upgrade.
  async fn plain_ws<S>(&self, mut stream: BufReader<S>) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    let head = match read_head(&mut stream).await {
      Ok(Some(head)) => head,
      Ok(None) => return Ok(()),
      Err(e) => {
        tracing::debug!("[MITM] not an HTTP request inside the tunnel: {}", e);
        return Ok(());
      }
    };
    if is_websocket_upgrade(&head.headers) {
      serve_websocket(&head, stream, &self.handlers, self.config.max_frame_payload).await
    } else {
      Ok(())
    }
  }

  /// Build an absolute-form upstream request from a parsed head, reading
  /// any `Content-Length` body off the stream.
  async fn request_from_head<R>(
    &self,
    head: &RequestHead,
    reader: &mut R,
    tunnel_authority: Option<&str>,
  ) -> Result<Request>
  where
    R: AsyncBufRead + Unpin,
  {
    let absolute = head.target.starts_with("http://") || head.target.starts_with("https://");
    let uri: http::Uri = if absolute {
      head.target.parse().map_err(http::Error::from)?
    } else if let Some(authority) = tunnel_authority {
      format!("https://{}{}", authority, head.target)
        .parse()
        .map_err(http::Error::from)?
    } else {
      let host = head
        .headers
        .get(http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
          Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "request has no Host header",
          ))
        })?;
      format!("http://{}{}", host, head.target)
        .parse()
        .map_err(http::Error::from)?
    };
    let content_length = head
      .headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|v| v.to_str().ok()?.parse::<usize>().ok());
    let body = match content_length {
      Some(n) if n > 0 => {
        let mut buf = vec![0u8; n];
        reader.read_exact(&mut buf).await?;
        Some(Body::from(buf))
      }
      _ => None,
    };
    let mut request: Request = http::Request::builder()
      .method(head.method.clone())
      .uri(uri)
      .version(head.version)
      .body(body.unwrap_or_default())
      .map_err(Error::Http)?
      .into();
    *request.headers_mut() = head.headers.clone();
    Ok(request)
  }
}

/// Write a response to the client, re-framed with a concrete body length.
async fn write_response<W>(stream: &mut W, mut response: Response) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  // the transport decoded any chunked body, so the framing headers must
  // reflect the bytes actually written
  response.headers_mut().remove(http::header::TRANSFER_ENCODING);
  let length = response.body().as_ref().map(|b| b.len());
  if let Some(length) = length {
    response
      .headers_mut()
      .insert(http::header::CONTENT_LENGTH, HeaderValue::from(length));
  }
  stream.write_all(&response.to_raw()).await?;
  stream.flush().await?;
  Ok(())
}

/// Plain-text error reply for request-scoped failures.
async fn write_error_response<W>(stream: &mut W, status: StatusCode, message: &str) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let head = format!(
    "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nX-Content-Type-Options: nosniff\r\nContent-Length: {}\r\n\r\n",
    status.as_u16(),
    status.canonical_reason().unwrap_or_default(),
    message.len()
  );
  stream.write_all(head.as_bytes()).await?;
  stream.write_all(message.as_bytes()).await?;
  stream.flush().await?;
  Ok(())
}

/// Split `host:port` (or a bracketed IPv6 authority) into host and port,
/// defaulting to 443 for bare hosts.
fn split_authority(target: &str) -> (String, u16) {
  if let Some(rest) = target.strip_prefix('[') {
    if let Some(end) = rest.find(']') {
      let host = rest[..end].to_string();
      let port = rest[end + 1..]
        .strip_prefix(':')
        .and_then(|p| p.parse().ok())
        .unwrap_or(443);
      return (host, port);
    }
  }
  match target.rsplit_once(':') {
    Some((host, port)) if !host.contains(':') => {
      (host.to_string(), port.parse().unwrap_or(443))
    }
    _ => (target.to_string(), 443),
  }
}
