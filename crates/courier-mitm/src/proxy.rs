//! Proxy configuration and facade

use crate::ca::CertificateAuthority;
use crate::error::Result;
use crate::handlers::Handlers;
use crate::server::ProxyServer;
use crate::source::{ConnectionSource, SourcedRequest, TcpConnectionSource};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Configuration for the interception dataplane.
#[derive(Clone, Debug)]
pub struct MitmConfig {
  /// Deadline for the CONNECT-time TLS probe of the target
  pub probe_timeout: Duration,
  /// Total per-request deadline on the upstream transport
  pub upstream_timeout: Duration,
  /// Optional upstream HTTP proxy the transport routes through
  pub upstream_proxy: Option<courier::Proxy>,
  /// Optional bound on WebSocket frame payload allocation; `None` accepts
  /// any declared length
  pub max_frame_payload: Option<u64>,
}

impl Default for MitmConfig {
  fn default() -> Self {
    Self {
      probe_timeout: Duration::from_secs(2),
      upstream_timeout: Duration::from_secs(10),
      upstream_proxy: None,
      max_frame_payload: None,
    }
  }
}

/// An intercepting MITM proxy for HTTP, HTTPS and WebSocket traffic.
///
/// Clients configure the proxy as their HTTP proxy. Plaintext requests are
/// forwarded through the internal transport; CONNECT tunnels are either
/// TLS-terminated with a leaf minted under the configured CA, or spliced as
/// a plaintext WebSocket relay. The [`Handlers`] installed at construction
/// observe and transform everything that crosses the dataplane.
///
/// # Example
///
/// ```no_run
/// use courier_mitm::{Handlers, MitmConfig, MitmProxy};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///   let ca_cert = std::fs::read("ca_cert.pem")?;
///   let ca_key = std::fs::read("ca_key.pem")?;
///   let proxy = MitmProxy::new(MitmConfig::default(), ca_cert, ca_key, Handlers::new())?;
///   proxy.start("127.0.0.1:8080").await?;
///   Ok(())
/// }
/// ```
pub struct MitmProxy {
  server: Arc<ProxyServer>,
}

impl MitmProxy {
  /// Create a proxy from configuration, PEM CA material and an
  /// interception capability set.
  ///
  /// The CA material is kept as raw bytes and only parsed during TLS
  /// handshakes, so a malformed pair surfaces per connection rather than
  /// here.
  pub fn new(
    config: MitmConfig,
    ca_cert_pem: impl Into<Bytes>,
    ca_key_pem: impl Into<Bytes>,
    handlers: Handlers,
  ) -> Result<Self> {
    let authority = CertificateAuthority::new(ca_cert_pem, ca_key_pem);
    Ok(Self {
      server: Arc::new(ProxyServer::new(config, authority, handlers)?),
    })
  }

  /// The CA certificate in PEM format, for installation in client trust
  /// stores.
  pub fn ca_cert_pem(&self) -> &[u8] {
    self.server.authority().cert_pem()
  }

  /// Listen on `addr` and serve proxy clients forever.
  pub async fn start(&self, addr: &str) -> Result<()> {
    let source = TcpConnectionSource::bind(addr).await?;
    tracing::info!("[MITM] listening on {}", source.local_addr()?);
    self.run(source).await
  }

  /// Serve clients from an arbitrary [`ConnectionSource`] forever.
  pub async fn run<C>(&self, source: C) -> Result<()>
  where
    C: ConnectionSource + Send,
  {
    self.server.clone().run(source).await
  }

  /// Serve a single already-sourced connection to completion.
  pub async fn serve<S>(&self, sourced: SourcedRequest<S>) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    self.server.serve(sourced).await
  }
}
