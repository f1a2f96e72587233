//! Client-facing TLS termination
//!
//! The hijacked client socket is wrapped in a server-side TLS stream whose
//! certificate is chosen per handshake: the resolver reads the ClientHello
//! SNI and returns the memoized leaf for that hostname, minting it on first
//! sight. Clients that send no SNI (IP-literal targets, mostly) fall back
//! to the CONNECT authority the tunnel was opened for.

use crate::ca::{CertificateAuthority, LeafStore};
use crate::error::{Error, Result};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert, ServerConfig};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// SNI-driven certificate selection backed by the leaf store.
pub(crate) struct LeafResolver {
  authority: Arc<CertificateAuthority>,
  leaves: LeafStore,
  fallback: Option<String>,
}

impl std::fmt::Debug for LeafResolver {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LeafResolver")
      .field("fallback", &self.fallback)
      .finish()
  }
}

impl ResolvesServerCert for LeafResolver {
  fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
    let name = match client_hello.server_name() {
      Some(name) => name.to_string(),
      None => self.fallback.clone()?,
    };
    match self.leaves.get_or_mint(&self.authority, &name) {
      Ok(leaf) => Some(leaf),
      Err(e) => {
        tracing::error!("[MITM] no leaf certificate for {}: {}", name, e);
        None
      }
    }
  }
}

/// Terminate TLS toward the client on `stream`.
///
/// `fallback_host` names the CONNECT authority, used when the ClientHello
/// carries no SNI. Handshake failures surface as `Tls` errors; the caller
/// logs and abandons the connection.
pub(crate) async fn terminate<S>(
  stream: S,
  authority: Arc<CertificateAuthority>,
  leaves: LeafStore,
  fallback_host: Option<String>,
) -> Result<TlsStream<S>>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let resolver = LeafResolver {
    authority,
    leaves,
    fallback: fallback_host,
  };
  let config = ServerConfig::builder()
    .with_no_client_auth()
    .with_cert_resolver(Arc::new(resolver));
  let acceptor = TlsAcceptor::from(Arc::new(config));
  acceptor
    .accept(stream)
    .await
    .map_err(|e| Error::tls_error(format!("client handshake failed: {}", e)))
}
