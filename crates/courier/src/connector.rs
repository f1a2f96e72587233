use crate::errors::{new_io_error, Error, Result};
use crate::proxy::Proxy;
use crate::socket::Socket;
use crate::tls;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// ConnectorBuilder
#[derive(Clone)]
pub struct ConnectorBuilder {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  certs_verification: bool,
  proxy: Option<Proxy>,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: false,
      certs_verification: true,
      proxy: None,
    }
  }
}

impl ConnectorBuilder {
  /// Set a timeout covering the whole dial, including the TLS handshake.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
  /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
  ///
  /// Default is `false`.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// Controls the use of certificate validation.
  ///
  /// Defaults to `true`.
  pub fn certs_verification(mut self, value: bool) -> ConnectorBuilder {
    self.certs_verification = value;
    self
  }
  /// Route connections through an upstream HTTP proxy.
  pub fn proxy(mut self, proxy: Option<Proxy>) -> ConnectorBuilder {
    self.proxy = proxy;
    self
  }
  /// Combine the configuration of this builder into a `Connector`.
  pub fn build(self) -> Result<Connector> {
    let config = tls::client_config(self.certs_verification);
    Ok(Connector {
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
      proxy: self.proxy,
      tls: TlsConnector::from(Arc::new(config)),
    })
  }
}

/// Establishes transport connections for the client: TCP dial, optional
/// upstream-proxy routing, optional TLS.
pub struct Connector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  proxy: Option<Proxy>,
  tls: TlsConnector,
}

impl Default for Connector {
  fn default() -> Self {
    ConnectorBuilder::default()
      .build()
      .expect("new default connector failure")
  }
}

impl Connector {
  /// The upstream proxy this connector routes through, if any.
  pub fn proxy(&self) -> Option<&Proxy> {
    self.proxy.as_ref()
  }

  /// Connect to the target of `uri`.
  ///
  /// For `https` targets the returned socket has completed the TLS
  /// handshake; routed through a proxy, the tunnel is established first.
  /// The connect timeout bounds the whole operation.
  pub async fn connect(&self, target: &http::Uri) -> Result<Socket> {
    match self.connect_timeout {
      None => self.connect_inner(target).await,
      Some(timeout) => tokio::time::timeout(timeout, self.connect_inner(target))
        .await
        .map_err(|x| new_io_error(ErrorKind::TimedOut, &x.to_string()))?,
    }
  }

  async fn connect_inner(&self, target: &http::Uri) -> Result<Socket> {
    let https = target.scheme_str() == Some("https");
    let host = target
      .host()
      .ok_or_else(|| new_io_error(ErrorKind::InvalidInput, "uri has no host"))?;
    let port = target.port_u16().unwrap_or(if https { 443 } else { 80 });
    let stream = match &self.proxy {
      Some(proxy) => {
        let stream = TcpStream::connect(proxy.address()).await?;
        if self.nodelay {
          stream.set_nodelay(true)?;
        }
        if https {
          self.connect_tunnel(stream, host, port, proxy).await?
        } else {
          // plain targets go through the proxy in absolute form
          stream
        }
      }
      None => {
        let stream = TcpStream::connect((host, port)).await?;
        if self.nodelay {
          stream.set_nodelay(true)?;
        }
        stream
      }
    };
    if https {
      let domain = ServerName::try_from(host.to_string())
        .map_err(|e| Error::Other(format!("invalid server name: {}", e)))?;
      let tls_stream = self.tls.connect(domain, stream).await?;
      Ok(Socket::Tls(Box::new(tls_stream)))
    } else {
      Ok(Socket::Tcp(stream))
    }
  }

  async fn connect_tunnel(
    &self,
    mut stream: TcpStream,
    host: &str,
    port: u16,
    proxy: &Proxy,
  ) -> Result<TcpStream> {
    let mut connect = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let Some(auth) = proxy.basic_auth() {
      if let Ok(auth) = auth.to_str() {
        connect.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
      }
    }
    connect.push_str("\r\n");
    stream.write_all(connect.as_bytes()).await?;
    stream.flush().await?;
    // read the reply head byte-wise so no tunneled bytes are buffered away
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    loop {
      stream.read_exact(&mut byte).await?;
      head.push(byte[0]);
      if head.ends_with(b"\r\n\r\n") {
        break;
      }
      if head.len() > 16 * 1024 {
        return Err(new_io_error(
          ErrorKind::InvalidData,
          "proxy CONNECT reply head too large",
        ));
      }
    }
    let status_line = head.split(|b| *b == b'\n').next().unwrap_or_default();
    let ok = std::str::from_utf8(status_line)
      .ok()
      .and_then(|line| line.split_whitespace().nth(1))
      .map(|status| status.starts_with('2'))
      .unwrap_or(false);
    if !ok {
      return Err(new_io_error(
        ErrorKind::ConnectionRefused,
        &format!(
          "proxy refused CONNECT: {}",
          String::from_utf8_lossy(status_line).trim()
        ),
      ));
    }
    Ok(stream)
  }
}
