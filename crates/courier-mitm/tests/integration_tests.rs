//! End-to-end tests for the interception dataplane

use courier_mitm::{
  compute_accept_key, Handlers, MitmConfig, MitmProxy, SourcedRequest, TcpConnectionSource,
  WebsocketFragment, BINARY_MESSAGE,
};
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn make_ca() -> (String, String) {
  let mut params = CertificateParams::default();
  let mut dn = DistinguishedName::new();
  dn.push(DnType::CommonName, "test CA");
  params.distinguished_name = dn;
  params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
  params.key_usages = vec![
    rcgen::KeyUsagePurpose::KeyCertSign,
    rcgen::KeyUsagePurpose::CrlSign,
  ];
  let key = KeyPair::generate().unwrap();
  let cert = params.self_signed(&key).unwrap();
  (cert.pem(), key.serialize_pem())
}

async fn start_proxy(handlers: Handlers, config: MitmConfig) -> SocketAddr {
  let (ca_cert, ca_key) = make_ca();
  let proxy = MitmProxy::new(config, ca_cert, ca_key, handlers).unwrap();
  let source = TcpConnectionSource::bind("127.0.0.1:0").await.unwrap();
  let addr = source.local_addr().unwrap();
  tokio::spawn(async move {
    let _ = proxy.run(source).await;
  });
  addr
}

/// Read one HTTP response (head + content-length body) off a buffered
/// reader, returning head text and body text.
async fn read_response<R>(reader: &mut R) -> (String, String)
where
  R: AsyncBufRead + Unpin,
{
  let mut head = String::new();
  loop {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await.unwrap();
    if n == 0 || line == "\r\n" {
      break;
    }
    head.push_str(&line);
  }
  let length = head
    .lines()
    .find_map(|line| {
      line
        .to_ascii_lowercase()
        .strip_prefix("content-length:")
        .and_then(|v| v.trim().parse::<usize>().ok())
    })
    .unwrap_or(0);
  let mut body = vec![0u8; length];
  reader.read_exact(&mut body).await.unwrap();
  (head, String::from_utf8_lossy(&body).to_string())
}

/// Plain HTTP origin that answers every request with its own path.
async fn plain_origin() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let Ok((stream, _)) = listener.accept().await else {
        break;
      };
      tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
          return;
        }
        loop {
          let mut line = String::new();
          let n = reader.read_line(&mut line).await.unwrap_or(0);
          if n == 0 || line == "\r\n" {
            break;
          }
        }
        let path = request_line.split_whitespace().nth(1).unwrap_or("/").to_string();
        let response = format!(
          "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nX-Origin: plain\r\n\r\n{}",
          path.len(),
          path
        );
        let _ = reader.write_all(response.as_bytes()).await;
        let _ = reader.flush().await;
      });
    }
  });
  addr
}

#[tokio::test]
async fn plaintext_forward_end_to_end() {
  let origin = plain_origin().await;
  let handlers = Handlers::new().on_response(|_session, _req, resp| {
    resp
      .headers_mut()
      .insert("x-intercepted", "1".parse().unwrap());
  });
  let proxy = start_proxy(handlers, MitmConfig::default()).await;

  let stream = TcpStream::connect(proxy).await.unwrap();
  let mut stream = BufReader::new(stream);
  let request = format!(
    "GET http://{origin}/greeting HTTP/1.1\r\nHost: {origin}\r\n\r\n"
  );
  stream.write_all(request.as_bytes()).await.unwrap();
  stream.flush().await.unwrap();

  let (head, body) = read_response(&mut stream).await;
  assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
  assert!(head.to_ascii_lowercase().contains("x-intercepted: 1"));
  assert!(head.to_ascii_lowercase().contains("x-origin: plain"));
  assert_eq!(body, "/greeting");
}

#[tokio::test]
async fn request_handler_short_circuits_upstream() {
  let (ca_cert, ca_key) = make_ca();
  let handlers = Handlers::new().on_request(|_session, req| {
    if req.uri().host() == Some("blocked.example") {
      Some(
        http::Response::builder()
          .status(500)
          .body("blocked")
          .unwrap()
          .into(),
      )
    } else {
      None
    }
  });
  let proxy = MitmProxy::new(MitmConfig::default(), ca_cert, ca_key, handlers).unwrap();

  let (client, server) = tokio::io::duplex(16 * 1024);
  let (mut client_read, mut client_write) = tokio::io::split(client);
  tokio::spawn(async move {
    client_write
      .write_all(b"GET http://blocked.example/ HTTP/1.1\r\nHost: blocked.example\r\n\r\n")
      .await
      .unwrap();
  });
  let sourced = SourcedRequest::from_stream(server).await.unwrap();
  proxy.serve(sourced).await.unwrap();

  let mut raw = Vec::new();
  client_read.read_to_end(&mut raw).await.unwrap();
  let text = String::from_utf8_lossy(&raw);
  // short-circuited: the handler's response, not a dial failure
  assert!(text.starts_with("HTTP/1.1 500"), "{text}");
  assert!(text.ends_with("blocked"), "{text}");
}

#[derive(Debug)]
struct AcceptAnything;

impl rustls::client::danger::ServerCertVerifier for AcceptAnything {
  fn verify_server_cert(
    &self,
    _end_entity: &rustls::pki_types::CertificateDer,
    _intermediates: &[rustls::pki_types::CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: rustls::pki_types::UnixTime,
  ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
    Ok(rustls::client::danger::ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &rustls::pki_types::CertificateDer,
    _dss: &rustls::DigitallySignedStruct,
  ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
    Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &rustls::pki_types::CertificateDer,
    _dss: &rustls::DigitallySignedStruct,
  ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
    Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
    vec![
      rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
      rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
      rustls::SignatureScheme::RSA_PSS_SHA256,
      rustls::SignatureScheme::ED25519,
    ]
  }
}

/// TLS origin that answers every request with its own path.
async fn tls_origin() -> SocketAddr {
  let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
  params.distinguished_name = DistinguishedName::new();
  let key = KeyPair::generate().unwrap();
  let cert = params.self_signed(&key).unwrap();
  let config = rustls::ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(
      vec![cert.der().clone()],
      PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
    )
    .unwrap();
  let acceptor = TlsAcceptor::from(Arc::new(config));
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let Ok((stream, _)) = listener.accept().await else {
        break;
      };
      let acceptor = acceptor.clone();
      tokio::spawn(async move {
        // the reachability probe drops its connection mid-handshake
        let Ok(tls) = acceptor.accept(stream).await else {
          return;
        };
        let mut reader = BufReader::new(tls);
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
          return;
        }
        loop {
          let mut line = String::new();
          let n = reader.read_line(&mut line).await.unwrap_or(0);
          if n == 0 || line == "\r\n" {
            break;
          }
        }
        let path = request_line.split_whitespace().nth(1).unwrap_or("/").to_string();
        let response = format!(
          "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
          path.len(),
          path
        );
        let _ = reader.write_all(response.as_bytes()).await;
        let _ = reader.flush().await;
      });
    }
  });
  addr
}

#[tokio::test]
async fn connect_tunnel_terminates_tls_and_services_requests_until_eof() {
  let origin = tls_origin().await;
  let proxy = start_proxy(Handlers::new(), MitmConfig::default()).await;

  let mut stream = TcpStream::connect(proxy).await.unwrap();
  let connect = format!("CONNECT {origin} HTTP/1.1\r\nHost: {origin}\r\n\r\n");
  stream.write_all(connect.as_bytes()).await.unwrap();
  let mut ack = [0u8; 19];
  stream.read_exact(&mut ack).await.unwrap();
  assert_eq!(&ack, b"HTTP/1.1 200 OK\r\n\r\n");

  let config = rustls::ClientConfig::builder()
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(AcceptAnything))
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(config));
  let tls = connector
    .connect(ServerName::try_from("localhost").unwrap(), stream)
    .await
    .unwrap();
  let mut tls = BufReader::new(tls);

  // the tunnel services more than one request
  for path in ["/one", "/two"] {
    let request = format!("GET {path} HTTP/1.1\r\nHost: {origin}\r\n\r\n");
    tls.write_all(request.as_bytes()).await.unwrap();
    tls.flush().await.unwrap();
    let (head, body) = read_response(&mut tls).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert_eq!(body, path);
  }
}

/// Plaintext origin that drops TLS probes and echoes WebSocket frames.
async fn websocket_origin() -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
  tokio::spawn(async move {
    loop {
      let Ok((stream, _)) = listener.accept().await else {
        break;
      };
      let tx = tx.clone();
      tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let first = match reader.read_u8().await {
          Ok(byte) => byte,
          Err(_) => return,
        };
        if first == 0x16 {
          // a TLS ClientHello: this origin does not speak TLS
          return;
        }
        let mut key = String::new();
        loop {
          let mut line = Vec::new();
          let n = reader.read_until(b'\n', &mut line).await.unwrap_or(0);
          if n == 0 {
            return;
          }
          let text = String::from_utf8_lossy(&line);
          if let Some(value) = text
            .to_ascii_lowercase()
            .strip_prefix("sec-websocket-key:")
          {
            key = text[text.len() - value.len()..].trim().to_string();
          }
          if line == b"\r\n" {
            break;
          }
        }
        let response = format!(
          "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
          compute_accept_key(&key)
        );
        reader.write_all(response.as_bytes()).await.unwrap();
        reader.flush().await.unwrap();
        loop {
          let Ok(frame) = WebsocketFragment::read_from(&mut reader, None).await else {
            return;
          };
          tx.send(frame.data.clone()).ok();
          let echo = WebsocketFragment {
            fin: true,
            opcode: BINARY_MESSAGE,
            payload_length: frame.data.len() as u64,
            data: frame.data,
            ..Default::default()
          };
          if echo.write_to(&mut reader).await.is_err() {
            return;
          }
          if reader.flush().await.is_err() {
            return;
          }
        }
      });
    }
  });
  (addr, rx)
}

#[tokio::test]
async fn plaintext_websocket_relay_transforms_frames() {
  let (origin, mut origin_saw) = websocket_origin().await;
  let handlers = Handlers::new().on_ws_request(|mut frame| {
    frame.data = frame.data.to_ascii_uppercase();
    frame.payload_length = frame.data.len() as u64;
    frame
  });
  let config = MitmConfig {
    probe_timeout: Duration::from_millis(500),
    ..Default::default()
  };
  let proxy = start_proxy(handlers, config).await;

  let mut stream = TcpStream::connect(proxy).await.unwrap();
  let connect = format!("CONNECT {origin} HTTP/1.1\r\nHost: {origin}\r\n\r\n");
  stream.write_all(connect.as_bytes()).await.unwrap();
  let mut ack = [0u8; 19];
  stream.read_exact(&mut ack).await.unwrap();
  assert_eq!(&ack, b"HTTP/1.1 200 OK\r\n\r\n");

  let upgrade = format!(
    "GET /live HTTP/1.1\r\nHost: {origin}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
  );
  stream.write_all(upgrade.as_bytes()).await.unwrap();

  let mut reader = BufReader::new(stream);
  let mut response_head = String::new();
  loop {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await.unwrap();
    if n == 0 || line == "\r\n" {
      break;
    }
    response_head.push_str(&line);
  }
  assert!(
    response_head.starts_with("HTTP/1.1 101"),
    "{response_head}"
  );
  assert!(response_head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

  let frame = WebsocketFragment {
    fin: true,
    opcode: BINARY_MESSAGE,
    masked: true,
    payload_length: 11,
    masking_key: vec![0x1A, 0x2B, 0x3C, 0x4D],
    data: b"hello world".to_vec(),
    ..Default::default()
  };
  frame.write_to(&mut reader).await.unwrap();
  reader.flush().await.unwrap();

  // the request handler uppercased the payload before the origin saw it
  assert_eq!(origin_saw.recv().await.unwrap(), b"HELLO WORLD");

  let echoed = WebsocketFragment::read_from(&mut reader, None).await.unwrap();
  assert_eq!(echoed.data, b"HELLO WORLD");
}
