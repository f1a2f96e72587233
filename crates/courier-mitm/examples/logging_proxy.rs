//! A proxy that logs everything it intercepts.
//!
//! Run with `cargo run --example logging_proxy`, then point a client at
//! http://127.0.0.1:8080 and trust the printed CA certificate for HTTPS:
//!
//! ```text
//! curl https://example.com -x http://127.0.0.1:8080 --cacert ca.crt
//! ```

use courier_mitm::{Handlers, MitmConfig, MitmProxy};
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use tracing_subscriber::EnvFilter;

fn make_ca() -> (String, String) {
  let mut params = CertificateParams::default();
  let mut dn = DistinguishedName::new();
  dn.push(DnType::CommonName, "courier-mitm example CA");
  params.distinguished_name = dn;
  params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
  params.key_usages = vec![
    rcgen::KeyUsagePurpose::KeyCertSign,
    rcgen::KeyUsagePurpose::CrlSign,
  ];
  let key = KeyPair::generate().expect("generate CA key");
  let cert = params.self_signed(&key).expect("self-sign CA");
  (cert.pem(), key.serialize_pem())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
    .init();

  let (ca_cert, ca_key) = make_ca();
  println!("Trust this certificate to intercept HTTPS:\n\n{ca_cert}");

  let handlers = Handlers::new()
    .on_request(|session, req| {
      tracing::info!("session {session}: {} {}", req.method(), req.uri());
      None
    })
    .on_response(|session, _req, resp| {
      tracing::info!("session {session}: {}", resp.status_code());
    })
    .on_ws_request(|frame| {
      tracing::info!("ws client frame: opcode {} ({} bytes)", frame.opcode, frame.data.len());
      frame
    })
    .on_ws_response(|frame| {
      tracing::info!("ws server frame: opcode {} ({} bytes)", frame.opcode, frame.data.len());
      frame
    });

  let proxy = MitmProxy::new(MitmConfig::default(), ca_cert, ca_key, handlers)?;
  proxy.start("127.0.0.1:8080").await?;
  Ok(())
}
