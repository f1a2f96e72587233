//! Leaf certificate minting for the client-facing TLS terminator
//!
//! The proxy presents a freshly minted leaf for every intercepted hostname,
//! signed by the configured CA. Leaves are memoized per hostname for the
//! life of the process, so a busy proxy re-handshakes cheaply.

use crate::error::{Error, Result};
use bytes::Bytes;
use moka::sync::Cache;
use rand::Rng;
use rcgen::{
  CertificateParams, DistinguishedName, DnType, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::sign::CertifiedKey;

/// Leaf lifetime.
const LEAF_MAX_AGE: Duration = Duration::hours(24);
/// Leaves are backdated by this much to tolerate client clock skew.
const NOT_BEFORE_OFFSET: Duration = Duration::hours(1);

/// The signing CA: a PEM certificate/private-key pair.
///
/// The material is held as raw bytes and parsed lazily when a leaf is
/// minted, i.e. inside the TLS certificate-selection callback. The
/// certificate must carry the BasicConstraints CA flag; anything else is
/// rejected at mint time.
pub struct CertificateAuthority {
  cert_pem: Bytes,
  key_pem: Bytes,
}

impl CertificateAuthority {
  /// Create an authority from PEM-encoded certificate and private key.
  pub fn new(cert_pem: impl Into<Bytes>, key_pem: impl Into<Bytes>) -> Self {
    Self {
      cert_pem: cert_pem.into(),
      key_pem: key_pem.into(),
    }
  }

  /// The CA certificate in PEM format, for installation in client trust
  /// stores.
  pub fn cert_pem(&self) -> &[u8] {
    &self.cert_pem
  }

  /// Mint a leaf certificate for `host`, signed by this CA.
  ///
  /// The leaf carries a random 128-bit serial, a validity window of
  /// `[now-1h, now-1h+24h)`, CN = host, digital-signature key usage, an IP
  /// or DNS SAN depending on how `host` parses, and a P-384 ECDSA key. The
  /// returned value is ready for a rustls certificate resolver.
  pub fn mint_leaf(&self, host: &str) -> Result<Arc<CertifiedKey>> {
    let ca_der = self.parse_ca_der()?;
    let cert_pem = std::str::from_utf8(&self.cert_pem)
      .map_err(|_| Error::certificate_error("CA certificate PEM is not valid UTF-8"))?;
    let key_pem = std::str::from_utf8(&self.key_pem)
      .map_err(|_| Error::certificate_error("CA private key PEM is not valid UTF-8"))?;
    let ca_key = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::certificate_error(format!("cannot parse CA private key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(cert_pem, ca_key)
      .map_err(|e| Error::certificate_error(format!("cannot parse CA certificate: {}", e)))?;

    let mut params = CertificateParams::default();
    let mut serial = [0u8; 16];
    rand::thread_rng().fill(&mut serial);
    params.serial_number = Some(serial.to_vec().into());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      vec![SanType::IpAddress(ip)]
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::certificate_error(format!("invalid leaf hostname: {}", host))
      })?)]
    };
    let not_before = OffsetDateTime::now_utc() - NOT_BEFORE_OFFSET;
    params.not_before = not_before;
    params.not_after = not_before + LEAF_MAX_AGE;

    let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
      .map_err(|e| Error::certificate_error(format!("failed to generate leaf key: {}", e)))?;
    let cert = params
      .signed_by(&leaf_key, &issuer)
      .map_err(|e| Error::certificate_error(format!("failed to sign leaf: {}", e)))?;

    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
    let provider = CryptoProvider::get_default().cloned().unwrap_or_else(|| {
      Arc::new(tokio_rustls::rustls::crypto::ring::default_provider())
    });
    let signing_key = provider
      .key_provider
      .load_private_key(key_der)
      .map_err(|e| Error::certificate_error(format!("failed to load leaf key: {}", e)))?;
    let chain = vec![cert.der().clone(), ca_der];
    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
  }

  /// Parse the CA certificate to DER and verify it is actually a CA.
  fn parse_ca_der(&self) -> Result<CertificateDer<'static>> {
    let ca_der = rustls_pemfile::certs(&mut self.cert_pem.as_ref())
      .next()
      .ok_or_else(|| Error::certificate_error("no certificate found in CA PEM"))?
      .map_err(|e| Error::certificate_error(format!("cannot parse CA PEM: {}", e)))?;
    let (_, parsed) = x509_parser::parse_x509_certificate(ca_der.as_ref())
      .map_err(|e| Error::certificate_error(format!("cannot parse CA certificate: {}", e)))?;
    let is_ca = parsed
      .basic_constraints()
      .ok()
      .flatten()
      .map(|bc| bc.value.ca)
      .unwrap_or(false);
    if !is_ca {
      return Err(Error::certificate_error(
        "configured CA certificate does not carry the CA BasicConstraints flag",
      ));
    }
    Ok(ca_der)
  }
}

/// Per-hostname memoization of minted leaves.
///
/// Entries live for the life of the process; the store trades memory for
/// handshake reuse. Concurrent misses on the same hostname are
/// single-flighted, so no observer ever sees two distinct leaves for one
/// hostname.
#[derive(Clone)]
pub struct LeafStore {
  cache: Cache<String, Arc<CertifiedKey>>,
}

impl Default for LeafStore {
  fn default() -> Self {
    Self::new()
  }
}

impl LeafStore {
  /// Create an empty store.
  pub fn new() -> Self {
    Self {
      cache: Cache::builder().build(),
    }
  }

  /// Return the cached leaf for `host`, minting (and caching) one on the
  /// first request. Mint failures are returned and do not populate the
  /// store.
  pub fn get_or_mint(
    &self,
    authority: &CertificateAuthority,
    host: &str,
  ) -> Result<Arc<CertifiedKey>> {
    self
      .cache
      .try_get_with(host.to_string(), || authority.mint_leaf(host))
      .map_err(|e: Arc<Error>| Error::Certificate(e.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn test_authority() -> CertificateAuthority {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "courier test CA");
    params.distinguished_name = dn;
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    CertificateAuthority::new(cert.pem().into_bytes(), key.serialize_pem().into_bytes())
  }

  fn non_ca_authority() -> CertificateAuthority {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "plain leaf");
    params.distinguished_name = dn;
    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    CertificateAuthority::new(cert.pem().into_bytes(), key.serialize_pem().into_bytes())
  }

  #[test]
  fn minted_leaf_has_a_chain_of_two() {
    let authority = test_authority();
    let leaf = authority.mint_leaf("example.com").unwrap();
    assert_eq!(leaf.cert.len(), 2);
  }

  #[test]
  fn memoized_leaves_are_identical() {
    let authority = test_authority();
    let store = LeafStore::new();
    let first = store.get_or_mint(&authority, "example.com").unwrap();
    let second = store.get_or_mint(&authority, "example.com").unwrap();
    // same serial, byte-identical DER
    assert_eq!(
      first.end_entity_cert().unwrap().as_ref(),
      second.end_entity_cert().unwrap().as_ref()
    );
  }

  #[test]
  fn distinct_hosts_get_distinct_leaves() {
    let authority = test_authority();
    let store = LeafStore::new();
    let a = store.get_or_mint(&authority, "a.example.com").unwrap();
    let b = store.get_or_mint(&authority, "b.example.com").unwrap();
    assert_ne!(
      a.end_entity_cert().unwrap().as_ref(),
      b.end_entity_cert().unwrap().as_ref()
    );
  }

  #[test]
  fn non_ca_certificate_is_rejected() {
    let authority = non_ca_authority();
    let err = authority.mint_leaf("example.com").unwrap_err();
    assert!(matches!(err, Error::Certificate(_)));
  }

  #[test]
  fn mint_failure_does_not_populate_the_store() {
    let store = LeafStore::new();
    assert!(store.get_or_mint(&non_ca_authority(), "example.com").is_err());
    // a later mint with a valid CA succeeds for the same key
    assert!(store.get_or_mint(&test_authority(), "example.com").is_ok());
  }

  #[test]
  fn concurrent_misses_observe_one_leaf() {
    let authority = Arc::new(test_authority());
    let store = LeafStore::new();
    let mut handles = Vec::new();
    for _ in 0..8 {
      let authority = authority.clone();
      let store = store.clone();
      handles.push(std::thread::spawn(move || {
        store
          .get_or_mint(&authority, "flight.example.com")
          .unwrap()
          .end_entity_cert()
          .unwrap()
          .as_ref()
          .to_vec()
      }));
    }
    let mut leaves: Vec<Vec<u8>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    leaves.dedup();
    assert_eq!(leaves.len(), 1);
  }

  #[test]
  fn ip_hosts_are_minted() {
    let authority = test_authority();
    assert!(authority.mint_leaf("127.0.0.1").is_ok());
  }
}
