//! Error types for the interception dataplane

use std::io;
use thiserror::Error;

/// Result type for interception operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for interception operations
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// The connection source could not deliver a raw byte stream
  #[error("hijack error: {0}")]
  Hijack(String),

  /// Leaf minting or CA parsing failed
  #[error("certificate error: {0}")]
  Certificate(String),

  /// TLS termination failed
  #[error("TLS error: {0}")]
  Tls(String),

  /// HTTP vocabulary error
  #[error("HTTP error: {0}")]
  Http(#[from] http::Error),

  /// Upstream transport error
  #[error("transport error: {0}")]
  Transport(#[from] courier::Error),

  /// The WebSocket upgrade with one of the endpoints failed
  #[error("websocket handshake error: {0}")]
  Handshake(String),

  /// A masked frame was encoded with a key that is not exactly 4 bytes
  #[error("mask key length must be exactly 4 bytes")]
  InvalidMaskKeyLength,

  /// A WebSocket frame could not be decoded
  #[error("frame error: {0}")]
  Frame(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("[MITM] {}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::error!("[MITM] {}", error);
    error
  }

  /// Create a hijack error and log it
  pub fn hijack_error(msg: impl Into<String>) -> Self {
    let error = Error::Hijack(msg.into());
    tracing::error!("[MITM] {}", error);
    error
  }

  /// Create a websocket handshake error and log it
  pub fn handshake_error(msg: impl Into<String>) -> Self {
    let error = Error::Handshake(msg.into());
    tracing::error!("[MITM] {}", error);
    error
  }

  /// Create a frame decode error and log it
  pub fn frame_error(msg: impl Into<String>) -> Self {
    let error = Error::Frame(msg.into());
    tracing::debug!("[MITM] {}", error);
    error
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    Error::Io(value)
  }
}
