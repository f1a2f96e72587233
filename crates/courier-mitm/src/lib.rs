//! Intercepting MITM proxy for HTTP, HTTPS and WebSocket traffic
//!
//! A client configures this proxy as its HTTP proxy; the proxy terminates
//! the client's transport (including TLS after a CONNECT tunnel), forwards
//! requests upstream through [`courier`], and returns responses, optionally
//! transformed by user-supplied [`Handlers`]. WebSocket connections are
//! spliced at the frame level, with each decoded frame offered to a handler
//! before re-encoding.
//!
//! # Features
//!
//! - Per-hostname leaf certificates minted on the fly under a configured CA,
//!   selected by SNI during the client handshake and memoized for the life
//!   of the process
//! - CONNECT tunnels classified by a short TLS probe of the target:
//!   TLS-capable targets are transparently terminated, everything else is
//!   treated as a plaintext WebSocket candidate
//! - RFC 6455 frame codec with full masking support, usable on its own via
//!   [`WebsocketFragment`]
//!
//! # Example
//!
//! ```no_run
//! use courier_mitm::{Handlers, MitmConfig, MitmProxy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let handlers = Handlers::new().on_response(|session, req, resp| {
//!     tracing::info!("session {}: {} -> {}", session, req.uri(), resp.status_code());
//!   });
//!   let ca_cert = std::fs::read("ca_cert.pem")?;
//!   let ca_key = std::fs::read("ca_key.pem")?;
//!   let proxy = MitmProxy::new(MitmConfig::default(), ca_cert, ca_key, handlers)?;
//!   proxy.start("127.0.0.1:8080").await?;
//!   Ok(())
//! }
//! ```

mod ca;
mod error;
mod frame;
mod handlers;
mod proxy;
mod server;
mod source;
mod tls;
mod websocket;

pub use ca::{CertificateAuthority, LeafStore};
pub use error::{Error, Result};
pub use frame::{
  WebsocketFragment, BINARY_MESSAGE, CLOSE_MESSAGE, CONTINUATION_FRAME, PING_MESSAGE,
  PONG_MESSAGE, TEXT_MESSAGE,
};
pub use handlers::{FrameHandler, Handlers, RequestHandler, ResponseHandler};
pub use proxy::{MitmConfig, MitmProxy};
pub use server::ProxyServer;
pub use source::{ConnectionSource, RequestHead, SourcedRequest, TcpConnectionSource};
pub use websocket::{compute_accept_key, is_websocket_upgrade};
