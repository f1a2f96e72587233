#![deny(missing_docs)]

//! # courier
//!
//! The `courier` crate provides a small, low-level HTTP/1.1 [`Client`]
//! intended for proxies and other tools that need exact control over what
//! goes on the wire.
//!
//! - Customizable [redirect policy](redirect)
//! - Optional upstream HTTP [`Proxy`] routing
//! - TLS via rustls, with an opt-in permissive certificate mode
//!
//! ## Making a request
//!
//! ```no_run
//! # async fn run() -> Result<(), courier::Error> {
//! let client = courier::Client::new();
//! let resp = client.get("http://httpbin.org/get").send().await?;
//! println!("status = {}", resp.status_code());
//! # Ok(())
//! # }
//! ```
//!
//! Every request is sent on a fresh connection with `Connection: close`;
//! there is no pooling. The response body is read eagerly according to
//! `Content-Length`, chunked framing, or until EOF.

mod body;
mod client;
mod connector;
mod errors;
mod proxy;
/// Redirect handling
pub mod redirect;
mod request;
mod response;
mod socket;
mod tls;

pub use body::Body;
pub use client::{Client, ClientBuilder};
pub use connector::{Connector, ConnectorBuilder};
pub use errors::{Error, Result};
pub use http::header;
pub use http::uri;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use proxy::Proxy;
pub use request::{Request, RequestBuilder};
pub use response::{Response, ResponseBuilder};
pub use socket::Socket;

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
