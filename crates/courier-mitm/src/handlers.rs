//! User-supplied interception points
//!
//! A [`Handlers`] value is a record of four independently optional
//! operations, installed at proxy construction and immutable afterward.
//! Each may be invoked concurrently from many connections, so the closures
//! must be thread-safe.

use crate::frame::WebsocketFragment;
use courier::{Request, Response};
use std::sync::Arc;

/// Inspect a request before it is forwarded; returning a response
/// short-circuits the upstream call.
pub type RequestHandler = Arc<dyn Fn(u64, &mut Request) -> Option<Response> + Send + Sync>;
/// Observe or mutate a response before it is written back to the client.
pub type ResponseHandler = Arc<dyn Fn(u64, &Request, &mut Response) + Send + Sync>;
/// Transform one WebSocket frame; return it unchanged to observe only.
pub type FrameHandler = Arc<dyn Fn(WebsocketFragment) -> WebsocketFragment + Send + Sync>;

/// The interception capability set.
///
/// Every frame crossing the WebSocket relay is fed through the matching
/// frame handler, control frames included. A frame handler that rewrites
/// `data` must keep `payload_length` in step.
///
/// # Example
///
/// ```
/// use courier_mitm::Handlers;
///
/// let handlers = Handlers::new().on_request(|session, req| {
///   tracing::info!("session {}: {} {}", session, req.method(), req.uri());
///   None
/// });
/// ```
#[derive(Clone, Default)]
pub struct Handlers {
  pub(crate) request: Option<RequestHandler>,
  pub(crate) response: Option<ResponseHandler>,
  pub(crate) ws_request: Option<FrameHandler>,
  pub(crate) ws_response: Option<FrameHandler>,
}

impl Handlers {
  /// An empty capability set; the proxy forwards everything untouched.
  pub fn new() -> Self {
    Self::default()
  }

  /// Install the request handler.
  pub fn on_request<F>(mut self, f: F) -> Self
  where
    F: Fn(u64, &mut Request) -> Option<Response> + Send + Sync + 'static,
  {
    self.request = Some(Arc::new(f));
    self
  }

  /// Install the response handler.
  pub fn on_response<F>(mut self, f: F) -> Self
  where
    F: Fn(u64, &Request, &mut Response) + Send + Sync + 'static,
  {
    self.response = Some(Arc::new(f));
    self
  }

  /// Install the client-to-server frame handler.
  pub fn on_ws_request<F>(mut self, f: F) -> Self
  where
    F: Fn(WebsocketFragment) -> WebsocketFragment + Send + Sync + 'static,
  {
    self.ws_request = Some(Arc::new(f));
    self
  }

  /// Install the server-to-client frame handler.
  pub fn on_ws_response<F>(mut self, f: F) -> Self
  where
    F: Fn(WebsocketFragment) -> WebsocketFragment + Send + Sync + 'static,
  {
    self.ws_response = Some(Arc::new(f));
    self
  }
}
