use std::fmt::{Debug, Formatter};

use bytes::{BufMut, Bytes, BytesMut};
use http::Request as HttpRequest;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Version};

use crate::body::Body;
use crate::{Client, Response};

/// A request which can be executed with `Client::execute()`.
#[derive(Default, Clone)]
pub struct Request {
  uri: http::Uri,
  version: Version,
  method: Method,
  headers: HeaderMap<HeaderValue>,
  body: Option<Body>,
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("uri", &self.uri)
      .field("version", &self.version)
      .field("method", &self.method)
      .field("headers", &self.headers)
      .field("body", &self.body)
      .finish()
  }
}

impl<T> From<HttpRequest<T>> for Request
where
  T: Into<Body>,
{
  fn from(value: HttpRequest<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      uri: parts.uri,
      version: parts.version,
      method: parts.method,
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Request {
  /// Serialize the request to its HTTP/1.1 wire form.
  ///
  /// `absolute_form` selects the request-target representation: origin form
  /// for direct connections, absolute form when routed through a proxy.
  /// A `Host` header is injected from the URI authority when absent, and
  /// `Content-Length` when a body is present.
  pub fn to_raw(&self, absolute_form: bool) -> Bytes {
    let body = self.body.as_ref().filter(|b| !b.is_empty());
    let mut wire = BytesMut::with_capacity(256 + body.map_or(0, |b| b.len()));

    wire.put_slice(self.method.as_str().as_bytes());
    wire.put_u8(b' ');
    if absolute_form {
      wire.put_slice(self.uri.to_string().as_bytes());
    } else {
      match self.uri.path_and_query() {
        Some(target) => wire.put_slice(target.as_str().as_bytes()),
        None => wire.put_u8(b'/'),
      }
    }
    wire.put_slice(format!(" {:?}\r\n", self.version).as_bytes());

    if !self.headers.contains_key(http::header::HOST) {
      if let Some(authority) = self.uri.authority() {
        wire.put_slice(format!("host: {}\r\n", authority).as_bytes());
      }
    }
    for (name, value) in &self.headers {
      wire.put_slice(name.as_str().as_bytes());
      wire.put_slice(b": ");
      wire.put_slice(value.as_bytes());
      wire.put_slice(b"\r\n");
    }
    if let Some(body) = body {
      if !self.headers.contains_key(http::header::CONTENT_LENGTH) {
        wire.put_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
      }
    }
    wire.put_slice(b"\r\n");
    if let Some(body) = body {
      wire.put_slice(body.as_ref());
    }
    wire.freeze()
  }
  /// Creates a new builder-style object to manufacture a `Request`.
  pub fn builder() -> http::request::Builder {
    http::request::Builder::new()
  }
}

impl Request {
  /// Get the HTTP method of this request.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Get a mutable reference to the HTTP method.
  #[inline]
  pub fn method_mut(&mut self) -> &mut Method {
    &mut self.method
  }
  /// Get the URI of this request.
  #[inline]
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }
  /// Get a mutable reference to the URI.
  #[inline]
  pub fn uri_mut(&mut self) -> &mut http::Uri {
    &mut self.uri
  }
  /// Get the headers of this request.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// Get the body of this request.
  #[inline]
  pub fn body(&self) -> Option<&Body> {
    self.body.as_ref()
  }
  /// Get a mutable reference to the body.
  #[inline]
  pub fn body_mut(&mut self) -> &mut Option<Body> {
    &mut self.body
  }
  /// Returns the associated version.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// Returns a mutable reference to the associated version.
  #[inline]
  pub fn version_mut(&mut self) -> &mut Version {
    &mut self.version
  }
}

/// A builder to construct the properties of a `Request`.
///
/// To construct a `RequestBuilder`, refer to the `Client` documentation.
#[must_use = "RequestBuilder does nothing until you 'send' it"]
pub struct RequestBuilder {
  client: Client,
  builder: http::request::Builder,
  body: Body,
}

impl RequestBuilder {
  /// Constructs a new request builder bound to a client.
  pub fn new(client: Client, builder: http::request::Builder) -> RequestBuilder {
    RequestBuilder {
      client,
      builder,
      body: Default::default(),
    }
  }
  /// Append one header to the request under construction.
  pub fn header<K, V>(mut self, key: K, value: V) -> RequestBuilder
  where
    HeaderName: TryFrom<K>,
    HeaderValue: TryFrom<V>,
    <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
    <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
  {
    self.builder = self.builder.header(key, value);
    self
  }
  /// Merge a whole `HeaderMap` into the request, replacing entries whose
  /// name is already present.
  pub fn headers(mut self, headers: HeaderMap) -> RequestBuilder {
    if let Some(header) = self.builder.headers_mut() {
      for (key, value) in headers {
        if let Some(key) = key {
          header.insert(key, value);
        }
      }
    }
    self
  }
  /// Set the request body.
  pub fn body<T: Into<Body>>(mut self, body: T) -> RequestBuilder {
    self.body = body.into();
    self
  }
  /// Build a `Request`, which can be inspected, modified and executed with
  /// `Client::execute()`.
  pub fn build(self) -> crate::Result<Request> {
    let r: Request = self
      .builder
      .body(self.body)
      .map_err(http::Error::from)?
      .into();
    Ok(r)
  }
  /// Constructs the `Request` and sends it, returning the `Response`.
  ///
  /// # Errors
  ///
  /// This method fails if there was an error while sending the request or
  /// the redirect limit was exhausted.
  pub async fn send(self) -> crate::Result<Response> {
    let req: Request = self
      .builder
      .body(self.body)
      .map_err(http::Error::from)?
      .into();
    self.client.execute(req).await
  }
}
