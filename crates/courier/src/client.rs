use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{new_io_error, Result};
use crate::proxy::Proxy;
use crate::redirect::{remove_sensitive_headers, Action, Policy};
use crate::response::ResponseBuilder;
use crate::{Connector, ConnectorBuilder, Request, RequestBuilder, Response};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tokio::io::{AsyncWriteExt, BufReader};

/// Issues [`Request`]s over fresh connections.
///
/// The defaults are reasonable for most callers; anything else is set up
/// through [`Client::builder`]. A `Client` is cheap to clone, and clones
/// share the same connector and policies.
///
/// # Examples
///
/// ```no_run
/// use courier::Client;
/// #
/// # async fn run() -> Result<(), courier::Error> {
/// let client = Client::new();
/// let resp = client.get("http://httpbin.org/").send().await?;
/// #   Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
  inner: Arc<ClientRef>,
}

impl Default for Client {
  fn default() -> Self {
    Self::new()
  }
}

impl Client {
  /// Build a client with the default configuration.
  ///
  /// # Panics
  ///
  /// Panics when the TLS backend fails to initialize. Go through
  /// `Client::builder()` to surface that failure as an `Error` instead.
  pub fn new() -> Client {
    ClientBuilder::default().build().expect("Client::new()")
  }
  /// Shorthand for `ClientBuilder::default()`.
  pub fn builder() -> ClientBuilder {
    ClientBuilder::default()
  }
  /// Begin a `GET` request to `url`.
  ///
  /// An unparseable `url` surfaces as an error when the request is built
  /// or sent.
  pub fn get<U>(&self, url: U) -> RequestBuilder
  where
    http::Uri: TryFrom<U>,
    <http::Uri as TryFrom<U>>::Error: Into<http::Error>,
  {
    self.request(Method::GET, url)
  }
  /// Begin a `POST` request to `url`.
  ///
  /// An unparseable `url` surfaces as an error when the request is built
  /// or sent.
  pub fn post<U>(&self, url: U) -> RequestBuilder
  where
    http::Uri: TryFrom<U>,
    <http::Uri as TryFrom<U>>::Error: Into<http::Error>,
  {
    self.request(Method::POST, url)
  }
  /// Begin a request with an arbitrary method, returning the
  /// `RequestBuilder` to attach headers and a body before sending.
  ///
  /// An unparseable `url` surfaces as an error when the request is built
  /// or sent.
  pub fn request<U>(&self, method: Method, url: U) -> RequestBuilder
  where
    http::Uri: TryFrom<U>,
    <http::Uri as TryFrom<U>>::Error: Into<http::Error>,
  {
    RequestBuilder::new(
      self.clone(),
      http::request::Builder::new().method(method).uri(url),
    )
  }
  /// Executes a `Request`.
  ///
  /// A `Request` can be built manually with `Request::builder()` or
  /// obtained from a `RequestBuilder` with `RequestBuilder::build()`.
  ///
  /// # Errors
  ///
  /// This method fails if there was an error while sending the request or
  /// the configured total timeout elapsed.
  pub async fn execute<R: Into<Request>>(&self, request: R) -> Result<Response> {
    let request = request.into();
    match self.inner.timeout {
      None => self.execute_inner(request).await,
      Some(timeout) => tokio::time::timeout(timeout, self.execute_inner(request))
        .await
        .map_err(|x| new_io_error(std::io::ErrorKind::TimedOut, &x.to_string()))?,
    }
  }

  async fn execute_inner(&self, mut request: Request) -> Result<Response> {
    let mut previous: Vec<http::Uri> = Vec::new();
    loop {
      for (k, v) in self.inner.headers.iter() {
        // built-in defaults rank below whatever the caller set
        if request.headers().get(k).is_none() {
          request.headers_mut().insert(k, v.clone());
        }
      }
      request
        .headers_mut()
        .insert(http::header::CONNECTION, HeaderValue::from_static("close"));
      let response = self.send_once(&request).await?;
      let status = response.status_code();
      let should_redirect = matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
          | StatusCode::FOUND
          | StatusCode::SEE_OTHER
          | StatusCode::TEMPORARY_REDIRECT
          | StatusCode::PERMANENT_REDIRECT
      );
      if !should_redirect {
        return Ok(response);
      }
      let next = match response
        .headers()
        .get(http::header::LOCATION)
        .and_then(|loc| resolve_location(request.uri(), loc))
      {
        Some(next) => next,
        None => return Ok(response),
      };
      previous.push(request.uri().clone());
      match self.inner.redirect_policy.check(status, &next, &previous) {
        Action::Follow => {
          if matches!(
            status,
            StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER
          ) {
            for header in &[
              http::header::TRANSFER_ENCODING,
              http::header::CONTENT_ENCODING,
              http::header::CONTENT_TYPE,
              http::header::CONTENT_LENGTH,
            ] {
              request.headers_mut().remove(header);
            }
            match request.method() {
              &Method::GET | &Method::HEAD => {}
              _ => {
                *request.method_mut() = Method::GET;
              }
            }
            request.body_mut().take();
          }
          remove_sensitive_headers(request.headers_mut(), &next, &previous);
          request.headers_mut().remove(http::header::HOST);
          *request.uri_mut() = next;
        }
        Action::Stop => return Ok(response),
      }
    }
  }

  async fn send_once(&self, request: &Request) -> Result<Response> {
    let mut socket = self.inner.connector.connect(request.uri()).await?;
    let absolute_form = self.inner.connector.proxy().is_some()
      && request.uri().scheme_str() != Some("https");
    let raw = if absolute_form {
      let mut request = request.clone();
      if let Some(auth) = self.inner.connector.proxy().and_then(Proxy::basic_auth) {
        request
          .headers_mut()
          .insert(http::header::PROXY_AUTHORIZATION, auth.clone());
      }
      request.to_raw(true)
    } else {
      request.to_raw(false)
    };
    socket.write_all(&raw).await?;
    socket.flush().await?;
    let reader = BufReader::new(socket);
    let mut response = ResponseBuilder::new(reader, request.method().clone())
      .build()
      .await?;
    *response.uri_mut() = request.uri().clone();
    Ok(response)
  }
}

fn resolve_location(base: &http::Uri, location: &HeaderValue) -> Option<http::Uri> {
  let location = location.to_str().ok()?;
  if location.starts_with("http://") || location.starts_with("https://") {
    return location.parse().ok();
  }
  if location.starts_with('/') {
    let mut builder = http::Uri::builder();
    if let Some(scheme) = base.scheme_str() {
      builder = builder.scheme(scheme);
    }
    if let Some(authority) = base.authority() {
      builder = builder.authority(authority.as_str());
    }
    return builder.path_and_query(location).build().ok();
  }
  None
}

/// A `ClientBuilder` can be used to create a `Client` with custom
/// configuration.
///
/// # Example
///
/// ```
/// # fn run() -> Result<(), courier::Error> {
/// use std::time::Duration;
///
/// let client = courier::Client::builder()
///     .timeout(Some(Duration::from_secs(10)))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[must_use]
#[derive(Clone, Debug, Default)]
pub struct ClientBuilder {
  config: Config,
}

impl ClientBuilder {
  /// Returns a `Client` that uses this `ClientBuilder` configuration.
  ///
  /// # Errors
  ///
  /// This method fails if the TLS backend cannot be initialized.
  pub fn build(self) -> Result<Client> {
    let config = self.config;
    let connector = ConnectorBuilder::default()
      .proxy(config.proxy)
      .connect_timeout(config.connect_timeout)
      .nodelay(config.nodelay)
      .certs_verification(config.certs_verification)
      .build()?;
    Ok(Client {
      inner: Arc::new(ClientRef {
        timeout: config.timeout,
        connector,
        redirect_policy: config.redirect_policy,
        headers: config.headers,
      }),
    })
  }
  /// Sets the `User-Agent` header to be used by this client.
  pub fn user_agent<V>(mut self, value: V) -> ClientBuilder
  where
    V: Into<HeaderValue>,
  {
    self
      .config
      .headers
      .insert(http::header::USER_AGENT, value.into());
    self
  }
  /// Sets the default headers for every request.
  pub fn default_headers(mut self, headers: HeaderMap) -> ClientBuilder {
    for (key, value) in headers.iter() {
      self.config.headers.insert(key, value.clone());
    }
    self
  }
  /// Set a `redirect::Policy` for this client.
  ///
  /// Default will follow redirects up to a maximum of 10.
  pub fn redirect(mut self, policy: Policy) -> ClientBuilder {
    self.config.redirect_policy = policy;
    self
  }
  /// Add a `Proxy` to the list of proxies the `Client` will use.
  pub fn proxy(mut self, proxy: Proxy) -> ClientBuilder {
    self.config.proxy = Some(proxy);
    self
  }
  /// Set a total timeout for each request issued by this `Client`.
  ///
  /// Default is 30 seconds.
  ///
  /// Pass `None` to disable the timeout.
  pub fn timeout(mut self, timeout: Option<Duration>) -> ClientBuilder {
    self.config.timeout = timeout;
    self
  }
  /// Set a timeout for only the connect phase of a `Client`.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ClientBuilder {
    self.config.connect_timeout = timeout;
    self
  }
  /// Set whether sockets have `TCP_NODELAY` enabled.
  ///
  /// Default is `false`.
  pub fn tcp_nodelay(mut self, enabled: bool) -> ClientBuilder {
    self.config.nodelay = enabled;
    self
  }
  /// Controls the use of certificate validation.
  ///
  /// Defaults to `false`.
  ///
  /// # Warning
  ///
  /// You should think very carefully before using this method. If invalid
  /// certificates are trusted, *any* certificate for *any* site will be
  /// trusted for use. This includes expired certificates.
  pub fn danger_accept_invalid_certs(mut self, accept_invalid_certs: bool) -> ClientBuilder {
    self.config.certs_verification = !accept_invalid_certs;
    self
  }
}

#[derive(Clone)]
struct Config {
  timeout: Option<Duration>,
  connect_timeout: Option<Duration>,
  headers: HeaderMap,
  proxy: Option<Proxy>,
  nodelay: bool,
  certs_verification: bool,
  redirect_policy: Policy,
}

impl Debug for Config {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Config")
      .field("timeout", &self.timeout)
      .field("connect_timeout", &self.connect_timeout)
      .field("headers", &self.headers)
      .field("proxy", &self.proxy)
      .field("nodelay", &self.nodelay)
      .field("certs_verification", &self.certs_verification)
      .field("redirect_policy", &self.redirect_policy)
      .finish()
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      timeout: Some(Duration::from_secs(30)),
      connect_timeout: Some(Duration::from_secs(10)),
      headers: Default::default(),
      proxy: None,
      nodelay: false,
      certs_verification: true,
      redirect_policy: Policy::default(),
    }
  }
}

struct ClientRef {
  timeout: Option<Duration>,
  connector: Connector,
  redirect_policy: Policy,
  headers: HeaderMap,
}
