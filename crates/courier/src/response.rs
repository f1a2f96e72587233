use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::body::Body;
use crate::errors::{new_io_error, Error, Result};
use crate::{COLON_SPACE, CR_LF, SPACE};
use bytes::Bytes;
use http::{Method, Response as HttpResponse};

/// A Response to a submitted `Request`.
#[derive(Debug, Default, Clone)]
pub struct Response {
  version: http::Version,
  uri: http::Uri,
  status_code: http::StatusCode,
  headers: http::HeaderMap<http::HeaderValue>,
  body: Option<Body>,
}

impl PartialEq for Response {
  fn eq(&self, other: &Self) -> bool {
    self.version == other.version
      && self.status_code == other.status_code
      && self.headers == other.headers
      && self.body == other.body
  }
}

impl<T> From<HttpResponse<T>> for Response
where
  T: Into<Body>,
{
  fn from(value: HttpResponse<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      version: parts.version,
      uri: Default::default(),
      status_code: parts.status,
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Response {
  /// Serialize the response to its HTTP/1.1 wire form.
  pub fn to_raw(&self) -> Bytes {
    let mut wire = Vec::new();
    wire.extend(format!("{:?}", self.version).as_bytes());
    wire.extend(SPACE);
    wire.extend(format!("{}", self.status_code).as_bytes());
    wire.extend(CR_LF);
    for (k, v) in self.headers.iter() {
      wire.extend(k.as_str().as_bytes());
      wire.extend(COLON_SPACE);
      wire.extend(v.as_bytes());
      wire.extend(CR_LF);
    }
    wire.extend(CR_LF);
    if let Some(b) = self.body() {
      if !b.is_empty() {
        wire.extend(b.as_ref());
      }
    }
    Bytes::from(wire)
  }
  /// An HTTP response builder.
  pub fn builder() -> http::response::Builder {
    http::response::Builder::new()
  }
}

impl Response {
  /// Get the `StatusCode` of this `Response`.
  #[inline]
  pub fn status_code(&self) -> http::StatusCode {
    self.status_code
  }
  /// Get the HTTP `Version` of this `Response`.
  #[inline]
  pub fn version(&self) -> http::Version {
    self.version
  }
  /// Get the `Headers` of this `Response`.
  #[inline]
  pub fn headers(&self) -> &http::HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the `Headers` of this `Response`.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut http::HeaderMap {
    &mut self.headers
  }
  /// Get the content-length of the response, if it is known.
  pub fn content_length(&self) -> Option<u64> {
    self
      .headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.parse().ok())
  }
  /// Get the `http::Uri` this `Response` was fetched from.
  #[inline]
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }
  #[inline]
  pub(crate) fn uri_mut(&mut self) -> &mut http::Uri {
    &mut self.uri
  }
  /// Get the full response body.
  pub fn body(&self) -> &Option<Body> {
    &self.body
  }
  /// Get a mutable reference to the response body.
  pub fn body_mut(&mut self) -> &mut Option<Body> {
    &mut self.body
  }
  /// Get the response body decoded as UTF-8 text.
  pub fn text(&self) -> String {
    String::from_utf8_lossy(self.body.clone().unwrap_or_default().as_ref()).to_string()
  }
}

/// A builder that parses a `Response` off a buffered reader.
///
/// To construct a `ResponseBuilder`, refer to the `Client` documentation.
#[derive(Debug)]
pub struct ResponseBuilder<T: AsyncRead + AsyncReadExt> {
  builder: http::response::Builder,
  reader: BufReader<T>,
  method: Method,
}

impl<T: AsyncRead + Unpin + Sized> ResponseBuilder<T> {
  /// Constructs a new response builder reading for the given request method.
  pub fn new(reader: BufReader<T>, method: Method) -> ResponseBuilder<T> {
    ResponseBuilder {
      builder: Default::default(),
      reader,
      method,
    }
  }

  async fn parser_version(&mut self) -> Result<(http::Version, http::StatusCode)> {
    let mut line = Vec::new();
    self.reader.read_until(b'\n', &mut line).await?;
    let line = line
      .strip_suffix(CR_LF)
      .or_else(|| line.strip_suffix(b"\n"))
      .unwrap_or(&line);
    let mut parts = line.splitn(3, |b| b == &b' ');
    let version = match parts.next() {
      Some(b"HTTP/0.9") => http::Version::HTTP_09,
      Some(b"HTTP/1.0") => http::Version::HTTP_10,
      Some(b"HTTP/1.1") => http::Version::HTTP_11,
      Some(b"HTTP/2.0") => http::Version::HTTP_2,
      Some(b"HTTP/3.0") => http::Version::HTTP_3,
      _ => {
        return Err(new_io_error(
          std::io::ErrorKind::InvalidData,
          "invalid http version",
        ));
      }
    };
    let status_code = parts
      .next()
      .filter(|vc| !vc.is_empty())
      .ok_or_else(|| new_io_error(std::io::ErrorKind::InvalidData, "missing status code"))
      .and_then(|vc| {
        http::StatusCode::try_from(vc).map_err(|x| Error::Http(http::Error::from(x)))
      })?;
    Ok((version, status_code))
  }

  async fn read_headers(&mut self) -> http::HeaderMap {
    let mut headers = http::HeaderMap::new();
    let mut header_line = Vec::new();
    while let Ok(length) = self.reader.read_until(b'\n', &mut header_line).await {
      if length == 0 || header_line == b"\r\n" {
        break;
      }
      if let Ok((Some(k), Some(v))) = parser_headers(&header_line) {
        if headers.contains_key(&k) {
          headers.append(k, v);
        } else {
          headers.insert(k, v);
        }
      };
      header_line.clear();
    }
    headers
  }

  async fn read_body(&mut self, header: &http::HeaderMap) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    if matches!(self.method, Method::HEAD) {
      return Ok(body);
    }
    let chunked = header
      .get(http::header::TRANSFER_ENCODING)
      .map(|te| te == "chunked")
      .unwrap_or(false);
    if chunked {
      return self.read_chunked_body().await;
    }
    let content_length: Option<u64> = header
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.parse().ok());
    match content_length {
      Some(length) => {
        body.resize(length as usize, 0);
        self.reader.read_exact(&mut body).await?;
      }
      None => {
        self.reader.read_to_end(&mut body).await?;
      }
    }
    Ok(body)
  }

  async fn read_chunked_body(&mut self) -> Result<Vec<u8>> {
    let mut body: Vec<u8> = Vec::new();
    loop {
      let mut size_line = Vec::new();
      self.reader.read_until(b'\n', &mut size_line).await?;
      let size_line = size_line
        .strip_suffix(CR_LF)
        .or_else(|| size_line.strip_suffix(b"\n"))
        .unwrap_or(&size_line);
      let size_text = std::str::from_utf8(size_line)
        .map_err(|_| new_io_error(std::io::ErrorKind::InvalidData, "invalid chunk size"))?
        .trim();
      if size_text.is_empty() {
        continue;
      }
      let size = usize::from_str_radix(size_text, 16)?;
      if size == 0 {
        // trailing CRLF after the last chunk
        let mut trailer = Vec::new();
        self.reader.read_until(b'\n', &mut trailer).await.ok();
        break;
      }
      let mut chunk = vec![0; size];
      self.reader.read_exact(&mut chunk).await?;
      body.append(&mut chunk);
      let mut crlf = [0; 2];
      self.reader.read_exact(&mut crlf).await?;
    }
    Ok(body)
  }

  /// Read and assemble the complete `Response`.
  pub async fn build(mut self) -> Result<Response> {
    let (v, c) = self.parser_version().await?;
    self.builder = self.builder.version(v).status(c);
    let header = self.read_headers().await;
    let body = self.read_body(&header).await?;
    if let Some(h) = self.builder.headers_mut() {
      *h = header;
    }
    let resp = self.builder.body(body)?;
    Ok(resp.into())
  }
}

pub(crate) fn parser_headers(
  buffer: &[u8],
) -> Result<(Option<http::HeaderName>, Option<http::HeaderValue>)> {
  let mut k = None;
  let mut v = None;
  let buffer = buffer
    .strip_suffix(CR_LF)
    .or_else(|| buffer.strip_suffix(b"\n"))
    .unwrap_or(buffer);
  for (index, h) in buffer.splitn(2, |s| s == &58).enumerate() {
    let h = h.strip_prefix(SPACE).unwrap_or(h);
    match index {
      0 => match http::HeaderName::from_bytes(h) {
        Ok(hk) => k = Some(hk),
        Err(err) => {
          return Err(Error::Http(http::Error::from(err)));
        }
      },
      1 => match http::HeaderValue::from_bytes(h) {
        Ok(hv) => v = Some(hv),
        Err(err) => {
          return Err(Error::Http(http::Error::from(err)));
        }
      },
      _ => {}
    }
  }
  Ok((k, v))
}

#[cfg(test)]
mod tests {
  use super::*;

  async fn parse(raw: &[u8], method: Method) -> Response {
    ResponseBuilder::new(BufReader::new(raw), method)
      .build()
      .await
      .unwrap()
  }

  #[tokio::test]
  async fn content_length_body() {
    let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
    let resp = parse(raw, Method::GET).await;
    assert_eq!(resp.status_code(), http::StatusCode::OK);
    assert_eq!(resp.text(), "hello");
  }

  #[tokio::test]
  async fn chunked_body() {
    let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
    let resp = parse(raw, Method::GET).await;
    assert_eq!(resp.text(), "hello world");
  }

  #[tokio::test]
  async fn body_until_eof() {
    let raw = b"HTTP/1.0 200 OK\r\n\r\nstream until close";
    let resp = parse(raw, Method::GET).await;
    assert_eq!(resp.version(), http::Version::HTTP_10);
    assert_eq!(resp.text(), "stream until close");
  }

  #[tokio::test]
  async fn head_has_no_body() {
    let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n";
    let resp = parse(raw, Method::HEAD).await;
    assert!(resp.body().is_none());
  }

  #[tokio::test]
  async fn status_without_reason() {
    let raw = b"HTTP/1.1 404\r\n\r\n";
    let resp = parse(raw, Method::GET).await;
    assert_eq!(resp.status_code(), http::StatusCode::NOT_FOUND);
  }

  #[test]
  fn raw_round_trip_shape() {
    let resp: Response = http::Response::builder()
      .status(500)
      .header("content-type", "text/plain")
      .body("oops")
      .unwrap()
      .into();
    let raw = String::from_utf8(resp.to_raw().to_vec()).unwrap();
    assert!(raw.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(raw.ends_with("\r\n\r\noops"));
  }
}
