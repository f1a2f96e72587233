use std::io::Error;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// A connected transport stream, either plain TCP or client-side TLS.
pub enum Socket {
  /// TCP
  Tcp(TcpStream),
  /// TLS over TCP
  Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Socket {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      Socket::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      Socket::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for Socket {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      Socket::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      Socket::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      Socket::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      Socket::Tls(stream) => Pin::new(stream).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      Socket::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      Socket::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
    }
  }
}
