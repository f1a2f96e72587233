//! WebSocket frame codec
//!
//! Encodes and decodes single RFC 6455 section 5.2 frames. The relay reads
//! one fragment at a time off a buffered stream, hands it to the installed
//! handler, and re-encodes the result for the peer. Masking is applied and
//! removed here, so handlers always see the plain application payload.

use crate::error::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const FINAL_BIT: u8 = 0x80;
const RSV1_BIT: u8 = 0x40;
const RSV2_BIT: u8 = 0x20;
const RSV3_BIT: u8 = 0x10;
const MASK_BIT: u8 = 0x80;

/// Continuation of a fragmented message.
pub const CONTINUATION_FRAME: u8 = 0;
/// Text data message, payload is UTF-8 encoded text.
pub const TEXT_MESSAGE: u8 = 1;
/// Binary data message.
pub const BINARY_MESSAGE: u8 = 2;
/// Close control message.
pub const CLOSE_MESSAGE: u8 = 8;
/// Ping control message.
pub const PING_MESSAGE: u8 = 9;
/// Pong control message.
pub const PONG_MESSAGE: u8 = 10;

/// One WebSocket frame as per RFC 6455 section 5.2.
///
/// `data` always holds the unmasked application payload; the mask, when
/// present on the wire, is removed during decoding and re-applied during
/// encoding. A handler that rewrites `data` is responsible for keeping
/// `payload_length` equal to `data.len()`; the encoder does not reconcile
/// the two.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebsocketFragment {
  /// Final fragment of the message
  pub fin: bool,
  /// Reserved bit 1
  pub rsv1: bool,
  /// Reserved bit 2
  pub rsv2: bool,
  /// Reserved bit 3
  pub rsv3: bool,
  /// Opcode, low 4 bits significant; values outside the named constants
  /// pass through unvalidated
  pub opcode: u8,
  /// Whether the payload is masked on the wire
  pub masked: bool,
  /// Declared payload length
  pub payload_length: u64,
  /// Masking key; exactly 4 bytes are meaningful when `masked`, an
  /// all-zero key is reported for unmasked frames
  pub masking_key: Vec<u8>,
  /// Unmasked application payload
  pub data: Vec<u8>,
}

impl WebsocketFragment {
  /// Encode this fragment and deliver it to `sink` in a single write.
  ///
  /// A masked fragment whose key is not exactly 4 bytes fails with
  /// [`Error::InvalidMaskKeyLength`] before anything reaches the sink.
  pub async fn write_to<W>(&self, sink: &mut W) -> Result<()>
  where
    W: AsyncWrite + Unpin,
  {
    let mut wire = Vec::with_capacity(14 + self.data.len());
    let mut first = 0u8;
    if self.fin {
      first |= FINAL_BIT;
    }
    if self.rsv1 {
      first |= RSV1_BIT;
    }
    if self.rsv2 {
      first |= RSV2_BIT;
    }
    if self.rsv3 {
      first |= RSV3_BIT;
    }
    first |= self.opcode & 0x0F;
    wire.push(first);

    let mut second = 0u8;
    if self.masked {
      second |= MASK_BIT;
    }
    if self.payload_length < 126 {
      wire.push(second | self.payload_length as u8);
    } else if self.payload_length < 65536 {
      wire.push(second | 126);
      wire.extend_from_slice(&(self.payload_length as u16).to_be_bytes());
    } else {
      wire.push(second | 127);
      wire.extend_from_slice(&self.payload_length.to_be_bytes());
    }

    if self.masked {
      if self.masking_key.len() != 4 {
        return Err(Error::InvalidMaskKeyLength);
      }
      wire.extend_from_slice(&self.masking_key);
      wire.extend_from_slice(&xor_mask(&self.data, &self.masking_key));
    } else {
      wire.extend_from_slice(&self.data);
    }

    sink.write_all(&wire).await?;
    Ok(())
  }

  /// Decode a single fragment from a buffered byte source.
  ///
  /// Short reads surface as `Io` errors with `ErrorKind::UnexpectedEof`.
  /// `max_payload` optionally bounds the payload allocation; `None` allows
  /// any declared length.
  pub async fn read_from<R>(source: &mut R, max_payload: Option<u64>) -> Result<Self>
  where
    R: AsyncRead + Unpin,
  {
    let first = source.read_u8().await?;
    let mut fragment = WebsocketFragment {
      fin: first & FINAL_BIT != 0,
      rsv1: first & RSV1_BIT != 0,
      rsv2: first & RSV2_BIT != 0,
      rsv3: first & RSV3_BIT != 0,
      opcode: first & 0x0F,
      ..Default::default()
    };

    let second = source.read_u8().await?;
    fragment.masked = second & MASK_BIT != 0;
    fragment.payload_length = match second & 0x7F {
      126 => {
        let mut len = [0u8; 2];
        source.read_exact(&mut len).await?;
        u16::from_be_bytes(len) as u64
      }
      127 => {
        let mut len = [0u8; 8];
        source.read_exact(&mut len).await?;
        u64::from_be_bytes(len)
      }
      short => short as u64,
    };
    if let Some(max) = max_payload {
      if fragment.payload_length > max {
        return Err(Error::frame_error(format!(
          "payload length {} exceeds the configured maximum {}",
          fragment.payload_length, max
        )));
      }
    }

    let mut key = [0u8; 4];
    if fragment.masked {
      source.read_exact(&mut key).await?;
    }
    fragment.masking_key = key.to_vec();

    let mut data = vec![0u8; fragment.payload_length as usize];
    source.read_exact(&mut data).await?;
    fragment.data = if fragment.masked {
      xor_mask(&data, &key)
    } else {
      data
    };
    Ok(fragment)
  }
}

/// XOR the payload with the masking key cycled modulo its length.
///
/// Masking is an involution: applying it twice with the same key restores
/// the input.
fn xor_mask(data: &[u8], key: &[u8]) -> Vec<u8> {
  data
    .iter()
    .enumerate()
    .map(|(i, b)| b ^ key[i % key.len()])
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::BufReader;

  fn sample_fragment() -> WebsocketFragment {
    WebsocketFragment {
      fin: true,
      opcode: BINARY_MESSAGE,
      masked: true,
      payload_length: 11,
      masking_key: vec![0x1A, 0x2B, 0x3C, 0x4D],
      data: b"hello world".to_vec(),
      ..Default::default()
    }
  }

  const SAMPLE_WIRE: &[u8] = &[
    0x82, 0x8B, 0x1A, 0x2B, 0x3C, 0x4D, 0x72, 0x4E, 0x50, 0x21, 0x75, 0x0B, 0x4B, 0x22, 0x68,
    0x47, 0x58,
  ];

  #[tokio::test]
  async fn encode_masked_binary() {
    let mut wire = Vec::new();
    sample_fragment().write_to(&mut wire).await.unwrap();
    assert_eq!(wire, SAMPLE_WIRE);
  }

  #[tokio::test]
  async fn decode_masked_binary() {
    let mut reader = BufReader::new(SAMPLE_WIRE);
    let fragment = WebsocketFragment::read_from(&mut reader, None)
      .await
      .unwrap();
    assert_eq!(fragment, sample_fragment());
    assert_eq!(fragment.data, b"hello world");
  }

  #[tokio::test]
  async fn wire_round_trip_is_identity() {
    let mut reader = BufReader::new(SAMPLE_WIRE);
    let fragment = WebsocketFragment::read_from(&mut reader, None)
      .await
      .unwrap();
    let mut wire = Vec::new();
    fragment.write_to(&mut wire).await.unwrap();
    assert_eq!(wire, SAMPLE_WIRE);
  }

  #[tokio::test]
  async fn unmasked_round_trip() {
    let fragment = WebsocketFragment {
      fin: true,
      opcode: TEXT_MESSAGE,
      payload_length: 3,
      data: b"abc".to_vec(),
      ..Default::default()
    };
    let mut wire = Vec::new();
    fragment.write_to(&mut wire).await.unwrap();
    assert_eq!(&wire[..2], &[0x81, 0x03]);
    let decoded = WebsocketFragment::read_from(&mut BufReader::new(&wire[..]), None)
      .await
      .unwrap();
    assert_eq!(decoded.data, fragment.data);
    assert_eq!(decoded.masking_key, vec![0, 0, 0, 0]);
    assert!(!decoded.masked);
  }

  #[tokio::test]
  async fn length_encoding_boundaries() {
    for (len, header_len, marker) in [
      (125u64, 2usize, 125u8),
      (126, 4, 126),
      (65535, 4, 126),
      (65536, 10, 127),
    ] {
      let fragment = WebsocketFragment {
        fin: true,
        opcode: BINARY_MESSAGE,
        payload_length: len,
        data: vec![0xAA; len as usize],
        ..Default::default()
      };
      let mut wire = Vec::new();
      fragment.write_to(&mut wire).await.unwrap();
      assert_eq!(wire[1] & 0x7F, marker, "marker for length {}", len);
      assert_eq!(wire.len(), header_len + len as usize, "length {}", len);
      let decoded = WebsocketFragment::read_from(&mut BufReader::new(&wire[..]), None)
        .await
        .unwrap();
      assert_eq!(decoded.payload_length, len);
      assert_eq!(decoded.data.len(), len as usize);
    }
  }

  #[tokio::test]
  async fn sixteen_bit_boundary_header() {
    // 82 7E 00 7E <126 bytes>
    let mut wire = vec![0x82, 0x7E, 0x00, 0x7E];
    wire.extend(std::iter::repeat(0x55).take(126));
    let fragment = WebsocketFragment::read_from(&mut BufReader::new(&wire[..]), None)
      .await
      .unwrap();
    assert!(fragment.fin);
    assert_eq!(fragment.opcode, BINARY_MESSAGE);
    assert!(!fragment.masked);
    assert_eq!(fragment.payload_length, 126);
  }

  #[tokio::test]
  async fn bad_mask_key_writes_nothing() {
    let fragment = WebsocketFragment {
      fin: true,
      opcode: BINARY_MESSAGE,
      masked: true,
      payload_length: 2,
      masking_key: vec![0x01, 0x02, 0x03],
      data: vec![0x00, 0x00],
      ..Default::default()
    };
    let mut wire = Vec::new();
    let err = fragment.write_to(&mut wire).await.unwrap_err();
    assert!(matches!(err, Error::InvalidMaskKeyLength));
    assert!(wire.is_empty());
  }

  #[tokio::test]
  async fn truncated_frame_is_unexpected_eof() {
    let wire = [0x82u8, 0x85, 0x01, 0x02, 0x03, 0x04, 0xFF];
    let err = WebsocketFragment::read_from(&mut BufReader::new(&wire[..]), None)
      .await
      .unwrap_err();
    match err {
      Error::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
      other => panic!("unexpected error: {other:?}"),
    }
  }

  #[tokio::test]
  async fn payload_bound_is_enforced() {
    let wire = [0x82u8, 0x7E, 0x40, 0x00];
    let err = WebsocketFragment::read_from(&mut BufReader::new(&wire[..]), Some(1024))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Frame(_)));
  }

  #[test]
  fn masking_is_an_involution() {
    let key = [0x1A, 0x2B, 0x3C, 0x4D];
    let data = b"some application payload".to_vec();
    let once = xor_mask(&data, &key);
    assert_ne!(once, data);
    assert_eq!(xor_mask(&once, &key), data);
  }
}
