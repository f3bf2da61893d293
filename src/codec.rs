// Wire codec for the mediator protocol - separates framing from the message
// model.
//
// Every message travels as one packet: a 16-byte zero-padded ASCII decimal
// length, a single ASCII type digit, and exactly `length` bytes of
// LZ4-frame-compressed content. The decoder therefore consumes exactly
// `length + 17` bytes per message and never needs to scan for delimiters,
// which keeps it binary-safe and lets it allocate the body buffer up front.

use crate::message::{LENGTH_FIELD_SIZE, MAX_CONTENT_SIZE, Message, MessageType};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{Read, Write};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::time::timeout;

/// Codec errors with enough context to tell a malformed peer from a dead one.
///
/// A read timeout is deliberately *not* represented here: the read layer
/// retries timeouts silently and only surfaces the conditions below.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("length field is not a zero-padded decimal: {0:?}")]
    BadLength(String),

    #[error("unknown message type digit: {0:#x}")]
    BadType(u8),

    #[error("frame of {len} bytes exceeds the limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("compression failed: {0}")]
    Compress(String),

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("stream ended in the middle of a frame")]
    TruncatedFrame,

    #[error("stream closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Whether this error describes a malformed peer rather than a transport
    /// failure. Protocol errors crash the offending connection only.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            CodecError::BadLength(_)
                | CodecError::BadType(_)
                | CodecError::FrameTooLarge { .. }
                | CodecError::Decompress(_)
                | CodecError::TruncatedFrame
        )
    }
}

/// Encode a message into one wire packet.
///
/// Encoding is deterministic: the LZ4 frame compressor is pure, so equal
/// messages produce equal packets.
pub fn encode(message: &Message) -> Result<Bytes, CodecError> {
    let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
    encoder
        .write_all(message.content())
        .map_err(|e| CodecError::Compress(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| CodecError::Compress(e.to_string()))?;

    if compressed.len() as u64 >= MAX_CONTENT_SIZE {
        return Err(CodecError::FrameTooLarge {
            len: compressed.len(),
            max: MAX_CONTENT_SIZE as usize,
        });
    }

    let mut buf = BytesMut::with_capacity(LENGTH_FIELD_SIZE + 1 + compressed.len());
    buf.put_slice(format!("{:016}", compressed.len()).as_bytes());
    buf.put_u8(message.kind().digit());
    buf.put_slice(&compressed);
    Ok(buf.freeze())
}

/// Reads framed messages off a byte stream with buffering.
#[derive(Debug)]
pub struct MessageReader<R> {
    inner: BufReader<R>,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(stream: R, max_frame_len: usize) -> MessageReader<R> {
        MessageReader {
            inner: BufReader::new(stream),
            max_frame_len,
        }
    }

    /// Wait up to `idle` for the start of the next frame.
    ///
    /// Returns `Ok(None)` when the wait elapsed with no data, so callers can
    /// re-check their run flag and come back. Once the first byte of a frame
    /// is visible the whole frame is read without interruption; a stream that
    /// ends cleanly between frames yields [`CodecError::Closed`], while one
    /// that ends inside a frame yields [`CodecError::TruncatedFrame`].
    pub async fn poll_frame(&mut self, idle: Duration) -> Result<Option<Message>, CodecError> {
        let has_data = match timeout(idle, self.inner.fill_buf()).await {
            Err(_) => return Ok(None),
            Ok(Ok(buf)) => !buf.is_empty(),
            Ok(Err(e)) => return Err(e.into()),
        };
        if !has_data {
            return Err(CodecError::Closed);
        }
        self.read_frame().await.map(Some)
    }

    /// Read one complete frame: three exact reads (16, 1, LENGTH) followed by
    /// decompression of the body.
    pub async fn read_frame(&mut self) -> Result<Message, CodecError> {
        let mut header = [0u8; LENGTH_FIELD_SIZE];
        read_exact_frame(&mut self.inner, &mut header).await?;
        let len = parse_length(&header)?;
        if len > self.max_frame_len {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        let mut type_digit = [0u8; 1];
        read_exact_frame(&mut self.inner, &mut type_digit).await?;
        let kind = MessageType::try_from(type_digit[0])
            .map_err(|_| CodecError::BadType(type_digit[0]))?;

        let mut body = vec![0u8; len];
        read_exact_frame(&mut self.inner, &mut body).await?;

        let mut content = Vec::new();
        lz4_flex::frame::FrameDecoder::new(&body[..])
            .read_to_end(&mut content)
            .map_err(|e| CodecError::Decompress(e.to_string()))?;

        Message::new(kind, content).map_err(|e| CodecError::Decompress(e.to_string()))
    }
}

/// `read_exact` that reports EOF inside a frame as [`CodecError::TruncatedFrame`].
async fn read_exact_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), CodecError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(CodecError::TruncatedFrame),
        Err(e) => Err(e.into()),
    }
}

fn parse_length(field: &[u8; LENGTH_FIELD_SIZE]) -> Result<usize, CodecError> {
    if !field.iter().all(u8::is_ascii_digit) {
        return Err(CodecError::BadLength(
            String::from_utf8_lossy(field).into_owned(),
        ));
    }
    // Sixteen decimal digits always fit in a u64.
    let mut len = 0u64;
    for digit in field {
        len = len * 10 + u64::from(digit - b'0');
    }
    Ok(len as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const MAX: usize = 16 * 1024 * 1024;

    async fn decode_all(bytes: &[u8]) -> Result<Message, CodecError> {
        let mut reader = MessageReader::new(Cursor::new(bytes.to_vec()), MAX);
        reader.read_frame().await
    }

    #[tokio::test]
    async fn test_round_trip_identity() {
        let original = Message::text(MessageType::ServerInteraction, "generate-token:mouse");
        let packet = encode(&original).unwrap();
        let decoded = decode_all(&packet).await.unwrap();
        assert_eq!(decoded, original);
    }

    #[tokio::test]
    async fn test_round_trip_binary_content() {
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let original = Message::new(MessageType::ControllerFrame, payload.clone()).unwrap();
        let packet = encode(&original).unwrap();
        let decoded = decode_all(&packet).await.unwrap();
        assert_eq!(decoded.content().as_ref(), payload.as_slice());
        assert_eq!(decoded.kind(), MessageType::ControllerFrame);
    }

    #[tokio::test]
    async fn test_packet_is_exactly_length_plus_header() {
        let msg = Message::text(MessageType::ControlledFrame, "Message received");
        let packet = encode(&msg).unwrap();
        let declared: usize = std::str::from_utf8(&packet[..LENGTH_FIELD_SIZE])
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(packet.len(), declared + LENGTH_FIELD_SIZE + 1);
    }

    #[tokio::test]
    async fn test_bad_length_field_rejected() {
        let mut packet = encode(&Message::text(MessageType::ServerInteraction, "x"))
            .unwrap()
            .to_vec();
        packet[3] = b'q';
        assert!(matches!(
            decode_all(&packet).await,
            Err(CodecError::BadLength(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_type_digit_rejected() {
        let mut packet = encode(&Message::text(MessageType::ServerInteraction, "x"))
            .unwrap()
            .to_vec();
        packet[LENGTH_FIELD_SIZE] = b'9';
        assert!(matches!(
            decode_all(&packet).await,
            Err(CodecError::BadType(b'9'))
        ));
    }

    #[tokio::test]
    async fn test_truncated_body_rejected() {
        let packet = encode(&Message::text(MessageType::ServerInteraction, "ready")).unwrap();
        let truncated = &packet[..packet.len() - 2];
        assert!(matches!(
            decode_all(truncated).await,
            Err(CodecError::TruncatedFrame)
        ));
    }

    #[tokio::test]
    async fn test_garbage_body_fails_decompression() {
        let body = b"definitely not an lz4 frame";
        let mut packet = Vec::new();
        packet.extend_from_slice(format!("{:016}", body.len()).as_bytes());
        packet.push(b'1');
        packet.extend_from_slice(body);
        assert!(matches!(
            decode_all(&packet).await,
            Err(CodecError::Decompress(_))
        ));
    }

    #[tokio::test]
    async fn test_frame_over_limit_rejected() {
        let packet = encode(&Message::text(MessageType::ServerInteraction, "ready")).unwrap();
        let mut reader = MessageReader::new(Cursor::new(packet.to_vec()), 4);
        assert!(matches!(
            reader.read_frame().await,
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_poll_frame_times_out_quietly() {
        // A duplex pipe with no data: poll must return None, not an error.
        let (client, _server) = tokio::io::duplex(64);
        let mut reader = MessageReader::new(client, MAX);
        let polled = reader.poll_frame(Duration::from_millis(20)).await.unwrap();
        assert!(polled.is_none());
    }

    #[tokio::test]
    async fn test_poll_frame_reports_clean_close() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let mut reader = MessageReader::new(client, MAX);
        assert!(matches!(
            reader.poll_frame(Duration::from_millis(20)).await,
            Err(CodecError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_two_frames_back_to_back() {
        let first = Message::text(MessageType::ServerInteraction, "ready");
        let second = Message::new(MessageType::ControllerFrame, vec![7u8; 100]).unwrap();
        let mut stream = encode(&first).unwrap().to_vec();
        stream.extend_from_slice(&encode(&second).unwrap());

        let mut reader = MessageReader::new(Cursor::new(stream), MAX);
        assert_eq!(reader.read_frame().await.unwrap(), first);
        assert_eq!(reader.read_frame().await.unwrap(), second);
    }
}
