//! RESP bulk-string framing for the Snapper wire protocol.
//!
//! Every JSON payload travels as a RESP bulk string:
//!
//! ```text
//! $<byte length>\r\n<payload>\r\n
//! ```
//!
//! The length prefix lets [`FrameDecoder`] buffer partial reads until a whole
//! frame is available. Two other RESP shapes may appear on the inbound side:
//! the null bulk string `$-1\r\n`, which is skipped, and an error line
//! `-<message>\r\n`, which is surfaced as [`Frame::Error`] without losing
//! synchronization. Anything else means the byte stream can no longer be
//! trusted and decoding fails with [`CodecError::Desync`].

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::Decoder;

/// Largest payload the decoder accepts (64 MiB).
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// `$` + an `i64` in decimal + `\r\n`.
const MAX_HEADER_LEN: usize = 24;

/// Longest `-<message>\r\n` error line the decoder accepts.
const MAX_ERROR_LINE_LEN: usize = 64 * 1024;

const CRLF: &[u8] = b"\r\n";

/// Errors produced while splitting the inbound byte stream into frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The stream is malformed and frame boundaries can no longer be found.
    #[error("frame stream out of sync: {0}")]
    Desync(String),

    /// Reading from the underlying stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One decoded unit of the inbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A bulk string payload (a JSON-RPC message).
    Payload(Bytes),
    /// A RESP error line sent by the server.
    Error(String),
}

/// Append `payload` to `dst` as a bulk string frame.
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) {
    let len = payload.len().to_string();
    dst.reserve(1 + len.len() + payload.len() + 2 * CRLF.len());
    dst.put_u8(b'$');
    dst.put_slice(len.as_bytes());
    dst.put_slice(CRLF);
    dst.put_slice(payload);
    dst.put_slice(CRLF);
}

/// Frame `payload` into a freshly allocated buffer.
pub fn frame(payload: &[u8]) -> Bytes {
    let mut dst = BytesMut::new();
    encode_frame(payload, &mut dst);
    dst.freeze()
}

#[derive(Debug, Clone, Copy, Default)]
enum State {
    /// Waiting for a complete `$<len>\r\n` or `-<msg>\r\n` line.
    #[default]
    Header,
    /// Header consumed; waiting for `len` payload bytes plus the trailer.
    Payload { len: usize },
}

/// Incremental decoder for the inbound frame stream.
///
/// Used with [`FramedRead`](tokio_util::codec::FramedRead) by the TCP
/// transport, and directly by tests.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    state: State,
}

impl FrameDecoder {
    /// Create a decoder positioned at a frame boundary.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        loop {
            match self.state {
                State::Header => {
                    let Some(&kind) = src.first() else {
                        return Ok(None);
                    };
                    match kind {
                        b'$' => {
                            let Some(end) = find_crlf(src, MAX_HEADER_LEN)? else {
                                return Ok(None);
                            };
                            let line = src.split_to(end + CRLF.len());
                            match parse_len(line.get(1..end).unwrap_or_default())? {
                                // Null bulk string: nothing to deliver.
                                None => continue,
                                Some(len) => {
                                    src.reserve(len + CRLF.len());
                                    self.state = State::Payload { len };
                                }
                            }
                        }
                        b'-' => {
                            let Some(end) = find_crlf(src, MAX_ERROR_LINE_LEN)? else {
                                return Ok(None);
                            };
                            let line = src.split_to(end + CRLF.len());
                            let message =
                                String::from_utf8_lossy(line.get(1..end).unwrap_or_default())
                                    .into_owned();
                            return Ok(Some(Frame::Error(message)));
                        }
                        other => {
                            return Err(CodecError::Desync(format!(
                                "unexpected frame type byte 0x{other:02x}"
                            )));
                        }
                    }
                }
                State::Payload { len } => {
                    if src.len() < len + CRLF.len() {
                        return Ok(None);
                    }
                    let mut chunk = src.split_to(len + CRLF.len());
                    if chunk.get(len..) != Some(CRLF) {
                        return Err(CodecError::Desync(
                            "bulk payload is not terminated by CRLF".into(),
                        ));
                    }
                    chunk.truncate(len);
                    self.state = State::Header;
                    return Ok(Some(Frame::Payload(chunk.freeze())));
                }
            }
        }
    }
}

/// Position of the first CRLF in `buf`, or `None` if more bytes are needed.
fn find_crlf(buf: &[u8], limit: usize) -> Result<Option<usize>, CodecError> {
    match buf.windows(CRLF.len()).position(|w| w == CRLF) {
        Some(pos) if pos + CRLF.len() <= limit => Ok(Some(pos)),
        Some(_) => Err(CodecError::Desync("header line too long".into())),
        None if buf.len() >= limit => Err(CodecError::Desync("header line too long".into())),
        None => Ok(None),
    }
}

/// Parse a bulk length. `Ok(None)` is the RESP null bulk string.
fn parse_len(digits: &[u8]) -> Result<Option<usize>, CodecError> {
    let text = std::str::from_utf8(digits)
        .map_err(|_| CodecError::Desync("bulk length is not ASCII".into()))?;
    let len: i64 = text
        .parse()
        .map_err(|_| CodecError::Desync(format!("invalid bulk length {text:?}")))?;
    match len {
        -1 => Ok(None),
        n if n < 0 => Err(CodecError::Desync(format!("negative bulk length {n}"))),
        n => {
            let n = usize::try_from(n)
                .map_err(|_| CodecError::Desync(format!("bulk length {n} out of range")))?;
            if n > MAX_FRAME_LEN {
                return Err(CodecError::Desync(format!(
                    "bulk length {n} exceeds maximum {MAX_FRAME_LEN}"
                )));
            }
            Ok(Some(n))
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut FrameDecoder, buf: &mut BytesMut) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode(buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn encodes_bulk_string() {
        assert_eq!(&frame(b"{}")[..], b"$2\r\n{}\r\n");
        assert_eq!(&frame(b"")[..], b"$0\r\n\r\n");
    }

    #[test]
    fn length_counts_bytes_not_chars() {
        let payload = "\"héllo\"".as_bytes();
        let framed = frame(payload);
        assert!(framed.starts_with(format!("${}\r\n", payload.len()).as_bytes()));

        let mut buf = BytesMut::from(&framed[..]);
        let frames = decode_all(&mut FrameDecoder::new(), &mut buf);
        assert_eq!(frames, vec![Frame::Payload(Bytes::copy_from_slice(payload))]);
    }

    #[test]
    fn decodes_several_frames_from_one_read() {
        let mut buf = BytesMut::new();
        encode_frame(b"first", &mut buf);
        encode_frame(b"second", &mut buf);

        let frames = decode_all(&mut FrameDecoder::new(), &mut buf);
        assert_eq!(
            frames,
            vec![
                Frame::Payload(Bytes::from_static(b"first")),
                Frame::Payload(Bytes::from_static(b"second")),
            ]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn buffers_partial_input_byte_by_byte() {
        let payload = br#"{"jsonrpc":"2.0","id":1,"result":"ok"}"#;
        let framed = frame(payload);
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        let mut out = Vec::new();

        for byte in framed.iter() {
            buf.put_u8(*byte);
            if let Some(frame) = decoder.decode(&mut buf).unwrap() {
                out.push(frame);
            }
        }

        assert_eq!(out.len(), 1);
        assert_eq!(out[0], Frame::Payload(Bytes::copy_from_slice(payload)));
    }

    #[test]
    fn skips_null_bulk_strings() {
        let mut buf = BytesMut::from(&b"$-1\r\n$2\r\nok\r\n"[..]);
        let frames = decode_all(&mut FrameDecoder::new(), &mut buf);
        assert_eq!(frames, vec![Frame::Payload(Bytes::from_static(b"ok"))]);
    }

    #[test]
    fn error_lines_keep_the_stream_in_sync() {
        let mut buf = BytesMut::from(&b"-ERR overloaded\r\n$2\r\nok\r\n"[..]);
        let frames = decode_all(&mut FrameDecoder::new(), &mut buf);
        assert_eq!(
            frames,
            vec![
                Frame::Error("ERR overloaded".into()),
                Frame::Payload(Bytes::from_static(b"ok")),
            ]
        );
    }

    #[test]
    fn unknown_type_byte_is_desync() {
        let mut buf = BytesMut::from(&b"*1\r\n"[..]);
        let err = FrameDecoder::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::Desync(_)));
    }

    #[test]
    fn missing_trailer_is_desync() {
        let mut buf = BytesMut::from(&b"$2\r\nokXX"[..]);
        let err = FrameDecoder::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::Desync(_)));
    }

    #[test]
    fn garbage_length_is_desync() {
        let headers: [&[u8]; 3] = [b"$abc\r\n", b"$-7\r\n", b"$99999999999\r\n"];
        for header in headers {
            let mut buf = BytesMut::from(header);
            let err = FrameDecoder::new().decode(&mut buf).unwrap_err();
            assert!(matches!(err, CodecError::Desync(_)), "{header:?}");
        }
    }

    #[test]
    fn unterminated_header_is_desync_once_too_long() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&b"$123"[..]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.put_slice(&[b'9'; MAX_HEADER_LEN]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(CodecError::Desync(_))
        ));
    }
}
