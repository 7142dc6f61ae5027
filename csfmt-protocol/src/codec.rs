//! Encoder and streaming decoder for `Content-Length`-framed messages.
//!
//! A frame is an ASCII header block terminated by `\r\n\r\n` followed by a
//! UTF-8 JSON body of exactly `Content-Length` bytes. Unknown headers are
//! tolerated; exactly one `Content-Length` is required.

use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::MAX_FRAME_BYTES;
use bytes::{Buf, Bytes, BytesMut};

/// Maximum size of the header block before the decoder gives up on finding a
/// terminator.
const MAX_HEADER_BYTES: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Encodes envelopes into framed bytes.
pub struct Encoder;

impl Encoder {
    /// Encodes an envelope into a `Content-Length`-framed frame.
    pub fn encode(envelope: &Envelope) -> Result<BytesMut, ProtocolError> {
        let body = serde_json::to_vec(envelope)?;
        if body.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len(),
                max: MAX_FRAME_BYTES,
            });
        }
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        let mut buf = BytesMut::with_capacity(header.len() + body.len());
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }
}

/// Streaming decoder over a growable byte buffer.
///
/// Feed bytes with [`extend`](Decoder::extend), then drain complete frames
/// with [`decode_frame`](Decoder::decode_frame). Partial frames are retained
/// until completed by later input.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Attempts to decode the next frame body from the buffer.
    ///
    /// Returns `Ok(Some(body))` when a complete frame is available,
    /// `Ok(None)` when more bytes are needed. On a malformed header block the
    /// buffer is advanced past the terminator and the error is returned; the
    /// decoder does not resync beyond that point.
    pub fn decode_frame(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        // Stray line terminators between frames are skipped.
        while self
            .buffer
            .first()
            .is_some_and(|b| *b == b'\r' || *b == b'\n')
        {
            self.buffer.advance(1);
        }

        let Some(header_end) = find(&self.buffer, HEADER_TERMINATOR) else {
            if self.buffer.len() > MAX_HEADER_BYTES {
                return Err(ProtocolError::InvalidHeaders {
                    reason: format!("no header terminator within {MAX_HEADER_BYTES} bytes"),
                });
            }
            return Ok(None);
        };

        let content_length = match parse_headers(&self.buffer[..header_end]) {
            Ok(len) => len,
            Err(reason) => {
                // Discard up to and including the terminator, then report.
                self.buffer.advance(header_end + HEADER_TERMINATOR.len());
                return Err(ProtocolError::InvalidHeaders { reason });
            }
        };

        if content_length > MAX_FRAME_BYTES {
            self.buffer.advance(header_end + HEADER_TERMINATOR.len());
            return Err(ProtocolError::FrameTooLarge {
                size: content_length,
                max: MAX_FRAME_BYTES,
            });
        }

        let total = header_end + HEADER_TERMINATOR.len() + content_length;
        if self.buffer.len() < total {
            return Ok(None);
        }

        self.buffer.advance(header_end + HEADER_TERMINATOR.len());
        let body = self.buffer.split_to(content_length).freeze();

        std::str::from_utf8(&body).map_err(|_| ProtocolError::InvalidUtf8)?;
        Ok(Some(body))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Finds the first occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Parses a header block, returning the single `Content-Length` value.
///
/// Header names are matched case-insensitively; headers other than
/// `Content-Length` are ignored.
fn parse_headers(block: &[u8]) -> Result<usize, String> {
    let text = std::str::from_utf8(block).map_err(|_| "header block is not UTF-8".to_string())?;

    let mut content_length: Option<usize> = None;
    for line in text.split("\r\n").filter(|l| !l.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            return Err(format!("malformed header line: {line:?}"));
        };
        if !name.trim().eq_ignore_ascii_case("content-length") {
            continue;
        }
        if content_length.is_some() {
            return Err("duplicate Content-Length header".to_string());
        }
        let value = value.trim();
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("Content-Length is not a non-negative integer: {value:?}"));
        }
        content_length = Some(
            value
                .parse::<usize>()
                .map_err(|_| format!("Content-Length out of range: {value:?}"))?,
        );
    }

    content_length.ok_or_else(|| "missing Content-Length header".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{classify_body, Command, Envelope};
    use serde_json::json;

    fn ping_request(id: &str) -> Envelope {
        Envelope::request(id, Command::Ping, json!({}))
    }

    #[test]
    fn test_round_trip() {
        let env = ping_request("1");
        let encoded = Encoder::encode(&env).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&encoded);

        let body = decoder.decode_frame().unwrap().unwrap();
        let decoded = classify_body(&body).unwrap();
        assert_eq!(decoded.request_id.as_deref(), Some("1"));
        assert_eq!(decoded.command, Command::Ping);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_every_byte_aligned_split_yields_frames_in_order() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&Encoder::encode(&ping_request("a")).unwrap());
        stream.extend_from_slice(&Encoder::encode(&ping_request("b")).unwrap());

        for split in 0..=stream.len() {
            let mut decoder = Decoder::new();
            let mut ids = Vec::new();

            decoder.extend(&stream[..split]);
            while let Some(body) = decoder.decode_frame().unwrap() {
                ids.push(classify_body(&body).unwrap().request_id.unwrap());
            }
            decoder.extend(&stream[split..]);
            while let Some(body) = decoder.decode_frame().unwrap() {
                ids.push(classify_body(&body).unwrap().request_id.unwrap());
            }

            assert_eq!(ids, vec!["a", "b"], "split at byte {split}");
        }
    }

    #[test]
    fn test_trailing_partial_frame_retained() {
        let first = Encoder::encode(&ping_request("1")).unwrap();
        let second = Encoder::encode(&ping_request("2")).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&first);
        decoder.extend(&second[..second.len() - 3]);

        assert!(decoder.decode_frame().unwrap().is_some());
        // Second frame is incomplete: retained, not yielded.
        assert!(decoder.decode_frame().unwrap().is_none());
        assert!(decoder.buffered() > 0);

        decoder.extend(&second[second.len() - 3..]);
        let body = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(
            classify_body(&body).unwrap().request_id.as_deref(),
            Some("2")
        );
    }

    #[test]
    fn test_multiple_frames_in_single_read() {
        let mut stream = Vec::new();
        for id in ["1", "2", "3"] {
            stream.extend_from_slice(&Encoder::encode(&ping_request(id)).unwrap());
        }

        let mut decoder = Decoder::new();
        decoder.extend(&stream);

        for expected in ["1", "2", "3"] {
            let body = decoder.decode_frame().unwrap().unwrap();
            assert_eq!(
                classify_body(&body).unwrap().request_id.as_deref(),
                Some(expected)
            );
        }
        assert!(decoder.decode_frame().unwrap().is_none());
    }

    #[test]
    fn test_non_integer_content_length_rejected() {
        let mut decoder = Decoder::new();
        decoder.extend(b"Content-Length: twelve\r\n\r\n");
        let err = decoder.decode_frame().unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidHeaders { .. }));
    }

    #[test]
    fn test_negative_content_length_rejected() {
        let mut decoder = Decoder::new();
        decoder.extend(b"Content-Length: -5\r\n\r\n");
        let err = decoder.decode_frame().unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidHeaders { .. }));
    }

    #[test]
    fn test_missing_content_length_rejected() {
        let mut decoder = Decoder::new();
        decoder.extend(b"Content-Type: application/json\r\n\r\n{}");
        let err = decoder.decode_frame().unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidHeaders { .. }));
    }

    #[test]
    fn test_extra_headers_tolerated() {
        let body = br#"{"version":1,"type":"request","requestId":"1","command":"ping","payload":{}}"#;
        let mut stream = Vec::new();
        stream.extend_from_slice(
            format!(
                "Content-Type: application/json\r\nContent-Length: {}\r\nX-Extra: yes\r\n\r\n",
                body.len()
            )
            .as_bytes(),
        );
        stream.extend_from_slice(body);

        let mut decoder = Decoder::new();
        decoder.extend(&stream);
        let decoded = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(&decoded[..], &body[..]);
    }

    #[test]
    fn test_header_names_case_insensitive() {
        let body = b"{}";
        let mut decoder = Decoder::new();
        decoder.extend(format!("content-LENGTH: {}\r\n\r\n", body.len()).as_bytes());
        decoder.extend(body);
        assert_eq!(&decoder.decode_frame().unwrap().unwrap()[..], &body[..]);
    }

    #[test]
    fn test_stray_newlines_between_frames_skipped() {
        let first = Encoder::encode(&ping_request("1")).unwrap();
        let second = Encoder::encode(&ping_request("2")).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&first);
        decoder.extend(b"\r\n\n");
        decoder.extend(&second);

        assert!(decoder.decode_frame().unwrap().is_some());
        let body = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(
            classify_body(&body).unwrap().request_id.as_deref(),
            Some("2")
        );
    }

    #[test]
    fn test_duplicate_content_length_rejected() {
        let mut decoder = Decoder::new();
        decoder.extend(b"Content-Length: 2\r\nContent-Length: 3\r\n\r\n{}");
        let err = decoder.decode_frame().unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidHeaders { .. }));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut decoder = Decoder::new();
        decoder.extend(format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1).as_bytes());
        let err = decoder.decode_frame().unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_empty_input_yields_none() {
        let mut decoder = Decoder::new();
        assert!(decoder.decode_frame().unwrap().is_none());
    }
}
