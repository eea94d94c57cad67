//! Newline-delimited JSON frame codec.
//!
//! Each frame is one JSON object on its own line:
//!
//! ```text
//! {"Msg":"ping","Seq":1}\n
//! {"Msg":"pong","Seq":1}\n
//! ```
//!
//! The decoder works on an accumulating buffer, so objects split across
//! reads are reassembled before parsing. Blank lines between frames are
//! skipped. Unknown fields are ignored unless the codec is configured to
//! deny them.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::peer_closed;

/// Media type used for both request and response bodies.
pub const CONTENT_TYPE_NDJSON: &str = "application/x-ndjson";

/// Default upper bound on a single encoded frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "Msg")]
    pub msg: String,
    #[serde(rename = "Seq", default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

/// Mirror of `Frame` used when unknown fields must be rejected.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictFrame {
    #[serde(rename = "Msg")]
    msg: String,
    #[serde(rename = "Seq", default)]
    seq: Option<u64>,
}

impl From<StrictFrame> for Frame {
    fn from(strict: StrictFrame) -> Self {
        Frame {
            msg: strict.msg,
            seq: strict.seq,
        }
    }
}

impl Frame {
    pub const PING: &'static str = "ping";
    pub const PONG: &'static str = "pong";

    pub fn ping(seq: u64) -> Self {
        Frame {
            msg: Self::PING.to_string(),
            seq: Some(seq),
        }
    }

    pub fn pong(seq: Option<u64>) -> Self {
        Frame {
            msg: Self::PONG.to_string(),
            seq,
        }
    }
}

/// Frame decoding/encoding errors
#[derive(Debug)]
pub enum FrameError {
    Io(io::Error),
    Json(serde_json::Error),
    /// A line grew beyond the configured maximum.
    TooLarge { len: usize, max: usize },
    /// The stream ended in the middle of a frame.
    UnexpectedEof { pending: usize },
}

impl FrameError {
    /// True when the error only means the peer stopped sending.
    pub fn is_end_of_stream(&self) -> bool {
        match self {
            FrameError::UnexpectedEof { .. } => true,
            FrameError::Io(e) => peer_closed(e),
            _ => false,
        }
    }
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        FrameError::Io(e)
    }
}

impl From<serde_json::Error> for FrameError {
    fn from(e: serde_json::Error) -> Self {
        FrameError::Json(e)
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Io(e) => write!(f, "frame I/O error: {}", e),
            FrameError::Json(e) => write!(f, "malformed frame: {}", e),
            FrameError::TooLarge { len, max } => {
                write!(f, "frame of {} bytes exceeds limit of {} bytes", len, max)
            }
            FrameError::UnexpectedEof { pending } => {
                write!(f, "stream ended with {} bytes of an incomplete frame", pending)
            }
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Io(e) => Some(e),
            FrameError::Json(e) => Some(e),
            _ => None,
        }
    }
}

/// Codec for newline-delimited JSON frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_length: usize,
    deny_unknown_fields: bool,
    /// Bytes of the buffer already searched for a newline.
    next_index: usize,
}

impl FrameCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            deny_unknown_fields: false,
            next_index: 0,
        }
    }

    pub fn deny_unknown_fields(mut self, deny: bool) -> Self {
        self.deny_unknown_fields = deny;
        self
    }

    fn parse(&self, line: &[u8]) -> Result<Frame, FrameError> {
        if self.deny_unknown_fields {
            Ok(serde_json::from_slice::<StrictFrame>(line)?.into())
        } else {
            Ok(serde_json::from_slice(line)?)
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        loop {
            let newline = buf[self.next_index..].iter().position(|b| *b == b'\n');

            let Some(offset) = newline else {
                if buf.len() > self.max_length {
                    return Err(FrameError::TooLarge {
                        len: buf.len(),
                        max: self.max_length,
                    });
                }
                self.next_index = buf.len();
                return Ok(None);
            };

            let end = self.next_index + offset;
            self.next_index = 0;
            let line = buf.split_to(end + 1);
            let line = trim_ascii_whitespace(&line[..end]);

            if line.is_empty() {
                continue;
            }
            if line.len() > self.max_length {
                return Err(FrameError::TooLarge {
                    len: line.len(),
                    max: self.max_length,
                });
            }
            return self.parse(line).map(Some);
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }

        let pending = trim_ascii_whitespace(buf).len();
        buf.clear();
        self.next_index = 0;
        if pending == 0 {
            Ok(None)
        } else {
            Err(FrameError::UnexpectedEof { pending })
        }
    }
}

impl Encoder<&Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let start = dst.len();
        serde_json::to_writer((&mut *dst).writer(), frame)?;
        let len = dst.len() - start;
        if len > self.max_length {
            dst.truncate(start);
            return Err(FrameError::TooLarge {
                len,
                max: self.max_length,
            });
        }
        dst.put_u8(b'\n');
        Ok(())
    }
}

fn trim_ascii_whitespace(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if !first.is_ascii_whitespace() {
            break;
        }
        bytes = rest;
    }
    while let [rest @ .., last] = bytes {
        if !last.is_ascii_whitespace() {
            break;
        }
        bytes = rest;
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    fn encode(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::default().encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_wire_format() {
        assert_eq!(&encode(&Frame::ping(1))[..], b"{\"Msg\":\"ping\",\"Seq\":1}\n");
        assert_eq!(&encode(&Frame::pong(None))[..], b"{\"Msg\":\"pong\"}\n");
    }

    #[test]
    fn test_round_trip() {
        let frames = [
            Frame::ping(1),
            Frame::ping(u64::MAX),
            Frame::pong(Some(7)),
            Frame::pong(None),
            Frame {
                msg: "quoted \"text\" with\nnewline".to_string(),
                seq: None,
            },
        ];

        let mut codec = FrameCodec::default();
        for frame in frames {
            let mut buf = encode(&frame);
            assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_partial_frame_waits_for_newline() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"{\"Msg\":\"pi"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"ng\"}\n{\"Msg\"");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame {
                msg: "ping".to_string(),
                seq: None
            })
        );
        assert_eq!(&buf[..], b"{\"Msg\"");
    }

    #[test]
    fn test_blank_lines_skipped() {
        // Encoders that write an extra delimiter after each object.
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"{\"Msg\":\"pong\"}\n\n\r\n{\"Msg\":\"pong\"}\n\n"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_unknown_fields() {
        let line = b"{\"Msg\":\"ping\",\"Extra\":true}\n";

        let mut lenient = FrameCodec::default();
        let frame = lenient
            .decode(&mut BytesMut::from(&line[..]))
            .unwrap()
            .unwrap();
        assert_eq!(frame.msg, "ping");

        let mut strict = FrameCodec::default().deny_unknown_fields(true);
        assert!(matches!(
            strict.decode(&mut BytesMut::from(&line[..])),
            Err(FrameError::Json(_))
        ));
    }

    #[test]
    fn test_frame_too_large() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::from(&b"{\"Msg\":\"this is far too long\"}"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::TooLarge { max: 16, .. })
        ));

        let mut out = BytesMut::new();
        let long = Frame {
            msg: "x".repeat(32),
            seq: None,
        };
        assert!(matches!(
            codec.encode(&long, &mut out),
            Err(FrameError::TooLarge { .. })
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn test_malformed_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"not json\n"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::Json(_)));
        assert!(!err.is_end_of_stream());
    }

    #[test]
    fn test_truncated_stream_is_end_of_stream() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"{\"Msg\":\"pi"[..]);
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedEof { pending: 10 }));
        assert!(err.is_end_of_stream());
    }

    #[tokio::test]
    async fn test_frames_split_across_reads() {
        let reader = tokio_test::io::Builder::new()
            .read(b"{\"Msg\":")
            .read(b"\"ping\",\"Seq\":1}\n{\"Msg\":\"ping\",")
            .read(b"\"Seq\":2}")
            .read(b"\n")
            .build();

        let mut frames = FramedRead::new(reader, FrameCodec::default());
        assert_eq!(frames.next().await.unwrap().unwrap(), Frame::ping(1));
        assert_eq!(frames.next().await.unwrap().unwrap(), Frame::ping(2));
        assert!(frames.next().await.is_none());
    }
}
