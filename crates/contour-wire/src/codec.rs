use bytes::{Buf, BufMut, BytesMut};
use contour_types::Frame;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::encode::encode_frame;
use crate::error::WireError;
use crate::literal::parse_frame;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

const LENGTH_PREFIX_BYTES: usize = 4;

/// How frames are delimited on the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// One frame per line. `\r\n` is accepted; blank lines are skipped.
    #[default]
    Newline,
    /// 4-byte big-endian length followed by that many bytes of frame text.
    LengthPrefixed,
}

/// Splits a byte stream into [`Frame`]s and back.
///
/// Decoding never guesses: a truncated frame yields `Ok(None)` until the rest
/// arrives, and bytes past the size limit are rejected before they are parsed.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    framing: Framing,
    max_frame_bytes: usize,
    /// Bytes of the current partial line already scanned for a newline.
    next_index: usize,
}

impl FrameCodec {
    pub fn new(framing: Framing, max_frame_bytes: usize) -> Self {
        Self {
            framing,
            max_frame_bytes: max_frame_bytes.max(1),
            next_index: 0,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    fn decode_line(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        loop {
            let newline = src[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);
            let Some(end) = newline else {
                if src.len() > self.max_frame_bytes {
                    return Err(WireError::TooLarge {
                        size: src.len(),
                        limit: self.max_frame_bytes,
                    });
                }
                self.next_index = src.len();
                return Ok(None);
            };
            self.next_index = 0;
            if end > self.max_frame_bytes {
                return Err(WireError::TooLarge {
                    size: end,
                    limit: self.max_frame_bytes,
                });
            }
            let line = src.split_to(end + 1);
            let mut text = &line[..end];
            if text.last() == Some(&b'\r') {
                text = &text[..text.len() - 1];
            }
            if text.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return parse_bytes(text).map(Some);
        }
    }

    fn decode_prefixed(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        if src.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }
        let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_BYTES]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame_bytes {
            return Err(WireError::TooLarge {
                size: len,
                limit: self.max_frame_bytes,
            });
        }
        if src.len() < LENGTH_PREFIX_BYTES + len {
            src.reserve(LENGTH_PREFIX_BYTES + len - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX_BYTES);
        let body = src.split_to(len);
        parse_bytes(&body).map(Some)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(Framing::Newline, DEFAULT_MAX_FRAME_BYTES)
    }
}

fn parse_bytes(bytes: &[u8]) -> Result<Frame, WireError> {
    let text = std::str::from_utf8(bytes).map_err(|err| {
        WireError::malformed(err.valid_up_to(), "frame is not valid UTF-8")
    })?;
    parse_frame(text)
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        match self.framing {
            Framing::Newline => self.decode_line(src),
            Framing::LengthPrefixed => self.decode_prefixed(src),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        // A partial frame at end of stream is never delivered.
        src.clear();
        self.next_index = 0;
        Ok(None)
    }
}

impl Encoder<&Frame> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<(), WireError> {
        let text = encode_frame(frame)?;
        if text.len() > self.max_frame_bytes {
            return Err(WireError::TooLarge {
                size: text.len(),
                limit: self.max_frame_bytes,
            });
        }
        match self.framing {
            Framing::Newline => {
                dst.reserve(text.len() + 1);
                dst.put_slice(text.as_bytes());
                dst.put_u8(b'\n');
            }
            Framing::LengthPrefixed => {
                dst.reserve(text.len() + LENGTH_PREFIX_BYTES);
                dst.put_u32(text.len() as u32);
                dst.put_slice(text.as_bytes());
            }
        }
        Ok(())
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), WireError> {
        Encoder::<&Frame>::encode(self, &frame, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contour_types::FrameValue;
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[test]
    fn truncated_line_waits_for_more_bytes() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"{'kind': 'ready', "[..]);
        assert!(codec.decode(&mut buf).expect("decode").is_none());
        buf.extend_from_slice(b"'id': 0}\r\n\n{'kind'");
        let frame = codec.decode(&mut buf).expect("decode").expect("frame");
        assert_eq!(frame.kind(), Some("ready"));
        assert_eq!(frame.id(), Some(0));
        assert!(codec.decode(&mut buf).expect("decode").is_none());
        assert_eq!(&buf[..], b"{'kind'");
    }

    #[test]
    fn partial_frame_at_eof_is_dropped() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"{'kind': 'res"[..]);
        assert!(codec.decode_eof(&mut buf).expect("decode").is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_line_is_rejected_without_a_newline() {
        let mut codec = FrameCodec::new(Framing::Newline, 16);
        let mut buf = BytesMut::from(&b"{'data': 'xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(WireError::TooLarge { limit: 16, .. })
        ));
    }

    #[test]
    fn oversized_length_prefix_is_rejected_before_the_body_arrives() {
        let mut codec = FrameCodec::new(Framing::LengthPrefixed, 1024);
        let mut buf = BytesMut::new();
        buf.put_u32(1_000_000);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(WireError::TooLarge { size: 1_000_000, .. })
        ));
    }

    #[test]
    fn unsafe_line_surfaces_as_unsafe_error() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"{'x': __import__('os')}\n"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(WireError::Unsafe { .. })));
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"{'x': '\xff'}\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(WireError::Malformed { .. })
        ));
    }

    #[test]
    fn encoder_refuses_frames_over_the_limit() {
        let mut codec = FrameCodec::new(Framing::Newline, 8);
        let mut dst = BytesMut::new();
        let frame = Frame::new().with("data", "0123456789");
        assert!(matches!(
            Encoder::<&Frame>::encode(&mut codec, &frame, &mut dst),
            Err(WireError::TooLarge { .. })
        ));
        assert!(dst.is_empty());
    }

    #[test]
    fn encoder_refuses_frames_nested_past_the_limit() {
        let mut codec = FrameCodec::new(Framing::LengthPrefixed, 1024 * 1024);
        let mut dst = BytesMut::new();
        let mut value = FrameValue::Null;
        for _ in 0..crate::MAX_DEPTH {
            value = FrameValue::List(vec![value]);
        }
        let frame = Frame::new().with("data", value);
        assert!(matches!(
            Encoder::<&Frame>::encode(&mut codec, &frame, &mut dst),
            Err(WireError::TooDeep { .. })
        ));
        assert!(dst.is_empty());
    }

    #[tokio::test]
    async fn frames_cross_a_stream_in_both_framings() {
        for framing in [Framing::Newline, Framing::LengthPrefixed] {
            let (client, server) = tokio::io::duplex(64);
            let mut writer = FramedWrite::new(client, FrameCodec::new(framing, 4096));
            let mut reader = FramedRead::new(server, FrameCodec::new(framing, 4096));

            let frames = vec![
                Frame::new().with("kind", "hello").with("id", 0_i64),
                Frame::new()
                    .with("kind", "output")
                    .with("data", "line one\nline two")
                    .with("seq", FrameValue::List(vec![1_i64.into(), 2_i64.into()])),
            ];
            let expected = frames.clone();
            let send = tokio::spawn(async move {
                for frame in frames {
                    writer.send(frame).await.expect("send");
                }
            });

            for want in expected {
                let got = reader.next().await.expect("frame").expect("decode");
                assert_eq!(got, want);
            }
            send.await.expect("writer task");
            assert!(reader.next().await.is_none());
        }
    }
}
