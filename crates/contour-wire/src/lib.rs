//! Frame codec for the Contour backend protocol.

pub mod codec;
pub mod encode;
pub mod error;
pub mod literal;
pub mod message;

pub use codec::{FrameCodec, Framing, DEFAULT_MAX_FRAME_BYTES};
pub use encode::{encode_frame, encode_value};
pub use error::WireError;
pub use literal::{parse_frame, parse_value, MAX_DEPTH};
pub use message::{
    ExecResult, MessageError, OutputStream, Reply, Request, HANDSHAKE_ID, PROTOCOL_VERSION,
};

use contour_types::Frame;

/// Encodes one frame as wire text without a delimiter. Fails only for
/// frames nested deeper than [`MAX_DEPTH`].
pub fn encode(frame: &Frame) -> Result<Vec<u8>, WireError> {
    encode_frame(frame).map(String::into_bytes)
}

/// Decodes one complete, undelimited frame.
pub fn decode(bytes: &[u8]) -> Result<Frame, WireError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|err| WireError::Malformed {
            offset: err.valid_up_to(),
            reason: "frame is not valid UTF-8".to_string(),
        })?;
    parse_frame(text)
}
