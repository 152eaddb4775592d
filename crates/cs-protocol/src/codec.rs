//! Remote-call framing
//!
//! Frames ride a u32 big-endian length prefix (tokio-util's
//! [`LengthDelimitedCodec`]). The body is laid out as
//!
//! ```text
//! | kind: u8 | call id: u32 BE | bincode RpcMessage |
//! ```
//!
//! The kind byte repeats the message variant so a frame of an unknown kind
//! is refused before its payload is decoded.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::call::CallId;
use crate::error::ProtocolError;
use crate::message::{MessageType, RpcMessage};

/// Largest frame body either side will send or accept
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Kind byte plus call id
const BODY_PREFIX: usize = 5;

/// One remote-call message and the call it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcFrame {
    pub call_id: CallId,
    pub message: RpcMessage,
}

impl RpcFrame {
    pub fn new(call_id: CallId, message: RpcMessage) -> Self {
        Self { call_id, message }
    }
}

/// Codec for [`RpcFrame`]s
#[derive(Debug)]
pub struct RpcCodec {
    framing: LengthDelimitedCodec,
}

impl RpcCodec {
    pub fn new() -> Self {
        Self {
            framing: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_SIZE)
                .new_codec(),
        }
    }
}

impl Default for RpcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RpcCodec {
    type Item = RpcFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RpcFrame>, ProtocolError> {
        let Some(mut body) = self.framing.decode(src)? else {
            return Ok(None);
        };
        if body.len() < BODY_PREFIX {
            return Err(ProtocolError::Truncated(body.len()));
        }

        let kind_byte = body.get_u8();
        let kind = MessageType::from_u8(kind_byte)
            .ok_or(ProtocolError::UnknownMessageType(kind_byte))?;
        let call_id = CallId::new(body.get_u32());

        let message: RpcMessage = bincode::deserialize(&body)?;
        if message.message_type() != kind {
            return Err(ProtocolError::TypeMismatch {
                header: kind,
                payload: message.message_type(),
            });
        }

        Ok(Some(RpcFrame { call_id, message }))
    }
}

impl Encoder<RpcFrame> for RpcCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: RpcFrame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload = bincode::serialize(&frame.message)?;
        let size = BODY_PREFIX + payload.len();
        if size > MAX_FRAME_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut body = BytesMut::with_capacity(size);
        body.put_u8(frame.message.message_type().as_u8());
        body.put_u32(frame.call_id.as_u32());
        body.extend_from_slice(&payload);

        self.framing.encode(body.freeze(), dst)?;
        Ok(())
    }
}
