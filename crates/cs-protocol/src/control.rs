//! Control-channel messages
//!
//! The control channel carries low-frequency signaling between peers. Each
//! message is a UTF-8 JSON array terminated by a single NUL byte; the first
//! element is a string tag and the remaining elements depend on the tag.
//!
//! ```text
//! ["open-reverse-channel", 17]\0
//! ```
//!
//! A message that fails to parse is reported as a per-item error so the
//! caller can log and skip it without tearing the channel down.

use bytes::{BufMut, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Message terminator
pub const TERMINATOR: u8 = 0;

/// Longest message accepted before the decoder starts discarding
pub const MAX_CONTROL_MESSAGE: usize = 64 * 1024;

/// Tag asking the peer to open a reverse remote-call channel
pub const TAG_OPEN_REVERSE_CHANNEL: &str = "open-reverse-channel";

/// Signaling messages exchanged on the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Server asks the client to open `rpc-s2c-<sequence_id>@consys`
    OpenReverseChannel { sequence_id: u64 },
}

impl ControlMessage {
    /// Tag string carried as the first array element
    pub fn tag(&self) -> &'static str {
        match self {
            ControlMessage::OpenReverseChannel { .. } => TAG_OPEN_REVERSE_CHANNEL,
        }
    }

    /// Encode as a JSON array (without the terminator)
    pub fn to_json(&self) -> Value {
        match self {
            ControlMessage::OpenReverseChannel { sequence_id } => {
                Value::Array(vec![Value::from(self.tag()), Value::from(*sequence_id)])
            }
        }
    }

    /// Parse one message body (without the terminator)
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| ProtocolError::MalformedControl(e.to_string()))?;

        let items = match value {
            Value::Array(items) => items,
            other => {
                return Err(ProtocolError::MalformedControl(format!(
                    "expected array, got {}",
                    other
                )))
            }
        };

        let (tag, rest) = match items.split_first() {
            Some((Value::String(tag), rest)) => (tag.as_str(), rest),
            Some(_) => {
                return Err(ProtocolError::MalformedControl(
                    "tag is not a string".to_string(),
                ))
            }
            None => return Err(ProtocolError::MalformedControl("empty message".to_string())),
        };

        match tag {
            TAG_OPEN_REVERSE_CHANNEL => match rest {
                [n] => {
                    let sequence_id = n.as_u64().ok_or_else(|| {
                        ProtocolError::MalformedControl(format!(
                            "sequence id must be a non-negative integer, got {}",
                            n
                        ))
                    })?;
                    Ok(ControlMessage::OpenReverseChannel { sequence_id })
                }
                _ => Err(ProtocolError::MalformedControl(format!(
                    "{} takes exactly one argument, got {}",
                    TAG_OPEN_REVERSE_CHANNEL,
                    rest.len()
                ))),
            },
            other => Err(ProtocolError::UnknownControlTag(other.to_string())),
        }
    }
}

/// Codec for NUL-terminated control messages
///
/// Items are `Result`s: a bad message yields `Ok(Some(Err(..)))` and the
/// stream continues with the next one.
#[derive(Debug)]
pub struct ControlCodec {
    max_length: usize,
    /// Bytes already scanned for a terminator
    next_index: usize,
    /// Dropping an oversized message until its terminator
    discarding: bool,
}

impl ControlCodec {
    /// Create a codec with the default length limit
    pub fn new() -> Self {
        Self::with_max_length(MAX_CONTROL_MESSAGE)
    }

    /// Create a codec with a custom length limit
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }
}

impl Default for ControlCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ControlCodec {
    type Item = Result<ControlMessage, ProtocolError>;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let terminator = src[self.next_index..]
                .iter()
                .position(|b| *b == TERMINATOR)
                .map(|offset| self.next_index + offset);

            match (self.discarding, terminator) {
                (true, Some(end)) => {
                    let _ = src.split_to(end + 1);
                    self.next_index = 0;
                    self.discarding = false;
                    return Ok(Some(Err(ProtocolError::MalformedControl(format!(
                        "message longer than {} bytes",
                        self.max_length
                    )))));
                }
                (true, None) => {
                    let _ = src.split_to(src.len());
                    self.next_index = 0;
                    return Ok(None);
                }
                (false, Some(end)) => {
                    let line = src.split_to(end + 1);
                    self.next_index = 0;
                    if end > self.max_length {
                        return Ok(Some(Err(ProtocolError::MalformedControl(format!(
                            "message longer than {} bytes",
                            self.max_length
                        )))));
                    }
                    return Ok(Some(ControlMessage::parse(&line[..end])));
                }
                (false, None) if src.len() > self.max_length => {
                    self.discarding = true;
                    continue;
                }
                (false, None) => {
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(item) => Ok(Some(item)),
            None => {
                // Trailing bytes without a terminator are dropped
                if !buf.is_empty() {
                    let _ = buf.split_to(buf.len());
                    self.next_index = 0;
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = item.to_json().to_string();
        dst.reserve(body.len() + 1);
        dst.put_slice(body.as_bytes());
        dst.put_u8(TERMINATOR);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut ControlCodec, buf: &mut BytesMut) -> Vec<Result<ControlMessage, ProtocolError>> {
        std::iter::from_fn(|| codec.decode(buf).unwrap()).collect()
    }

    #[test]
    fn test_open_reverse_channel_roundtrip() {
        for n in [0u64, 1, 17, u32::MAX as u64, u64::MAX] {
            let mut codec = ControlCodec::new();
            let mut buf = BytesMut::new();
            codec
                .encode(ControlMessage::OpenReverseChannel { sequence_id: n }, &mut buf)
                .unwrap();

            let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();
            assert_eq!(decoded, ControlMessage::OpenReverseChannel { sequence_id: n });
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_wire_shape() {
        let mut buf = BytesMut::new();
        ControlCodec::new()
            .encode(ControlMessage::OpenReverseChannel { sequence_id: 3 }, &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"[\"open-reverse-channel\",3]\0");
    }

    #[test]
    fn test_split_across_reads() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::from(&b"[\"open-rev"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"erse-channel\", 9]\0");
        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(decoded, ControlMessage::OpenReverseChannel { sequence_id: 9 });
    }

    #[test]
    fn test_bad_messages_do_not_stop_the_stream() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"[\"reboot-now\"]\0");
        buf.extend_from_slice(b"not json\0");
        buf.extend_from_slice(b"[\"open-reverse-channel\", -4]\0");
        buf.extend_from_slice(b"[\"open-reverse-channel\"]\0");
        buf.extend_from_slice(b"{\"tag\": 1}\0");
        buf.extend_from_slice(b"[\"open-reverse-channel\", 5]\0");

        let items = decode_all(&mut codec, &mut buf);
        assert_eq!(items.len(), 6);
        assert!(matches!(items[0], Err(ProtocolError::UnknownControlTag(ref t)) if t == "reboot-now"));
        for item in &items[1..5] {
            assert!(matches!(item, Err(ProtocolError::MalformedControl(_))));
        }
        assert_eq!(
            items[5].as_ref().unwrap(),
            &ControlMessage::OpenReverseChannel { sequence_id: 5 }
        );
    }

    #[test]
    fn test_oversized_message_is_discarded() {
        let mut codec = ControlCodec::with_max_length(16);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[b'x'; 40]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"yyy\0[\"open-reverse-channel\",2]\0");
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, Err(ProtocolError::MalformedControl(_))));

        let mut codec = ControlCodec::new();
        let second = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(second, ControlMessage::OpenReverseChannel { sequence_id: 2 });
    }
}
