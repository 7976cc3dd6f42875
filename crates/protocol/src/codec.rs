//! Framing for message streams

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::types::{Message, MessageType, ProtocolError, HEADER_LEN};

/// Length-prefixed message codec for `Framed` transports
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        let Some(len) = Message::peek_len(src) else {
            src.reserve(HEADER_LEN);
            return Ok(None);
        };
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(len);
        let kind = MessageType(frame[2]);
        let context_id = frame[3];
        frame.advance(HEADER_LEN);
        Message::new(kind, context_id, frame.freeze()).map(Some)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        item.write_to(dst);
        Ok(())
    }
}

impl Encoder<&Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        item.write_to(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_frames_split_across_reads() {
        let first = Message::chat(1, "hello").unwrap();
        let second = Message::ping(false);

        let mut wire = BytesMut::new();
        first.write_to(&mut wire);
        second.write_to(&mut wire);

        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&wire[..3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&wire[3..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(second));
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn encoder_writes_wire_form() {
        let msg = Message::user_leave(7);
        let mut dst = BytesMut::new();
        MessageCodec.encode(&msg, &mut dst).unwrap();
        assert_eq!(&dst[..], &msg.to_bytes()[..]);
    }
}
