use crate::config::{MAGIC_BYTES, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use crate::core::message::HeaderMessage;
use crate::error::{ProtocolError, Result};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 4 + 1 + 8 + 8 + 4;

/// Length-prefixed framing of [`HeaderMessage`]s.
///
/// Decoding is incremental: an incomplete frame leaves the buffer untouched
/// and yields `None` until the rest arrives.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = HeaderMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<HeaderMessage>> {
        // Reject garbage as soon as the magic is visible
        if src.len() >= MAGIC_BYTES.len() && src[..MAGIC_BYTES.len()] != MAGIC_BYTES {
            return Err(ProtocolError::InvalidHeader);
        }

        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let version = src[4];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let mut header = &src[5..HEADER_SIZE];
        let identifier = header.get_u64();
        let request_id = header.get_u64();
        let length = header.get_u32() as usize;

        if length > self.max_payload {
            return Err(ProtocolError::OversizedPacket(length));
        }

        if src.len() < HEADER_SIZE + length {
            src.reserve(HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length).freeze();

        Ok(Some(HeaderMessage {
            identifier,
            request_id: (request_id != 0).then_some(request_id),
            payload,
        }))
    }
}

impl<'a> Encoder<&'a HeaderMessage> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: &'a HeaderMessage, dst: &mut BytesMut) -> Result<()> {
        if frame.payload.len() > self.max_payload {
            return Err(ProtocolError::OversizedPacket(frame.payload.len()));
        }

        dst.reserve(HEADER_SIZE + frame.payload.len());
        dst.put_slice(&MAGIC_BYTES);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u64(frame.identifier);
        dst.put_u64(frame.wire_request_id());
        dst.put_u32(frame.payload.len() as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: &HeaderMessage) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::default().encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_frame_layout() {
        let buf = encode(&HeaderMessage::new(3, Some(2), &b"hi"[..]));
        assert_eq!(buf.len(), HEADER_SIZE + 2);
        assert_eq!(&buf[..4], &MAGIC_BYTES);
        assert_eq!(buf[4], PROTOCOL_VERSION);
        assert_eq!(&buf[5..13], &3u64.to_be_bytes());
        assert_eq!(&buf[13..21], &2u64.to_be_bytes());
        assert_eq!(&buf[21..25], &2u32.to_be_bytes());
        assert_eq!(&buf[25..], b"hi");
    }

    #[test]
    fn test_partial_header_waits() {
        let full = encode(&HeaderMessage::new(1, None, &b"payload"[..]));
        let mut partial = BytesMut::from(&full[..10]);
        assert!(FrameCodec::default().decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), 10);
    }

    #[test]
    fn test_zero_request_id_decodes_as_none() {
        let mut buf = encode(&HeaderMessage::new(5, None, &b""[..]));
        let frame = FrameCodec::default().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.request_id, None);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_invalid_magic_rejected_early() {
        let mut buf = BytesMut::from(&[0xFF, 0xFF, 0xFF, 0xFF, 1][..]);
        assert!(matches!(
            FrameCodec::default().decode(&mut buf),
            Err(ProtocolError::InvalidHeader)
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let mut buf = encode(&HeaderMessage::new(1, None, &b"x"[..]));
        buf[4] = 99;
        assert!(matches!(
            FrameCodec::default().decode(&mut buf),
            Err(ProtocolError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut codec = FrameCodec::new(4);
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(&HeaderMessage::new(1, None, &b"too long"[..]), &mut buf),
            Err(ProtocolError::OversizedPacket(8))
        ));

        let mut claimed = encode(&HeaderMessage::new(1, None, &b"too long"[..]));
        assert!(matches!(
            codec.decode(&mut claimed),
            Err(ProtocolError::OversizedPacket(8))
        ));
    }
}
