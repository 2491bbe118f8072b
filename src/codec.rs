//! Streaming frame codec for [`tokio_util::codec::Framed`].
//!
//! TCP does not preserve message boundaries: one read may hold half a frame or several frames
//! at once. The [`Decoder`] keeps the parsed header of a partially received frame between calls
//! and yields every complete frame in the buffer, in order.
use bytes::{Buf, BytesMut};
use tokio_util::codec::{self, Decoder as _, Encoder as _};

use crate::{
    frame::{self, Frame, FrameError, FrameHeader},
    mask::apply_mask,
    WebSocketError,
};

/// A combined codec that provides both encoding and decoding functionality for WebSocket frames.
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl Codec {
    /// Creates a codec rejecting frames whose payload exceeds `max_payload_size`.
    pub fn new(max_payload_size: usize) -> Self {
        Self::from((Decoder::new(max_payload_size), Encoder))
    }
}

impl From<(Decoder, Encoder)> for Codec {
    fn from((decoder, encoder): (Decoder, Encoder)) -> Self {
        Self { decoder, encoder }
    }
}

impl codec::Decoder for Codec {
    type Item = <Decoder as codec::Decoder>::Item;
    type Error = <Decoder as codec::Decoder>::Error;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }

    #[inline]
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode_eof(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = <Encoder as codec::Encoder<Frame>>::Error;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}

/// A decoder for WebSocket frames.
///
/// Once a header has been parsed it is removed from the buffer and kept here until its whole
/// payload has arrived.
pub struct Decoder {
    /// Header of the frame whose payload is still incomplete.
    pending: Option<FrameHeader>,
    /// Maximum allowed size for the frame payload.
    max_payload_size: usize,
}

impl Decoder {
    /// Creates a new `Decoder` with a specified maximum payload size.
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            pending: None,
            max_payload_size,
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    /// Decodes the next frame from `src`, unmasking its payload.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))` for a complete frame.
    /// - `Ok(None)` when more data is needed.
    /// - `Err(WebSocketError::Frame(FrameError::FrameTooLarge))` when a header declares a payload
    ///   above the limit.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending.take() {
            Some(header) => header,
            None => match FrameHeader::parse(src, self.max_payload_size)? {
                Some(header) => {
                    src.advance(header.header_len);
                    header
                }
                None => return Ok(None),
            },
        };

        if src.remaining() < header.payload_len {
            src.reserve(header.payload_len - src.remaining());
            self.pending = Some(header);
            return Ok(None);
        }

        let mut payload = src.split_to(header.payload_len);
        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }

        Ok(Some(Frame::new(
            header.fin,
            header.opcode,
            header.mask,
            payload,
        )))
    }

    /// Like [`decode`](Self::decode), but reports a partial frame left at end of stream as
    /// [`FrameError::Truncated`].
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        let needed = match &self.pending {
            Some(header) => header.payload_len,
            None if src.is_empty() => return Ok(None),
            None => frame::required_header_len(src),
        };

        Err(FrameError::Truncated {
            needed,
            available: src.remaining(),
        }
        .into())
    }
}

/// WebSocket frame encoder.
///
/// Frames are written as they are: server frames carry no key, frames built with a key (client
/// frames) have their payload masked in the output.
pub struct Encoder;

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        frame.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OpCode;

    const MASK: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];

    fn client_bytes(payload: &str) -> BytesMut {
        let mut dst = BytesMut::new();
        Encoder
            .encode(
                Frame::new(true, OpCode::Text, Some(MASK), payload.as_bytes()),
                &mut dst,
            )
            .unwrap();
        dst
    }

    #[test]
    fn test_decode_frame_split_across_reads() {
        let mut decoder = Decoder::new(1024);
        let bytes = client_bytes(&"z".repeat(300));
        let mut src = BytesMut::new();

        for chunk in bytes.chunks(7) {
            src.extend_from_slice(chunk);
            if let Some(frame) = decoder.decode(&mut src).unwrap() {
                assert_eq!(&frame.payload[..], "z".repeat(300).as_bytes());
                assert!(src.is_empty());
                return;
            }
        }
        panic!("frame never completed");
    }

    #[test]
    fn test_decode_coalesced_frames_in_order() {
        let mut decoder = Decoder::new(1024);
        let mut src = BytesMut::new();
        for text in ["one", "two", "three"] {
            src.extend_from_slice(&client_bytes(text));
        }

        let mut decoded = vec![];
        while let Some(frame) = decoder.decode(&mut src).unwrap() {
            decoded.push(frame.into_text(false).unwrap());
        }

        assert_eq!(decoded, vec!["one", "two", "three"]);
        assert!(src.is_empty());
    }

    #[test]
    fn test_decode_consumes_unmasked_frame() {
        let mut decoder = Decoder::new(1024);
        let mut src = BytesMut::new();
        Encoder.encode(Frame::text("bare"), &mut src).unwrap();
        src.extend_from_slice(&client_bytes("after"));

        let bare = decoder.decode(&mut src).unwrap().unwrap();
        assert!(!bare.is_masked());
        assert_eq!(bare.into_text(false).unwrap(), "");

        let after = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(after.into_text(false).unwrap(), "after");
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let mut decoder = Decoder::new(16);
        let mut src = client_bytes(&"x".repeat(17));

        let err = decoder.decode(&mut src).unwrap_err();
        assert!(matches!(
            err,
            WebSocketError::Frame(FrameError::FrameTooLarge { length: 17, max: 16 })
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_decode_eof_reports_partial_frame() {
        let mut decoder = Decoder::new(1024);
        let bytes = client_bytes("hello");
        let mut src = BytesMut::from(&bytes[..bytes.len() - 2]);

        assert!(decoder.decode(&mut src).unwrap().is_none());
        let err = decoder.decode_eof(&mut src).unwrap_err();
        assert!(matches!(
            err,
            WebSocketError::Frame(FrameError::Truncated {
                needed: 5,
                available: 3
            })
        ));

        let mut empty = BytesMut::new();
        assert!(Decoder::new(1024).decode_eof(&mut empty).unwrap().is_none());
    }

    #[test]
    fn test_codec_encodes_server_frames_unmasked() {
        let mut codec = Codec::new(1024);
        let mut dst = BytesMut::new();
        codec.encode(Frame::close(Some(1001)), &mut dst).unwrap();

        assert_eq!(&dst[..], &[0x88, 0x02, 0x03, 0xE9]);

        let frame = codec.decode(&mut dst).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Close);
        assert_eq!(frame.close_code(), Some(1001));
    }
}
