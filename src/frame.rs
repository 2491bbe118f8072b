//! # Frame
//!
//! Parsing and serialization of WebSocket frames as defined in
//! [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! ```
//!
//! The server only gives meaning to single, unfragmented text frames sent by a client. The
//! parser still understands every length class (7-bit, 16-bit and 64-bit, all big-endian) so
//! that any frame can be skipped or rejected precisely instead of being misread.
//!
//! Client frames must be masked. A frame arriving with the MASK bit clear is a protocol
//! violation; it is consumed and yields an empty text, it is not an error.
//!
//! Text conversion is lossy by default: invalid UTF-8 sequences become U+FFFD. With
//! [`Options::with_utf8`](crate::Options::with_utf8) invalid payloads are rejected with
//! [`FrameError::InvalidUtf8`] instead.
use bytes::{BufMut, BytesMut};
use thiserror::Error;

use crate::mask::apply_mask;

/// Largest possible header: 2 base bytes, 8 bytes of extended length and a 4-byte mask key.
pub const MAX_HEAD_SIZE: usize = 14;

/// WebSocket operation code (OpCode) carried in the low nibble of the first header byte.
///
/// Values outside the ones named by RFC 6455 are kept as [`OpCode::Reserved`] rather than
/// rejected; the server decodes their payload like any other data frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl OpCode {
    /// Returns `true` if the `OpCode` represents a control frame (`Close`, `Ping`, or `Pong`).
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl From<u8> for OpCode {
    /// Interprets the low four bits of `value`.
    fn from(value: u8) -> Self {
        match value & 0x0F {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
            OpCode::Reserved(code) => code & 0x0F,
        }
    }
}

/// Errors produced while decoding a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer ends before the frame its header describes.
    #[error("Truncated frame: {needed} bytes required, {available} available")]
    Truncated { needed: usize, available: usize },

    /// The declared payload length exceeds the configured maximum.
    #[error("Frame too large: {length} bytes declared, limit is {max}")]
    FrameTooLarge { length: u64, max: usize },

    /// The payload is not valid UTF-8 and strict validation is enabled.
    #[error("Invalid UTF-8")]
    InvalidUtf8,
}

impl FrameError {
    /// Returns `true` if the stream cannot continue after this error.
    ///
    /// An oversized frame is never buffered, so its payload cannot be skipped and every
    /// following byte would be misread as a header.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FrameTooLarge { .. })
    }
}

/// Decoded frame header fields and their encoded size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag. Parsed but unused: fragmented messages are not reassembled.
    pub fin: bool,
    pub opcode: OpCode,
    /// The 4-byte masking key, present when the MASK bit is set.
    pub mask: Option<[u8; 4]>,
    /// Actual payload length after resolving the 126/127 escapes.
    pub payload_len: usize,
    /// Number of bytes before the payload (base bytes, extended length and mask key).
    pub header_len: usize,
}

impl FrameHeader {
    /// Parses a frame header from the start of `buf`.
    ///
    /// # Returns
    /// - `Ok(Some(header))` when the whole header is available.
    /// - `Ok(None)` when `buf` is too short to hold the header it begins.
    /// - `Err(FrameError::FrameTooLarge)` when the declared length exceeds `max_payload`.
    pub fn parse(buf: &[u8], max_payload: usize) -> Result<Option<Self>, FrameError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let fin = buf[0] & 0b1000_0000 != 0;
        let opcode = OpCode::from(buf[0]);
        let masked = buf[1] & 0b1000_0000 != 0;
        let length_code = buf[1] & 0x7F;

        let extra = match length_code {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let header_len = 2 + extra + if masked { 4 } else { 0 };
        if buf.len() < header_len {
            return Ok(None);
        }

        // extended lengths are in network byte order
        let length = match extra {
            0 => u64::from(length_code),
            2 => u64::from(u16::from_be_bytes([buf[2], buf[3]])),
            _ => {
                let mut be = [0u8; 8];
                be.copy_from_slice(&buf[2..10]);
                u64::from_be_bytes(be)
            }
        };

        let payload_len = match usize::try_from(length) {
            Ok(len) if len <= max_payload => len,
            _ => {
                return Err(FrameError::FrameTooLarge {
                    length,
                    max: max_payload,
                })
            }
        };

        let mask = masked.then(|| {
            let at = 2 + extra;
            [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]
        });

        Ok(Some(Self {
            fin,
            opcode,
            mask,
            payload_len,
            header_len,
        }))
    }

    /// Total encoded size of the frame, or `None` if it does not fit in `usize`.
    pub fn frame_len(&self) -> Option<usize> {
        self.header_len.checked_add(self.payload_len)
    }
}

/// A single WebSocket frame with an unmasked payload.
///
/// Frames produced by the decoder keep the key they arrived with in `mask`, but their payload
/// has already been unmasked. When a frame with a key is encoded, the payload is masked on the
/// way out; server frames are built without a key.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// The masking key for the frame, if any.
    mask: Option<[u8; 4]>,
    /// The payload of the frame, in clear.
    pub payload: BytesMut,
}

impl Frame {
    /// Creates a new frame.
    pub fn new(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<BytesMut>,
    ) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
        }
    }

    /// Creates an unmasked, final text frame.
    pub fn text(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Text, None, BytesMut::from(payload.as_ref()))
    }

    /// Creates an unmasked Close frame carrying `code`, or an empty payload.
    pub fn close(code: Option<u16>) -> Self {
        let payload = code
            .map(|code| BytesMut::from(&code.to_be_bytes()[..]))
            .unwrap_or_default();
        Self::new(true, OpCode::Close, None, payload)
    }

    /// Status code of a Close frame, if its payload carries one.
    pub fn close_code(&self) -> Option<u16> {
        match self.payload.get(0..2) {
            Some(&[hi, lo]) => Some(u16::from_be_bytes([hi, lo])),
            _ => None,
        }
    }

    /// Returns whether the frame carries a masking key.
    #[inline(always)]
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Returns the masking key, if any.
    pub fn mask_key(&self) -> Option<[u8; 4]> {
        self.mask
    }

    /// Converts a frame received from a client into its text.
    ///
    /// Client frames without a mask key yield an empty string. With `check_utf8` unset invalid
    /// sequences are replaced with U+FFFD; with it set they fail with [`FrameError::InvalidUtf8`].
    pub fn into_text(self, check_utf8: bool) -> Result<String, FrameError> {
        if !self.is_masked() {
            log::warn!(
                "mask bit not set on {:?} frame, discarding {} payload bytes",
                self.opcode,
                self.payload.len()
            );
            return Ok(String::new());
        }

        payload_to_string(&self.payload, check_utf8)
    }

    /// Formats the frame header into `head` and returns its size.
    ///
    /// # Panics
    /// Panics if `head` is shorter than the header, at most [`MAX_HEAD_SIZE`] bytes.
    pub(crate) fn fmt_head(&self, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7 | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len <= u16::MAX as usize {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(mask) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }

    /// Serializes the frame into `dst`, masking the payload if the frame carries a key.
    pub fn encode(&self, dst: &mut BytesMut) {
        let mut head = [0; MAX_HEAD_SIZE];
        let size = self.fmt_head(&mut head);

        dst.reserve(size + self.payload.len());
        dst.put_slice(&head[..size]);

        let start = dst.len();
        dst.put_slice(&self.payload);
        if let Some(mask) = self.mask {
            apply_mask(&mut dst[start..], mask);
        }
    }
}

fn payload_to_string(payload: &[u8], check_utf8: bool) -> Result<String, FrameError> {
    if !check_utf8 {
        return Ok(String::from_utf8_lossy(payload).into_owned());
    }

    #[cfg(feature = "simd")]
    let text = simdutf8::basic::from_utf8(payload).map_err(|_| FrameError::InvalidUtf8)?;
    #[cfg(not(feature = "simd"))]
    let text = std::str::from_utf8(payload).map_err(|_| FrameError::InvalidUtf8)?;

    Ok(text.to_owned())
}

/// Parses one complete frame from the start of `bytes`, unmasking its payload.
///
/// Bytes past the end of the frame are ignored.
pub fn parse_frame(bytes: &[u8], max_payload: usize) -> Result<Frame, FrameError> {
    let header = FrameHeader::parse(bytes, max_payload)?.ok_or(FrameError::Truncated {
        needed: required_header_len(bytes),
        available: bytes.len(),
    })?;

    let needed = header.frame_len().unwrap_or(usize::MAX);
    if bytes.len() < needed {
        return Err(FrameError::Truncated {
            needed,
            available: bytes.len(),
        });
    }

    let mut payload = BytesMut::from(&bytes[header.header_len..needed]);
    if let Some(mask) = header.mask {
        apply_mask(&mut payload, mask);
    }

    Ok(Frame::new(header.fin, header.opcode, header.mask, payload))
}

/// Header size implied by the first two bytes, or 2 when even those are missing.
pub(crate) fn required_header_len(bytes: &[u8]) -> usize {
    match bytes {
        [_, second, ..] => {
            let extra = match second & 0x7F {
                126 => 2,
                127 => 8,
                _ => 0,
            };
            2 + extra + if second & 0x80 != 0 { 4 } else { 0 }
        }
        _ => 2,
    }
}

/// Decodes a single client frame held entirely in `bytes` into its text payload.
///
/// - A declared length of zero yields an empty string.
/// - A frame with the MASK bit clear yields an empty string; the violation is logged.
/// - A buffer shorter than the frame it declares fails with [`FrameError::Truncated`].
/// - Any opcode is decoded as text; invalid UTF-8 is replaced with U+FFFD.
///
/// All three extended length classes are supported, big-endian, with no size limit beyond
/// the buffer itself.
pub fn decode_frame(bytes: &[u8]) -> Result<String, FrameError> {
    if let [_, second, ..] = bytes {
        if second & 0x80 == 0 {
            log::warn!("mask bit not set, frame carries no usable payload");
            return Ok(String::new());
        }
    }

    parse_frame(bytes, usize::MAX)?.into_text(false)
}
