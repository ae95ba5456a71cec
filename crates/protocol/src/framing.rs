//! Length-prefixed frame codec with optional LZ4 compression.
//!
//! # Frame Format
//!
//! ```text
//! +--------+-----------------+-------+-----------------------+
//! | "ENVY" | length (u32 BE) | flags | payload (length - 1)  |
//! +--------+-----------------+-------+-----------------------+
//! ```
//!
//! `length` counts the flags byte plus the payload. Bit 0 of `flags` marks an
//! LZ4 payload (size-prepended block format). Payloads above
//! [`COMPRESSION_THRESHOLD`] are compressed when that makes them smaller.

use crate::error::{ProtocolError, Result};

/// Magic bytes identifying an Envoy frame.
pub const FRAME_MAGIC: [u8; 4] = *b"ENVY";

/// Payloads larger than this many bytes are candidates for compression.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Maximum encoded frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header size: 4 (magic) + 4 (length) + 1 (flags).
pub const FRAME_HEADER_SIZE: usize = 9;

/// Bytes preceding the flags byte (magic + length).
const PREFIX_SIZE: usize = 8;

/// Flags carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// The payload is LZ4 compressed.
    pub const COMPRESSED: u8 = 0b0000_0001;

    #[inline]
    pub fn new() -> Self {
        Self(0)
    }

    #[inline]
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    #[inline]
    pub fn as_byte(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    /// Return a copy with the compressed bit set or cleared.
    #[inline]
    pub fn with_compressed(self, compressed: bool) -> Self {
        if compressed {
            Self(self.0 | Self::COMPRESSED)
        } else {
            Self(self.0 & !Self::COMPRESSED)
        }
    }
}

/// A decoded frame. The payload is always held uncompressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: FrameFlags,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            flags: FrameFlags::new(),
            payload,
        }
    }
}

/// Encoder and decoder for frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    compression_enabled: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a codec that compresses large payloads.
    pub fn new() -> Self {
        Self {
            compression_enabled: true,
        }
    }

    /// Create a codec that never compresses.
    pub fn without_compression() -> Self {
        Self {
            compression_enabled: false,
        }
    }

    /// Encode a frame into its wire representation.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let payload = &frame.payload;

        if payload.len() > MAX_FRAME_SIZE - FRAME_HEADER_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len() + FRAME_HEADER_SIZE,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut flags = frame.flags.with_compressed(false);
        let mut compressed = None;
        if self.compression_enabled && payload.len() > COMPRESSION_THRESHOLD {
            let candidate = lz4_flex::compress_prepend_size(payload);
            if candidate.len() < payload.len() {
                flags = flags.with_compressed(true);
                compressed = Some(candidate);
            }
        }
        let body = compressed.as_deref().unwrap_or(payload);

        let content_len = 1 + body.len();
        let mut output = Vec::with_capacity(PREFIX_SIZE + content_len);
        output.extend_from_slice(&FRAME_MAGIC);
        output.extend_from_slice(&(content_len as u32).to_be_bytes());
        output.push(flags.as_byte());
        output.extend_from_slice(body);

        Ok(output)
    }

    /// Decode one frame from the start of `data`.
    ///
    /// Returns the frame and the number of bytes consumed. Fails if `data`
    /// does not hold a complete frame.
    pub fn decode(&self, data: &[u8]) -> Result<(Frame, usize)> {
        match self.try_decode(data)? {
            Some(decoded) => Ok(decoded),
            None => Err(ProtocolError::Deserialization(format!(
                "insufficient data for frame: have {} bytes",
                data.len()
            ))),
        }
    }

    /// Decode one frame if `data` holds a complete one.
    ///
    /// Returns `Ok(None)` when more bytes are needed, which is what a stream
    /// reader wants between socket reads.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Frame, usize)>> {
        let Some(content_len) = parse_header(data)? else {
            return Ok(None);
        };

        let total = PREFIX_SIZE + content_len;
        if data.len() < total {
            return Ok(None);
        }

        let flags = FrameFlags::from_byte(data[PREFIX_SIZE]);
        let body = &data[FRAME_HEADER_SIZE..total];

        let payload = if flags.is_compressed() {
            lz4_flex::decompress_size_prepended(body).map_err(|e| {
                ProtocolError::Deserialization(format!("failed to decompress payload: {}", e))
            })?
        } else {
            body.to_vec()
        };

        Ok(Some((Frame::new(payload), total)))
    }
}

/// Validate the fixed header and return the content length (flags + payload).
///
/// Returns `Ok(None)` if fewer than [`FRAME_HEADER_SIZE`] bytes are available.
fn parse_header(data: &[u8]) -> Result<Option<usize>> {
    if data.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    if data[..4] != FRAME_MAGIC {
        return Err(ProtocolError::InvalidFrameMagic {
            expected: u32::from_be_bytes(FRAME_MAGIC),
            got: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
        });
    }

    let content_len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
    if PREFIX_SIZE + content_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: PREFIX_SIZE + content_len,
            max: MAX_FRAME_SIZE,
        });
    }
    if content_len == 0 {
        return Err(ProtocolError::Deserialization(
            "invalid frame: content length must include the flags byte".to_string(),
        ));
    }

    Ok(Some(content_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_flags_with_compressed() {
        let flags = FrameFlags::new().with_compressed(true);
        assert!(flags.is_compressed());
        assert_eq!(flags.as_byte(), FrameFlags::COMPRESSED);
        assert!(!flags.with_compressed(false).is_compressed());
        assert!(!FrameFlags::from_byte(0b1111_1110).is_compressed());
    }

    #[test]
    fn test_frame_header_format() {
        let codec = FrameCodec::new();
        let payload = vec![0xDE, 0xAD, 0xBE, 0xEF];
        let encoded = codec.encode(&Frame::new(payload.clone())).unwrap();

        assert_eq!(&encoded[0..4], b"ENVY");
        let length = u32::from_be_bytes([encoded[4], encoded[5], encoded[6], encoded[7]]);
        assert_eq!(length, 5);
        assert_eq!(encoded[8], 0);
        assert_eq!(&encoded[9..], &payload[..]);
    }

    #[test]
    fn test_empty_payload() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(&Frame::new(vec![])).unwrap();
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE);

        let (decoded, consumed) = codec.decode(&encoded).unwrap();
        assert!(decoded.payload.is_empty());
        assert_eq!(consumed, FRAME_HEADER_SIZE);
    }

    #[test]
    fn test_compression_threshold() {
        let codec = FrameCodec::new();

        let at_threshold = codec
            .encode(&Frame::new(vec![0u8; COMPRESSION_THRESHOLD]))
            .unwrap();
        assert_eq!(at_threshold[8] & 0x01, 0x00);

        let above = codec
            .encode(&Frame::new(vec![0u8; COMPRESSION_THRESHOLD + 1]))
            .unwrap();
        assert_eq!(above[8] & 0x01, 0x01);

        let (decoded, _) = codec.decode(&above).unwrap();
        assert_eq!(decoded.payload, vec![0u8; COMPRESSION_THRESHOLD + 1]);
        assert!(!decoded.flags.is_compressed());
    }

    #[test]
    fn test_without_compression_keeps_raw_payload() {
        let codec = FrameCodec::without_compression();
        let encoded = codec.encode(&Frame::new(vec![7u8; 4096])).unwrap();
        assert_eq!(encoded[8] & 0x01, 0x00);
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + 4096);
    }

    #[test]
    fn test_invalid_magic() {
        let codec = FrameCodec::new();
        let mut bad = b"BAD!".to_vec();
        bad.extend_from_slice(&5u32.to_be_bytes());
        bad.push(0);
        bad.extend_from_slice(&[1, 2, 3, 4]);

        assert!(matches!(
            codec.try_decode(&bad),
            Err(ProtocolError::InvalidFrameMagic { .. })
        ));
    }

    #[test]
    fn test_encode_too_large() {
        let codec = FrameCodec::without_compression();
        let result = codec.encode(&Frame::new(vec![0u8; MAX_FRAME_SIZE]));
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_decode_oversized_length() {
        let codec = FrameCodec::new();
        let mut bad = FRAME_MAGIC.to_vec();
        bad.extend_from_slice(&(MAX_FRAME_SIZE as u32).to_be_bytes());
        bad.push(0);

        assert!(matches!(
            codec.try_decode(&bad),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_zero_content_length_rejected() {
        let codec = FrameCodec::new();
        let mut bad = FRAME_MAGIC.to_vec();
        bad.extend_from_slice(&0u32.to_be_bytes());
        bad.push(0);

        assert!(codec.try_decode(&bad).is_err());
    }

    #[test]
    fn test_try_decode_partial_data() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(&Frame::new(vec![1, 2, 3, 4, 5])).unwrap();

        for i in 0..encoded.len() {
            assert!(
                codec.try_decode(&encoded[..i]).unwrap().is_none(),
                "prefix of {} bytes should need more data",
                i
            );
        }

        let (frame, consumed) = codec.try_decode(&encoded).unwrap().unwrap();
        assert_eq!(frame.payload, vec![1, 2, 3, 4, 5]);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_decode_partial_is_error() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(&Frame::new(vec![1, 2, 3])).unwrap();
        let err = codec.decode(&encoded[..encoded.len() - 1]).unwrap_err();
        assert!(err.to_string().contains("insufficient data"));
    }

    #[test]
    fn test_corrupted_compressed_payload() {
        let codec = FrameCodec::new();
        let mut bad = FRAME_MAGIC.to_vec();
        bad.extend_from_slice(&10u32.to_be_bytes());
        bad.push(FrameFlags::COMPRESSED);
        bad.extend_from_slice(&[0xFF; 9]);

        let err = codec.decode(&bad).unwrap_err();
        assert!(err.to_string().contains("decompress"));
    }

    #[test]
    fn test_back_to_back_frames() {
        let codec = FrameCodec::new();
        let first = codec.encode(&Frame::new(vec![1, 2, 3])).unwrap();
        let second = codec.encode(&Frame::new(vec![4, 5, 6, 7])).unwrap();

        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        let (a, used) = codec.decode(&stream).unwrap();
        assert_eq!(a.payload, vec![1, 2, 3]);
        assert_eq!(used, first.len());

        let (b, _) = codec.decode(&stream[used..]).unwrap();
        assert_eq!(b.payload, vec![4, 5, 6, 7]);
    }
}
