//! Frame encoding/decoding for the session protocol
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+
//! |  Type  |      Stream ID (3B)      |
//! +--------+--------+--------+--------+
//! |   Length (2B)   | Pad len|
//! +--------+--------+--------+
//! |              Payload              |
//! +--------+--------+--------+--------+
//! |              Padding              |
//! +--------+--------+--------+--------+
//! ```

use super::MuxError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 7;

/// Maximum payload size of a single frame
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Largest stream id representable in the 3-byte field
pub const MAX_STREAM_ID: u32 = 0x00FF_FFFF;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Data frame
    Data = 0x00,
    /// Stream open request, payload is the destination
    StreamOpen = 0x01,
    /// Stream close
    StreamClose = 0x02,
    /// Window update (flow control)
    WindowUpdate = 0x03,
    /// Ping (keepalive)
    Ping = 0x04,
    /// Pong (keepalive response)
    Pong = 0x05,
    /// Go away (session closing)
    GoAway = 0x06,
    /// Padding only (for traffic shaping)
    Padding = 0x07,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameType::Data),
            0x01 => Ok(FrameType::StreamOpen),
            0x02 => Ok(FrameType::StreamClose),
            0x03 => Ok(FrameType::WindowUpdate),
            0x04 => Ok(FrameType::Ping),
            0x05 => Ok(FrameType::Pong),
            0x06 => Ok(FrameType::GoAway),
            0x07 => Ok(FrameType::Padding),
            _ => Err(MuxError::InvalidFrame(format!(
                "Unknown frame type: {}",
                value
            ))),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Stream ID (0 for session-level frames)
    pub stream_id: u32,
    /// Payload data
    pub payload: Bytes,
    /// Padding length
    pub padding_len: u8,
}

impl Frame {
    fn new(frame_type: FrameType, stream_id: u32, payload: Bytes) -> Self {
        Self {
            frame_type,
            stream_id,
            payload,
            padding_len: 0,
        }
    }

    /// Create a new data frame
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self::new(FrameType::Data, stream_id, payload)
    }

    /// Create a stream open frame
    pub fn stream_open(stream_id: u32, destination: &str) -> Self {
        Self::new(
            FrameType::StreamOpen,
            stream_id,
            Bytes::copy_from_slice(destination.as_bytes()),
        )
    }

    /// Create a stream close frame
    pub fn stream_close(stream_id: u32) -> Self {
        Self::new(FrameType::StreamClose, stream_id, Bytes::new())
    }

    /// Create a window update frame
    pub fn window_update(stream_id: u32, increment: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(increment);
        Self::new(FrameType::WindowUpdate, stream_id, payload.freeze())
    }

    /// Create a ping frame
    pub fn ping(data: u64) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u64(data);
        Self::new(FrameType::Ping, 0, payload.freeze())
    }

    /// Create a pong frame
    pub fn pong(payload: Bytes) -> Self {
        Self::new(FrameType::Pong, 0, payload)
    }

    /// Create a go-away frame
    pub fn go_away() -> Self {
        Self::new(FrameType::GoAway, 0, Bytes::new())
    }

    /// Create a padding-only frame
    pub fn padding(len: usize) -> Self {
        Self::new(FrameType::Padding, 0, Bytes::new()).with_padding(len)
    }

    /// Attach `len` bytes of random padding (capped at 255)
    pub fn with_padding(mut self, len: usize) -> Self {
        self.padding_len = len.min(u8::MAX as usize) as u8;
        self
    }

    /// Destination carried by a stream open frame
    pub fn destination(&self) -> Result<String, MuxError> {
        match std::str::from_utf8(&self.payload) {
            Ok(s) if s.contains(':') => Ok(s.to_string()),
            Ok(s) => Err(MuxError::InvalidFrame(format!(
                "Invalid destination (no port): {}",
                s
            ))),
            Err(_) => Err(MuxError::InvalidFrame("Non UTF-8 destination".to_string())),
        }
    }

    /// Increment carried by a window update frame
    pub fn window_increment(&self) -> Result<u32, MuxError> {
        let bytes: [u8; 4] = self.payload[..]
            .try_into()
            .map_err(|_| MuxError::InvalidFrame("Invalid window update".to_string()))?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        let payload_len = self.payload.len();
        let total_len = FRAME_HEADER_SIZE + payload_len + self.padding_len as usize;

        let mut buf = BytesMut::with_capacity(total_len);

        // Type (1 byte)
        buf.put_u8(self.frame_type as u8);

        // Stream ID (3 bytes, big endian)
        buf.put_u8((self.stream_id >> 16) as u8);
        buf.put_u16(self.stream_id as u16);

        // Payload length (2 bytes)
        buf.put_u16(payload_len as u16);

        // Padding length (1 byte)
        buf.put_u8(self.padding_len);

        buf.extend_from_slice(&self.payload);

        if self.padding_len > 0 {
            let mut padding = vec![0u8; self.padding_len as usize];
            rand::thread_rng().fill_bytes(&mut padding);
            buf.extend_from_slice(&padding);
        }

        buf
    }

    /// Decode a frame from the front of `buf`, if complete
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, MuxError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Peek at header to get lengths
        let frame_type = FrameType::try_from(buf[0])?;
        let stream_id = ((buf[1] as u32) << 16) | ((buf[2] as u32) << 8) | (buf[3] as u32);
        let payload_len = ((buf[4] as usize) << 8) | (buf[5] as usize);
        let padding_len = buf[6] as usize;

        let total_len = FRAME_HEADER_SIZE + payload_len + padding_len;

        if buf.len() < total_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();
        buf.advance(padding_len);

        Ok(Some(Self {
            frame_type,
            stream_id,
            payload,
            padding_len: padding_len as u8,
        }))
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len() + self.padding_len as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let original = Frame::data(42, Bytes::from_static(b"Hello, World!"));
        let mut encoded = original.encode();
        assert_eq!(encoded.len(), original.encoded_size());

        let decoded = Frame::decode(&mut encoded).unwrap().unwrap();

        assert_eq!(decoded.frame_type, original.frame_type);
        assert_eq!(decoded.stream_id, original.stream_id);
        assert_eq!(decoded.payload, original.payload);
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_frame_with_padding() {
        let original = Frame::data(1, Bytes::from_static(b"Test")).with_padding(16);
        let mut encoded = original.encode();

        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + 4 + 16);

        let decoded = Frame::decode(&mut encoded).unwrap().unwrap();
        assert_eq!(&decoded.payload[..], b"Test");
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let encoded = Frame::data(3, Bytes::from_static(b"abcdef")).encode();
        let mut partial = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(Frame::decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), encoded.len() - 1);
    }

    #[test]
    fn test_stream_open_frame() {
        let frame = Frame::stream_open(0x012345, "example.com:443");

        let mut encoded = frame.encode();
        assert_eq!(&encoded[1..4], &[0x01, 0x23, 0x45]);
        let decoded = Frame::decode(&mut encoded).unwrap().unwrap();

        assert_eq!(decoded.frame_type, FrameType::StreamOpen);
        assert_eq!(decoded.stream_id, 0x012345);
        assert_eq!(decoded.destination().unwrap(), "example.com:443");
    }

    #[test]
    fn test_invalid_frames() {
        let mut buf = BytesMut::from(&[0x09u8, 0, 0, 1, 0, 0, 0][..]);
        assert!(Frame::decode(&mut buf).is_err());

        let frame = Frame::stream_open(1, "no-port");
        assert!(frame.destination().is_err());

        let frame = Frame::data(1, Bytes::from_static(b"abc"));
        assert!(frame.window_increment().is_err());
        assert_eq!(Frame::window_update(1, 77).window_increment().unwrap(), 77);
    }
}
