//! Wire frames
//!
//! Every message between nodes is one frame:
//!
//! ```text
//! [2 bytes: version][4 bytes: message id][1 byte: record type]
//! [4 bytes: payload length][payload][1 byte: terminator]
//! ```
//!
//! Integers are little-endian. The record type is always `0x02` (sized
//! payload), so the total frame length is `HEADER_LEN + length + 1`.

use crate::error::{AgentError, Result};
use std::io::{ErrorKind, Read, Write};

/// Protocol version written into every frame
pub const VERSION: u16 = 1;

/// Record type of a length-prefixed payload
pub const SIZED_PAYLOAD: u8 = 0x02;

/// Last byte of every frame
pub const TERMINATOR: u8 = 0xFE;

/// Bytes before the payload
pub const HEADER_LEN: usize = 2 + 4 + 1 + 4;

/// Largest payload accepted from a peer
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_id: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(message_id: u32, payload: Vec<u8>) -> Self {
        Frame { message_id, payload }
    }

    /// Total encoded length
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len() + 1
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = payload_len(self.payload.len())?;
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&self.message_id.to_le_bytes());
        out.push(SIZED_PAYLOAD);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out.push(TERMINATOR);
        Ok(out)
    }

    /// Decode the frame at the start of `bytes`.
    ///
    /// Returns the frame and the number of bytes it occupied, or `None` if
    /// `bytes` does not yet hold a complete frame.
    pub fn decode(bytes: &[u8]) -> Result<Option<(Frame, usize)>> {
        if bytes.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header_buf = [0u8; HEADER_LEN];
        header_buf.copy_from_slice(&bytes[..HEADER_LEN]);
        let header = Header::parse(header_buf)?;
        let total = HEADER_LEN + header.len + 1;
        if bytes.len() < total {
            return Ok(None);
        }
        if bytes[total - 1] != TERMINATOR {
            return Err(AgentError::Codec(format!(
                "Bad frame terminator 0x{:02x}",
                bytes[total - 1]
            )));
        }
        let frame = Frame::new(header.message_id, bytes[HEADER_LEN..total - 1].to_vec());
        Ok(Some((frame, total)))
    }

    /// Read one frame. Returns `None` if the stream ends cleanly before a
    /// new frame starts; an end of stream inside a frame is an error.
    pub fn read_from(reader: &mut impl Read) -> Result<Option<Frame>> {
        let mut header_buf = [0u8; HEADER_LEN];
        loop {
            match reader.read(&mut header_buf[..1]) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        reader.read_exact(&mut header_buf[1..])?;
        let header = Header::parse(header_buf)?;

        let mut data = vec![0u8; header.len + 1];
        reader.read_exact(&mut data)?;
        if data.pop() != Some(TERMINATOR) {
            return Err(AgentError::Codec("Bad frame terminator".to_string()));
        }
        Ok(Some(Frame::new(header.message_id, data)))
    }

    pub fn write_to(&self, writer: &mut impl Write) -> Result<()> {
        writer.write_all(&self.encode()?)?;
        writer.flush()?;
        Ok(())
    }
}

struct Header {
    message_id: u32,
    len: usize,
}

impl Header {
    fn parse(buf: [u8; HEADER_LEN]) -> Result<Self> {
        let version = u16::from_le_bytes([buf[0], buf[1]]);
        if version != VERSION {
            return Err(AgentError::Codec(format!("Unsupported frame version {}", version)));
        }
        let message_id = u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]);
        if buf[6] != SIZED_PAYLOAD {
            return Err(AgentError::Codec(format!("Unknown record type 0x{:02x}", buf[6])));
        }
        let len = u32::from_le_bytes([buf[7], buf[8], buf[9], buf[10]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(AgentError::Codec(format!("Frame payload too large: {} bytes", len)));
        }
        Ok(Header { message_id, len })
    }
}

fn payload_len(len: usize) -> Result<u32> {
    if len > MAX_PAYLOAD {
        return Err(AgentError::Codec(format!("Frame payload too large: {} bytes", len)));
    }
    Ok(len as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_layout() {
        let bytes = Frame::new(7, vec![0xAA]).encode().unwrap();
        assert_eq!(bytes, vec![1, 0, 7, 0, 0, 0, 0x02, 1, 0, 0, 0, 0xAA, 0xFE]);
    }

    #[test]
    fn test_length_determines_frame() {
        for len in [0usize, 1, 70_000] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let frame = Frame::new(2, payload);
            let mut bytes = frame.encode().unwrap();
            assert_eq!(bytes.len(), HEADER_LEN + len + 1);

            // Trailing bytes belong to the next frame.
            bytes.extend_from_slice(&[1, 2, 3]);
            let (decoded, used) = Frame::decode(&bytes).unwrap().unwrap();
            assert_eq!(used, HEADER_LEN + len + 1);
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_partial_input() {
        let bytes = Frame::new(1, b"node-a".to_vec()).encode().unwrap();
        assert!(Frame::decode(&bytes[..5]).unwrap().is_none());
        assert!(Frame::decode(&bytes[..bytes.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn test_bad_terminator() {
        let mut bytes = Frame::new(1, vec![9]).encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] = 0x00;
        assert!(matches!(Frame::decode(&bytes), Err(AgentError::Codec(_))));
    }

    #[test]
    fn test_bad_version_and_record_type() {
        let mut bytes = Frame::new(1, vec![]).encode().unwrap();
        bytes[0] = 9;
        assert!(Frame::decode(&bytes).is_err());

        let mut bytes = Frame::new(1, vec![]).encode().unwrap();
        bytes[6] = 0x01;
        assert!(Frame::decode(&bytes).is_err());
    }

    #[test]
    fn test_stream_read_write() {
        let mut buf = Vec::new();
        Frame::new(1, b"hello".to_vec()).write_to(&mut buf).unwrap();
        Frame::new(2, Vec::new()).write_to(&mut buf).unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(Frame::read_from(&mut cursor).unwrap().unwrap().payload, b"hello");
        assert_eq!(Frame::read_from(&mut cursor).unwrap().unwrap().message_id, 2);
        assert!(Frame::read_from(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_truncated_header() {
        let bytes = Frame::new(1, vec![1, 2, 3]).encode().unwrap();
        let mut cursor = Cursor::new(bytes[..5].to_vec());
        assert!(matches!(Frame::read_from(&mut cursor), Err(AgentError::Io(_))));

        let mut cursor = Cursor::new(bytes[..1].to_vec());
        assert!(matches!(Frame::read_from(&mut cursor), Err(AgentError::Io(_))));

        let mut empty = Cursor::new(Vec::new());
        assert!(Frame::read_from(&mut empty).unwrap().is_none());
    }

    #[test]
    fn test_truncated_stream() {
        let bytes = Frame::new(1, vec![1, 2, 3]).encode().unwrap();
        let mut cursor = Cursor::new(bytes[..HEADER_LEN + 1].to_vec());
        assert!(matches!(Frame::read_from(&mut cursor), Err(AgentError::Io(_))));
    }
}
