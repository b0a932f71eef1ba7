//! Message Framing
//!
//! Each frame on the wire is a 4-byte big-endian length followed by exactly
//! that many payload bytes. [`FrameDecoder`] reassembles frames from reads of
//! arbitrary size, keeping its state between calls.

use bytes::{Bytes, BytesMut};

/// Size of the length prefix.
pub const HEADER_SIZE: usize = 4;

/// Largest payload accepted from a peer (10MB).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Framing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    TooLarge(usize),
}

/// Encode a payload as a length-prefixed frame.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(payload.len()));
    }
    let len = payload.len() as u32;

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);

    Ok(frame)
}

/// Decode a length from the first 4 bytes.
pub fn decode_length(buf: &[u8; HEADER_SIZE]) -> u32 {
    u32::from_be_bytes(*buf)
}

/// Streaming decoder for length-prefixed frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    header: [u8; HEADER_SIZE],
    header_read: usize,
    body_len: Option<usize>,
    body: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume bytes from `data` until the current frame is complete.
    ///
    /// Returns the number of bytes consumed. Bytes past the end of the frame
    /// are left for the caller to feed again after [`take`] or [`reset`].
    /// Once satisfied, the decoder consumes nothing.
    ///
    /// [`take`]: FrameDecoder::take
    /// [`reset`]: FrameDecoder::reset
    pub fn decode(&mut self, data: &[u8]) -> Result<usize, FrameError> {
        if self.is_satisfied() {
            return Ok(0);
        }

        let mut consumed = 0;

        if self.body_len.is_none() {
            let want = HEADER_SIZE - self.header_read;
            let n = want.min(data.len());
            self.header[self.header_read..self.header_read + n].copy_from_slice(&data[..n]);
            self.header_read += n;
            consumed += n;

            if self.header_read < HEADER_SIZE {
                return Ok(consumed);
            }

            let len = decode_length(&self.header) as usize;
            if len > MAX_FRAME_SIZE {
                return Err(FrameError::TooLarge(len));
            }
            self.body_len = Some(len);
            self.body.reserve(len);
        }

        let remaining = self.body_len.unwrap_or(0) - self.body.len();
        let n = remaining.min(data.len() - consumed);
        self.body.extend_from_slice(&data[consumed..consumed + n]);
        consumed += n;

        Ok(consumed)
    }

    /// Whether a complete frame has been assembled.
    pub fn is_satisfied(&self) -> bool {
        matches!(self.body_len, Some(len) if self.body.len() == len)
    }

    /// Payload assembled so far.
    pub fn data(&self) -> &[u8] {
        &self.body
    }

    /// Take the completed payload and reset for the next frame.
    pub fn take(&mut self) -> Bytes {
        let payload = self.body.split().freeze();
        self.reset();
        payload
    }

    /// Discard any partial frame.
    pub fn reset(&mut self) {
        self.header_read = 0;
        self.body_len = None;
        self.body.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame() {
        let frame = encode_frame(b"hello").unwrap();
        assert_eq!(frame.len(), HEADER_SIZE + 5);
        assert_eq!(&frame[..4], &[0, 0, 0, 5]);
        assert_eq!(&frame[4..], b"hello");
    }

    #[test]
    fn test_decode_length() {
        assert_eq!(decode_length(&[0, 0, 1, 0]), 256);
        assert_eq!(decode_length(&[0, 0, 0, 0]), 0);
    }

    #[test]
    fn test_decode_whole_frame() {
        let frame = encode_frame(b"payload").unwrap();
        let mut decoder = FrameDecoder::new();

        let consumed = decoder.decode(&frame).unwrap();
        assert_eq!(consumed, frame.len());
        assert!(decoder.is_satisfied());
        assert_eq!(decoder.data(), b"payload");
    }

    #[test]
    fn test_decode_byte_at_a_time() {
        let frame = encode_frame(b"split across reads").unwrap();
        let mut decoder = FrameDecoder::new();

        for (i, byte) in frame.iter().enumerate() {
            assert!(!decoder.is_satisfied(), "satisfied early at byte {}", i);
            assert_eq!(decoder.decode(std::slice::from_ref(byte)).unwrap(), 1);
        }

        assert!(decoder.is_satisfied());
        assert_eq!(&decoder.take()[..], b"split across reads");
        assert!(!decoder.is_satisfied());
    }

    #[test]
    fn test_decode_split_header() {
        let frame = encode_frame(b"abc").unwrap();
        let mut decoder = FrameDecoder::new();

        assert_eq!(decoder.decode(&frame[..2]).unwrap(), 2);
        assert!(!decoder.is_satisfied());
        assert_eq!(decoder.decode(&frame[2..]).unwrap(), 5);
        assert!(decoder.is_satisfied());
        assert_eq!(decoder.data(), b"abc");
    }

    #[test]
    fn test_decode_two_frames_in_one_buffer() {
        let mut buf = encode_frame(b"first").unwrap();
        buf.extend(encode_frame(b"second").unwrap());
        let mut decoder = FrameDecoder::new();

        let consumed = decoder.decode(&buf).unwrap();
        assert_eq!(consumed, HEADER_SIZE + 5);
        assert_eq!(&decoder.take()[..], b"first");

        // satisfied decoder takes nothing more until drained
        let rest = &buf[consumed..];
        assert_eq!(decoder.decode(rest).unwrap(), rest.len());
        assert_eq!(decoder.decode(b"xyz").unwrap(), 0);
        assert_eq!(&decoder.take()[..], b"second");
    }

    #[test]
    fn test_decode_empty_frame() {
        let frame = encode_frame(&[]).unwrap();
        let mut decoder = FrameDecoder::new();

        assert_eq!(decoder.decode(&frame).unwrap(), HEADER_SIZE);
        assert!(decoder.is_satisfied());
        assert!(decoder.data().is_empty());
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let len = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        let mut decoder = FrameDecoder::new();

        let result = decoder.decode(&len);
        assert_eq!(result, Err(FrameError::TooLarge(MAX_FRAME_SIZE + 1)));
    }

    #[test]
    fn test_reset_discards_partial_frame() {
        let frame = encode_frame(b"partial").unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.decode(&frame[..6]).unwrap();

        decoder.reset();
        assert!(decoder.data().is_empty());

        decoder.decode(&encode_frame(b"ok").unwrap()).unwrap();
        assert_eq!(decoder.data(), b"ok");
    }
}
