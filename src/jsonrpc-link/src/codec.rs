//! Length-prefixed framing for JSON-RPC payloads.
//!
//! Every payload travels as one frame:
//!
//! ```text
//! <hex-length>\r\n<payload>\r\n
//! ```
//!
//! where `hex-length` is the lowercase hexadecimal byte length of the payload.

use thiserror::Error;
use tracing::warn;

/// Largest payload a single frame may carry (64 KiB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

const DELIMITER: &[u8] = b"\r\n";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("message too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },
}

/// Wraps `payload` into a single frame.
pub fn encode_frame(payload: &[u8], max_message_size: usize) -> Result<Vec<u8>, FrameError> {
    if payload.len() > max_message_size {
        return Err(FrameError::TooLarge {
            size: payload.len(),
            max: max_message_size,
        });
    }

    let header = format!("{:x}", payload.len());
    let mut frame = Vec::with_capacity(header.len() + payload.len() + 2 * DELIMITER.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(DELIMITER);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(DELIMITER);
    Ok(frame)
}

/// Incremental frame decoder fed with whatever the transport delivers.
///
/// Bytes accumulate until at least one complete frame is available. Pipelined
/// frames in a single chunk are all returned by the same [`FrameDecoder::push`].
/// A buffer that cannot yield a frame within `max_message_size` bytes is
/// dropped as a whole; the decoder never tries to resynchronise inside it.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_message_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl FrameDecoder {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_message_size,
        }
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Appends `data` and returns every payload completed by it.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            match self.next_frame() {
                Decoded::Frame(payload) => frames.push(payload),
                Decoded::Incomplete => break,
                Decoded::Invalid(reason) => {
                    warn!(
                        buffered = self.buffer.len(),
                        reason, "discarding unparseable read buffer"
                    );
                    self.buffer.clear();
                    break;
                }
            }
        }
        frames
    }

    fn next_frame(&mut self) -> Decoded {
        let Some(header_end) = find_delimiter(&self.buffer) else {
            if self.buffer.len() > self.max_message_size {
                return Decoded::Invalid("no frame header within max message size");
            }
            return Decoded::Incomplete;
        };

        let Some(len) = std::str::from_utf8(&self.buffer[..header_end])
            .ok()
            .filter(|h| !h.is_empty())
            .and_then(|h| usize::from_str_radix(h, 16).ok())
        else {
            return Decoded::Invalid("malformed frame length");
        };

        if len > self.max_message_size {
            return Decoded::Invalid("frame length exceeds max message size");
        }

        let payload_start = header_end + DELIMITER.len();
        let payload_end = payload_start + len;
        let frame_end = payload_end + DELIMITER.len();
        if self.buffer.len() < frame_end {
            return Decoded::Incomplete;
        }

        if &self.buffer[payload_end..frame_end] != DELIMITER {
            return Decoded::Invalid("missing frame trailer");
        }

        let payload = self.buffer[payload_start..payload_end].to_vec();
        self.buffer.drain(..frame_end);
        Decoded::Frame(payload)
    }
}

enum Decoded {
    Frame(Vec<u8>),
    Incomplete,
    Invalid(&'static str),
}

fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(DELIMITER.len()).position(|w| w == DELIMITER)
}
