//! Sentinel-delimited framing for streamed generation units
//!
//! Each unit is serialized as JSON and terminated by a single NUL byte. JSON
//! string encoding escapes control characters, so the delimiter never occurs
//! inside an encoded unit.

use crate::StreamUnit;
use bytes::Bytes;
use thiserror::Error;

/// Frame terminator
pub const FRAME_DELIMITER: u8 = b'\0';

#[derive(Error, Debug)]
pub enum FramingError {
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// Stream ended with bytes that were never terminated
    #[error("Truncated frame: {0} bytes without delimiter at end of stream")]
    Truncated(usize),
}

/// Encode one unit followed by the delimiter
pub fn encode_frame(unit: &StreamUnit) -> Result<Bytes, FramingError> {
    let mut buf = serde_json::to_vec(unit)?;
    buf.push(FRAME_DELIMITER);
    Ok(Bytes::from(buf))
}

/// Incremental decoder for a sentinel-delimited byte stream
///
/// Chunk boundaries from the transport are arbitrary; a frame may span
/// several chunks and a chunk may hold several frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every frame it completes, in order
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<StreamUnit>, FramingError> {
        let mut units = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == FRAME_DELIMITER) {
            self.pending.extend_from_slice(&rest[..pos]);
            let frame = std::mem::take(&mut self.pending);
            units.push(serde_json::from_slice(&frame)?);
            rest = &rest[pos + 1..];
        }
        self.pending.extend_from_slice(rest);

        Ok(units)
    }

    /// Signal end of stream; leftover bytes are a framing error
    pub fn finish(self) -> Result<(), FramingError> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(FramingError::Truncated(self.pending.len()))
        }
    }
}

/// Decode a complete body
pub fn decode_frames(body: &[u8]) -> Result<Vec<StreamUnit>, FramingError> {
    let mut decoder = FrameDecoder::new();
    let units = decoder.push(body)?;
    decoder.finish()?;
    Ok(units)
}
