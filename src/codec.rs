//! Byte-stream framing around the frame codec.
//!
//! [`FrameDecoder`] buffers whatever arrives from the transport and yields
//! complete frames; [`FrameEncoder`] owns the outbound compression context.
//! Neither touches I/O.

use bytes::BytesMut;
use thiserror::Error;

use crate::error::FrameError;
use crate::frame::{frame_type, Frame, FrameHeader};
use crate::header::{Compressor, Decompressor};

/// A frame that was complete on the wire but failed to parse.
///
/// The bytes have already been consumed, so decoding can continue with the
/// next frame if the caller decides the error is recoverable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{source} (frame type {}, stream {stream_id:?})", .header.frame_type)]
pub struct DecodeError {
    pub header: FrameHeader,
    /// Stream the broken frame addressed, when it could be read.
    pub stream_id: Option<u32>,
    #[source]
    pub source: FrameError,
}

impl DecodeError {
    /// The decompression context is unusable after a failed header block.
    pub fn is_fatal(&self) -> bool {
        matches!(self.source, FrameError::Header(_))
            || (self.header.control
                && frame_type::carries_headers(self.header.frame_type))
    }

    /// Unknown control frame types must be ignored.
    pub fn is_unknown_type(&self) -> bool {
        matches!(self.source, FrameError::UnknownType(_))
    }
}

/// Incremental frame decoder.
pub struct FrameDecoder {
    buffer: BytesMut,
    decompressor: Box<dyn Decompressor>,
}

impl std::fmt::Debug for FrameDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDecoder")
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl FrameDecoder {
    pub fn new(decompressor: Box<dyn Decompressor>) -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
            decompressor,
        }
    }

    /// Append received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Read buffer, for filling directly from the transport.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Next complete frame, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Option<Result<Frame, DecodeError>> {
        let header = FrameHeader::parse(&self.buffer)?;

        // Need the complete frame
        let total_size = header.total_size();
        if self.buffer.len() < total_size {
            self.buffer.reserve(total_size - self.buffer.len());
            return None;
        }

        let raw = self.buffer.split_to(total_size).freeze();
        let result = Frame::parse(&raw, self.decompressor.as_mut()).map_err(|source| DecodeError {
            header,
            stream_id: header.stream_id_in(&raw),
            source,
        });
        Some(result)
    }

    /// Decode every complete frame currently buffered.
    pub fn drain(&mut self) -> Vec<Result<Frame, DecodeError>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }
}

/// Outbound side: frames to bytes, sharing one compression context.
pub struct FrameEncoder {
    compressor: Box<dyn Compressor>,
}

impl std::fmt::Debug for FrameEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameEncoder").finish_non_exhaustive()
    }
}

impl FrameEncoder {
    pub fn new(compressor: Box<dyn Compressor>) -> Self {
        Self { compressor }
    }

    pub fn encode(&mut self, frame: &Frame) -> Result<Vec<u8>, FrameError> {
        frame.encode(self.compressor.as_mut())
    }
}
