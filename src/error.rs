//! Error types for every layer of the crate.
//!
//! Codec errors never tear anything down on their own: the connection decides
//! whether a malformed frame costs a single frame, a stream or the whole
//! connection.

use std::io;

use thiserror::Error;

/// Failure to parse or encode a single frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Too few bytes for the frame, or the declared length disagrees with the data.
    #[error("incorrect amount of data for frame: got {got} bytes, expected {expected}")]
    LengthMismatch { got: usize, expected: usize },
    /// A named field held a value the protocol does not allow.
    #[error("field {field:?} received invalid data {got}, expecting {expected}")]
    InvalidField {
        field: &'static str,
        got: u32,
        expected: u32,
    },
    /// Control frame type this codec does not know. SPDY peers must ignore these.
    #[error("unknown control frame type {0}")]
    UnknownType(u16),
    #[error("header block error: {0}")]
    Header(#[from] HeaderError),
}

impl FrameError {
    pub(crate) fn invalid(field: &'static str, got: u32, expected: u32) -> Self {
        FrameError::InvalidField {
            field,
            got,
            expected,
        }
    }
}

/// Failure inside the header block collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("header compression failed: {0}")]
    Compression(String),
    #[error("header decompression failed: {0}")]
    Decompression(String),
    #[error("malformed header block: {0}")]
    Malformed(String),
}

/// Failure of an operation on a single stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("stream {0} was cancelled")]
    Cancelled(u32),
    #[error("stream {0} is closed for sending")]
    Closed(u32),
    #[error("stream {stream_id} was reset with status {status}")]
    Reset { stream_id: u32, status: u32 },
    #[error("stream {stream_id} pending queue is full ({queued} bytes queued, limit {limit})")]
    QueueFull {
        stream_id: u32,
        queued: usize,
        limit: usize,
    },
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("stream {stream_id} cannot process {frame} frames")]
    UnexpectedFrame { stream_id: u32, frame: &'static str },
}

/// Failure that ends (or prevents) a connection-level operation.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    #[error("transport deadline exceeded")]
    Timeout,
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("protocol error (status {status}): {reason}")]
    Protocol { status: u32, reason: String },
    #[error("connection is closed")]
    Closed,
    #[error("connection is going away")]
    GoingAway,
    #[error("peer allows at most {0} concurrent streams")]
    StreamLimit(u32),
    #[error("stream identifiers exhausted")]
    StreamIdsExhausted,
    #[error("connection is already running")]
    AlreadyRunning,
}

/// Error returned by an application handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("handler aborted: {0}")]
    Aborted(String),
}
