//! spdy-mux: SPDY/3 frame codec and connection multiplexer
//!
//! This crate implements the wire protocol and stream multiplexing layer of
//! SPDY/3 (and the SPDY/3.1 connection window) over any tokio byte stream.
//!
//! # Features
//!
//! - **Frame Codec**: Pure parse/encode for SYN_STREAM, SYN_REPLY, RST_STREAM,
//!   SETTINGS, PING, GOAWAY, HEADERS, WINDOW_UPDATE, CREDENTIAL and DATA
//! - **Header Compression**: zlib with the SPDY/3 dictionary via flate2, or
//!   any [`Compressor`]/[`Decompressor`] pair
//! - **Multiplexing**: 8 priority lanes, one send task, one read loop,
//!   one task per stream handler
//! - **Flow Control**: Per-stream windows with bounded pending queues,
//!   SPDY/3.1 connection window, receive window replenishment
//! - **Lifecycle**: PING round trips, GOAWAY, graceful shutdown, server push
//!
//! # Quick Start
//!
//! ```rust
//! use spdy_mux::{Frame, Ping, ZlibCompressor, ZlibDecompressor};
//!
//! let mut compressor = ZlibCompressor::new().unwrap();
//! let mut decompressor = ZlibDecompressor::new();
//!
//! let bytes = Frame::Ping(Ping { id: 1 }).encode(&mut compressor).unwrap();
//! assert_eq!(bytes.len(), 12);
//!
//! let frame = Frame::parse(&bytes, &mut decompressor).unwrap();
//! assert_eq!(frame, Frame::Ping(Ping { id: 1 }));
//! ```
//!
//! Serving a connection:
//!
//! ```rust,no_run
//! use spdy_mux::{Config, Connection, HandlerError, Request, Stream};
//!
//! async fn hello(stream: Stream, request: Request) -> Result<(), HandlerError> {
//!     let _body = stream.read_to_end().await?;
//!     stream.set_header("content-type", "text/plain");
//!     stream.write_header(200)?;
//!     stream.write(format!("hello {}", request.path().unwrap_or("/")).as_bytes())?;
//!     Ok(())
//! }
//!
//! # async fn serve(socket: tokio::io::DuplexStream) -> Result<(), spdy_mux::ConnectionError> {
//! let conn = Connection::new(socket, Config::server())?;
//! conn.run(hello).await
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`frame`]: frames as a closed enum, bytes in and out
//! - [`codec`]: buffered decoding and the outbound compression context
//! - [`stream`]: sans-io stream state machine and the [`Stream`] handle
//! - [`connection`]: read loop, send loop, dispatch, ids and shutdown
//!
//! It does NOT provide:
//! - TLS or NPN negotiation (hand in an established stream)
//! - HTTP request/response objects (headers are a plain mapping)

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handler;
pub mod header;
pub mod priority;
pub mod registry;
pub mod stream;

pub use codec::{DecodeError, FrameDecoder, FrameEncoder};
pub use config::{Config, OverflowPolicy, ProtocolVersion, Role};
pub use connection::Connection;
pub use error::{ConnectionError, FrameError, HandlerError, HeaderError, StreamError};
pub use frame::{
    flags, frame_type, goaway_status, rst_status, setting_flags, settings_id, Credential, Data,
    Frame, FrameHeader, GoAway, HeadersFrame, Ping, RstStream, Setting, Settings, SynReply,
    SynStream, WindowUpdate, MAX_FRAME_LENGTH, MAX_STREAM_ID, MAX_WINDOW_SIZE, SPDY_VERSION,
};
pub use handler::{Handler, Request};
pub use header::{Compressor, Decompressor, Headers, ZlibCompressor, ZlibDecompressor};
pub use priority::PriorityQueue;
pub use stream::{Stream, StreamState};
