//! Application handler capability.

use std::future::Future;
use std::net::SocketAddr;

use crate::error::HandlerError;
use crate::header::Headers;
use crate::stream::Stream;

/// What a SYN_STREAM announced.
#[derive(Debug, Clone)]
pub struct Request {
    pub stream_id: u32,
    pub priority: u8,
    /// Non-zero for pushed streams.
    pub associated_stream_id: u32,
    pub headers: Headers,
    pub remote_addr: Option<SocketAddr>,
}

impl Request {
    pub fn method(&self) -> Option<&str> {
        self.headers.get(":method")
    }

    pub fn path(&self) -> Option<&str> {
        self.headers.get(":path")
    }

    pub fn host(&self) -> Option<&str> {
        self.headers.get(":host")
    }

    pub fn scheme(&self) -> Option<&str> {
        self.headers.get(":scheme")
    }

    pub fn version(&self) -> Option<&str> {
        self.headers.get(":version")
    }

    pub fn is_push(&self) -> bool {
        self.associated_stream_id != 0
    }
}

/// Serves one inbound stream. Runs in its own task; returning ends the
/// stream (see [`Stream`] for what completion sends).
pub trait Handler: Send + Sync + 'static {
    fn serve(
        &self,
        stream: Stream,
        request: Request,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send;
}

impl<F, Fut> Handler for F
where
    F: Fn(Stream, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    fn serve(
        &self,
        stream: Stream,
        request: Request,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send {
        self(stream, request)
    }
}
