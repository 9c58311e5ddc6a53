//! Raw SPDY peer driving the other end of an in-memory transport

use std::time::Duration;

use bytes::Bytes;
use spdy_mux::{
    flags, Config, Connection, ConnectionError, Data, Frame, FrameDecoder, FrameEncoder, Handler,
    Headers, Settings, SynStream, WindowUpdate, ZlibCompressor, ZlibDecompressor,
};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub struct Peer {
    io: DuplexStream,
    encoder: FrameEncoder,
    decoder: FrameDecoder,
}

impl Peer {
    pub async fn send(&mut self, frame: Frame) {
        let bytes = self.encoder.encode(&frame).unwrap();
        self.send_raw(&bytes).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.io.write_all(bytes).await.unwrap();
    }

    /// Next frame, `None` once the connection closed the transport.
    pub async fn try_recv(&mut self) -> Option<Frame> {
        loop {
            if let Some(result) = self.decoder.next_frame() {
                return Some(result.unwrap());
            }
            let mut buf = [0u8; 8192];
            let n = tokio::time::timeout(TIMEOUT, self.io.read(&mut buf))
                .await
                .expect("timed out waiting for a frame")
                .unwrap();
            if n == 0 {
                return None;
            }
            self.decoder.extend(&buf[..n]);
        }
    }

    pub async fn recv(&mut self) -> Frame {
        self.try_recv().await.expect("transport closed")
    }

    /// The SETTINGS every connection sends first.
    pub async fn handshake(&mut self) -> Settings {
        match self.recv().await {
            Frame::Settings(settings) => settings,
            other => panic!("expected SETTINGS, got {:?}", other),
        }
    }

    pub async fn expect_eof(&mut self) {
        if let Some(frame) = self.try_recv().await {
            panic!("expected end of stream, got {:?}", frame);
        }
    }
}

/// A connection plus the raw peer on the other end of its transport.
pub fn pair(config: Config) -> (Connection, Peer) {
    pair_with_capacity(config, 1 << 20)
}

/// `pair` over a transport that buffers at most `capacity` bytes each way.
pub fn pair_with_capacity(config: Config, capacity: usize) -> (Connection, Peer) {
    let (local, remote) = duplex(capacity);
    let conn = Connection::new(local, config).unwrap();
    let peer = Peer {
        io: remote,
        encoder: FrameEncoder::new(Box::new(ZlibCompressor::new().unwrap())),
        decoder: FrameDecoder::new(Box::new(ZlibDecompressor::new())),
    };
    (conn, peer)
}

pub fn spawn_run<H: Handler>(conn: &Connection, handler: H) -> JoinHandle<Result<(), ConnectionError>> {
    let conn = conn.clone();
    tokio::spawn(async move { conn.run(handler).await })
}

pub fn get_request() -> Headers {
    let mut headers = Headers::new();
    headers.set(":method", "GET");
    headers.set(":path", "/");
    headers.set(":version", "HTTP/1.1");
    headers.set(":host", "example.com");
    headers.set(":scheme", "https");
    headers
}

pub fn syn_stream(stream_id: u32, priority: u8, headers: Headers, fin: bool) -> Frame {
    Frame::SynStream(SynStream {
        flags: if fin { flags::FIN } else { 0 },
        stream_id,
        assoc_stream_id: 0,
        priority,
        slot: 0,
        headers,
    })
}

pub fn data(stream_id: u32, payload: &[u8], fin: bool) -> Frame {
    Frame::Data(Data {
        stream_id,
        flags: if fin { flags::FIN } else { 0 },
        data: Bytes::copy_from_slice(payload),
    })
}

pub fn window_update(stream_id: u32, delta: u32) -> Frame {
    Frame::WindowUpdate(WindowUpdate { stream_id, delta })
}
