//! SPDY connection multiplexer.
//!
//! A [`Connection`] runs one send task and one read loop over a single byte
//! stream, plus one task per inbound stream handler. Only the send task
//! touches the header compressor and only the read loop touches the
//! decompressor, so header-compression state always follows wire order.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::codec::{DecodeError, FrameDecoder, FrameEncoder};
use crate::config::{Config, DEFAULT_PEER_WINDOW_SIZE};
use crate::error::{ConnectionError, FrameError};
use crate::frame::{
    flags, goaway_status, rst_status, settings_id, Credential, Frame, GoAway, Ping,
    RstStream, Setting, Settings, SynStream, WindowUpdate, MAX_STREAM_ID, MAX_WINDOW_SIZE,
};
use crate::handler::{Handler, Request};
use crate::header::{Compressor, Decompressor, Headers, ZlibCompressor, ZlibDecompressor};
use crate::priority::PriorityQueue;
use crate::registry::{PingTable, StreamTable};
use crate::stream::{FlowWindow, Stream, StreamCore, StreamShared, StreamState};

/// SPDY/3.1 connection windows start here in both directions.
const CONNECTION_WINDOW_SIZE: u32 = 64 * 1024;

/// How long teardown waits for the send task to flush what is queued.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const READ_CHUNK: usize = 16 * 1024;

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug)]
struct ConnState {
    next_stream_id: u32,
    last_remote_id: u32,
    next_ping_id: u32,
    goaway_sent: bool,
    /// Last good stream id from the peer's GOAWAY.
    goaway_received: Option<u32>,
    peer_max_streams: Option<u32>,
    peer_initial_window: u32,
    settings: BTreeMap<u32, Setting>,
    credentials: HashMap<u16, Vec<Vec<u8>>>,
    recv_window: i64,
    recv_unacked: u32,
    remote_addr: Option<SocketAddr>,
}

pub(crate) struct Shared {
    config: Config,
    queue: PriorityQueue,
    streams: StreamTable,
    pings: PingTable,
    state: Mutex<ConnState>,
    /// SPDY/3.1 only.
    send_window: Option<FlowWindow>,
    stop: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
    benign: AtomicU64,
    io: Mutex<Option<(BoxReader, BoxWriter)>>,
    header_codec: Mutex<Option<(Box<dyn Compressor>, Box<dyn Decompressor>)>>,
}

/// Handle to a SPDY connection. Clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.shared.config.role)
            .field("version", &self.shared.config.version)
            .field("streams", &self.shared.streams.len())
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

impl Connection {
    /// Wrap `io` with the SPDY/3 zlib header codec.
    pub fn new<T>(io: T, config: Config) -> Result<Self, ConnectionError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let compressor = ZlibCompressor::new().map_err(FrameError::from)?;
        Ok(Self::with_header_codec(
            io,
            config,
            Box::new(compressor),
            Box::new(ZlibDecompressor::new()),
        ))
    }

    /// Wrap `io` with a caller-supplied header codec.
    pub fn with_header_codec<T>(
        io: T,
        config: Config,
        compressor: Box<dyn Compressor>,
        decompressor: Box<dyn Decompressor>,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let send_window = config
            .version
            .connection_flow_control()
            .then(|| FlowWindow::new(CONNECTION_WINDOW_SIZE));
        let state = ConnState {
            next_stream_id: config.role.first_stream_id(),
            last_remote_id: 0,
            next_ping_id: config.role.first_stream_id(),
            goaway_sent: false,
            goaway_received: None,
            peer_max_streams: None,
            peer_initial_window: DEFAULT_PEER_WINDOW_SIZE,
            settings: BTreeMap::new(),
            credentials: HashMap::new(),
            recv_window: i64::from(CONNECTION_WINDOW_SIZE),
            recv_unacked: 0,
            remote_addr: None,
        };
        let shared = Shared {
            config,
            queue: PriorityQueue::new(),
            streams: StreamTable::new(),
            pings: PingTable::new(),
            state: Mutex::new(state),
            send_window,
            stop: CancellationToken::new(),
            tracker: TaskTracker::new(),
            closed: AtomicBool::new(false),
            benign: AtomicU64::new(0),
            io: Mutex::new(Some((Box::new(reader), Box::new(writer)))),
            header_codec: Mutex::new(Some((compressor, decompressor))),
        };
        // SETTINGS leads the queue ahead of anything opened before `run`
        shared.queue_initial_settings();
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn set_remote_addr(&self, addr: SocketAddr) {
        self.shared.state().remote_addr = Some(addr);
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Drive the connection until the peer goes away, an error occurs or the
    /// connection is closed locally. Inbound streams are served by `handler`.
    pub async fn run<H: Handler>(&self, handler: H) -> Result<(), ConnectionError> {
        let shared = &self.shared;
        let (reader, writer) = lock(&shared.io)
            .take()
            .ok_or(ConnectionError::AlreadyRunning)?;
        let (compressor, decompressor) = lock(&shared.header_codec)
            .take()
            .ok_or(ConnectionError::AlreadyRunning)?;

        let mut sender = tokio::spawn(send_loop(
            shared.clone(),
            writer,
            FrameEncoder::new(compressor),
        ));

        let handler = Arc::new(handler);
        let decoder = FrameDecoder::new(decompressor);
        let result = tokio::select! {
            r = shared.read_loop(reader, decoder, &handler) => r,
            _ = shared.stop.cancelled() => Ok(()),
        };
        if let Err(e) = &result {
            log::debug!("connection terminated: {}", e);
        }
        shared.teardown();

        match tokio::time::timeout(DRAIN_TIMEOUT, &mut sender).await {
            Ok(Ok(Err(e))) if result.is_ok() => return Err(e),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => log::error!("send task failed: {}", e),
            Err(_) => {
                log::warn!("send task did not drain in {:?}, aborting", DRAIN_TIMEOUT);
                sender.abort();
            }
        }
        result
    }

    /// Open a stream by sending SYN_STREAM. With `fin` the request carries
    /// no body.
    pub fn open_stream(
        &self,
        headers: Headers,
        priority: u8,
        fin: bool,
    ) -> Result<Stream, ConnectionError> {
        let syn_flags = if fin { flags::FIN } else { 0 };
        self.shared.open_local(0, headers, priority, syn_flags)
    }

    /// Push a unidirectional stream associated with `associated_stream_id`.
    pub fn push_stream(
        &self,
        associated_stream_id: u32,
        headers: Headers,
        priority: u8,
    ) -> Result<Stream, ConnectionError> {
        if associated_stream_id == 0 || self.shared.config.role.owns_id(associated_stream_id) {
            return Err(ConnectionError::Protocol {
                status: rst_status::INVALID_STREAM,
                reason: format!(
                    "cannot push on stream {} not opened by the peer",
                    associated_stream_id
                ),
            });
        }
        self.shared.open_local(
            associated_stream_id,
            headers,
            priority,
            flags::UNIDIRECTIONAL,
        )
    }

    /// Send a PING and wait for its echo.
    pub async fn ping(&self) -> Result<Duration, ConnectionError> {
        let shared = &self.shared;
        if shared.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let id = {
            let mut state = shared.state();
            let id = state.next_ping_id;
            state.next_ping_id = match id.checked_add(2) {
                Some(next) => next,
                None => shared.config.role.first_stream_id(),
            };
            id
        };
        let echo = shared.pings.insert(id);
        let start = Instant::now();
        if shared.queue.push(0, Frame::Ping(Ping { id })).is_err() {
            shared.pings.remove(id);
            return Err(ConnectionError::Closed);
        }
        echo.await.map_err(|_| ConnectionError::Closed)?;
        Ok(start.elapsed())
    }

    /// Send GOAWAY(OK), wait for in-flight handlers, then close.
    pub async fn shutdown(&self) {
        self.shared.send_goaway(goaway_status::OK);
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        self.shared.teardown();
    }

    /// Close immediately. Idempotent.
    pub fn close(&self) {
        self.shared.teardown();
    }

    pub async fn closed(&self) {
        self.shared.stop.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Settings received from the peer, by id.
    pub fn settings(&self) -> Vec<Setting> {
        self.shared.state().settings.values().copied().collect()
    }

    /// Certificate chain received for CREDENTIAL `slot`.
    pub fn credentials(&self, slot: u16) -> Option<Vec<Vec<u8>>> {
        self.shared.state().credentials.get(&slot).cloned()
    }

    /// Protocol anomalies that were ignored rather than answered.
    pub fn benign_errors(&self) -> u64 {
        self.shared.benign.load(Ordering::Relaxed)
    }

    pub fn stream_count(&self) -> usize {
        self.shared.streams.len()
    }

    pub fn stream(&self, id: u32) -> Option<Stream> {
        self.shared
            .streams
            .get(id)
            .map(|s| Stream::new(s, Arc::downgrade(&self.shared)))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ConnState> {
        lock(&self.state)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn count_benign(&self, what: std::fmt::Arguments<'_>) {
        log::debug!("ignoring: {}", what);
        self.benign.fetch_add(1, Ordering::Relaxed);
    }

    fn push_control(&self, frame: Frame) {
        if let Err(frame) = self.queue.push(0, frame) {
            log::trace!("dropping {} frame: connection closed", frame.name());
        }
    }

    /// Control-lane reply to something the peer sent. Dropped while the
    /// backlog is full, so a peer that stops reading cannot grow it.
    fn push_reply(&self, frame: Frame) {
        let cap = self.config.max_queued_replies;
        if let Err(frame) = self.queue.push_bounded(0, frame, cap) {
            if self.queue.is_closed() {
                log::trace!("dropping {} frame: connection closed", frame.name());
            } else {
                self.count_benign(format_args!("{} reply, {} already queued", frame.name(), cap));
            }
        }
    }

    fn enqueue(&self, stream: &StreamShared, frames: Vec<Frame>) {
        for frame in frames {
            if let Err(frame) = self.queue.push(stream.priority(), frame) {
                log::trace!(
                    "dropping {} frame for stream {}: connection closed",
                    frame.name(),
                    stream.id()
                );
            }
        }
    }

    /// Run `f` on the stream's state machine, queue what it produced and
    /// forget the stream once it is closed.
    pub(crate) fn stream_op<R>(
        &self,
        stream: &Arc<StreamShared>,
        f: impl FnOnce(&mut StreamCore, Option<&FlowWindow>) -> R,
    ) -> R {
        let (result, closed) = {
            let mut core = stream.lock();
            let result = f(&mut *core, self.send_window.as_ref());
            self.enqueue(stream, core.take_outbox());
            (result, core.state() == StreamState::Closed)
        };
        stream.notify.notify_waiters();
        if closed {
            self.forget_stream(stream.id());
        }
        result
    }

    /// Like `stream_op` for readers: no wakeups.
    pub(crate) fn stream_poll<R>(
        &self,
        stream: &Arc<StreamShared>,
        f: impl FnOnce(&mut StreamCore) -> R,
    ) -> R {
        let mut core = stream.lock();
        let result = f(&mut *core);
        self.enqueue(stream, core.take_outbox());
        result
    }

    fn forget_stream(&self, id: u32) {
        if self.streams.remove(id).is_none() {
            return;
        }
        let draining = self.state().goaway_received.is_some();
        if draining && self.streams.is_empty() {
            log::debug!("last stream closed after GOAWAY");
            self.teardown();
        }
    }

    /// Runs exactly once, whatever triggered it.
    fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("closing connection");
        self.stop.cancel();
        for stream in self.streams.drain() {
            stream.lock().terminate();
            stream.notify.notify_waiters();
        }
        self.pings.clear();
        self.queue.close();
        self.tracker.close();
    }

    fn send_goaway(&self, status: u32) {
        let last_good_stream_id = {
            let mut state = self.state();
            if state.goaway_sent {
                return;
            }
            state.goaway_sent = true;
            state.last_remote_id
        };
        self.push_control(Frame::GoAway(GoAway {
            last_good_stream_id,
            status,
        }));
    }

    /// GOAWAY(PROTOCOL_ERROR) and the error that ends the read loop.
    fn protocol_error(&self, reason: String) -> ConnectionError {
        log::warn!("protocol error: {}", reason);
        self.send_goaway(goaway_status::PROTOCOL_ERROR);
        ConnectionError::Protocol {
            status: goaway_status::PROTOCOL_ERROR,
            reason,
        }
    }

    fn queue_initial_settings(&self) {
        let mut settings = Settings::default();
        if let Some(limit) = self.config.max_concurrent_streams {
            settings.add(0, settings_id::MAX_CONCURRENT_STREAMS, limit);
        }
        settings.add(0, settings_id::INITIAL_WINDOW_SIZE, self.config.initial_window_size);
        self.push_control(Frame::Settings(settings));
    }

    fn new_core(&self, id: u32, send_window: u32) -> StreamCore {
        StreamCore::new(id, send_window, self.config.initial_window_size)
            .with_pending_limit(self.config.max_pending_bytes, self.config.overflow_policy)
    }

    fn open_local(
        self: &Arc<Self>,
        assoc_stream_id: u32,
        headers: Headers,
        priority: u8,
        syn_flags: u8,
    ) -> Result<Stream, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        if priority > 7 {
            return Err(FrameError::InvalidField {
                field: "priority",
                got: u32::from(priority),
                expected: 7,
            }
            .into());
        }

        // The id is allocated and its SYN_STREAM queued under one lock, so
        // ids reach lane 0 (and the wire) in increasing order.
        let mut state = self.state();
        if state.goaway_received.is_some() || state.goaway_sent {
            return Err(ConnectionError::GoingAway);
        }
        if let Some(limit) = state.peer_max_streams {
            let role = self.config.role;
            let open = self.streams.count_where(|s| role.owns_id(s.id()));
            if open >= limit as usize {
                return Err(ConnectionError::StreamLimit(limit));
            }
        }
        let id = state.next_stream_id;
        if id > MAX_STREAM_ID {
            return Err(ConnectionError::StreamIdsExhausted);
        }
        state.next_stream_id += 2;

        let mut core = self.new_core(id, state.peer_initial_window);
        core.open_local(syn_flags);
        let stream = Arc::new(StreamShared::new(priority, core));
        self.streams.insert(id, stream.clone());

        let syn = Frame::SynStream(SynStream {
            flags: syn_flags,
            stream_id: id,
            assoc_stream_id,
            priority,
            slot: 0,
            headers,
        });
        if self.queue.push(0, syn).is_err() {
            self.streams.remove(id);
            return Err(ConnectionError::Closed);
        }
        drop(state);

        log::debug!("opened stream {} (priority {})", id, priority);
        Ok(Stream::new(stream, Arc::downgrade(self)))
    }

    // ------------------------------------------------------------------------
    // Read side
    // ------------------------------------------------------------------------

    async fn read_loop<H: Handler>(
        self: &Arc<Self>,
        mut reader: BoxReader,
        mut decoder: FrameDecoder,
        handler: &Arc<H>,
    ) -> Result<(), ConnectionError> {
        loop {
            while let Some(result) = decoder.next_frame() {
                match result {
                    Ok(frame) => self.handle_frame(frame, handler)?,
                    Err(e) => self.handle_decode_error(e)?,
                }
                if self.is_closed() {
                    return Ok(());
                }
            }

            let buffer = decoder.buffer_mut();
            buffer.reserve(READ_CHUNK);
            let read = reader.read_buf(buffer);
            let n = match self.config.read_timeout {
                Some(deadline) => tokio::time::timeout(deadline, read)
                    .await
                    .map_err(|_| ConnectionError::Timeout)??,
                None => read.await?,
            };
            if n == 0 {
                log::debug!("peer closed the transport");
                return Ok(());
            }
        }
    }

    fn handle_decode_error(&self, e: DecodeError) -> Result<(), ConnectionError> {
        if e.is_unknown_type() {
            self.count_benign(format_args!("{}", e));
            return Ok(());
        }
        if e.is_fatal() {
            return Err(self.protocol_error(e.to_string()));
        }
        match e.stream_id {
            Some(id) if id != 0 => {
                log::debug!("malformed frame on stream {}: {}", id, e);
                match self.streams.get(id) {
                    Some(stream) => {
                        self.stream_op(&stream, |core, _| core.reset(rst_status::PROTOCOL_ERROR))
                    }
                    None => self.push_reply(Frame::RstStream(RstStream {
                        stream_id: id,
                        status: rst_status::PROTOCOL_ERROR,
                    })),
                }
            }
            _ => self.count_benign(format_args!("malformed frame: {}", e)),
        }
        Ok(())
    }

    fn handle_frame<H: Handler>(
        self: &Arc<Self>,
        frame: Frame,
        handler: &Arc<H>,
    ) -> Result<(), ConnectionError> {
        log::trace!("received {} frame", frame.name());
        match frame {
            Frame::SynStream(syn) => self.on_syn_stream(syn, handler),
            Frame::RstStream(rst) => {
                self.on_rst_stream(rst);
                Ok(())
            }
            Frame::Settings(settings) => {
                self.on_settings(settings);
                Ok(())
            }
            Frame::Ping(ping) => {
                self.on_ping(ping);
                Ok(())
            }
            Frame::GoAway(goaway) => {
                self.on_goaway(goaway);
                Ok(())
            }
            Frame::WindowUpdate(update) if update.stream_id == 0 => {
                self.on_connection_window_update(update.delta)
            }
            Frame::Credential(credential) => {
                self.on_credential(credential);
                Ok(())
            }
            Frame::Data(data) => {
                self.consume_connection_window(data.data.len())?;
                self.deliver(data.stream_id, Frame::Data(data));
                Ok(())
            }
            other => {
                // SYN_REPLY, HEADERS and stream WINDOW_UPDATE
                if let Some(id) = other.stream_id() {
                    self.deliver(id, other);
                }
                Ok(())
            }
        }
    }

    fn deliver(&self, id: u32, frame: Frame) {
        let Some(stream) = self.streams.get(id) else {
            let name = frame.name();
            if matches!(frame, Frame::Data(_)) {
                self.push_reply(Frame::RstStream(RstStream {
                    stream_id: id,
                    status: rst_status::INVALID_STREAM,
                }));
            }
            self.count_benign(format_args!("{} for unknown stream {}", name, id));
            return;
        };
        if let Err(e) = self.stream_op(&stream, |core, window| core.receive_frame(frame, window)) {
            log::debug!("stream {}: {}", id, e);
        }
    }

    fn on_syn_stream<H: Handler>(
        self: &Arc<Self>,
        syn: SynStream,
        handler: &Arc<H>,
    ) -> Result<(), ConnectionError> {
        let id = syn.stream_id;
        let (refuse, send_window, remote_addr) = {
            let mut state = self.state();
            if id == 0 || self.config.role.owns_id(id) || id <= state.last_remote_id {
                let last = state.last_remote_id;
                drop(state);
                return Err(self.protocol_error(format!(
                    "invalid SYN_STREAM id {} (last remote id {})",
                    id, last
                )));
            }
            state.last_remote_id = id;
            (
                state.goaway_sent,
                state.peer_initial_window,
                state.remote_addr,
            )
        };

        let over_limit = self.config.max_concurrent_streams.is_some_and(|limit| {
            let role = self.config.role;
            self.streams.count_where(|s| !role.owns_id(s.id())) >= limit as usize
        });
        if refuse || over_limit {
            log::debug!("refusing stream {}", id);
            self.push_reply(Frame::RstStream(RstStream {
                stream_id: id,
                status: rst_status::REFUSED_STREAM,
            }));
            return Ok(());
        }

        let mut core = self.new_core(id, send_window);
        core.open_remote(syn.headers.clone(), syn.flags);
        let stream = Arc::new(StreamShared::new(syn.priority, core));
        if !self.streams.insert(id, stream.clone()) {
            return Err(self.protocol_error(format!("stream {} already exists", id)));
        }
        log::debug!("accepted stream {} (priority {})", id, syn.priority);

        let request = Request {
            stream_id: id,
            priority: syn.priority,
            associated_stream_id: syn.assoc_stream_id,
            headers: syn.headers,
            remote_addr,
        };
        let stream = Stream::new(stream, Arc::downgrade(self));
        let handler = handler.clone();
        self.tracker.spawn(async move {
            let result = handler.serve(stream.clone(), request).await;
            if let Err(e) = &result {
                log::debug!("stream {}: handler failed: {}", stream.id(), e);
            }
            stream.complete(result.is_ok());
        });
        Ok(())
    }

    fn on_rst_stream(&self, rst: RstStream) {
        match self.streams.get(rst.stream_id) {
            Some(stream) => {
                log::debug!("stream {} reset by peer (status {})", rst.stream_id, rst.status);
                self.stream_op(&stream, |core, _| core.remote_reset(rst.status));
            }
            None => self.count_benign(format_args!("RST_STREAM for unknown stream {}", rst.stream_id)),
        }
    }

    fn on_settings(&self, frame: Settings) {
        let window_diff = {
            let mut state = self.state();
            if frame.flags & flags::CLEAR_SETTINGS != 0 {
                state.settings.clear();
            }
            let mut diff = 0i64;
            for setting in frame.entries {
                match setting.id {
                    settings_id::MAX_CONCURRENT_STREAMS => {
                        state.peer_max_streams = Some(setting.value);
                    }
                    settings_id::INITIAL_WINDOW_SIZE => {
                        if setting.value > MAX_WINDOW_SIZE {
                            log::warn!("ignoring initial window size {}", setting.value);
                            continue;
                        }
                        diff += i64::from(setting.value) - i64::from(state.peer_initial_window);
                        state.peer_initial_window = setting.value;
                    }
                    _ => {}
                }
                state.settings.insert(setting.id, setting);
            }
            diff
        };

        if window_diff != 0 {
            for stream in self.streams.snapshot() {
                let result = self.stream_op(&stream, |core, window| {
                    core.adjust_send_window(window_diff, window)
                });
                if let Err(e) = result {
                    log::debug!("stream {}: {}", stream.id(), e);
                }
            }
        }
    }

    fn on_ping(&self, ping: Ping) {
        if !self.config.role.owns_id(ping.id) {
            self.push_reply(Frame::Ping(ping));
        } else if !self.pings.resolve(ping.id) {
            self.count_benign(format_args!("unexpected PING {}", ping.id));
        }
    }

    fn on_goaway(&self, goaway: GoAway) {
        log::debug!(
            "peer sent GOAWAY (last good stream {}, status {})",
            goaway.last_good_stream_id,
            goaway.status
        );
        self.state().goaway_received = Some(goaway.last_good_stream_id);

        let role = self.config.role;
        for stream in self.streams.snapshot() {
            let id = stream.id();
            if role.owns_id(id) && id > goaway.last_good_stream_id {
                self.stream_op(&stream, |core, _| core.remote_reset(rst_status::REFUSED_STREAM));
            }
        }
        if self.streams.is_empty() {
            self.teardown();
        }
    }

    fn on_connection_window_update(&self, delta: u32) -> Result<(), ConnectionError> {
        let Some(window) = &self.send_window else {
            self.count_benign(format_args!("connection WINDOW_UPDATE under SPDY/3"));
            return Ok(());
        };
        if !window.grow(delta) {
            return Err(self.protocol_error(format!(
                "connection window overflow (window {}, delta {})",
                window.available(),
                delta
            )));
        }
        for stream in self.streams.snapshot() {
            self.stream_op(&stream, |core, window| core.flush(window));
        }
        Ok(())
    }

    /// SPDY/3.1 inbound connection window.
    fn consume_connection_window(&self, len: usize) -> Result<(), ConnectionError> {
        if !self.config.version.connection_flow_control() || len == 0 {
            return Ok(());
        }
        let update = {
            let mut state = self.state();
            state.recv_window -= len as i64;
            if state.recv_window < 0 {
                drop(state);
                return Err(self.protocol_error(format!(
                    "DATA exceeds the connection receive window by {} bytes",
                    len
                )));
            }
            state.recv_unacked += len as u32;
            if state.recv_unacked >= CONNECTION_WINDOW_SIZE / 2 {
                let delta = std::mem::take(&mut state.recv_unacked);
                state.recv_window += i64::from(delta);
                Some(delta)
            } else {
                None
            }
        };
        if let Some(delta) = update {
            self.push_control(Frame::WindowUpdate(WindowUpdate { stream_id: 0, delta }));
        }
        Ok(())
    }

    fn on_credential(&self, credential: Credential) {
        if credential.slot == 0 || credential.slot > self.config.credential_slots {
            self.count_benign(format_args!("CREDENTIAL for slot {}", credential.slot));
            return;
        }
        log::debug!(
            "stored {} certificates in slot {}",
            credential.certificates.len(),
            credential.slot
        );
        self.state()
            .credentials
            .insert(credential.slot, credential.certificates);
    }
}

async fn send_loop(
    shared: Arc<Shared>,
    mut writer: BoxWriter,
    mut encoder: FrameEncoder,
) -> Result<(), ConnectionError> {
    let result: Result<(), ConnectionError> = async {
        while let Some(frame) = shared.queue.pop().await {
            let bytes = match encoder.encode(&frame) {
                Ok(bytes) => bytes,
                Err(FrameError::Header(e)) => return Err(FrameError::Header(e).into()),
                Err(e) => {
                    log::error!("dropping {} frame: {}", frame.name(), e);
                    continue;
                }
            };
            log::trace!("sending {} frame ({} bytes)", frame.name(), bytes.len());
            let write = async {
                writer.write_all(&bytes).await?;
                writer.flush().await
            };
            match shared.config.write_timeout {
                Some(deadline) => tokio::time::timeout(deadline, write)
                    .await
                    .map_err(|_| ConnectionError::Timeout)??,
                None => write.await?,
            }
        }
        Ok::<(), ConnectionError>(())
    }
    .await;

    if let Err(e) = &result {
        log::debug!("send loop failed: {}", e);
        shared.teardown();
    }
    if let Err(e) = writer.shutdown().await {
        log::trace!("transport shutdown: {}", e);
    }
    result
}
