//! Per-stream state.
//!
//! [`StreamCore`] is a sans-io state machine: every operation records the
//! frames it wants sent in an outbox, and the connection moves them to the
//! stream's priority lane while still holding the stream lock, which keeps
//! per-stream frame order intact. [`Stream`] is the handle given to handlers
//! and to callers of `open_stream`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

use crate::config::{OverflowPolicy, DEFAULT_MAX_PENDING_BYTES};
use crate::connection::Shared;
use crate::error::StreamError;
use crate::frame::{
    flags, rst_status, Data, Frame, RstStream, SynReply, WindowUpdate, MAX_FRAME_LENGTH,
    MAX_WINDOW_SIZE,
};
use crate::header::Headers;

/// Stream lifecycle.
///
/// ```text
///              SYN_STREAM
///      Idle ---------------> Open
///                             |
///          local FIN  +-------+-------+  remote FIN
///                     v               v
///            HalfClosedLocal    HalfClosedRemote
///                     |               |
///          remote FIN +-------+-------+  local FIN
///                             v
///                           Closed  <---- RST_STREAM (either side)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// Shared send window (the SPDY/3.1 connection window).
#[derive(Debug)]
pub struct FlowWindow {
    available: Mutex<i64>,
}

impl FlowWindow {
    pub fn new(size: u32) -> Self {
        Self {
            available: Mutex::new(i64::from(size)),
        }
    }

    /// Take up to `wanted` bytes of credit, returning how much was granted.
    pub fn reserve(&self, wanted: usize) -> usize {
        let mut available = self.available.lock().unwrap_or_else(PoisonError::into_inner);
        let granted = wanted.min(usize::try_from((*available).max(0)).unwrap_or(usize::MAX));
        *available -= granted as i64;
        granted
    }

    /// Return unused credit.
    pub fn release(&self, n: usize) {
        *self.available.lock().unwrap_or_else(PoisonError::into_inner) += n as i64;
    }

    /// Grow by `delta`. False, with the window unchanged, when the result
    /// would exceed 2^31-1.
    pub fn grow(&self, delta: u32) -> bool {
        let mut available = self.available.lock().unwrap_or_else(PoisonError::into_inner);
        if *available + i64::from(delta) > i64::from(MAX_WINDOW_SIZE) {
            return false;
        }
        *available += i64::from(delta);
        true
    }

    pub fn available(&self) -> i64 {
        *self.available.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct StreamCore {
    id: u32,
    state: StreamState,
    stopped: bool,
    terminated: bool,
    reset: Option<u32>,
    locally_initiated: bool,

    // Outbound
    wrote_header: bool,
    out_headers: Headers,
    send_window: i64,
    pending: BytesMut,
    pending_fin: bool,
    max_pending: usize,
    overflow_policy: OverflowPolicy,

    // Inbound
    headers: Headers,
    got_reply: bool,
    remote_fin: bool,
    body: BytesMut,
    recv_window: i64,
    initial_recv_window: u32,
    recv_unacked: u32,

    outbox: Vec<Frame>,
}

impl StreamCore {
    pub fn new(id: u32, send_window: u32, recv_window: u32) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            stopped: false,
            terminated: false,
            reset: None,
            locally_initiated: false,
            wrote_header: false,
            out_headers: Headers::new(),
            send_window: i64::from(send_window),
            pending: BytesMut::new(),
            pending_fin: false,
            max_pending: DEFAULT_MAX_PENDING_BYTES,
            overflow_policy: OverflowPolicy::Reject,
            headers: Headers::new(),
            got_reply: false,
            remote_fin: false,
            body: BytesMut::new(),
            recv_window: i64::from(recv_window),
            initial_recv_window: recv_window,
            recv_unacked: 0,
            outbox: Vec::new(),
        }
    }

    pub fn with_pending_limit(mut self, limit: usize, policy: OverflowPolicy) -> Self {
        self.max_pending = limit;
        self.overflow_policy = policy;
        self
    }

    /// Open for a SYN_STREAM the peer sent.
    pub fn open_remote(&mut self, headers: Headers, syn_flags: u8) {
        self.headers = headers;
        self.state = StreamState::Open;
        if syn_flags & flags::FIN != 0 {
            self.remote_fin = true;
            self.close_remote();
        }
        if syn_flags & flags::UNIDIRECTIONAL != 0 {
            self.close_local();
        }
    }

    /// Open for a SYN_STREAM we are sending. Our headers count as written.
    pub fn open_local(&mut self, syn_flags: u8) {
        self.locally_initiated = true;
        self.wrote_header = true;
        self.state = StreamState::Open;
        if syn_flags & flags::FIN != 0 {
            self.close_local();
        }
        if syn_flags & flags::UNIDIRECTIONAL != 0 {
            self.close_remote();
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn send_window(&self) -> i64 {
        self.send_window
    }

    pub fn recv_window(&self) -> i64 {
        self.recv_window
    }

    /// Bytes waiting for window.
    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn reset_status(&self) -> Option<u32> {
        self.reset
    }

    /// Frames produced since the last call.
    pub fn take_outbox(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.outbox)
    }

    fn close_local(&mut self) {
        self.state = match self.state {
            StreamState::Idle | StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
    }

    fn close_remote(&mut self) {
        self.state = match self.state {
            StreamState::Idle | StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
    }

    fn remote_closed(&self) -> bool {
        matches!(
            self.state,
            StreamState::HalfClosedRemote | StreamState::Closed
        )
    }

    fn local_open(&self) -> bool {
        !self.pending_fin && matches!(self.state, StreamState::Open | StreamState::HalfClosedRemote)
    }

    fn stopped_error(&self) -> StreamError {
        match self.reset {
            Some(status) => StreamError::Reset {
                stream_id: self.id,
                status,
            },
            None => StreamError::Cancelled(self.id),
        }
    }

    fn check_writable(&self) -> Result<(), StreamError> {
        if self.stopped {
            return Err(self.stopped_error());
        }
        if !self.local_open() {
            return Err(StreamError::Closed(self.id));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.out_headers.set(name, value);
    }

    /// Send the SYN_REPLY. Only the first call has any effect.
    pub fn write_header(&mut self, code: u16) -> bool {
        if self.wrote_header {
            log::warn!("stream {}: multiple calls to write_header", self.id);
            return false;
        }
        if self.stopped || self.state == StreamState::Closed {
            return false;
        }
        self.out_headers.set(":status", code.to_string());
        self.out_headers.set(":version", "HTTP/1.1");
        self.send_reply(0);
        true
    }

    /// `write_header` for callers: a stopped or closed stream is an error,
    /// a repeated call is not.
    pub fn send_header(&mut self, code: u16) -> Result<(), StreamError> {
        if self.stopped {
            return Err(self.stopped_error());
        }
        if self.state == StreamState::Closed {
            return Err(StreamError::Closed(self.id));
        }
        self.write_header(code);
        Ok(())
    }

    fn send_reply(&mut self, reply_flags: u8) {
        self.wrote_header = true;
        self.outbox.push(Frame::SynReply(SynReply {
            flags: reply_flags,
            stream_id: self.id,
            headers: self.out_headers.clone(),
        }));
        if reply_flags & flags::FIN != 0 {
            self.close_local();
        }
    }

    fn emit_data(&mut self, mut data: Bytes, fin: bool) {
        while data.len() > MAX_FRAME_LENGTH {
            let chunk = data.split_to(MAX_FRAME_LENGTH);
            self.outbox.push(Frame::Data(Data {
                stream_id: self.id,
                flags: 0,
                data: chunk,
            }));
        }
        self.outbox.push(Frame::Data(Data {
            stream_id: self.id,
            flags: if fin { flags::FIN } else { 0 },
            data,
        }));
        if fin {
            self.close_local();
        }
    }

    /// Send what the windows allow and queue the rest behind any data
    /// already waiting. Returns the number of bytes accepted.
    pub fn write(&mut self, data: &[u8], conn: Option<&FlowWindow>) -> Result<usize, StreamError> {
        self.check_writable()?;
        if data.is_empty() {
            return Ok(0);
        }

        let stream_room = if self.pending.is_empty() {
            usize::try_from(self.send_window.max(0)).unwrap_or(usize::MAX)
        } else {
            0
        };
        let mut sendable = data.len().min(stream_room);
        if let Some(conn) = conn {
            sendable = conn.reserve(sendable);
        }

        let queued = data.len() - sendable;
        if queued > 0 && self.pending.len() + queued > self.max_pending {
            if let Some(conn) = conn {
                conn.release(sendable);
            }
            return Err(self.overflow(queued));
        }

        if !self.wrote_header {
            self.write_header(200);
        }
        if sendable > 0 {
            self.send_window -= sendable as i64;
            self.emit_data(Bytes::copy_from_slice(&data[..sendable]), false);
        }
        if queued > 0 {
            log::trace!(
                "stream {}: window exhausted, queueing {} bytes",
                self.id,
                queued
            );
            self.pending.extend_from_slice(&data[sendable..]);
        }
        Ok(data.len())
    }

    fn overflow(&mut self, queued: usize) -> StreamError {
        match self.overflow_policy {
            OverflowPolicy::Reject => StreamError::QueueFull {
                stream_id: self.id,
                queued: self.pending.len() + queued,
                limit: self.max_pending,
            },
            OverflowPolicy::ResetStream => {
                self.reset(rst_status::CANCEL);
                StreamError::Reset {
                    stream_id: self.id,
                    status: rst_status::CANCEL,
                }
            }
        }
    }

    /// Release queued data in FIFO order as far as the windows allow.
    pub fn flush(&mut self, conn: Option<&FlowWindow>) {
        if self.state == StreamState::Closed {
            return;
        }
        while !self.pending.is_empty() {
            let mut n = self
                .pending
                .len()
                .min(usize::try_from(self.send_window.max(0)).unwrap_or(usize::MAX));
            if let Some(conn) = conn {
                n = conn.reserve(n);
            }
            if n == 0 {
                break;
            }
            self.send_window -= n as i64;
            let chunk = self.pending.split_to(n).freeze();
            let fin = self.pending.is_empty() && self.pending_fin;
            if fin {
                self.pending_fin = false;
            }
            self.emit_data(chunk, fin);
        }
    }

    /// Close the local side. FIN rides on the last queued byte.
    pub fn finish(&mut self) -> Result<(), StreamError> {
        self.check_writable()?;
        if !self.wrote_header {
            self.out_headers.set(":status", "200");
            self.out_headers.set(":version", "HTTP/1.1");
            self.send_reply(flags::FIN);
        } else if self.pending.is_empty() {
            self.emit_data(Bytes::new(), true);
        } else {
            self.pending_fin = true;
        }
        Ok(())
    }

    /// Send RST_STREAM and close.
    pub fn reset(&mut self, status: u32) {
        if self.state == StreamState::Closed {
            return;
        }
        self.outbox.push(Frame::RstStream(RstStream {
            stream_id: self.id,
            status,
        }));
        self.abort(status);
    }

    /// The peer reset the stream.
    pub fn remote_reset(&mut self, status: u32) {
        if self.state != StreamState::Closed {
            self.abort(status);
        }
    }

    fn abort(&mut self, status: u32) {
        self.reset = Some(status);
        self.stopped = true;
        self.state = StreamState::Closed;
        self.pending.clear();
        self.pending_fin = false;
    }

    /// The connection is gone.
    pub fn terminate(&mut self) {
        if self.state != StreamState::Closed {
            self.terminated = true;
        }
        self.stopped = true;
        self.state = StreamState::Closed;
        self.pending.clear();
        self.pending_fin = false;
    }

    pub fn cancel(&mut self) {
        self.stopped = true;
    }

    /// Handler finished: reply if it never did, finish or reset otherwise.
    /// A stream the handler cancelled is reset with CANCEL.
    pub fn complete(&mut self, ok: bool) {
        if self.state == StreamState::Closed || self.reset.is_some() {
            return;
        }
        if self.stopped {
            self.reset(rst_status::CANCEL);
        } else if ok {
            if self.local_open() {
                if let Err(e) = self.finish() {
                    log::debug!("stream {}: finish after handler failed: {}", self.id, e);
                }
            }
        } else if self.wrote_header {
            self.reset(rst_status::CANCEL);
        } else {
            self.reset(rst_status::INTERNAL_ERROR);
        }
    }

    /// Change the send window by `diff` (SETTINGS INITIAL_WINDOW_SIZE).
    pub fn adjust_send_window(&mut self, diff: i64, conn: Option<&FlowWindow>) -> Result<(), StreamError> {
        if self.state == StreamState::Closed {
            return Ok(());
        }
        if self.send_window + diff > i64::from(MAX_WINDOW_SIZE) {
            return Err(self.flow_control_error());
        }
        self.send_window += diff;
        if diff > 0 {
            self.flush(conn);
        }
        Ok(())
    }

    fn flow_control_error(&mut self) -> StreamError {
        self.reset(rst_status::FLOW_CONTROL_ERROR);
        StreamError::Reset {
            stream_id: self.id,
            status: rst_status::FLOW_CONTROL_ERROR,
        }
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    /// Apply a frame the peer sent on this stream.
    pub fn receive_frame(&mut self, frame: Frame, conn: Option<&FlowWindow>) -> Result<(), StreamError> {
        if self.state == StreamState::Closed {
            return Err(StreamError::Closed(self.id));
        }
        match frame {
            Frame::Data(data) => self.receive_data(data.data, data.flags & flags::FIN != 0),
            Frame::Headers(frame) => {
                if self.remote_closed() {
                    return Err(self.already_closed());
                }
                self.headers.update(&frame.headers);
                if frame.flags & flags::FIN != 0 {
                    self.remote_fin = true;
                    self.close_remote();
                }
                Ok(())
            }
            Frame::SynReply(reply) => {
                if !self.locally_initiated {
                    return Err(self.unexpected("SYN_REPLY"));
                }
                if self.got_reply {
                    self.reset(rst_status::STREAM_IN_USE);
                    return Err(StreamError::Reset {
                        stream_id: self.id,
                        status: rst_status::STREAM_IN_USE,
                    });
                }
                self.got_reply = true;
                self.headers.update(&reply.headers);
                if reply.flags & flags::FIN != 0 {
                    self.remote_fin = true;
                    self.close_remote();
                }
                Ok(())
            }
            Frame::WindowUpdate(update) => self.window_update(update.delta, conn),
            other => Err(self.unexpected(other.name())),
        }
    }

    fn unexpected(&mut self, frame: &'static str) -> StreamError {
        log::warn!("stream {}: received {} frame", self.id, frame);
        self.reset(rst_status::PROTOCOL_ERROR);
        StreamError::UnexpectedFrame {
            stream_id: self.id,
            frame,
        }
    }

    fn already_closed(&mut self) -> StreamError {
        self.reset(rst_status::STREAM_ALREADY_CLOSED);
        StreamError::Reset {
            stream_id: self.id,
            status: rst_status::STREAM_ALREADY_CLOSED,
        }
    }

    fn receive_data(&mut self, data: Bytes, fin: bool) -> Result<(), StreamError> {
        if self.remote_closed() {
            return Err(self.already_closed());
        }
        if data.len() as i64 > self.recv_window {
            log::debug!(
                "stream {}: {} bytes exceed receive window {}",
                self.id,
                data.len(),
                self.recv_window
            );
            return Err(self.flow_control_error());
        }
        self.recv_window -= data.len() as i64;
        self.body.extend_from_slice(&data);
        if fin {
            self.remote_fin = true;
            self.close_remote();
        }
        Ok(())
    }

    /// Grow the send window and flush. Overflow past 2^31-1 resets the stream
    /// and leaves the window unchanged.
    pub fn window_update(&mut self, delta: u32, conn: Option<&FlowWindow>) -> Result<(), StreamError> {
        if self.state == StreamState::Closed {
            return Ok(());
        }
        if self.send_window + i64::from(delta) > i64::from(MAX_WINDOW_SIZE) {
            return Err(self.flow_control_error());
        }
        self.send_window += i64::from(delta);
        self.flush(conn);
        Ok(())
    }

    /// Hand unread body bytes to the reader and replenish the receive window
    /// once half of it has been consumed.
    pub fn take_body(&mut self) -> Bytes {
        let chunk = self.body.split().freeze();
        self.recv_unacked = self.recv_unacked.saturating_add(chunk.len() as u32);
        let threshold = (self.initial_recv_window / 2).max(1);
        if self.recv_unacked >= threshold && !self.remote_closed() {
            self.outbox.push(Frame::WindowUpdate(WindowUpdate {
                stream_id: self.id,
                delta: self.recv_unacked,
            }));
            self.recv_window += i64::from(self.recv_unacked);
            self.recv_unacked = 0;
        }
        chunk
    }

    /// Next read result, `None` while the reader has to wait.
    pub fn poll_read(&mut self) -> Option<Result<Option<Bytes>, StreamError>> {
        if !self.body.is_empty() {
            return Some(Ok(Some(self.take_body())));
        }
        if self.remote_fin {
            return Some(Ok(None));
        }
        if self.terminated {
            return Some(Err(StreamError::ConnectionClosed));
        }
        if let Some(status) = self.reset {
            return Some(Err(StreamError::Reset {
                stream_id: self.id,
                status,
            }));
        }
        if self.remote_closed() {
            return Some(Ok(None));
        }
        None
    }

    /// Peer's SYN_REPLY headers, `None` while still waiting.
    pub fn poll_reply(&mut self) -> Option<Result<Headers, StreamError>> {
        if self.got_reply {
            return Some(Ok(self.headers.clone()));
        }
        if self.terminated {
            return Some(Err(StreamError::ConnectionClosed));
        }
        if let Some(status) = self.reset {
            return Some(Err(StreamError::Reset {
                stream_id: self.id,
                status,
            }));
        }
        if self.remote_closed() {
            return Some(Err(StreamError::Closed(self.id)));
        }
        None
    }
}

/// A stream as stored in the connection's table.
#[derive(Debug)]
pub struct StreamShared {
    id: u32,
    priority: u8,
    core: Mutex<StreamCore>,
    pub(crate) notify: Notify,
}

impl StreamShared {
    pub fn new(priority: u8, core: StreamCore) -> Self {
        Self {
            id: core.id(),
            priority: priority.min(7),
            core: Mutex::new(core),
            notify: Notify::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn lock(&self) -> MutexGuard<'_, StreamCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to one stream of a connection.
#[derive(Debug, Clone)]
pub struct Stream {
    shared: Arc<StreamShared>,
    conn: Weak<Shared>,
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>, conn: Weak<Shared>) -> Self {
        Self { shared, conn }
    }

    fn op<R>(
        &self,
        f: impl FnOnce(&mut StreamCore, Option<&FlowWindow>) -> R,
    ) -> Result<R, StreamError> {
        let conn = self.conn.upgrade().ok_or(StreamError::ConnectionClosed)?;
        Ok(conn.stream_op(&self.shared, f))
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn priority(&self) -> u8 {
        self.shared.priority
    }

    pub fn state(&self) -> StreamState {
        self.shared.lock().state()
    }

    /// Headers received from the peer so far.
    pub fn headers(&self) -> Headers {
        self.shared.lock().headers().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.lock().is_stopped()
    }

    pub fn send_window(&self) -> i64 {
        self.shared.lock().send_window()
    }

    /// Bytes written but still waiting for window.
    pub fn queued_bytes(&self) -> usize {
        self.shared.lock().queued()
    }

    /// Set a reply header. Takes effect if the reply has not been sent yet.
    pub fn set_header(&self, name: &str, value: &str) {
        self.shared.lock().set_header(name, value);
    }

    /// Send the reply headers. Only the first call sends anything.
    pub fn write_header(&self, code: u16) -> Result<(), StreamError> {
        self.op(|core, _| core.send_header(code))?
    }

    /// Never blocks: what the window does not cover is queued.
    pub fn write(&self, data: &[u8]) -> Result<usize, StreamError> {
        self.op(|core, conn| core.write(data, conn))?
    }

    pub fn finish(&self) -> Result<(), StreamError> {
        self.op(|core, _| core.finish())?
    }

    pub fn reset(&self, status: u32) -> Result<(), StreamError> {
        self.op(|core, _| core.reset(status))
    }

    /// Stop the stream locally; later writes fail.
    pub fn cancel(&self) {
        self.shared.lock().cancel();
        self.shared.notify.notify_waiters();
    }

    pub(crate) fn complete(&self, ok: bool) {
        if let Err(e) = self.op(|core, _| core.complete(ok)) {
            log::debug!("stream {}: completion skipped: {}", self.id(), e);
        }
    }

    async fn wait_for<T>(
        &self,
        mut poll: impl FnMut(&mut StreamCore) -> Option<Result<T, StreamError>>,
    ) -> Result<T, StreamError> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let ready = match self.conn.upgrade() {
                Some(conn) => conn.stream_poll(&self.shared, &mut poll),
                None => {
                    let mut core = self.shared.lock();
                    core.take_outbox();
                    Some(poll(&mut *core).unwrap_or(Err(StreamError::ConnectionClosed)))
                }
            };
            if let Some(result) = ready {
                return result;
            }
            notified.await;
        }
    }

    /// Next chunk of the peer's body; `Ok(None)` once the peer finished.
    pub async fn read_chunk(&self) -> Result<Option<Bytes>, StreamError> {
        self.wait_for(StreamCore::poll_read).await
    }

    /// Read the peer's body until FIN.
    pub async fn read_to_end(&self) -> Result<Bytes, StreamError> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.read_chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }

    /// Headers of the peer's SYN_REPLY (locally opened streams).
    pub async fn reply_headers(&self) -> Result<Headers, StreamError> {
        self.wait_for(StreamCore::poll_reply).await
    }
}
