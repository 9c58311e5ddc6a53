//! Connection configuration.

use std::time::Duration;

/// Initial flow-control window a server advertises and assumes.
pub const DEFAULT_SERVER_WINDOW_SIZE: u32 = 64 * 1024;

/// Initial flow-control window a client advertises.
pub const DEFAULT_CLIENT_WINDOW_SIZE: u32 = 10 * 1024 * 1024;

/// Window every stream starts with until the peer's SETTINGS say otherwise.
pub const DEFAULT_PEER_WINDOW_SIZE: u32 = 64 * 1024;

/// Concurrent inbound streams a server accepts by default.
pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 1000;

/// Per-stream pending outbound bytes allowed by default.
pub const DEFAULT_MAX_PENDING_BYTES: usize = 1024 * 1024;

/// CREDENTIAL slots a server accepts by default.
pub const DEFAULT_CREDENTIAL_SLOTS: u16 = 8;

/// Replies a peer can trigger (PING echoes, RST_STREAM) allowed to wait
/// on the control lane at once.
pub const DEFAULT_MAX_QUEUED_REPLIES: usize = 1024;

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens odd-numbered streams and odd-numbered pings.
    Client,
    /// Opens even-numbered streams and even-numbered pings.
    Server,
}

impl Role {
    /// First id of the locally-initiated stream sequence.
    pub fn first_stream_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// True when `id` was allocated by this side.
    pub fn owns_id(self, id: u32) -> bool {
        match self {
            Role::Client => id % 2 == 1,
            Role::Server => id % 2 == 0,
        }
    }
}

/// Protocol sub-version spoken on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    Spdy3,
    /// Adds the connection-level flow-control window.
    Spdy31,
}

impl ProtocolVersion {
    pub fn connection_flow_control(self) -> bool {
        matches!(self, ProtocolVersion::Spdy31)
    }
}

/// What a stream write does when the pending queue would exceed its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Fail the write and leave the stream untouched.
    Reject,
    /// Reset the stream with CANCEL and fail the write.
    ResetStream,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub version: ProtocolVersion,
    /// Receive window advertised for every stream.
    pub initial_window_size: u32,
    /// Inbound stream limit, `None` for unlimited.
    pub max_concurrent_streams: Option<u32>,
    /// Per-stream cap on bytes waiting for window.
    pub max_pending_bytes: usize,
    pub overflow_policy: OverflowPolicy,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    /// Highest CREDENTIAL slot accepted.
    pub credential_slots: u16,
    /// Replies to peer frames dropped beyond this backlog.
    pub max_queued_replies: usize,
}

impl Config {
    pub fn server() -> Self {
        Self {
            role: Role::Server,
            version: ProtocolVersion::Spdy3,
            initial_window_size: DEFAULT_SERVER_WINDOW_SIZE,
            max_concurrent_streams: Some(DEFAULT_MAX_CONCURRENT_STREAMS),
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
            overflow_policy: OverflowPolicy::Reject,
            read_timeout: None,
            write_timeout: None,
            credential_slots: DEFAULT_CREDENTIAL_SLOTS,
            max_queued_replies: DEFAULT_MAX_QUEUED_REPLIES,
        }
    }

    pub fn client() -> Self {
        Self {
            role: Role::Client,
            initial_window_size: DEFAULT_CLIENT_WINDOW_SIZE,
            max_concurrent_streams: None,
            ..Self::server()
        }
    }

    pub fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }

    pub fn with_initial_window_size(mut self, size: u32) -> Self {
        self.initial_window_size = size.min(crate::frame::MAX_WINDOW_SIZE);
        self
    }

    pub fn with_max_concurrent_streams(mut self, limit: Option<u32>) -> Self {
        self.max_concurrent_streams = limit;
        self
    }

    pub fn with_max_pending_bytes(mut self, limit: usize) -> Self {
        self.max_pending_bytes = limit;
        self
    }

    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_credential_slots(mut self, slots: u16) -> Self {
        self.credential_slots = slots;
        self
    }

    pub fn with_max_queued_replies(mut self, limit: usize) -> Self {
        self.max_queued_replies = limit;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::server()
    }
}
