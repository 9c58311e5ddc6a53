//! SPDY/3 frame codec.
//!
//! Pure, stateless encode/decode for every SPDY/3 frame. The only state the
//! codec touches is the header compression context handed in by the caller,
//! used for SYN_STREAM, SYN_REPLY and HEADERS.
//!
//! Control frame layout (all integers big-endian):
//!
//! ```text
//! +----------------------------------+
//! |C| Version(15bits) | Type(16bits) |
//! +----------------------------------+
//! | Flags (8)  |  Length (24 bits)   |
//! +----------------------------------+
//! |               Data               |
//! +----------------------------------+
//! ```
//!
//! DATA frames clear the control bit and carry a 31-bit stream id instead of
//! version and type.

use bytes::Bytes;

use crate::error::FrameError;
use crate::header::{Compressor, Decompressor, Headers};

/// Protocol version carried in every control frame.
pub const SPDY_VERSION: u16 = 3;

/// Size of the common frame header.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Largest value of a 24-bit length field.
pub const MAX_FRAME_LENGTH: usize = 0x00ff_ffff;

/// Largest 31-bit stream id.
pub const MAX_STREAM_ID: u32 = 0x7fff_ffff;

/// Largest flow-control window (and WINDOW_UPDATE delta).
pub const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;

/// Largest 24-bit SETTINGS id.
pub const MAX_SETTING_ID: u32 = 0x00ff_ffff;

/// SPDY/3 control frame type codes.
pub mod frame_type {
    pub const SYN_STREAM: u16 = 1;
    pub const SYN_REPLY: u16 = 2;
    pub const RST_STREAM: u16 = 3;
    pub const SETTINGS: u16 = 4;
    pub const PING: u16 = 6;
    pub const GOAWAY: u16 = 7;
    pub const HEADERS: u16 = 8;
    pub const WINDOW_UPDATE: u16 = 9;
    pub const CREDENTIAL: u16 = 10;

    /// True for frames whose body carries a compressed header block.
    pub fn carries_headers(frame_type: u16) -> bool {
        matches!(frame_type, SYN_STREAM | SYN_REPLY | HEADERS)
    }
}

/// Frame flags.
pub mod flags {
    /// Last frame the sender will emit on this stream.
    pub const FIN: u8 = 0x01;
    /// SYN_STREAM only: the recipient may not send on this stream.
    pub const UNIDIRECTIONAL: u8 = 0x02;
    /// SETTINGS only: drop previously persisted settings.
    pub const CLEAR_SETTINGS: u8 = 0x01;
}

/// Per-entry SETTINGS flags.
pub mod setting_flags {
    pub const PERSIST_VALUE: u8 = 0x01;
    pub const PERSISTED: u8 = 0x02;
}

/// SPDY/3 SETTINGS identifiers.
pub mod settings_id {
    pub const UPLOAD_BANDWIDTH: u32 = 1;
    pub const DOWNLOAD_BANDWIDTH: u32 = 2;
    pub const ROUND_TRIP_TIME: u32 = 3;
    pub const MAX_CONCURRENT_STREAMS: u32 = 4;
    pub const CURRENT_CWND: u32 = 5;
    pub const DOWNLOAD_RETRANS_RATE: u32 = 6;
    pub const INITIAL_WINDOW_SIZE: u32 = 7;
    pub const CLIENT_CERTIFICATE_VECTOR_SIZE: u32 = 8;
}

/// RST_STREAM status codes.
pub mod rst_status {
    pub const PROTOCOL_ERROR: u32 = 1;
    pub const INVALID_STREAM: u32 = 2;
    pub const REFUSED_STREAM: u32 = 3;
    pub const UNSUPPORTED_VERSION: u32 = 4;
    pub const CANCEL: u32 = 5;
    pub const INTERNAL_ERROR: u32 = 6;
    pub const FLOW_CONTROL_ERROR: u32 = 7;
    pub const STREAM_IN_USE: u32 = 8;
    pub const STREAM_ALREADY_CLOSED: u32 = 9;
    pub const INVALID_CREDENTIALS: u32 = 10;
    pub const FRAME_TOO_LARGE: u32 = 11;
}

/// GOAWAY status codes.
pub mod goaway_status {
    pub const OK: u32 = 0;
    pub const PROTOCOL_ERROR: u32 = 1;
    pub const INTERNAL_ERROR: u32 = 2;
}

/// The fixed 8-byte header shared by every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub control: bool,
    /// Control frames only (0 for DATA).
    pub version: u16,
    /// Control frames only (0 for DATA).
    pub frame_type: u16,
    /// DATA frames only (0 for control frames).
    pub stream_id: u32,
    pub flags: u8,
    pub length: u32, // 24 bits
}

impl FrameHeader {
    /// Parse the 8-byte frame header
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return None;
        }
        let control = data[0] & 0x80 != 0;
        let flags = data[4];
        let length = read_u24(&data[5..8]);
        if control {
            Some(Self {
                control,
                version: read_u15(&data[0..2]),
                frame_type: read_u16(&data[2..4]),
                stream_id: 0,
                flags,
                length,
            })
        } else {
            Some(Self {
                control,
                version: 0,
                frame_type: 0,
                stream_id: read_u31(&data[0..4]),
                flags,
                length,
            })
        }
    }

    /// Total frame size including header
    pub fn total_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.length as usize
    }

    pub fn is_fin(&self) -> bool {
        self.flags & flags::FIN != 0
    }

    /// Stream the frame addresses, read from the raw frame bytes when the
    /// frame type places one right after the header.
    pub fn stream_id_in(&self, raw: &[u8]) -> Option<u32> {
        if !self.control {
            return Some(self.stream_id);
        }
        match self.frame_type {
            frame_type::SYN_STREAM
            | frame_type::SYN_REPLY
            | frame_type::RST_STREAM
            | frame_type::HEADERS
            | frame_type::WINDOW_UPDATE => raw.get(8..12).map(read_u31),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynStream {
    pub flags: u8,
    pub stream_id: u32,
    pub assoc_stream_id: u32,
    /// 0 (highest) to 7 (lowest).
    pub priority: u8,
    pub slot: u8,
    pub headers: Headers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynReply {
    pub flags: u8,
    pub stream_id: u32,
    pub headers: Headers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStream {
    pub stream_id: u32,
    pub status: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub flags: u8,
    /// 24 bits.
    pub id: u32,
    pub value: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub flags: u8,
    pub entries: Vec<Setting>,
}

impl Settings {
    pub fn add(&mut self, flags: u8, id: u32, value: u32) {
        self.entries.push(Setting { flags, id, value });
    }

    pub fn get(&self, id: u32) -> Option<&Setting> {
        self.entries.iter().find(|s| s.id == id)
    }
}

/// Even ids are server-initiated, odd ids client-initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoAway {
    pub last_good_stream_id: u32,
    pub status: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadersFrame {
    pub flags: u8,
    pub stream_id: u32,
    pub headers: Headers,
}

/// Stream id 0 addresses the connection-level window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdate {
    pub stream_id: u32,
    pub delta: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub slot: u16,
    pub proof: Vec<u8>,
    pub certificates: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub stream_id: u32,
    pub flags: u8,
    pub data: Bytes,
}

/// Every SPDY/3 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    SynStream(SynStream),
    SynReply(SynReply),
    RstStream(RstStream),
    Settings(Settings),
    Ping(Ping),
    GoAway(GoAway),
    Headers(HeadersFrame),
    WindowUpdate(WindowUpdate),
    Credential(Credential),
    Data(Data),
}

impl Frame {
    /// Parse one complete frame (header included).
    ///
    /// Header-bearing frames feed their block through `decompressor`; a
    /// failure there leaves the decompression context unusable and should be
    /// treated as fatal by the caller.
    pub fn parse(data: &[u8], decompressor: &mut dyn Decompressor) -> Result<Frame, FrameError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::LengthMismatch {
                got: data.len(),
                expected: FRAME_HEADER_SIZE,
            });
        }
        if data[0] & 0x80 == 0 {
            return parse_data(data).map(Frame::Data);
        }
        match read_u16(&data[2..4]) {
            frame_type::SYN_STREAM => parse_syn_stream(data, decompressor).map(Frame::SynStream),
            frame_type::SYN_REPLY => parse_syn_reply(data, decompressor).map(Frame::SynReply),
            frame_type::RST_STREAM => parse_rst_stream(data).map(Frame::RstStream),
            frame_type::SETTINGS => parse_settings(data).map(Frame::Settings),
            frame_type::PING => parse_ping(data).map(Frame::Ping),
            frame_type::GOAWAY => parse_goaway(data).map(Frame::GoAway),
            frame_type::HEADERS => parse_headers(data, decompressor).map(Frame::Headers),
            frame_type::WINDOW_UPDATE => parse_window_update(data).map(Frame::WindowUpdate),
            frame_type::CREDENTIAL => parse_credential(data).map(Frame::Credential),
            other => Err(FrameError::UnknownType(other)),
        }
    }

    /// Encode the frame, header included.
    pub fn encode(&self, compressor: &mut dyn Compressor) -> Result<Vec<u8>, FrameError> {
        match self {
            Frame::SynStream(f) => encode_syn_stream(f, compressor),
            Frame::SynReply(f) => encode_syn_reply(f, compressor),
            Frame::RstStream(f) => encode_rst_stream(f),
            Frame::Settings(f) => encode_settings(f),
            Frame::Ping(f) => Ok(encode_ping(f)),
            Frame::GoAway(f) => encode_goaway(f),
            Frame::Headers(f) => encode_headers(f, compressor),
            Frame::WindowUpdate(f) => encode_window_update(f),
            Frame::Credential(f) => encode_credential(f),
            Frame::Data(f) => encode_data(f),
        }
    }

    /// Addressed stream, `None` for connection-level frames.
    pub fn stream_id(&self) -> Option<u32> {
        match self {
            Frame::SynStream(f) => Some(f.stream_id),
            Frame::SynReply(f) => Some(f.stream_id),
            Frame::RstStream(f) => Some(f.stream_id),
            Frame::Headers(f) => Some(f.stream_id),
            Frame::WindowUpdate(f) if f.stream_id != 0 => Some(f.stream_id),
            Frame::Data(f) => Some(f.stream_id),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Frame::SynStream(_) => "SYN_STREAM",
            Frame::SynReply(_) => "SYN_REPLY",
            Frame::RstStream(_) => "RST_STREAM",
            Frame::Settings(_) => "SETTINGS",
            Frame::Ping(_) => "PING",
            Frame::GoAway(_) => "GOAWAY",
            Frame::Headers(_) => "HEADERS",
            Frame::WindowUpdate(_) => "WINDOW_UPDATE",
            Frame::Credential(_) => "CREDENTIAL",
            Frame::Data(_) => "DATA",
        }
    }

    pub fn is_fin(&self) -> bool {
        let flags = match self {
            Frame::SynStream(f) => f.flags,
            Frame::SynReply(f) => f.flags,
            Frame::Headers(f) => f.flags,
            Frame::Data(f) => f.flags,
            _ => 0,
        };
        flags & flags::FIN != 0
    }
}

// ============================================================================
// Field helpers
// ============================================================================

fn read_u15(b: &[u8]) -> u16 {
    (u16::from(b[0] & 0x7f) << 8) | u16::from(b[1])
}

fn read_u16(b: &[u8]) -> u16 {
    (u16::from(b[0]) << 8) | u16::from(b[1])
}

fn read_u24(b: &[u8]) -> u32 {
    (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2])
}

fn read_u31(b: &[u8]) -> u32 {
    read_u32(b) & 0x7fff_ffff
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn write_u24(out: &mut Vec<u8>, value: u32) {
    out.push((value >> 16) as u8);
    out.push((value >> 8) as u8);
    out.push(value as u8);
}

/// Common checks for a control frame: minimum size, declared length, control
/// bit, type and version (steps 1-4 of parsing).
fn check_control(data: &[u8], expected_type: u16, min_len: usize) -> Result<(), FrameError> {
    if data.len() < min_len {
        return Err(FrameError::LengthMismatch {
            got: data.len(),
            expected: min_len,
        });
    }
    let declared = FRAME_HEADER_SIZE + read_u24(&data[5..8]) as usize;
    if data.len() != declared {
        return Err(FrameError::LengthMismatch {
            got: data.len(),
            expected: declared,
        });
    }
    if data[0] & 0x80 == 0 {
        return Err(FrameError::invalid("control bit", 0, 1));
    }
    let got_type = read_u16(&data[2..4]);
    if got_type != expected_type {
        return Err(FrameError::invalid("type", u32::from(got_type), u32::from(expected_type)));
    }
    let version = read_u15(&data[0..2]);
    if version != SPDY_VERSION {
        return Err(FrameError::invalid("version", u32::from(version), u32::from(SPDY_VERSION)));
    }
    Ok(())
}

fn check_fixed_length(data: &[u8], length: u32) -> Result<(), FrameError> {
    let declared = read_u24(&data[5..8]);
    if declared != length {
        return Err(FrameError::invalid("length", declared, length));
    }
    Ok(())
}

fn check_no_flags(data: &[u8]) -> Result<(), FrameError> {
    if data[4] != 0 {
        return Err(FrameError::invalid("flags", u32::from(data[4]), 0));
    }
    Ok(())
}

fn check_unused_bit(byte: u8) -> Result<(), FrameError> {
    if byte & 0x80 != 0 {
        return Err(FrameError::invalid("unused", 1, 0));
    }
    Ok(())
}

fn check_stream_id(field: &'static str, id: u32) -> Result<(), FrameError> {
    if id > MAX_STREAM_ID {
        return Err(FrameError::invalid(field, id, MAX_STREAM_ID));
    }
    Ok(())
}

fn control_header(frame_type: u16, flags: u8, length: usize) -> Result<Vec<u8>, FrameError> {
    if length > MAX_FRAME_LENGTH {
        return Err(FrameError::invalid(
            "length",
            u32::try_from(length).unwrap_or(u32::MAX),
            MAX_FRAME_LENGTH as u32,
        ));
    }
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + length);
    out.push(0x80 | (SPDY_VERSION >> 8) as u8); // Control bit and version
    out.push(SPDY_VERSION as u8);
    out.extend_from_slice(&frame_type.to_be_bytes());
    out.push(flags);
    write_u24(&mut out, length as u32);
    Ok(out)
}

// ============================================================================
// SYN_STREAM
// ============================================================================

fn parse_syn_stream(
    data: &[u8],
    decompressor: &mut dyn Decompressor,
) -> Result<SynStream, FrameError> {
    check_control(data, frame_type::SYN_STREAM, 18)?;
    check_unused_bit(data[8])?;
    check_unused_bit(data[12])?;
    if data[16] & 0x1f != 0 {
        return Err(FrameError::invalid("unused", u32::from(data[16] & 0x1f), 0));
    }
    let headers = decompressor.decompress(&data[18..])?;
    Ok(SynStream {
        flags: data[4],
        stream_id: read_u31(&data[8..12]),
        assoc_stream_id: read_u31(&data[12..16]),
        priority: data[16] >> 5,
        slot: data[17],
        headers,
    })
}

fn encode_syn_stream(
    frame: &SynStream,
    compressor: &mut dyn Compressor,
) -> Result<Vec<u8>, FrameError> {
    check_stream_id("stream id", frame.stream_id)?;
    check_stream_id("associated stream id", frame.assoc_stream_id)?;
    if frame.priority > 7 {
        return Err(FrameError::invalid("priority", u32::from(frame.priority), 7));
    }
    let block = compressor.compress(&frame.headers)?;
    let mut out = control_header(frame_type::SYN_STREAM, frame.flags, 10 + block.len())?;
    out.extend_from_slice(&frame.stream_id.to_be_bytes());
    out.extend_from_slice(&frame.assoc_stream_id.to_be_bytes());
    out.push(frame.priority << 5); // Priority and unused
    out.push(frame.slot);
    out.extend_from_slice(&block);
    Ok(out)
}

// ============================================================================
// SYN_REPLY
// ============================================================================

fn parse_syn_reply(
    data: &[u8],
    decompressor: &mut dyn Decompressor,
) -> Result<SynReply, FrameError> {
    check_control(data, frame_type::SYN_REPLY, 12)?;
    check_unused_bit(data[8])?;
    let headers = decompressor.decompress(&data[12..])?;
    Ok(SynReply {
        flags: data[4],
        stream_id: read_u31(&data[8..12]),
        headers,
    })
}

fn encode_syn_reply(frame: &SynReply, compressor: &mut dyn Compressor) -> Result<Vec<u8>, FrameError> {
    check_stream_id("stream id", frame.stream_id)?;
    let block = compressor.compress(&frame.headers)?;
    let mut out = control_header(frame_type::SYN_REPLY, frame.flags, 4 + block.len())?;
    out.extend_from_slice(&frame.stream_id.to_be_bytes());
    out.extend_from_slice(&block);
    Ok(out)
}

// ============================================================================
// RST_STREAM
// ============================================================================

fn parse_rst_stream(data: &[u8]) -> Result<RstStream, FrameError> {
    check_control(data, frame_type::RST_STREAM, 16)?;
    check_fixed_length(data, 8)?;
    check_no_flags(data)?;
    check_unused_bit(data[8])?;
    Ok(RstStream {
        stream_id: read_u31(&data[8..12]),
        status: read_u32(&data[12..16]),
    })
}

fn encode_rst_stream(frame: &RstStream) -> Result<Vec<u8>, FrameError> {
    check_stream_id("stream id", frame.stream_id)?;
    let mut out = control_header(frame_type::RST_STREAM, 0, 8)?;
    out.extend_from_slice(&frame.stream_id.to_be_bytes());
    out.extend_from_slice(&frame.status.to_be_bytes());
    Ok(out)
}

// ============================================================================
// SETTINGS
// ============================================================================

fn parse_settings(data: &[u8]) -> Result<Settings, FrameError> {
    check_control(data, frame_type::SETTINGS, 12)?;
    let count = read_u32(&data[8..12]) as usize;
    let expected = count
        .checked_mul(8)
        .and_then(|n| n.checked_add(12))
        .unwrap_or(usize::MAX);
    if data.len() != expected {
        return Err(FrameError::LengthMismatch {
            got: data.len(),
            expected,
        });
    }
    let entries = data[12..]
        .chunks_exact(8)
        .map(|entry| Setting {
            flags: entry[0],
            id: read_u24(&entry[1..4]),
            value: read_u32(&entry[4..8]),
        })
        .collect();
    Ok(Settings {
        flags: data[4],
        entries,
    })
}

fn encode_settings(frame: &Settings) -> Result<Vec<u8>, FrameError> {
    let count = frame.entries.len();
    let mut out = control_header(frame_type::SETTINGS, frame.flags, 4 + 8 * count)?;
    out.extend_from_slice(&(count as u32).to_be_bytes());
    for setting in &frame.entries {
        if setting.id > MAX_SETTING_ID {
            return Err(FrameError::invalid("setting id", setting.id, MAX_SETTING_ID));
        }
        out.push(setting.flags);
        write_u24(&mut out, setting.id);
        out.extend_from_slice(&setting.value.to_be_bytes());
    }
    Ok(out)
}

// ============================================================================
// PING
// ============================================================================

fn parse_ping(data: &[u8]) -> Result<Ping, FrameError> {
    check_control(data, frame_type::PING, 12)?;
    check_fixed_length(data, 4)?;
    check_no_flags(data)?;
    Ok(Ping {
        id: read_u32(&data[8..12]),
    })
}

fn encode_ping(frame: &Ping) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&[0x80, SPDY_VERSION as u8, 0, frame_type::PING as u8]);
    out.extend_from_slice(&[0, 0, 0, 4]); // Flags and length
    out.extend_from_slice(&frame.id.to_be_bytes());
    out
}

// ============================================================================
// GOAWAY
// ============================================================================

fn parse_goaway(data: &[u8]) -> Result<GoAway, FrameError> {
    check_control(data, frame_type::GOAWAY, 16)?;
    check_fixed_length(data, 8)?;
    check_no_flags(data)?;
    check_unused_bit(data[8])?;
    Ok(GoAway {
        last_good_stream_id: read_u31(&data[8..12]),
        status: read_u32(&data[12..16]),
    })
}

fn encode_goaway(frame: &GoAway) -> Result<Vec<u8>, FrameError> {
    check_stream_id("last good stream id", frame.last_good_stream_id)?;
    let mut out = control_header(frame_type::GOAWAY, 0, 8)?;
    out.extend_from_slice(&frame.last_good_stream_id.to_be_bytes());
    out.extend_from_slice(&frame.status.to_be_bytes());
    Ok(out)
}

// ============================================================================
// HEADERS
// ============================================================================

fn parse_headers(
    data: &[u8],
    decompressor: &mut dyn Decompressor,
) -> Result<HeadersFrame, FrameError> {
    check_control(data, frame_type::HEADERS, 12)?;
    check_unused_bit(data[8])?;
    let headers = decompressor.decompress(&data[12..])?;
    Ok(HeadersFrame {
        flags: data[4],
        stream_id: read_u31(&data[8..12]),
        headers,
    })
}

fn encode_headers(
    frame: &HeadersFrame,
    compressor: &mut dyn Compressor,
) -> Result<Vec<u8>, FrameError> {
    check_stream_id("stream id", frame.stream_id)?;
    let block = compressor.compress(&frame.headers)?;
    let mut out = control_header(frame_type::HEADERS, frame.flags, 4 + block.len())?;
    out.extend_from_slice(&frame.stream_id.to_be_bytes());
    out.extend_from_slice(&block);
    Ok(out)
}

// ============================================================================
// WINDOW_UPDATE
// ============================================================================

fn parse_window_update(data: &[u8]) -> Result<WindowUpdate, FrameError> {
    check_control(data, frame_type::WINDOW_UPDATE, 16)?;
    check_fixed_length(data, 8)?;
    check_no_flags(data)?;
    check_unused_bit(data[8])?;
    check_unused_bit(data[12])?;
    Ok(WindowUpdate {
        stream_id: read_u31(&data[8..12]),
        delta: read_u31(&data[12..16]),
    })
}

fn encode_window_update(frame: &WindowUpdate) -> Result<Vec<u8>, FrameError> {
    check_stream_id("stream id", frame.stream_id)?;
    if frame.delta > MAX_WINDOW_SIZE {
        return Err(FrameError::invalid("delta window size", frame.delta, MAX_WINDOW_SIZE));
    }
    let mut out = control_header(frame_type::WINDOW_UPDATE, 0, 8)?;
    out.extend_from_slice(&frame.stream_id.to_be_bytes());
    out.extend_from_slice(&frame.delta.to_be_bytes());
    Ok(out)
}

// ============================================================================
// CREDENTIAL
// ============================================================================

fn parse_credential(data: &[u8]) -> Result<Credential, FrameError> {
    check_control(data, frame_type::CREDENTIAL, 14)?;
    check_no_flags(data)?;
    let slot = read_u16(&data[8..10]);
    let proof_len = read_u32(&data[10..14]) as usize;
    let proof_end = 14usize.saturating_add(proof_len);
    if proof_end > data.len() {
        return Err(FrameError::LengthMismatch {
            got: data.len(),
            expected: proof_end,
        });
    }
    let proof = data[14..proof_end].to_vec();

    let mut certificates = Vec::new();
    let mut offset = proof_end;
    while offset < data.len() {
        if offset + 4 > data.len() {
            return Err(FrameError::LengthMismatch {
                got: data.len(),
                expected: offset + 4,
            });
        }
        let cert_len = read_u32(&data[offset..offset + 4]) as usize;
        let cert_end = (offset + 4).saturating_add(cert_len);
        if cert_end > data.len() {
            return Err(FrameError::LengthMismatch {
                got: data.len(),
                expected: cert_end,
            });
        }
        certificates.push(data[offset + 4..cert_end].to_vec());
        offset = cert_end;
    }

    Ok(Credential {
        slot,
        proof,
        certificates,
    })
}

fn encode_credential(frame: &Credential) -> Result<Vec<u8>, FrameError> {
    let certs_len: usize = frame.certificates.iter().map(|c| 4 + c.len()).sum();
    let length = 6 + frame.proof.len() + certs_len;
    let mut out = control_header(frame_type::CREDENTIAL, 0, length)?;
    out.extend_from_slice(&frame.slot.to_be_bytes());
    out.extend_from_slice(&(frame.proof.len() as u32).to_be_bytes());
    out.extend_from_slice(&frame.proof);
    for cert in &frame.certificates {
        out.extend_from_slice(&(cert.len() as u32).to_be_bytes());
        out.extend_from_slice(cert);
    }
    Ok(out)
}

// ============================================================================
// DATA
// ============================================================================

fn parse_data(data: &[u8]) -> Result<Data, FrameError> {
    if data.len() < FRAME_HEADER_SIZE {
        return Err(FrameError::LengthMismatch {
            got: data.len(),
            expected: FRAME_HEADER_SIZE,
        });
    }
    let declared = FRAME_HEADER_SIZE + read_u24(&data[5..8]) as usize;
    if data.len() != declared {
        return Err(FrameError::LengthMismatch {
            got: data.len(),
            expected: declared,
        });
    }
    if data[0] & 0x80 != 0 {
        return Err(FrameError::invalid("control bit", 1, 0));
    }
    Ok(Data {
        stream_id: read_u31(&data[0..4]),
        flags: data[4],
        data: Bytes::copy_from_slice(&data[FRAME_HEADER_SIZE..]),
    })
}

fn encode_data(frame: &Data) -> Result<Vec<u8>, FrameError> {
    check_stream_id("stream id", frame.stream_id)?;
    let length = frame.data.len();
    if length > MAX_FRAME_LENGTH {
        return Err(FrameError::invalid(
            "length",
            u32::try_from(length).unwrap_or(u32::MAX),
            MAX_FRAME_LENGTH as u32,
        ));
    }
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + length);
    out.extend_from_slice(&frame.stream_id.to_be_bytes());
    out.push(frame.flags);
    write_u24(&mut out, length as u32);
    out.extend_from_slice(&frame.data);
    Ok(out)
}
