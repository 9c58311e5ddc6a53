//! Header blocks: the name/value mapping carried by SYN_STREAM, SYN_REPLY and
//! HEADERS frames, and the stateful compression boundary around it.
//!
//! Compression state is connection-scoped. Each connection owns exactly one
//! [`Compressor`] (used only by its send loop) and one [`Decompressor`] (used
//! only by its read loop); blocks must pass through them in wire order.

use std::collections::BTreeMap;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

use crate::error::HeaderError;

/// Upper bound on a decompressed header block (protects against zlib bombs).
pub const MAX_HEADER_BLOCK_SIZE: usize = 256 * 1024;

/// Name/value header mapping. Names are stored lower-case; a name may carry
/// several values, which travel NUL-separated on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: BTreeMap<String, Vec<String>>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Replace every value of `name`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries
            .insert(name.into().to_ascii_lowercase(), vec![value.into()]);
    }

    /// Append a value to `name`.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries
            .entry(name.into().to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.entries.remove(&name.to_ascii_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    /// Merge `other` into `self`; names present in `other` replace ours.
    pub fn update(&mut self, other: &Headers) {
        for (name, values) in &other.entries {
            self.entries.insert(name.clone(), values.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize into the uncompressed SPDY/3 name/value block.
    pub fn to_block(&self) -> Result<Vec<u8>, HeaderError> {
        let mut out = Vec::with_capacity(4 + self.entries.len() * 32);
        out.extend_from_slice(&block_len(self.entries.len())?.to_be_bytes());
        for (name, values) in &self.entries {
            if name.is_empty() {
                return Err(HeaderError::Malformed("empty header name".to_string()));
            }
            let value = values.join("\0");
            out.extend_from_slice(&block_len(name.len())?.to_be_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&block_len(value.len())?.to_be_bytes());
            out.extend_from_slice(value.as_bytes());
        }
        Ok(out)
    }

    /// Parse an uncompressed SPDY/3 name/value block.
    pub fn from_block(block: &[u8]) -> Result<Self, HeaderError> {
        let mut reader = BlockReader { data: block, pos: 0 };
        let count = reader.read_u32()? as usize;
        let mut headers = Headers::new();
        for _ in 0..count {
            let name = reader.read_string()?;
            if name.is_empty() {
                return Err(HeaderError::Malformed("empty header name".to_string()));
            }
            if name.bytes().any(|b| b.is_ascii_uppercase()) {
                return Err(HeaderError::Malformed(format!(
                    "header name {:?} is not lower-case",
                    name
                )));
            }
            if headers.entries.contains_key(&name) {
                return Err(HeaderError::Malformed(format!(
                    "duplicate header name {:?}",
                    name
                )));
            }
            let value = reader.read_string()?;
            let values = value.split('\0').map(str::to_string).collect();
            headers.entries.insert(name, values);
        }
        if reader.pos != block.len() {
            return Err(HeaderError::Malformed(format!(
                "{} trailing bytes after header block",
                block.len() - reader.pos
            )));
        }
        Ok(headers)
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.add(name, value);
        }
        headers
    }
}

fn block_len(len: usize) -> Result<u32, HeaderError> {
    u32::try_from(len)
        .map_err(|_| HeaderError::Malformed(format!("length {} does not fit in 32 bits", len)))
}

struct BlockReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl BlockReader<'_> {
    fn read_u32(&mut self) -> Result<u32, HeaderError> {
        let bytes = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or_else(|| HeaderError::Malformed("truncated length field".to_string()))?;
        self.pos += 4;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_string(&mut self) -> Result<String, HeaderError> {
        let len = self.read_u32()? as usize;
        let bytes = self
            .data
            .get(self.pos..self.pos + len)
            .ok_or_else(|| HeaderError::Malformed("truncated header string".to_string()))?;
        self.pos += len;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| HeaderError::Malformed("header string is not utf-8".to_string()))
    }
}

/// Outbound half of the header compression boundary.
pub trait Compressor: Send {
    fn compress(&mut self, headers: &Headers) -> Result<Vec<u8>, HeaderError>;
}

/// Inbound half of the header compression boundary.
pub trait Decompressor: Send {
    fn decompress(&mut self, data: &[u8]) -> Result<Headers, HeaderError>;
}

/// SPDY/3 zlib header compressor.
/// Wraps a `flate2::Compress` stream primed with [`SPDY3_DICTIONARY`]; every
/// block ends with a sync flush so the peer can inflate it immediately.
pub struct ZlibCompressor {
    inner: Compress,
}

impl std::fmt::Debug for ZlibCompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZlibCompressor")
            .field("total_in", &self.inner.total_in())
            .field("total_out", &self.inner.total_out())
            .finish()
    }
}

impl ZlibCompressor {
    pub fn new() -> Result<Self, HeaderError> {
        let mut inner = Compress::new(Compression::default(), true);
        inner
            .set_dictionary(SPDY3_DICTIONARY)
            .map_err(|e| HeaderError::Compression(e.to_string()))?;
        Ok(Self { inner })
    }
}

impl Compressor for ZlibCompressor {
    fn compress(&mut self, headers: &Headers) -> Result<Vec<u8>, HeaderError> {
        let block = headers.to_block()?;
        let start = self.inner.total_in();
        let mut out = Vec::with_capacity(block.len() / 2 + 64);
        loop {
            if out.len() == out.capacity() {
                out.reserve(256);
            }
            let consumed = (self.inner.total_in() - start) as usize;
            self.inner
                .compress_vec(&block[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| HeaderError::Compression(e.to_string()))?;
            let consumed = (self.inner.total_in() - start) as usize;
            if consumed == block.len() && out.len() < out.capacity() {
                return Ok(out);
            }
        }
    }
}

/// SPDY/3 zlib header decompressor.
/// Supplies [`SPDY3_DICTIONARY`] when the stream asks for it and keeps the
/// inflate window alive across blocks.
pub struct ZlibDecompressor {
    inner: Decompress,
}

impl std::fmt::Debug for ZlibDecompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZlibDecompressor")
            .field("total_in", &self.inner.total_in())
            .field("total_out", &self.inner.total_out())
            .finish()
    }
}

impl Default for ZlibDecompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl ZlibDecompressor {
    pub fn new() -> Self {
        Self {
            inner: Decompress::new(true),
        }
    }

    fn inflate(&mut self, data: &[u8]) -> Result<Vec<u8>, HeaderError> {
        let start_in = self.inner.total_in();
        let mut out = Vec::with_capacity(data.len() * 4 + 64);
        loop {
            if out.len() == out.capacity() {
                if out.len() >= MAX_HEADER_BLOCK_SIZE {
                    return Err(HeaderError::Decompression(format!(
                        "header block exceeds {} bytes",
                        MAX_HEADER_BLOCK_SIZE
                    )));
                }
                out.reserve(out.len().max(256));
            }
            let consumed = (self.inner.total_in() - start_in) as usize;
            let produced = out.len();
            match self
                .inner
                .decompress_vec(&data[consumed..], &mut out, FlushDecompress::Sync)
            {
                Ok(_) => {}
                Err(e) if e.needs_dictionary().is_some() => {
                    self.inner
                        .set_dictionary(SPDY3_DICTIONARY)
                        .map_err(|e| HeaderError::Decompression(e.to_string()))?;
                    continue;
                }
                Err(e) => return Err(HeaderError::Decompression(e.to_string())),
            }
            let now_consumed = (self.inner.total_in() - start_in) as usize;
            if now_consumed == data.len() && out.len() < out.capacity() {
                return Ok(out);
            }
            if now_consumed == consumed && out.len() == produced && out.len() < out.capacity() {
                return Err(HeaderError::Decompression(
                    "zlib stream made no progress".to_string(),
                ));
            }
        }
    }
}

impl Decompressor for ZlibDecompressor {
    fn decompress(&mut self, data: &[u8]) -> Result<Headers, HeaderError> {
        let block = self.inflate(data)?;
        Headers::from_block(&block)
    }
}

/// Preset zlib dictionary defined by SPDY/3 for header compression.
pub const SPDY3_DICTIONARY: &[u8] = b"\
\x00\x00\x00\x07options\x00\x00\x00\x04head\x00\x00\x00\x04post\
\x00\x00\x00\x03put\x00\x00\x00\x06delete\x00\x00\x00\x05trace\
\x00\x00\x00\x06accept\x00\x00\x00\x0eaccept-charset\
\x00\x00\x00\x0faccept-encoding\x00\x00\x00\x0faccept-language\
\x00\x00\x00\x0daccept-ranges\x00\x00\x00\x03age\x00\x00\x00\x05allow\
\x00\x00\x00\x0dauthorization\x00\x00\x00\x0dcache-control\
\x00\x00\x00\x0aconnection\x00\x00\x00\x0ccontent-base\
\x00\x00\x00\x10content-encoding\x00\x00\x00\x10content-language\
\x00\x00\x00\x0econtent-length\x00\x00\x00\x10content-location\
\x00\x00\x00\x0bcontent-md5\x00\x00\x00\x0dcontent-range\
\x00\x00\x00\x0ccontent-type\x00\x00\x00\x04date\x00\x00\x00\x04etag\
\x00\x00\x00\x06expect\x00\x00\x00\x07expires\x00\x00\x00\x04from\
\x00\x00\x00\x04host\x00\x00\x00\x08if-match\
\x00\x00\x00\x11if-modified-since\x00\x00\x00\x0dif-none-match\
\x00\x00\x00\x08if-range\x00\x00\x00\x13if-unmodified-since\
\x00\x00\x00\x0dlast-modified\x00\x00\x00\x08location\
\x00\x00\x00\x0cmax-forwards\x00\x00\x00\x06pragma\
\x00\x00\x00\x12proxy-authenticate\x00\x00\x00\x13proxy-authorization\
\x00\x00\x00\x05range\x00\x00\x00\x07referer\x00\x00\x00\x0bretry-after\
\x00\x00\x00\x06server\x00\x00\x00\x02te\x00\x00\x00\x07trailer\
\x00\x00\x00\x11transfer-encoding\x00\x00\x00\x07upgrade\
\x00\x00\x00\x0auser-agent\x00\x00\x00\x04vary\x00\x00\x00\x03via\
\x00\x00\x00\x07warning\x00\x00\x00\x10www-authenticate\
\x00\x00\x00\x06method\x00\x00\x00\x03get\x00\x00\x00\x06status\
\x00\x00\x00\x06200 OK\x00\x00\x00\x07version\x00\x00\x00\x08HTTP/1.1\
\x00\x00\x00\x03url\x00\x00\x00\x06public\x00\x00\x00\x0aset-cookie\
\x00\x00\x00\x0akeep-alive\x00\x00\x00\x06origin\
100101201202205206300302303304305306307402405406407408409410411412413414\
415416417502504505203 Non-Authoritative Information204 No Content\
301 Moved Permanently400 Bad Request401 Unauthorized403 Forbidden\
404 Not Found500 Internal Server Error501 Not Implemented\
503 Service UnavailableJan Feb Mar Apr May Jun Jul Aug Sept Oct Nov Dec\
 00:00:00 Mon, Tue, Wed, Thu, Fri, Sat, Sun, GMTchunked,text/html,\
image/png,image/jpg,image/gif,application/xml,application/xhtml+xml,\
text/plain,text/javascript,publicprivatemax-age=gzip,deflate,sdch\
charset=utf-8charset=iso-8859-1,utf-,*,enq=0.";

// ============================================================================
// Tests
// ============================================================================
