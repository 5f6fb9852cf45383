//! Request body framing.
//!
//! The framing strategy is chosen once per request from the headers and is
//! a closed set, so it is an enum rather than a trait object.

use std::io;

use thiserror::Error;

use crate::http::headers::KnownHeader;
use crate::http::parser::ParseError;
use crate::http::request::RequestHead;
use crate::memory::Cursor;
use crate::socket::SocketInput;

/// Largest chunk size accepted (hex digits beyond this overflow).
const MAX_CHUNK_SIZE_DIGITS: usize = 15;

/// Bytes of trailer section tolerated after the last chunk.
const MAX_TRAILER_SIZE: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum BodyError {
    #[error(transparent)]
    Protocol(#[from] ParseError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// How the request body is delimited.
#[derive(Debug)]
pub enum MessageBody {
    /// No body.
    Empty,
    /// `Content-Length` bytes.
    ContentLength { remaining: u64 },
    /// `Transfer-Encoding: chunked`.
    Chunked(ChunkedDecoder),
    /// Everything until the peer closes.
    UntilClose { done: bool },
}

impl MessageBody {
    /// Pick the body framing for a request.
    ///
    /// In priority order: a `Transfer-Encoding` ending in `chunked` (any
    /// `Content-Length` is ignored), then `Content-Length`, then an upgrade
    /// reads until close, otherwise the body is empty.
    pub fn for_request(head: &RequestHead) -> Result<MessageBody, ParseError> {
        // Applies to HTTP/1.0 too: a chunked body left unparsed would be
        // read as the next request.
        if let Some(coding) = head.headers.joined(KnownHeader::TransferEncoding) {
            if final_coding_is_chunked(&coding) {
                return Ok(MessageBody::Chunked(ChunkedDecoder::new()));
            }
            return Err(ParseError::UnsupportedTransferEncoding(coding));
        }

        if let Some(values) = head.headers.get_known(KnownHeader::ContentLength) {
            let length = parse_content_length(values)?;
            return Ok(if length == 0 {
                MessageBody::Empty
            } else {
                MessageBody::ContentLength { remaining: length }
            });
        }

        if head.is_upgrade() {
            return Ok(MessageBody::UntilClose { done: false });
        }

        Ok(MessageBody::Empty)
    }

    /// Whether the connection must close after this request because the
    /// body only ends with the stream.
    pub fn requires_close(&self) -> bool {
        matches!(self, MessageBody::UntilClose { .. })
    }

    pub fn is_complete(&self) -> bool {
        match self {
            MessageBody::Empty => true,
            MessageBody::ContentLength { remaining } => *remaining == 0,
            MessageBody::Chunked(decoder) => decoder.is_complete(),
            MessageBody::UntilClose { done } => *done,
        }
    }

    /// Read decoded body bytes. Returns 0 once the body is complete.
    pub async fn read(&mut self, input: &SocketInput, buf: &mut [u8]) -> Result<usize, BodyError> {
        if buf.is_empty() || self.is_complete() {
            return Ok(0);
        }

        loop {
            input.ready().await?;

            let (written, consumed, examined, closed) = {
                let view = input.consuming_start();
                let end = view.end();
                let closed = view.remote_closed();
                let mut cursor = view.cursor();

                let written = self.decode(&mut cursor, buf);
                let consumed = cursor.position();
                let examined = if cursor.is_end() { end } else { consumed };
                (written, consumed, examined, closed)
            };
            input.consuming_complete(consumed, examined);

            let written = written?;
            if written > 0 || self.is_complete() {
                return Ok(written);
            }
            if closed {
                if let MessageBody::UntilClose { done } = self {
                    *done = true;
                    return Ok(0);
                }
                return Err(ParseError::UnexpectedEof.into());
            }
        }
    }

    /// Read and discard whatever is left of the body.
    pub async fn drain(&mut self, input: &SocketInput) -> Result<u64, BodyError> {
        let mut scratch = [0u8; 4096];
        let mut total = 0u64;
        loop {
            let n = self.read(input, &mut scratch).await?;
            if n == 0 {
                return Ok(total);
            }
            total += n as u64;
        }
    }

    fn decode(&mut self, cursor: &mut Cursor<'_>, buf: &mut [u8]) -> Result<usize, ParseError> {
        match self {
            MessageBody::Empty => Ok(0),
            MessageBody::ContentLength { remaining } => {
                let wanted = buf.len().min(*remaining as usize);
                let n = copy_from(cursor, &mut buf[..wanted]);
                *remaining -= n as u64;
                Ok(n)
            }
            MessageBody::Chunked(decoder) => decoder.decode(cursor, buf),
            MessageBody::UntilClose { .. } => Ok(copy_from(cursor, buf)),
        }
    }
}

/// Whether the last listed transfer coding is `chunked`.
pub fn final_coding_is_chunked(coding: &str) -> bool {
    coding
        .rsplit(',')
        .map(str::trim)
        .find(|c| !c.is_empty())
        .map(|c| c.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

/// Parse one or more `Content-Length` values; they must agree.
pub fn parse_content_length(values: &[String]) -> Result<u64, ParseError> {
    let mut length = None;
    for part in values.iter().flat_map(|v| v.split(',')) {
        let part = part.trim();
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::InvalidContentLength);
        }
        let parsed: u64 = part.parse().map_err(|_| ParseError::InvalidContentLength)?;
        match length {
            Some(existing) if existing != parsed => return Err(ParseError::InvalidContentLength),
            _ => length = Some(parsed),
        }
    }
    length.ok_or(ParseError::InvalidContentLength)
}

fn copy_from(cursor: &mut Cursor<'_>, buf: &mut [u8]) -> usize {
    let mut copied = 0;
    while copied < buf.len() {
        let slice = cursor.contiguous();
        if slice.is_empty() {
            break;
        }
        let n = slice.len().min(buf.len() - copied);
        buf[copied..copied + n].copy_from_slice(&slice[..n]);
        cursor.skip(n);
        copied += n;
    }
    copied
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Extension,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    TrailerStart,
    TrailerLine,
    TrailerLineLf,
    TrailerEndLf,
    Complete,
}

/// Byte-driven chunked transfer decoder.
///
/// All state lives in the decoder, so input can be consumed as soon as it
/// is decoded and arbitrary fragmentation is handled without rescanning.
#[derive(Debug, Clone)]
pub struct ChunkedDecoder {
    state: ChunkState,
    size: u64,
    digits: usize,
    remaining: u64,
    trailer_bytes: usize,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
            size: 0,
            digits: 0,
            remaining: 0,
            trailer_bytes: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == ChunkState::Complete
    }

    /// Decode from `cursor` into `out`; stops when `out` is full, input runs
    /// out, or the terminating chunk and trailers have been read.
    pub fn decode(&mut self, cursor: &mut Cursor<'_>, out: &mut [u8]) -> Result<usize, ParseError> {
        let mut written = 0;

        while self.state != ChunkState::Complete {
            if self.state == ChunkState::Data {
                if written == out.len() {
                    break;
                }
                let wanted = (out.len() - written).min(self.remaining as usize);
                let n = copy_from(cursor, &mut out[written..written + wanted]);
                if n == 0 {
                    break;
                }
                written += n;
                self.remaining -= n as u64;
                if self.remaining == 0 {
                    self.state = ChunkState::DataCr;
                }
                continue;
            }

            let Some(byte) = cursor.take() else {
                break;
            };
            self.step(byte)?;
        }

        Ok(written)
    }

    fn step(&mut self, byte: u8) -> Result<(), ParseError> {
        self.state = match (self.state, byte) {
            (ChunkState::Size, b) if b.is_ascii_hexdigit() => {
                if self.digits == MAX_CHUNK_SIZE_DIGITS {
                    return Err(ParseError::InvalidChunk);
                }
                let digit = (b as char).to_digit(16).unwrap_or(0) as u64;
                self.size = self.size * 16 + digit;
                self.digits += 1;
                ChunkState::Size
            }
            (ChunkState::Size, b';' | b' ' | b'\t') if self.digits > 0 => ChunkState::Extension,
            (ChunkState::Size, b'\r') if self.digits > 0 => ChunkState::SizeLf,
            (ChunkState::Extension, b'\r') => ChunkState::SizeLf,
            (ChunkState::Extension, b) if is_extension_char(b) => ChunkState::Extension,
            (ChunkState::SizeLf, b'\n') => {
                let size = self.size;
                self.size = 0;
                self.digits = 0;
                if size == 0 {
                    ChunkState::TrailerStart
                } else {
                    self.remaining = size;
                    ChunkState::Data
                }
            }
            (ChunkState::DataCr, b'\r') => ChunkState::DataLf,
            (ChunkState::DataLf, b'\n') => ChunkState::Size,
            (ChunkState::TrailerStart, b'\r') => ChunkState::TrailerEndLf,
            (ChunkState::TrailerLine, b'\r') => ChunkState::TrailerLineLf,
            (ChunkState::TrailerStart | ChunkState::TrailerLine, b) if b != b'\n' => {
                self.trailer_bytes += 1;
                if self.trailer_bytes > MAX_TRAILER_SIZE {
                    return Err(ParseError::HeadersTooLarge);
                }
                ChunkState::TrailerLine
            }
            (ChunkState::TrailerLineLf, b'\n') => ChunkState::TrailerStart,
            (ChunkState::TrailerEndLf, b'\n') => ChunkState::Complete,
            _ => return Err(ParseError::InvalidChunk),
        };
        Ok(())
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn is_extension_char(b: u8) -> bool {
    b == b'\t' || (b >= 0x20 && b != 0x7f)
}
