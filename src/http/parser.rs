//! Incremental request-line and header parsing.
//!
//! Every function works on a `Cursor` over the buffered input and either
//! completes (leaving the cursor just past what it parsed) or reports
//! `Parse::Incomplete`. On `Incomplete` the caller releases nothing and
//! retries from the same position once more bytes arrive, so no partial
//! state is lost between attempts.

use thiserror::Error;

use crate::http::headers::{is_token_char, is_value_char};
use crate::http::request::{split_target, HttpVersion, Method};
use crate::http::response::StatusCode;
use crate::memory::Cursor;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid request line")]
    InvalidRequestLine,
    #[error("invalid HTTP method")]
    InvalidMethod,
    #[error("unsupported HTTP version {0:?}")]
    UnsupportedVersion(String),
    #[error("request line too long")]
    RequestLineTooLong,
    #[error("invalid header")]
    InvalidHeader,
    #[error("request headers too large")]
    HeadersTooLarge,
    #[error("too many request headers")]
    TooManyHeaders,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("unsupported Transfer-Encoding {0:?}")]
    UnsupportedTransferEncoding(String),
    #[error("invalid chunked framing")]
    InvalidChunk,
    #[error("connection closed mid-request")]
    UnexpectedEof,
}

impl ParseError {
    /// Status code of the synthetic response sent for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ParseError::UnsupportedVersion(_) => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            ParseError::RequestLineTooLong => StatusCode::URI_TOO_LONG,
            ParseError::HeadersTooLarge | ParseError::TooManyHeaders => {
                StatusCode::HEADER_FIELDS_TOO_LARGE
            }
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Outcome of one parse attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parse<T> {
    Complete(T),
    Incomplete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartLine {
    pub method: Method,
    pub raw_target: String,
    pub path: String,
    pub query: String,
    pub version: HttpVersion,
}

/// One line of the header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderLine {
    Field { name: String, value: String },
    /// The empty line ending the header block.
    End,
}

/// Parse `METHOD SP target SP HTTP/x.y CRLF`.
pub fn take_start_line(
    cursor: &mut Cursor<'_>,
    max_line: usize,
) -> Result<Parse<StartLine>, ParseError> {
    let begin = cursor.position().position();

    // Only parse once the whole line is buffered.
    let mut line_end = cursor.clone();
    if !line_end.seek(b'\n') {
        if cursor.remaining() > max_line {
            return Err(ParseError::RequestLineTooLong);
        }
        return Ok(Parse::Incomplete);
    }
    if (line_end.position().position() - begin) as usize > max_line {
        return Err(ParseError::RequestLineTooLong);
    }

    let method = take_until_space(cursor, ParseError::InvalidMethod, is_token_char)?;
    let target = take_until_space(cursor, ParseError::InvalidRequestLine, |b| {
        b > 0x20 && b != 0x7f
    })?;

    let mut version = Vec::with_capacity(8);
    loop {
        match cursor.take() {
            Some(b'\r') => break,
            Some(b) if b > 0x20 && b != 0x7f => version.push(b),
            _ => return Err(ParseError::InvalidRequestLine),
        }
    }
    if cursor.take() != Some(b'\n') {
        return Err(ParseError::InvalidRequestLine);
    }

    let version = parse_version(&version)?;
    let method = String::from_utf8(method).map_err(|_| ParseError::InvalidMethod)?;
    let raw_target = String::from_utf8(target).map_err(|_| ParseError::InvalidRequestLine)?;
    let (path, query) = split_target(&raw_target);
    let (path, query) = (path.to_string(), query.to_string());

    Ok(Parse::Complete(StartLine {
        method: Method::from_token(&method),
        path,
        query,
        raw_target,
        version,
    }))
}

/// Parse one header line, unfolding obs-fold continuation lines into a
/// single space.
pub fn take_header(cursor: &mut Cursor<'_>) -> Result<Parse<HeaderLine>, ParseError> {
    match cursor.peek() {
        None => return Ok(Parse::Incomplete),
        Some(b'\r') => {
            cursor.take();
            return match cursor.take() {
                None => Ok(Parse::Incomplete),
                Some(b'\n') => Ok(Parse::Complete(HeaderLine::End)),
                Some(_) => Err(ParseError::InvalidHeader),
            };
        }
        Some(b' ' | b'\t' | b'\n') => return Err(ParseError::InvalidHeader),
        Some(_) => {}
    }

    let mut name = Vec::new();
    loop {
        match cursor.take() {
            None => return Ok(Parse::Incomplete),
            Some(b':') => break,
            Some(b) if is_token_char(b) => name.push(b),
            Some(_) => return Err(ParseError::InvalidHeader),
        }
    }
    if name.is_empty() {
        return Err(ParseError::InvalidHeader);
    }

    let mut value = Vec::new();
    loop {
        match cursor.take() {
            None => return Ok(Parse::Incomplete),
            Some(b'\r') => {
                match cursor.take() {
                    None => return Ok(Parse::Incomplete),
                    Some(b'\n') => {}
                    Some(_) => return Err(ParseError::InvalidHeader),
                }
                // A following space or tab continues this header.
                match cursor.peek() {
                    None => return Ok(Parse::Incomplete),
                    Some(b' ' | b'\t') => {
                        while matches!(cursor.peek(), Some(b' ' | b'\t')) {
                            cursor.take();
                        }
                        value.push(b' ');
                    }
                    Some(_) => break,
                }
            }
            Some(b) if is_value_char(b) => value.push(b),
            Some(_) => return Err(ParseError::InvalidHeader),
        }
    }

    let name = String::from_utf8(name).map_err(|_| ParseError::InvalidHeader)?;
    let value = String::from_utf8_lossy(trim_ows(&value)).into_owned();
    Ok(Parse::Complete(HeaderLine::Field { name, value }))
}

fn take_until_space(
    cursor: &mut Cursor<'_>,
    invalid: ParseError,
    allowed: impl Fn(u8) -> bool,
) -> Result<Vec<u8>, ParseError> {
    let mut token = Vec::new();
    loop {
        match cursor.take() {
            Some(b' ') if !token.is_empty() => return Ok(token),
            Some(b'\r' | b'\n' | b' ') | None => return Err(ParseError::InvalidRequestLine),
            Some(b) if allowed(b) => token.push(b),
            Some(_) => return Err(invalid),
        }
    }
}

fn parse_version(bytes: &[u8]) -> Result<HttpVersion, ParseError> {
    match bytes {
        b"HTTP/1.1" => Ok(HttpVersion::Http11),
        b"HTTP/1.0" => Ok(HttpVersion::Http10),
        [b'H', b'T', b'T', b'P', b'/', major, b'.', minor]
            if major.is_ascii_digit() && minor.is_ascii_digit() =>
        {
            Err(ParseError::UnsupportedVersion(
                String::from_utf8_lossy(bytes).into_owned(),
            ))
        }
        _ => Err(ParseError::InvalidRequestLine),
    }
}

fn trim_ows(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}
