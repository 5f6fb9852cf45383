//! Response head serialization.

use std::io;

use chrono::{DateTime, Utc};

use crate::http::response::ResponseHead;
use crate::socket::{OutputProducer, SocketOutput};

/// Responses always advertise 1.1; 1.0 clients get 1.0-compatible framing.
const HTTP_VERSION: &str = "HTTP/1.1";

const CONTINUE_LINE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Format a timestamp for the `Date` header (RFC 1123, always GMT).
pub fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Serialize the status line and headers, including the blank line that
/// ends the head.
pub fn serialize_head(head: &ResponseHead) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);

    // Status line
    buf.extend_from_slice(HTTP_VERSION.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(head.status.as_u16().to_string().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(head.reason_phrase().as_bytes());
    buf.extend_from_slice(b"\r\n");

    // Headers
    for (name, value) in head.headers.iter() {
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    // Header/body separator
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Write the response head as part of an open batch.
pub fn write_head(producer: &mut OutputProducer<'_>, head: &ResponseHead) -> io::Result<()> {
    producer.write(&serialize_head(head))
}

/// Send the interim `100 Continue` response.
pub fn write_continue(output: &SocketOutput) -> io::Result<()> {
    output.write(CONTINUE_LINE, false)
}
