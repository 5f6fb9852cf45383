//! Per-request state handed to the application.
//!
//! `HttpContext` lives as long as its connection and is reset between
//! requests. The application sees the parsed request, reads the body,
//! sets a status and headers, and writes the body. Framing of the response
//! (length, chunked, or close-delimited) is decided when the first body
//! byte is written or the request completes, whichever comes first.

use std::cell::Cell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use tokio::sync::Notify;

use crate::http::body::{parse_content_length, final_coding_is_chunked, BodyError, MessageBody};
use crate::http::connection::ConnectionId;
use crate::http::headers::{HeaderError, KnownHeader};
use crate::http::request::{HttpVersion, Method, RequestHead};
use crate::http::response::{ResponseHead, StatusCode};
use crate::http::writer;
use crate::socket::{ProduceEndType, SocketInput, SocketOutput};

/// Where a request cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Waiting for (or parsing) the next request head.
    RequestPending,
    /// Head parsed; the application owns the request.
    RequestStarted,
    /// Response head written; headers are read-only.
    ResponseStarted,
}

/// Peer details for one accepted connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    /// `None` for local (unix) sockets.
    pub remote_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    /// DER certificate presented by the client, if a filter supplied one.
    pub client_certificate: Option<Vec<u8>>,
}

impl ConnectionInfo {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            remote_addr: None,
            local_addr: None,
            client_certificate: None,
        }
    }
}

/// Stop and abort requests for one connection. Set from its own loop thread
/// only; other threads post a callback that does it.
#[derive(Debug, Default)]
pub struct ConnectionSignals {
    stopping: Cell<bool>,
    aborted: Cell<bool>,
    changed: Notify,
}

impl ConnectionSignals {
    /// Finish the in-flight request, then close.
    pub fn request_stop(&self) {
        if !self.stopping.replace(true) {
            self.changed.notify_waiters();
        }
    }

    /// Tear the connection down now.
    pub fn abort(&self) {
        self.stopping.set(true);
        if !self.aborted.replace(true) {
            self.changed.notify_waiters();
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.get()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.get()
    }

    pub async fn stopped(&self) {
        loop {
            let notified = self.changed.notified();
            if self.stopping.get() {
                return;
            }
            notified.await;
        }
    }

    pub async fn aborted(&self) {
        loop {
            let notified = self.changed.notified();
            if self.aborted.get() {
                return;
            }
            notified.await;
        }
    }
}

/// Cancellation signal exposed to the application.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    signals: Rc<ConnectionSignals>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.signals.is_aborted()
    }

    /// Resolves once the connection is aborted.
    pub async fn aborted(&self) {
        self.signals.aborted().await
    }
}

/// How the response body in flight is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseFraming {
    /// Not decided yet.
    Pending,
    /// Status or method forbids a body; writes are discarded.
    NoBody,
    /// `Content-Length` bytes still owed.
    Fixed { remaining: u64 },
    Chunked,
    /// Raw bytes ended by closing the connection.
    UntilClose,
}

/// Request and response of the cycle in flight.
pub struct HttpContext {
    pub(crate) request: RequestHead,
    pub(crate) response: ResponseHead,
    pub(crate) body: MessageBody,
    pub(crate) state: FrameState,
    pub(crate) keep_alive: bool,
    pub(crate) framing: ResponseFraming,
    continue_pending: bool,
    add_server_header: bool,
    input: SocketInput,
    output: SocketOutput,
    info: Rc<ConnectionInfo>,
    signals: Rc<ConnectionSignals>,
}

impl HttpContext {
    pub(crate) fn new(
        input: SocketInput,
        output: SocketOutput,
        info: Rc<ConnectionInfo>,
        signals: Rc<ConnectionSignals>,
        add_server_header: bool,
    ) -> Self {
        Self {
            request: RequestHead::default(),
            response: ResponseHead::default(),
            body: MessageBody::Empty,
            state: FrameState::RequestPending,
            keep_alive: false,
            framing: ResponseFraming::Pending,
            continue_pending: false,
            add_server_header,
            input,
            output,
            info,
            signals,
        }
    }

    pub fn request(&self) -> &RequestHead {
        &self.request
    }

    pub fn method(&self) -> &Method {
        &self.request.method
    }

    pub fn path(&self) -> &str {
        &self.request.path
    }

    pub fn response(&self) -> &ResponseHead {
        &self.response
    }

    /// Mutable response head. Header changes fail once the response started.
    pub fn response_mut(&mut self) -> &mut ResponseHead {
        &mut self.response
    }

    pub fn set_status(&mut self, status: StatusCode) {
        if self.state != FrameState::ResponseStarted {
            self.response.status = status;
        }
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) -> Result<(), HeaderError> {
        self.response.headers.insert(name, value)
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn abort_signal(&self) -> AbortSignal {
        AbortSignal {
            signals: self.signals.clone(),
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn has_started(&self) -> bool {
        self.state == FrameState::ResponseStarted
    }

    /// Read decoded request body bytes; 0 means the body is complete.
    ///
    /// The first read of a request that sent `Expect: 100-continue` emits
    /// the interim response before waiting for body bytes.
    pub async fn read_body(&mut self, buf: &mut [u8]) -> Result<usize, BodyError> {
        if self.continue_pending {
            self.continue_pending = false;
            if self.state == FrameState::RequestStarted && !self.body.is_complete() {
                writer::write_continue(&self.output)?;
            }
        }
        self.body.read(&self.input, buf).await
    }

    /// Read the remaining request body into memory.
    pub async fn read_body_to_end(&mut self) -> Result<Vec<u8>, BodyError> {
        let mut body = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = self.read_body(&mut buf).await?;
            if n == 0 {
                return Ok(body);
            }
            body.extend_from_slice(&buf[..n]);
        }
    }

    /// Write response body bytes, starting the response if needed.
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.state != FrameState::ResponseStarted {
            self.start_response(false)?;
        }

        match &mut self.framing {
            ResponseFraming::NoBody => {
                if !data.is_empty() {
                    tracing::trace!(
                        connection_id = %self.info.id,
                        bytes = data.len(),
                        "Discarding body of bodyless response"
                    );
                }
                Ok(())
            }
            ResponseFraming::Fixed { remaining } => {
                if data.len() as u64 > *remaining {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "response body exceeds Content-Length",
                    ));
                }
                *remaining -= data.len() as u64;
                self.output.write_async(data, false).await
            }
            ResponseFraming::Chunked => self.output.write_async(data, true).await,
            ResponseFraming::UntilClose | ResponseFraming::Pending => {
                self.output.write_async(data, false).await
            }
        }
    }

    /// Start the response if needed and wait until everything written so far
    /// reached the socket.
    pub async fn flush(&mut self) -> io::Result<()> {
        if self.state != FrameState::ResponseStarted {
            self.start_response(false)?;
        }
        self.output.flush().await
    }

    /// Decide framing, fill in server headers and write the head.
    ///
    /// `complete` is true when the application already finished, so an
    /// unframed body is known to be empty.
    pub(crate) fn start_response(&mut self, complete: bool) -> io::Result<()> {
        let framing = self.choose_framing(complete)?;

        // A client still waiting for 100 Continue never sends the body, so
        // it cannot be drained.
        let unsent_body = self.continue_pending && !self.body.is_complete();
        let app_close = response_says_close(&self.response);
        if app_close || unsent_body || self.signals.is_stopping() || self.body.requires_close() {
            self.keep_alive = false;
        }

        let headers = &mut self.response.headers;
        if !headers.contains_known(KnownHeader::Date) {
            headers
                .set_known(KnownHeader::Date, writer::http_date(chrono::Utc::now()))
                .map_err(header_error)?;
        }
        if self.add_server_header && !headers.contains_known(KnownHeader::Server) {
            headers
                .set_known(KnownHeader::Server, "h1loop")
                .map_err(header_error)?;
        }
        if self.keep_alive {
            if self.request.version == HttpVersion::Http10 {
                headers
                    .set_known(KnownHeader::Connection, "keep-alive")
                    .map_err(header_error)?;
            }
        } else if !app_close {
            headers
                .set_known(KnownHeader::Connection, "close")
                .map_err(header_error)?;
        }
        headers.set_read_only();

        self.framing = framing;
        self.state = FrameState::ResponseStarted;

        let mut producer = self.output.producing_start()?;
        writer::write_head(&mut producer, &self.response)?;
        producer.complete();
        Ok(())
    }

    fn choose_framing(&mut self, complete: bool) -> io::Result<ResponseFraming> {
        let headers = &mut self.response.headers;

        if !self.response.status.allows_body() {
            return Ok(ResponseFraming::NoBody);
        }
        if self.request.method == Method::HEAD {
            return Ok(ResponseFraming::NoBody);
        }

        if let Some(coding) = headers.joined(KnownHeader::TransferEncoding) {
            if final_coding_is_chunked(&coding) {
                headers
                    .remove_known(KnownHeader::ContentLength)
                    .map_err(header_error)?;
                return Ok(ResponseFraming::Chunked);
            }
            // Unknown final coding: sent as-is, delimited by closing.
            self.keep_alive = false;
            return Ok(ResponseFraming::UntilClose);
        }

        if let Some(values) = headers.get_known(KnownHeader::ContentLength) {
            let length = parse_content_length(values)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            return Ok(ResponseFraming::Fixed { remaining: length });
        }

        if complete {
            headers
                .set_known(KnownHeader::ContentLength, "0")
                .map_err(header_error)?;
            return Ok(ResponseFraming::Fixed { remaining: 0 });
        }

        if self.request.version == HttpVersion::Http11 {
            headers
                .set_known(KnownHeader::TransferEncoding, "chunked")
                .map_err(header_error)?;
            Ok(ResponseFraming::Chunked)
        } else {
            self.keep_alive = false;
            Ok(ResponseFraming::UntilClose)
        }
    }

    /// Close out the response after the application returned.
    ///
    /// Fails when a `Content-Length` body came up short; the connection
    /// must then be aborted.
    pub(crate) fn finish_response(&mut self) -> io::Result<()> {
        if self.state != FrameState::ResponseStarted {
            self.start_response(true)?;
        }

        match self.framing {
            ResponseFraming::Chunked => self.output.write_chunked_end(),
            ResponseFraming::Fixed { remaining } if remaining > 0 => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("response body is {remaining} bytes short of Content-Length"),
            )),
            _ => Ok(()),
        }
    }

    /// Replace whatever the application set with an empty error response.
    /// Only valid before the response started.
    pub(crate) fn respond_error(&mut self, status: StatusCode) -> io::Result<()> {
        debug_assert!(self.state != FrameState::ResponseStarted);
        self.response.reset();
        self.response.status = status;
        self.keep_alive = false;
        self.finish_response()
    }

    /// Skip whatever request body the application left unread.
    pub(crate) async fn drain_body(&mut self) -> Result<u64, BodyError> {
        self.body.drain(&self.input).await
    }

    /// Prepare for the next request on the same connection.
    pub(crate) fn reset(&mut self) {
        self.output.end(ProduceEndType::ConnectionKeepAlive);
        self.request = RequestHead::default();
        self.response.reset();
        self.body = MessageBody::Empty;
        self.state = FrameState::RequestPending;
        self.keep_alive = false;
        self.framing = ResponseFraming::Pending;
        self.continue_pending = false;
    }

    /// Install a freshly parsed request head.
    pub(crate) fn begin_request(&mut self, request: RequestHead, body: MessageBody) {
        self.keep_alive = request.keep_alive() && !body.requires_close();
        self.continue_pending = request.expects_continue();
        self.request = request;
        self.body = body;
        self.state = FrameState::RequestStarted;
    }

    pub(crate) fn input(&self) -> &SocketInput {
        &self.input
    }

    pub(crate) fn signals(&self) -> &ConnectionSignals {
        &self.signals
    }

    pub(crate) fn info(&self) -> &ConnectionInfo {
        &self.info
    }
}

fn response_says_close(response: &ResponseHead) -> bool {
    response
        .headers
        .get_known(KnownHeader::Connection)
        .map(|values| {
            values
                .iter()
                .flat_map(|v| v.split(','))
                .any(|t| t.trim().eq_ignore_ascii_case("close"))
        })
        .unwrap_or(false)
}

fn header_error(e: HeaderError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, e)
}
