//! The per-connection request/response cycle.
//!
//! ```text
//!   RequestPending ──head parsed──▶ RequestStarted ──first write──▶ ResponseStarted
//!         ▲                                                              │
//!         └──────────── keep-alive: drain body, reset ◀──────────────────┘
//! ```
//!
//! A protocol error while parsing the head gets a synthetic 4xx response
//! and closes the connection. An application error before the response
//! started gets a 500 and closes; after it started the connection is
//! aborted, since a partial response cannot be retracted.

use std::io;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::app::Application;
use crate::config::RequestLimits;
use crate::http::body::{BodyError, MessageBody};
use crate::http::context::HttpContext;
use crate::http::parser::{take_header, take_start_line, HeaderLine, Parse, ParseError};
use crate::http::request::RequestHead;
use crate::http::response::StatusCode;
use crate::memory::Cursor;
use crate::socket::ProduceEndType;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Protocol(#[from] ParseError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<BodyError> for FrameError {
    fn from(e: BodyError) -> Self {
        match e {
            BodyError::Protocol(e) => FrameError::Protocol(e),
            BodyError::Io(e) => FrameError::Io(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeadPhase {
    StartLine,
    Headers,
}

/// Progress through one request head, kept across parse attempts.
struct HeadProgress {
    phase: HeadPhase,
    head: RequestHead,
    header_bytes: usize,
    header_count: usize,
}

impl HeadProgress {
    fn new() -> Self {
        Self {
            phase: HeadPhase::StartLine,
            head: RequestHead::default(),
            header_bytes: 0,
            header_count: 0,
        }
    }
}

pub struct Frame {
    ctx: HttpContext,
    app: Arc<dyn Application>,
    limits: RequestLimits,
}

impl Frame {
    pub fn new(ctx: HttpContext, app: Arc<dyn Application>, limits: RequestLimits) -> Self {
        Self { ctx, app, limits }
    }

    pub fn context(&self) -> &HttpContext {
        &self.ctx
    }

    /// Serve requests until the connection should end, and say how.
    pub async fn run(&mut self) -> ProduceEndType {
        let id = self.ctx.info().id;

        loop {
            match self.take_request_head().await {
                Ok(true) => {}
                Ok(false) => return ProduceEndType::SocketShutdownSend,
                Err(FrameError::Protocol(e)) => {
                    debug!(connection_id = %id, error = %e, "Bad request");
                    self.reject(e.status_code());
                    return ProduceEndType::SocketShutdownSend;
                }
                Err(FrameError::Io(e)) => {
                    debug!(connection_id = %id, error = %e, "Read failed");
                    return ProduceEndType::SocketDisconnect;
                }
            }

            trace!(
                connection_id = %id,
                method = %self.ctx.request.method,
                target = %self.ctx.request.raw_target,
                "Request started"
            );

            let result = self.app.process_request(&mut self.ctx).await;
            if let Some(end) = self.complete_response(result) {
                return end;
            }

            if !self.ctx.keep_alive {
                return ProduceEndType::SocketShutdownSend;
            }

            match self.ctx.drain_body().await {
                Ok(0) => {}
                Ok(skipped) => trace!(connection_id = %id, skipped, "Drained unread request body"),
                Err(BodyError::Protocol(e)) => {
                    debug!(connection_id = %id, error = %e, "Bad request body");
                    return ProduceEndType::SocketShutdownSend;
                }
                Err(BodyError::Io(e)) => {
                    debug!(connection_id = %id, error = %e, "Read failed");
                    return ProduceEndType::SocketDisconnect;
                }
            }

            if self.ctx.signals().is_stopping() {
                return ProduceEndType::SocketShutdownSend;
            }

            trace!(connection_id = %id, "Keep-alive");
            self.ctx.reset();
        }
    }

    /// Finalize framing after the application returned. `Some` ends the
    /// connection.
    fn complete_response(&mut self, result: anyhow::Result<()>) -> Option<ProduceEndType> {
        let id = self.ctx.info().id;

        match result {
            Ok(()) => {
                if let Err(e) = self.ctx.finish_response() {
                    warn!(connection_id = %id, error = %e, "Response incomplete, aborting connection");
                    return Some(ProduceEndType::SocketDisconnect);
                }
            }
            Err(e) if self.ctx.signals().is_aborted() => {
                debug!(connection_id = %id, error = %e, "Request aborted");
                return Some(ProduceEndType::SocketDisconnect);
            }
            Err(e) if self.ctx.has_started() => {
                error!(connection_id = %id, error = %e, "Application failed after response started");
                return Some(ProduceEndType::SocketDisconnect);
            }
            Err(e) => {
                error!(connection_id = %id, error = %e, "Application failed");
                if let Err(e) = self.ctx.respond_error(StatusCode::INTERNAL_SERVER_ERROR) {
                    debug!(connection_id = %id, error = %e, "Could not send error response");
                    return Some(ProduceEndType::SocketDisconnect);
                }
            }
        }
        None
    }

    fn reject(&mut self, status: StatusCode) {
        if self.ctx.has_started() {
            return;
        }
        if let Err(e) = self.ctx.respond_error(status) {
            debug!(connection_id = %self.ctx.info().id, error = %e, "Could not send error response");
        }
    }

    /// Parse the next request head. `Ok(false)` means the connection ended
    /// cleanly between requests (peer closed or server stopping).
    async fn take_request_head(&mut self) -> Result<bool, FrameError> {
        let mut progress = HeadProgress::new();

        loop {
            let input = self.ctx.input();
            let idle = progress.phase == HeadPhase::StartLine && input.buffered() == 0;
            if idle {
                tokio::select! {
                    biased;
                    _ = self.ctx.signals().stopped() => return Ok(false),
                    ready = input.ready() => ready?,
                }
            } else {
                input.ready().await?;
            }

            let (outcome, unconsumed, closed) = {
                let view = input.consuming_start();
                let end = view.end();
                let closed = view.remote_closed();
                let mut cursor = view.cursor();

                let outcome = parse_head(&mut cursor, &mut progress, &self.limits);
                let consumed = cursor.position();
                let examined = match outcome {
                    Ok(true) => consumed,
                    _ => end,
                };
                let unconsumed = end.position() - consumed.position();
                drop(view);
                input.consuming_complete(consumed, examined);
                (outcome, unconsumed, closed)
            };

            match outcome {
                Ok(true) => break,
                Ok(false) if closed => {
                    if progress.phase == HeadPhase::StartLine && unconsumed == 0 {
                        return Ok(false);
                    }
                    return Err(ParseError::UnexpectedEof.into());
                }
                Ok(false) => {}
                Err(e) => {
                    self.ctx.request = progress.head;
                    return Err(e.into());
                }
            }
        }

        let head = progress.head;
        match MessageBody::for_request(&head) {
            Ok(body) => {
                self.ctx.begin_request(head, body);
                Ok(true)
            }
            Err(e) => {
                self.ctx.request = head;
                Err(e.into())
            }
        }
    }
}

/// Advance through the head as far as the buffered bytes allow. Returns
/// `Ok(true)` once the blank line ending the headers was consumed; on
/// `Ok(false)` the cursor sits at the start of the first incomplete line.
fn parse_head(
    cursor: &mut Cursor<'_>,
    progress: &mut HeadProgress,
    limits: &RequestLimits,
) -> Result<bool, ParseError> {
    loop {
        match progress.phase {
            HeadPhase::StartLine => {
                // Empty lines before the request line are ignored.
                while matches!(cursor.peek(), Some(b'\r' | b'\n')) {
                    cursor.take();
                }

                let checkpoint = cursor.clone();
                match take_start_line(cursor, limits.max_request_line_size)? {
                    Parse::Complete(line) => {
                        let head = &mut progress.head;
                        head.method = line.method;
                        head.raw_target = line.raw_target;
                        head.path = line.path;
                        head.query = line.query;
                        head.version = line.version;
                        progress.phase = HeadPhase::Headers;
                    }
                    Parse::Incomplete => {
                        *cursor = checkpoint;
                        return Ok(false);
                    }
                }
            }
            HeadPhase::Headers => {
                let checkpoint = cursor.clone();
                match take_header(cursor)? {
                    Parse::Complete(HeaderLine::Field { name, value }) => {
                        let line_len =
                            (cursor.position().position() - checkpoint.position().position()) as usize;
                        progress.header_bytes += line_len;
                        progress.header_count += 1;
                        if progress.header_count > limits.max_request_header_count {
                            return Err(ParseError::TooManyHeaders);
                        }
                        if progress.header_bytes > limits.max_request_headers_size {
                            return Err(ParseError::HeadersTooLarge);
                        }
                        progress
                            .head
                            .headers
                            .append(&name, value)
                            .map_err(|_| ParseError::InvalidHeader)?;
                    }
                    Parse::Complete(HeaderLine::End) => return Ok(true),
                    Parse::Incomplete => {
                        if progress.header_bytes + checkpoint.remaining() > limits.max_request_headers_size {
                            return Err(ParseError::HeadersTooLarge);
                        }
                        *cursor = checkpoint;
                        return Ok(false);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BlockChain, MemoryPool};

    fn parse_whole(bytes: &[u8]) -> Result<(bool, RequestHead), ParseError> {
        let mut chain = BlockChain::new(MemoryPool::new());
        chain.append(bytes).unwrap();
        let mut cursor = chain.cursor_at_start();
        let mut progress = HeadProgress::new();
        let done = parse_head(&mut cursor, &mut progress, &RequestLimits::default())?;
        Ok((done, progress.head))
    }

    #[test]
    fn header_count_limit() {
        let mut request = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..101 {
            request.extend_from_slice(format!("X-H{i}: v\r\n").as_bytes());
        }
        request.extend_from_slice(b"\r\n");
        assert_eq!(parse_whole(&request).unwrap_err(), ParseError::TooManyHeaders);
    }

    #[test]
    fn oversized_partial_header_is_rejected_early() {
        let mut request = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
        request.resize(request.len() + 40 * 1024, b'a');
        assert_eq!(parse_whole(&request).unwrap_err(), ParseError::HeadersTooLarge);
    }

    #[test]
    fn leading_empty_lines_are_skipped() {
        let (done, head) = parse_whole(b"\r\n\r\nGET /x HTTP/1.0\r\n\r\n").unwrap();
        assert!(done);
        assert_eq!(head.path, "/x");
    }
}
