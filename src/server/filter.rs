//! Raw-stream filters run on each accepted connection before HTTP starts.
//!
//! A filter may wrap the transport (TLS, tracing, rate shaping) and attach
//! peer details such as a client certificate. Filters see bytes only; the
//! frame logic is the same whatever the filter did.

use std::io::Result;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::config::FilterKind;
use crate::http::connection::ConnectionId;
use crate::http::context::ConnectionInfo;

/// Anything a connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + 'static> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// An accepted connection on its way to the frame.
pub struct FilterContext {
    pub info: ConnectionInfo,
    pub transport: BoxedTransport,
}

#[async_trait(?Send)]
pub trait ConnectionFilter: Send + Sync + 'static {
    /// Inspect or replace the transport. An error drops the connection.
    async fn on_connection(&self, ctx: FilterContext) -> Result<FilterContext>;
}

/// Filter for the configured kind, if any.
pub fn from_kind(kind: FilterKind) -> Option<Arc<dyn ConnectionFilter>> {
    match kind {
        FilterKind::None => None,
        FilterKind::Logging => Some(Arc::new(LoggingFilter)),
    }
}

/// Traces every read and write with its byte count.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFilter;

#[async_trait(?Send)]
impl ConnectionFilter for LoggingFilter {
    async fn on_connection(&self, ctx: FilterContext) -> Result<FilterContext> {
        let FilterContext { info, transport } = ctx;
        let transport = Box::new(LoggingStream::new(transport, info.id));
        Ok(FilterContext { info, transport })
    }
}

/// Stream wrapper that logs traffic in both directions.
pub struct LoggingStream<S> {
    stream: S,
    id: ConnectionId,
    read: u64,
    written: u64,
}

impl<S> LoggingStream<S> {
    pub fn new(stream: S, id: ConnectionId) -> Self {
        Self {
            stream,
            id,
            read: 0,
            written: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.read
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for LoggingStream<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<Result<()>> {
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.stream).poll_read(cx, buf))?;
        let n = buf.filled().len() - before;
        self.read += n as u64;
        tracing::trace!(connection_id = %self.id, bytes = n, "Read");
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for LoggingStream<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize>> {
        let n = ready!(Pin::new(&mut self.stream).poll_write(cx, buf))?;
        self.written += n as u64;
        tracing::trace!(connection_id = %self.id, bytes = n, "Write");
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl<S> Drop for LoggingStream<S> {
    fn drop(&mut self) {
        tracing::debug!(
            connection_id = %self.id,
            bytes_read = self.read,
            bytes_written = self.written,
            "Stream closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn logging_stream_counts_bytes() {
        let (client, server) = tokio::io::duplex(64);
        let mut stream = LoggingStream::new(server, ConnectionId(7));
        let mut client = client;

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(b"pong!").await.unwrap();

        assert_eq!(stream.bytes_read(), 4);
        assert_eq!(stream.bytes_written(), 5);
    }
}
