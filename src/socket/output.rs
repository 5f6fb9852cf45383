//! Outbound half of a connection's byte pipeline.
//!
//! Producers append bytes (optionally wrapped in chunked framing) to a block
//! chain. A flusher task owns the write half of the transport and drains the
//! chain in order. Writers that outrun the socket by more than the configured
//! maximum suspend in `write_async` until the flusher catches up.

use std::cell::{Cell, RefCell, RefMut};
use std::io::{self, Write as _};
use std::rc::Rc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

use crate::memory::{BlockChain, BlockIter, MemoryPool};
use crate::socket::buffer_control::{BufferSizeControl, ProduceEndType};

const CHUNK_TERMINATOR: &[u8] = b"0\r\n\r\n";

struct OutputState {
    chain: BlockChain,
    /// Total bytes committed by producers.
    produced: u64,
    /// Total bytes handed to the transport.
    flushed: u64,
    end: Option<ProduceEndType>,
    error: Option<io::ErrorKind>,
    closed: bool,
}

struct OutputShared {
    state: RefCell<OutputState>,
    producing: Cell<bool>,
    wake_flusher: Notify,
    progress: Notify,
    max_pending: Option<usize>,
    buffer_control: Option<BufferSizeControl>,
}

/// Ordered, backpressure-aware output buffer for one connection.
#[derive(Clone)]
pub struct SocketOutput {
    shared: Rc<OutputShared>,
}

impl SocketOutput {
    pub fn new(
        pool: MemoryPool,
        max_pending: Option<usize>,
        buffer_control: Option<BufferSizeControl>,
    ) -> Self {
        Self {
            shared: Rc::new(OutputShared {
                state: RefCell::new(OutputState {
                    chain: BlockChain::new(pool),
                    produced: 0,
                    flushed: 0,
                    end: None,
                    error: None,
                    closed: false,
                }),
                producing: Cell::new(false),
                wake_flusher: Notify::new(),
                progress: Notify::new(),
                max_pending,
                buffer_control,
            }),
        }
    }

    /// Open a batch of writes that becomes visible to the flusher as one unit.
    pub fn producing_start(&self) -> io::Result<OutputProducer<'_>> {
        self.check_writable()?;
        debug_assert!(!self.shared.producing.get(), "producing_start called twice");
        self.shared.producing.set(true);

        let state = self.shared.state.borrow_mut();
        Ok(OutputProducer {
            shared: &self.shared,
            mark: state.chain.end(),
            state: Some(state),
            count: 0,
            failed: false,
        })
    }

    /// Commit a batch. Returns the number of bytes it added.
    pub fn producing_complete(&self, producer: OutputProducer<'_>) -> usize {
        producer.complete()
    }

    /// Buffer `data` without waiting. With `chunked`, the bytes are wrapped
    /// in one chunk (`<hex-size>\r\n<data>\r\n`).
    pub fn write(&self, data: &[u8], chunked: bool) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let mut producer = self.producing_start()?;
        if chunked {
            producer.write_chunk(data)?;
        } else {
            producer.write(data)?;
        }
        producer.complete();
        Ok(())
    }

    /// Buffer `data`, then wait while more than the maximum is unflushed.
    pub async fn write_async(&self, data: &[u8], chunked: bool) -> io::Result<()> {
        self.write(data, chunked)?;

        let Some(max) = self.shared.max_pending else {
            return Ok(());
        };

        loop {
            let notified = self.shared.progress.notified();
            {
                let state = self.shared.state.borrow();
                if let Some(kind) = state.error {
                    return Err(io::Error::from(kind));
                }
                if state.closed || state.produced.saturating_sub(state.flushed) as usize <= max {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Terminate a chunked body.
    pub fn write_chunked_end(&self) -> io::Result<()> {
        self.write(CHUNK_TERMINATOR, false)
    }

    /// Wait until everything produced so far reached the transport.
    pub async fn flush(&self) -> io::Result<()> {
        let target = self.shared.state.borrow().produced;

        loop {
            let notified = self.shared.progress.notified();
            {
                let state = self.shared.state.borrow();
                if let Some(kind) = state.error {
                    return Err(io::Error::from(kind));
                }
                if state.flushed >= target {
                    return Ok(());
                }
                if state.closed {
                    return Err(io::ErrorKind::BrokenPipe.into());
                }
            }
            notified.await;
        }
    }

    /// Finish output. Keep-alive leaves the flusher running; the other modes
    /// stop it after (shutdown) or instead of (disconnect) draining.
    pub fn end(&self, end_type: ProduceEndType) {
        if end_type == ProduceEndType::ConnectionKeepAlive {
            return;
        }

        let dropped = {
            let mut state = self.shared.state.borrow_mut();
            if state.end.is_none() {
                state.end = Some(end_type);
            }
            if end_type == ProduceEndType::SocketDisconnect {
                state.chain.clear()
            } else {
                0
            }
        };
        self.uncount(dropped);
        self.shared.wake_flusher.notify_one();
    }

    /// Drop pending output and fail every waiter.
    pub fn abort(&self) {
        let dropped = {
            let mut state = self.shared.state.borrow_mut();
            if state.error.is_none() {
                state.error = Some(io::ErrorKind::ConnectionAborted);
            }
            state.chain.clear()
        };
        self.uncount(dropped);
        self.shared.wake_flusher.notify_one();
        self.shared.progress.notify_waiters();
    }

    /// Produced bytes not yet written to the transport.
    pub fn pending(&self) -> usize {
        let state = self.shared.state.borrow();
        state.produced.saturating_sub(state.flushed) as usize
    }

    pub fn is_closed(&self) -> bool {
        let state = self.shared.state.borrow();
        state.closed || state.error.is_some()
    }

    /// Drain the buffer into `writer` until the output ends or fails.
    ///
    /// Runs as a task on the connection's loop thread.
    pub async fn run_flusher<W>(self, mut writer: W)
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let (blocks, end, error) = {
                let mut state = self.shared.state.borrow_mut();
                (state.chain.drain_blocks(), state.end, state.error)
            };

            if error.is_some() {
                break;
            }

            if blocks.is_empty() {
                match end {
                    Some(ProduceEndType::SocketShutdownSend) => {
                        if let Err(e) = writer.shutdown().await {
                            tracing::debug!(error = %e, "Write shutdown failed");
                        }
                        break;
                    }
                    Some(ProduceEndType::SocketDisconnect) => break,
                    _ => {
                        self.shared.wake_flusher.notified().await;
                        continue;
                    }
                }
            }

            let mut written = 0usize;
            let mut failure = None;
            for block in blocks {
                if failure.is_some() {
                    // Remaining blocks are dropped back to the pool.
                    continue;
                }
                match writer.write_all(block.readable()).await {
                    Ok(()) => written += block.len(),
                    Err(e) => failure = Some(e),
                }
            }
            if failure.is_none() {
                if let Err(e) = writer.flush().await {
                    failure = Some(e);
                }
            }

            self.shared.state.borrow_mut().flushed += written as u64;
            self.uncount(written);

            if let Some(e) = failure {
                tracing::debug!(error = %e, "Socket write failed");
                let dropped = {
                    let mut state = self.shared.state.borrow_mut();
                    state.error = Some(e.kind());
                    state.chain.clear()
                };
                self.uncount(dropped);
                break;
            }

            self.shared.progress.notify_waiters();
        }

        self.shared.state.borrow_mut().closed = true;
        self.shared.progress.notify_waiters();
    }

    fn check_writable(&self) -> io::Result<()> {
        let state = self.shared.state.borrow();
        if let Some(kind) = state.error {
            return Err(io::Error::from(kind));
        }
        if state.end.is_some() || state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "output already ended"));
        }
        Ok(())
    }

    fn uncount(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        if let Some(control) = &self.shared.buffer_control {
            control.subtract(bytes);
        }
    }
}

impl std::fmt::Debug for SocketOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("SocketOutput")
            .field("produced", &state.produced)
            .field("flushed", &state.flushed)
            .field("end", &state.end)
            .field("error", &state.error)
            .finish()
    }
}

/// An open batch of writes. Committed on `complete` or drop.
///
/// A write that fails discards the whole batch, so the flusher never sees
/// part of a head or a chunk.
pub struct OutputProducer<'a> {
    shared: &'a OutputShared,
    state: Option<RefMut<'a, OutputState>>,
    /// Chain end when the batch opened.
    mark: BlockIter,
    count: usize,
    failed: bool,
}

impl OutputProducer<'_> {
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.failed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "batch already failed"));
        }
        let Some(state) = self.state.as_mut() else {
            return Err(io::ErrorKind::BrokenPipe.into());
        };
        if let Err(e) = state.chain.append(data) {
            state.chain.truncate_to(self.mark);
            self.count = 0;
            self.failed = true;
            tracing::debug!(error = %e, "Output batch discarded");
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, e));
        }
        self.count += data.len();
        Ok(())
    }

    /// Write `data` as a single chunk of a chunked body.
    pub fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        let mut prefix = [0u8; 20];
        let len = {
            let mut cursor = &mut prefix[..];
            write!(cursor, "{:x}\r\n", data.len())?;
            20 - cursor.len()
        };
        self.write(&prefix[..len])?;
        self.write(data)?;
        self.write(b"\r\n")
    }

    pub fn complete(mut self) -> usize {
        self.finish()
    }

    fn finish(&mut self) -> usize {
        let Some(mut state) = self.state.take() else {
            return 0;
        };
        state.produced += self.count as u64;
        drop(state);

        self.shared.producing.set(false);
        if self.count > 0 {
            if let Some(control) = &self.shared.buffer_control {
                control.add(self.count);
            }
            self.shared.wake_flusher.notify_one();
        }
        self.count
    }
}

impl Drop for OutputProducer<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::task::LocalSet;

    #[tokio::test]
    async fn writes_are_flushed_in_order() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (client, server) = tokio::io::duplex(64 * 1024);
                let output = SocketOutput::new(MemoryPool::new(), None, None);
                let flusher = tokio::task::spawn_local(output.clone().run_flusher(server));

                output.write(b"first ", false).unwrap();
                output.write_async(b"second ", false).await.unwrap();
                output.write(b"third", false).unwrap();
                output.flush().await.unwrap();
                output.end(ProduceEndType::SocketShutdownSend);
                flusher.await.unwrap();

                let mut received = String::new();
                let mut client = client;
                client.read_to_string(&mut received).await.unwrap();
                assert_eq!(received, "first second third");
            })
            .await;
    }

    #[tokio::test]
    async fn chunked_write_frames_data() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (mut client, server) = tokio::io::duplex(1024);
                let output = SocketOutput::new(MemoryPool::new(), None, None);
                let flusher = tokio::task::spawn_local(output.clone().run_flusher(server));

                output.write(b"hello world!!!!!", true).unwrap();
                output.write(b"", true).unwrap();
                output.write_chunked_end().unwrap();
                output.end(ProduceEndType::SocketShutdownSend);
                flusher.await.unwrap();

                let mut received = Vec::new();
                client.read_to_end(&mut received).await.unwrap();
                assert_eq!(received, b"10\r\nhello world!!!!!\r\n0\r\n\r\n");
            })
            .await;
    }

    #[tokio::test]
    async fn failed_write_commits_nothing() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let pool = MemoryPool::with_limit(Some(1));
                let output = SocketOutput::new(pool.clone(), None, None);
                let (mut client, server) = tokio::io::duplex(64 * 1024);
                let flusher = tokio::task::spawn_local(output.clone().run_flusher(server));

                output.write(b"head\r\n", false).unwrap();
                let oversized = vec![b'x'; 40 * crate::memory::BLOCK_SIZE];
                let err = output.write(&oversized, true).unwrap_err();
                assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);
                assert_eq!(output.pending(), 6);

                // The output is still usable once the failed batch is gone.
                output.write(b"tail", true).unwrap();
                output.flush().await.unwrap();
                assert_eq!(output.pending(), 0);
                output.end(ProduceEndType::SocketShutdownSend);
                flusher.await.unwrap();

                let mut received = Vec::new();
                client.read_to_end(&mut received).await.unwrap();
                assert_eq!(received, b"head\r\n4\r\ntail\r\n");
                assert_eq!(pool.leased_count(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn write_after_end_fails() {
        let output = SocketOutput::new(MemoryPool::new(), None, None);
        output.end(ProduceEndType::SocketDisconnect);
        assert!(output.write(b"late", false).is_err());
    }

    #[tokio::test]
    async fn write_async_waits_for_slow_socket() {
        let local = LocalSet::new();
        local
            .run_until(async {
                // Tiny pipe: the flusher stalls until the client reads.
                let (mut client, server) = tokio::io::duplex(16);
                let output = SocketOutput::new(MemoryPool::new(), Some(32), None);
                tokio::task::spawn_local(output.clone().run_flusher(server));

                let writer = output.clone();
                let write = tokio::task::spawn_local(async move {
                    writer.write_async(&[b'x'; 100], false).await
                });

                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                assert!(!write.is_finished());

                let mut buf = vec![0u8; 100];
                client.read_exact(&mut buf).await.unwrap();
                write.await.unwrap().unwrap();
                assert_eq!(buf, vec![b'x'; 100]);
            })
            .await;
    }
}
