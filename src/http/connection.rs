//! One accepted socket bound to one loop thread.
//!
//! A connection runs three tasks on its loop thread:
//!
//! - the reader fills pooled blocks from the socket into `SocketInput`
//! - the flusher drains `SocketOutput` into the socket
//! - the frame (this task) parses requests and produces responses
//!
//! Reads stop while either buffer is over its watermark. The connection
//! ends when the frame says so, or immediately on abort.

use std::cell::Cell;
use std::fmt;
use std::io;
use std::rc::Rc;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::app::Application;
use crate::config::RequestLimits;
use crate::http::context::{ConnectionInfo, ConnectionSignals, HttpContext};
use crate::http::frame::Frame;
use crate::memory::MemoryPool;
use crate::socket::{BufferSizeControl, ConnectionControl, ProduceEndType, SocketInput, SocketOutput};

/// Identifier used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Per-connection settings shared by every connection of a server.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub max_request_buffer_size: Option<usize>,
    pub max_response_buffer_size: Option<usize>,
    pub add_server_header: bool,
    pub limits: RequestLimits,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_request_buffer_size: Some(1024 * 1024),
            max_response_buffer_size: Some(64 * 1024),
            add_server_header: true,
            limits: RequestLimits::default(),
        }
    }
}

/// Read side switch driven by the buffer controls.
///
/// Both the input and the output control may pause at the same time, so
/// pauses nest and reads resume only when every pause was undone.
struct ReadControl {
    id: ConnectionId,
    depth: Cell<usize>,
    resumed: Notify,
    signals: Rc<ConnectionSignals>,
}

impl ReadControl {
    fn is_paused(&self) -> bool {
        self.depth.get() > 0
    }

    async fn wait_resumed(&self) {
        loop {
            let notified = self.resumed.notified();
            if !self.is_paused() {
                return;
            }
            notified.await;
        }
    }
}

impl ConnectionControl for ReadControl {
    fn pause(&self) {
        let depth = self.depth.get() + 1;
        self.depth.set(depth);
        if depth == 1 {
            debug!(connection_id = %self.id, "Pausing reads");
        }
    }

    fn resume(&self) {
        let depth = self.depth.get().saturating_sub(1);
        self.depth.set(depth);
        if depth == 0 {
            debug!(connection_id = %self.id, "Resuming reads");
            self.resumed.notify_waiters();
        }
    }

    fn end(&self, end_type: ProduceEndType) {
        match end_type {
            ProduceEndType::SocketDisconnect => self.signals.abort(),
            ProduceEndType::SocketShutdownSend => self.signals.request_stop(),
            ProduceEndType::ConnectionKeepAlive => {}
        }
    }
}

pub struct Connection {
    info: Rc<ConnectionInfo>,
    pool: MemoryPool,
    app: Arc<dyn Application>,
    settings: Arc<ConnectionSettings>,
    signals: Rc<ConnectionSignals>,
    control: Rc<ReadControl>,
}

impl Connection {
    pub fn new(
        info: ConnectionInfo,
        pool: MemoryPool,
        app: Arc<dyn Application>,
        settings: Arc<ConnectionSettings>,
    ) -> Self {
        let signals = Rc::new(ConnectionSignals::default());
        let control = Rc::new(ReadControl {
            id: info.id,
            depth: Cell::new(0),
            resumed: Notify::new(),
            signals: signals.clone(),
        });
        Self {
            info: Rc::new(info),
            pool,
            app,
            settings,
            signals,
            control,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.info.id
    }

    /// Handle for pausing, resuming and ending this connection from its
    /// loop thread.
    pub fn control(&self) -> Rc<dyn ConnectionControl> {
        self.control.clone()
    }

    /// Serve the transport until the connection ends. Must run inside a
    /// `LocalSet`.
    pub async fn run<T>(self, transport: T)
    where
        T: AsyncRead + AsyncWrite + Unpin + 'static,
    {
        let id = self.info.id;
        debug!(
            connection_id = %id,
            peer = ?self.info.remote_addr,
            "Connection started"
        );

        // Never pause below one full head, or a head cut short by the pause
        // could never complete.
        let head_size = self.settings.limits.max_head_size();
        let input_control = self
            .settings
            .max_request_buffer_size
            .map(|max| BufferSizeControl::new(max.max(head_size), self.control.clone()));
        let output_control = self
            .settings
            .max_response_buffer_size
            .map(|max| BufferSizeControl::new(max, self.control.clone()));

        let input = SocketInput::new(self.pool.clone(), input_control);
        let output = SocketOutput::new(
            self.pool.clone(),
            self.settings.max_response_buffer_size,
            output_control,
        );

        let (reader, writer) = tokio::io::split(transport);
        let flusher = tokio::task::spawn_local(output.clone().run_flusher(writer));
        let reader = tokio::task::spawn_local(read_loop(
            reader,
            input.clone(),
            self.pool.clone(),
            self.control.clone(),
        ));

        let ctx = HttpContext::new(
            input.clone(),
            output.clone(),
            self.info.clone(),
            self.signals.clone(),
            self.settings.add_server_header,
        );
        let mut frame = Frame::new(ctx, self.app.clone(), self.settings.limits.clone());

        let end = tokio::select! {
            end = frame.run() => end,
            _ = self.signals.aborted() => ProduceEndType::SocketDisconnect,
        };
        drop(frame);

        self.finish(end, &input, &output, reader, flusher).await;
        debug!(connection_id = %id, "Connection stopped");
    }

    /// Close out the socket. A graceful end lets the flusher drain, unless
    /// an abort arrives first.
    async fn finish(
        &self,
        end: ProduceEndType,
        input: &SocketInput,
        output: &SocketOutput,
        reader: JoinHandle<()>,
        mut flusher: JoinHandle<()>,
    ) {
        let id = self.info.id;
        reader.abort();

        let mut flusher_done = false;
        if self.signals.is_aborted() {
            warn!(connection_id = %id, "Connection aborted");
        }
        if end == ProduceEndType::SocketDisconnect || self.signals.is_aborted() {
            debug!(connection_id = %id, "Disconnecting");
            output.abort();
            input.abort(io::ErrorKind::ConnectionAborted);
            flusher.abort();
        } else {
            output.end(ProduceEndType::SocketShutdownSend);
            tokio::select! {
                _ = &mut flusher => flusher_done = true,
                _ = self.signals.aborted() => {
                    warn!(connection_id = %id, "Connection aborted while flushing");
                    output.abort();
                    flusher.abort();
                }
            }
            trace!(connection_id = %id, "Write FIN");
        }

        // Both tasks end here, returning any blocks they held to the pool.
        let _ = reader.await;
        if !flusher_done {
            let _ = flusher.await;
        }
    }
}

async fn read_loop<R>(mut reader: R, input: SocketInput, pool: MemoryPool, control: Rc<ReadControl>)
where
    R: AsyncRead + Unpin,
{
    // Block handed back by the input after its bytes were copied.
    let mut spare = None;

    loop {
        control.wait_resumed().await;

        let mut block = match spare.take() {
            Some(block) => block,
            None => match pool.lease() {
                Ok(block) => block,
                Err(e) => {
                    warn!(connection_id = %control.id, error = %e, "Cannot lease read buffer");
                    input.abort(io::ErrorKind::OutOfMemory);
                    return;
                }
            },
        };

        let read = {
            let mut spare = block.spare_mut();
            reader.read_buf(&mut spare).await
        };
        match read {
            Ok(0) => {
                trace!(connection_id = %control.id, "Read FIN");
                input.incoming_fin();
                return;
            }
            Ok(_) => spare = input.incoming_complete(block),
            Err(e) => {
                debug!(connection_id = %control.id, error = %e, "Socket read failed");
                input.abort(e.kind());
                return;
            }
        }
    }
}
