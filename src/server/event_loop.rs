//! Event-loop threads.
//!
//! Each loop is an OS thread driving a current-thread tokio runtime with a
//! `LocalSet`. Connections are spawned onto exactly one loop and never move.
//! Other threads talk to a loop only by sending it messages.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::{debug, warn};

use crate::app::Application;
use crate::http::connection::{Connection, ConnectionId, ConnectionSettings};
use crate::http::context::ConnectionInfo;
use crate::memory::MemoryPool;
use crate::server::filter::{BoxedTransport, ConnectionFilter, FilterContext};
use crate::server::manager::ConnectionManager;
use crate::socket::{ConnectionControl, ProduceEndType};

/// A socket accepted on one loop, on its way to another. Std types are
/// used so the socket is not tied to the accepting loop's reactor.
#[derive(Debug)]
pub enum AcceptedSocket {
    Tcp(std::net::TcpStream),
    Unix(std::os::unix::net::UnixStream),
}

type Callback = Box<dyn FnOnce(&Rc<LoopContext>) + Send>;

pub(crate) enum LoopMessage {
    Accept(AcceptedSocket),
    Post(Callback),
    Shutdown,
}

/// Everything a loop needs to serve connections.
pub struct LoopServices {
    pub pool: MemoryPool,
    pub app: Arc<dyn Application>,
    pub filter: Option<Arc<dyn ConnectionFilter>>,
    pub settings: Arc<ConnectionSettings>,
    pub manager: Arc<ConnectionManager>,
    pub no_delay: bool,
}

/// Loop-thread state: the live connections this loop owns.
pub struct LoopContext {
    index: usize,
    services: Arc<LoopServices>,
    connections: RefCell<HashMap<ConnectionId, Rc<dyn ConnectionControl>>>,
    stopping: Cell<bool>,
}

impl LoopContext {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn connection_count(&self) -> usize {
        self.connections.borrow().len()
    }

    /// Ask every connection to finish its current request and close.
    pub fn stop_connections(&self) {
        self.stopping.set(true);
        self.end_all(ProduceEndType::SocketShutdownSend);
    }

    /// Tear every connection down now.
    pub fn abort_connections(&self) {
        self.stopping.set(true);
        self.end_all(ProduceEndType::SocketDisconnect);
    }

    fn end_all(&self, end_type: ProduceEndType) {
        // Collect first: ending a connection may unregister it.
        let controls: Vec<_> = self.connections.borrow().values().cloned().collect();
        debug!(loop_index = self.index, connections = controls.len(), ?end_type, "Ending connections");
        for control in controls {
            control.end(end_type);
        }
    }

    fn start_connection(self: &Rc<Self>, socket: AcceptedSocket) {
        let services = &self.services;
        let id = services.manager.register(self.index);
        let registration = Registration {
            id,
            ctx: self.clone(),
        };

        let (transport, remote_addr, local_addr) = match adopt(socket, services.no_delay) {
            Ok(adopted) => adopted,
            Err(e) => {
                warn!(connection_id = %id, error = %e, "Cannot adopt accepted socket");
                return;
            }
        };

        let ctx = self.clone();
        tokio::task::spawn_local(async move {
            let services = &ctx.services;
            let mut info = ConnectionInfo::new(id);
            info.remote_addr = remote_addr;
            info.local_addr = local_addr;

            let mut filtered = FilterContext { info, transport };
            if let Some(filter) = &services.filter {
                filtered = match filter.on_connection(filtered).await {
                    Ok(filtered) => filtered,
                    Err(e) => {
                        debug!(connection_id = %id, error = %e, "Connection filter failed");
                        return;
                    }
                };
            }

            let connection = Connection::new(
                filtered.info,
                services.pool.clone(),
                services.app.clone(),
                services.settings.clone(),
            );
            let control = connection.control();
            if ctx.stopping.get() {
                control.end(ProduceEndType::SocketShutdownSend);
            }
            ctx.connections.borrow_mut().insert(id, control);

            connection.run(filtered.transport).await;
            drop(registration);
        });
    }
}

/// Removes a connection from the loop and the manager however its task
/// ends, including when the loop drops it on shutdown.
struct Registration {
    id: ConnectionId,
    ctx: Rc<LoopContext>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.ctx.connections.borrow_mut().remove(&self.id);
        self.ctx.services.manager.unregister(self.id);
    }
}

fn adopt(
    socket: AcceptedSocket,
    no_delay: bool,
) -> io::Result<(BoxedTransport, Option<SocketAddr>, Option<SocketAddr>)> {
    match socket {
        AcceptedSocket::Tcp(stream) => {
            let stream = tokio::net::TcpStream::from_std(stream)?;
            if no_delay {
                stream.set_nodelay(true)?;
            }
            let remote = stream.peer_addr().ok();
            let local = stream.local_addr().ok();
            Ok((Box::new(stream), remote, local))
        }
        AcceptedSocket::Unix(stream) => {
            let stream = tokio::net::UnixStream::from_std(stream)?;
            Ok((Box::new(stream), None, None))
        }
    }
}

/// Cloneable sender side of a loop.
#[derive(Clone)]
pub struct LoopHandle {
    index: usize,
    sender: mpsc::UnboundedSender<LoopMessage>,
}

impl LoopHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Run `f` on the loop thread. Returns false if the loop is gone.
    pub fn post<F>(&self, f: F) -> bool
    where
        F: FnOnce(&Rc<LoopContext>) + Send + 'static,
    {
        self.sender.send(LoopMessage::Post(Box::new(f))).is_ok()
    }

    /// Hand an accepted socket to the loop.
    pub fn accept(&self, socket: AcceptedSocket) -> bool {
        self.sender.send(LoopMessage::Accept(socket)).is_ok()
    }

    /// Ask the loop to exit; connections still live are dropped.
    pub fn stop(&self) -> bool {
        self.sender.send(LoopMessage::Shutdown).is_ok()
    }
}

pub struct EventLoop {
    handle: LoopHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoop {
    /// Start loop `index` on its own thread.
    pub fn spawn(index: usize, services: Arc<LoopServices>) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (sender, receiver) = mpsc::unbounded_channel();

        let thread = thread::Builder::new()
            .name(format!("h1loop-{index}"))
            .spawn(move || {
                let local = LocalSet::new();
                let ctx = Rc::new(LoopContext {
                    index,
                    services,
                    connections: RefCell::new(HashMap::new()),
                    stopping: Cell::new(false),
                });
                local.block_on(&runtime, run(ctx, receiver));
            })?;

        Ok(Self {
            handle: LoopHandle { index, sender },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn index(&self) -> usize {
        self.handle.index
    }

    /// Wait for the loop thread to exit. Call after `stop`.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(loop_index = self.handle.index, "Event loop thread panicked");
            }
        }
    }
}

async fn run(ctx: Rc<LoopContext>, mut receiver: mpsc::UnboundedReceiver<LoopMessage>) {
    debug!(loop_index = ctx.index, "Event loop started");

    while let Some(message) = receiver.recv().await {
        match message {
            LoopMessage::Accept(socket) => ctx.start_connection(socket),
            LoopMessage::Post(callback) => callback(&ctx),
            LoopMessage::Shutdown => break,
        }
    }

    if ctx.connection_count() > 0 {
        warn!(
            loop_index = ctx.index,
            connections = ctx.connection_count(),
            "Event loop exiting with live connections"
        );
        ctx.abort_connections();
    }
    debug!(loop_index = ctx.index, "Event loop stopped");
}
