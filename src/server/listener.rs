use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::app::Application;
use crate::config::ServerOptions;
use crate::http::connection::ConnectionSettings;
use crate::memory::MemoryPool;
use crate::server::address::ServerAddress;
use crate::server::event_loop::{AcceptedSocket, EventLoop, LoopHandle, LoopServices};
use crate::server::filter;
use crate::server::manager::ConnectionManager;

/// How long aborted connections get to unwind before loops are stopped.
const ABORT_GRACE: Duration = Duration::from_secs(1);

/// A bound, not yet accepting, listener.
enum BoundListener {
    Tcp(std::net::TcpListener),
    Unix(std::os::unix::net::UnixListener),
}

impl BoundListener {
    fn bind(address: &ServerAddress) -> anyhow::Result<Self> {
        match address {
            ServerAddress::Tcp { .. } => {
                let addrs = address.socket_addrs()?;
                let listener = std::net::TcpListener::bind(&addrs[..])
                    .with_context(|| format!("Failed to bind {address}"))?;
                listener.set_nonblocking(true)?;
                Ok(BoundListener::Tcp(listener))
            }
            ServerAddress::Unix(path) => {
                let listener = std::os::unix::net::UnixListener::bind(path)
                    .with_context(|| format!("Failed to bind {address}"))?;
                listener.set_nonblocking(true)?;
                Ok(BoundListener::Unix(listener))
            }
        }
    }

    /// Address actually bound (resolves port 0).
    fn bound_address(&self, requested: &ServerAddress) -> ServerAddress {
        match self {
            BoundListener::Tcp(listener) => match listener.local_addr() {
                Ok(addr) => ServerAddress::Tcp {
                    host: addr.ip().to_string(),
                    port: addr.port(),
                },
                Err(_) => requested.clone(),
            },
            BoundListener::Unix(_) => requested.clone(),
        }
    }
}

enum AsyncListener {
    Tcp(tokio::net::TcpListener),
    Unix(tokio::net::UnixListener),
}

impl AsyncListener {
    fn from_bound(bound: BoundListener) -> std::io::Result<Self> {
        Ok(match bound {
            BoundListener::Tcp(l) => AsyncListener::Tcp(tokio::net::TcpListener::from_std(l)?),
            BoundListener::Unix(l) => AsyncListener::Unix(tokio::net::UnixListener::from_std(l)?),
        })
    }

    async fn accept(&self) -> std::io::Result<AcceptedSocket> {
        match self {
            AsyncListener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                debug!(peer = %peer, "Accepted connection");
                Ok(AcceptedSocket::Tcp(stream.into_std()?))
            }
            AsyncListener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                debug!("Accepted local connection");
                Ok(AcceptedSocket::Unix(stream.into_std()?))
            }
        }
    }
}

/// Hands accepted sockets to loops in turn.
struct Dispatcher {
    loops: Vec<LoopHandle>,
    next: AtomicUsize,
}

impl Dispatcher {
    fn dispatch(&self, socket: AcceptedSocket) {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        if !self.loops[index].accept(socket) {
            warn!(loop_index = index, "Event loop gone, dropping connection");
        }
    }
}

async fn accept_loop(
    listener: AsyncListener,
    address: ServerAddress,
    dispatcher: Arc<Dispatcher>,
    mut accepting: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = accepting.wait_for(|accepting| !*accepting) => break,
            accepted = listener.accept() => match accepted {
                Ok(socket) => dispatcher.dispatch(socket),
                Err(e) => {
                    warn!(address = %address, error = %e, "Accept failed");
                    // Typically out of file descriptors; back off briefly.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
    info!(address = %address, "Stopped accepting");
}

/// A running server: listeners, loop threads and connection bookkeeping.
pub struct Server {
    loops: Vec<EventLoop>,
    manager: Arc<ConnectionManager>,
    pool: MemoryPool,
    accepting: watch::Sender<bool>,
    addresses: Vec<ServerAddress>,
    shutdown_timeout: Duration,
}

impl Server {
    /// Bind every address, start the loop threads and begin accepting.
    ///
    /// Binding happens before this returns, so address errors surface here.
    pub fn start(options: &ServerOptions, app: Arc<dyn Application>) -> anyhow::Result<Server> {
        options
            .validate()
            .map_err(crate::error::ConfigError::Validation)?;

        let mut bound = Vec::new();
        for address in options.server_addresses()? {
            let listener = BoundListener::bind(&address)?;
            let actual = listener.bound_address(&address);
            info!(address = %actual, "Listening");
            bound.push((listener, actual));
        }

        let pool = MemoryPool::with_limit(options.pool.max_slabs);
        let manager = Arc::new(ConnectionManager::new());
        let services = Arc::new(LoopServices {
            pool: pool.clone(),
            app,
            filter: filter::from_kind(options.filter),
            settings: Arc::new(ConnectionSettings {
                max_request_buffer_size: options.max_request_buffer_size,
                max_response_buffer_size: options.max_response_buffer_size,
                add_server_header: options.add_server_header,
                limits: options.limits.clone(),
            }),
            manager: manager.clone(),
            no_delay: options.no_delay,
        });

        let mut loops = Vec::with_capacity(options.thread_count);
        for index in 0..options.thread_count {
            loops.push(EventLoop::spawn(index, services.clone())?);
        }
        info!(threads = loops.len(), "Event loops started");

        let dispatcher = Arc::new(Dispatcher {
            loops: loops.iter().map(EventLoop::handle).collect(),
            next: AtomicUsize::new(0),
        });
        let (accepting, _) = watch::channel(true);

        let mut addresses = Vec::with_capacity(bound.len());
        for (listener, address) in bound {
            let dispatcher = dispatcher.clone();
            let stop = accepting.subscribe();
            let announced = address.clone();
            loops[0].handle().post(move |_| {
                let listener = match AsyncListener::from_bound(listener) {
                    Ok(listener) => listener,
                    Err(e) => {
                        warn!(address = %announced, error = %e, "Cannot register listener");
                        return;
                    }
                };
                tokio::task::spawn_local(accept_loop(listener, announced, dispatcher, stop));
            });
            addresses.push(address);
        }

        Ok(Server {
            loops,
            manager,
            pool,
            accepting,
            addresses,
            shutdown_timeout: options.shutdown_timeout(),
        })
    }

    /// Bound addresses, with real ports for any that asked for port 0.
    pub fn addresses(&self) -> &[ServerAddress] {
        &self.addresses
    }

    /// First bound TCP address.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.addresses
            .iter()
            .find_map(|a| a.socket_addrs().ok().and_then(|addrs| addrs.into_iter().next()))
    }

    pub fn connection_count(&self) -> usize {
        self.manager.live_count()
    }

    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    /// Stop accepting, let in-flight requests finish, abort what is left
    /// after the timeout, then stop the loop threads.
    ///
    /// Returns true when every connection closed within the timeout.
    pub async fn shutdown(mut self) -> bool {
        info!("Stopping listeners");
        self.accepting.send_replace(false);

        for event_loop in &self.loops {
            event_loop.handle().post(|ctx| ctx.stop_connections());
        }

        info!(
            connections = self.manager.live_count(),
            timeout_secs = self.shutdown_timeout.as_secs(),
            "Waiting for connections to close"
        );
        let graceful = self.manager.wait_for_drain(self.shutdown_timeout).await;

        if !graceful {
            warn!(
                connections = self.manager.live_count(),
                "Shutdown timeout elapsed, aborting connections"
            );
            for event_loop in &self.loops {
                event_loop.handle().post(|ctx| ctx.abort_connections());
            }
            if !self.manager.wait_for_drain(ABORT_GRACE).await {
                warn!(connections = self.manager.live_count(), "Connections still live after abort");
            }
        }

        let mut loops = std::mem::take(&mut self.loops);
        for event_loop in &loops {
            event_loop.handle().stop();
        }
        let joined = tokio::task::spawn_blocking(move || {
            for event_loop in &mut loops {
                event_loop.join();
            }
        })
        .await;
        if let Err(e) = joined {
            warn!(error = %e, "Joining event loops failed");
        }

        for address in &self.addresses {
            if let ServerAddress::Unix(path) = address {
                remove_socket_file(path);
            }
        }

        info!(graceful, "Server stopped");
        graceful
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // Dropped without shutdown: stop loops, don't block on them.
        self.accepting.send_replace(false);
        for event_loop in &self.loops {
            event_loop.handle().stop();
        }
    }
}

fn remove_socket_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        debug!(path = %path.display(), error = %e, "Could not remove socket file");
    }
}
