//! Live connection bookkeeping for coordinated shutdown.
//!
//! The manager is shared by every loop thread. It only records which loop
//! owns each live connection; stopping or aborting connections is done by
//! the owning loop in response to a posted message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::http::connection::ConnectionId;

#[derive(Debug)]
pub struct ConnectionManager {
    next_id: AtomicU64,
    live: Mutex<HashMap<ConnectionId, usize>>,
    count: watch::Sender<usize>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            next_id: AtomicU64::new(1),
            live: Mutex::new(HashMap::new()),
            count,
        }
    }

    /// Record a new connection owned by loop `loop_index`.
    pub fn register(&self, loop_index: usize) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut live = self.live.lock();
        live.insert(id, loop_index);
        self.count.send_replace(live.len());
        id
    }

    pub fn unregister(&self, id: ConnectionId) {
        let mut live = self.live.lock();
        if live.remove(&id).is_some() {
            self.count.send_replace(live.len());
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    /// Live connections owned by one loop.
    pub fn live_on(&self, loop_index: usize) -> usize {
        self.live.lock().values().filter(|&&i| i == loop_index).count()
    }

    /// Wait until no connection is live. Returns false on timeout.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let mut count = self.count.subscribe();
        tokio::time::timeout(timeout, count.wait_for(|&n| n == 0))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
