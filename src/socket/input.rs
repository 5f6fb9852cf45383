//! Inbound half of a connection's byte pipeline.
//!
//! The reader task is the producer: it appends blocks as the socket yields
//! data. The frame is the single consumer: it takes a view of the buffered
//! bytes, scans as far as it can, and reports back two positions:
//!
//! - `consumed`: everything before it is done and goes back to the pool
//! - `examined`: everything before it has been looked at; if the consumer
//!   examined all buffered bytes, the next `ready()` waits for new data
//!
//! Both sides run on the connection's loop thread. Hand-off between them
//! happens only through `ready()` and the `Notify` behind it.

use std::cell::{Cell, Ref, RefCell};
use std::io;
use std::rc::Rc;

use tokio::sync::Notify;

use crate::error::PoolError;
use crate::memory::{Block, BlockChain, BlockIter, Cursor, MemoryPool};
use crate::socket::buffer_control::BufferSizeControl;

struct InputState {
    chain: BlockChain,
    remote_closed: bool,
    error: Option<io::ErrorKind>,
    awaiting_new_data: bool,
}

struct InputShared {
    state: RefCell<InputState>,
    consuming: Cell<bool>,
    ready: Notify,
    buffer_control: Option<BufferSizeControl>,
}

/// Buffered inbound bytes plus the suspension point the parser awaits.
#[derive(Clone)]
pub struct SocketInput {
    shared: Rc<InputShared>,
}

impl SocketInput {
    pub fn new(pool: MemoryPool, buffer_control: Option<BufferSizeControl>) -> Self {
        Self {
            shared: Rc::new(InputShared {
                state: RefCell::new(InputState {
                    chain: BlockChain::new(pool),
                    remote_closed: false,
                    error: None,
                    awaiting_new_data: true,
                }),
                consuming: Cell::new(false),
                ready: Notify::new(),
                buffer_control,
            }),
        }
    }

    /// Copy bytes read from the network into the buffer. An empty slice marks
    /// the end of the stream.
    pub fn incoming_data(&self, data: &[u8]) -> Result<(), PoolError> {
        if data.is_empty() {
            self.incoming_fin();
            return Ok(());
        }

        {
            let mut state = self.shared.state.borrow_mut();
            state.chain.append(data)?;
            state.awaiting_new_data = false;
        }
        self.produced(data.len());
        Ok(())
    }

    /// Take a block the reader filled in place.
    ///
    /// Small reads are copied into the free space of the last buffered block
    /// and the emptied block is handed back for the next read, so a peer
    /// trickling bytes holds at most about twice its buffered bytes in
    /// blocks. Larger reads are linked without copying.
    pub fn incoming_complete(&self, mut block: Block) -> Option<Block> {
        let count = block.len();
        if count == 0 {
            return Some(block);
        }

        let spare = {
            let mut state = self.shared.state.borrow_mut();
            state.awaiting_new_data = false;
            if state.chain.append_to_tail(block.readable()) {
                block.reset();
                Some(block)
            } else {
                state.chain.push_block(block);
                None
            }
        };
        self.produced(count);
        spare
    }

    /// The peer finished sending.
    pub fn incoming_fin(&self) {
        self.shared.state.borrow_mut().remote_closed = true;
        self.shared.ready.notify_one();
    }

    /// Fail any pending and future waits with `kind`.
    pub fn abort(&self, kind: io::ErrorKind) {
        {
            let mut state = self.shared.state.borrow_mut();
            if state.error.is_none() {
                state.error = Some(kind);
            }
        }
        self.shared.ready.notify_one();
    }

    pub fn remote_closed(&self) -> bool {
        self.shared.state.borrow().remote_closed
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.state.borrow().error.is_some()
    }

    /// Bytes buffered and not yet consumed.
    pub fn buffered(&self) -> usize {
        self.shared.state.borrow().chain.len()
    }

    /// Wait until there is unexamined data, the peer closed, or the input
    /// was aborted.
    pub async fn ready(&self) -> io::Result<()> {
        loop {
            {
                let state = self.shared.state.borrow();
                if let Some(kind) = state.error {
                    return Err(io::Error::from(kind));
                }
                if state.remote_closed || !state.awaiting_new_data {
                    return Ok(());
                }
            }
            self.shared.ready.notified().await;
        }
    }

    /// Borrow the buffered bytes for parsing. Must be paired with
    /// `consuming_complete` once the view is dropped.
    pub fn consuming_start(&self) -> InputView<'_> {
        debug_assert!(!self.shared.consuming.get(), "consuming_start called twice");
        self.shared.consuming.set(true);
        InputView {
            state: self.shared.state.borrow(),
        }
    }

    /// Release bytes before `consumed`; remember whether everything up to
    /// the end was `examined`.
    pub fn consuming_complete(&self, consumed: BlockIter, examined: BlockIter) {
        let released = {
            let mut state = self.shared.state.borrow_mut();
            let released = state.chain.consume_to(consumed);
            state.awaiting_new_data = examined >= state.chain.end();
            released
        };
        self.shared.consuming.set(false);

        if released > 0 {
            if let Some(control) = &self.shared.buffer_control {
                control.subtract(released);
            }
        }
    }

    /// Copy up to `buf.len()` buffered bytes out, waiting for data if needed.
    /// Returns 0 at end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            self.ready().await?;

            let (copied, consumed, closed) = {
                let view = self.consuming_start();
                let copied = view.chain().copy_to(view.start(), view.end(), buf);
                let mut cursor = view.cursor();
                cursor.skip(copied);
                (copied, cursor.position(), view.remote_closed())
            };
            // Bytes left behind by a short buffer still count as unexamined.
            self.consuming_complete(consumed, consumed);

            if copied > 0 || closed {
                return Ok(copied);
            }
        }
    }

    fn produced(&self, count: usize) {
        if let Some(control) = &self.shared.buffer_control {
            control.add(count);
        }
        self.shared.ready.notify_one();
    }
}

impl std::fmt::Debug for SocketInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("SocketInput")
            .field("buffered", &state.chain.len())
            .field("remote_closed", &state.remote_closed)
            .field("error", &state.error)
            .finish()
    }
}

/// Read-only view of the buffered inbound bytes.
pub struct InputView<'a> {
    state: Ref<'a, InputState>,
}

impl InputView<'_> {
    pub fn chain(&self) -> &BlockChain {
        &self.state.chain
    }

    pub fn start(&self) -> BlockIter {
        self.state.chain.start()
    }

    pub fn end(&self) -> BlockIter {
        self.state.chain.end()
    }

    pub fn len(&self) -> usize {
        self.state.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.chain.is_empty()
    }

    pub fn remote_closed(&self) -> bool {
        self.state.remote_closed
    }

    /// Cursor at the first buffered byte.
    pub fn cursor(&self) -> Cursor<'_> {
        self.state.chain.cursor_at_start()
    }
}
