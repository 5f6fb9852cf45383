//! Watermark-based read throttling.

use std::cell::Cell;
use std::rc::Rc;

/// How a producer finished its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProduceEndType {
    /// Flush, then half-close the write side.
    SocketShutdownSend,
    /// Drop pending output and close immediately.
    SocketDisconnect,
    /// Leave the socket open for the next request.
    ConnectionKeepAlive,
}

/// Control surface a connection exposes to its I/O objects and frame.
pub trait ConnectionControl {
    /// Stop reading from the socket.
    fn pause(&self);
    /// Start reading again after a `pause`.
    fn resume(&self);
    /// Finish the connection in the given way.
    fn end(&self, end_type: ProduceEndType);
}

/// Tracks outstanding bytes against a maximum and pauses reads while the
/// count is above it.
///
/// Never drops data; it only delays reads. Owned by a single loop thread.
pub struct BufferSizeControl {
    max_size: usize,
    size: Cell<usize>,
    paused: Cell<bool>,
    control: Rc<dyn ConnectionControl>,
}

impl BufferSizeControl {
    pub fn new(max_size: usize, control: Rc<dyn ConnectionControl>) -> Self {
        Self {
            max_size,
            size: Cell::new(0),
            paused: Cell::new(false),
            control,
        }
    }

    pub fn add(&self, count: usize) {
        let size = self.size.get() + count;
        self.size.set(size);

        if !self.paused.get() && size > self.max_size {
            self.paused.set(true);
            self.control.pause();
        }
    }

    pub fn subtract(&self, count: usize) {
        debug_assert!(count <= self.size.get(), "subtracting more than was added");
        let size = self.size.get().saturating_sub(count);
        self.size.set(size);

        if self.paused.get() && size <= self.max_size {
            self.paused.set(false);
            self.control.resume();
        }
    }

    pub fn size(&self) -> usize {
        self.size.get()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn is_paused(&self) -> bool {
        self.paused.get()
    }
}

impl std::fmt::Debug for BufferSizeControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferSizeControl")
            .field("max_size", &self.max_size)
            .field("size", &self.size.get())
            .field("paused", &self.paused.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        calls: RefCell<Vec<&'static str>>,
    }

    impl ConnectionControl for Recorder {
        fn pause(&self) {
            self.calls.borrow_mut().push("pause");
        }
        fn resume(&self) {
            self.calls.borrow_mut().push("resume");
        }
        fn end(&self, _end_type: ProduceEndType) {
            self.calls.borrow_mut().push("end");
        }
    }

    #[test]
    fn slow_consumer_pauses_then_resumes() {
        let recorder = Rc::new(Recorder::default());
        let control = BufferSizeControl::new(10, recorder.clone());

        // Fast producer.
        for _ in 0..5 {
            control.add(4);
        }
        assert!(control.is_paused());
        assert_eq!(control.size(), 20);

        // Slow consumer catches up.
        control.subtract(4);
        control.subtract(4);
        assert!(control.is_paused());
        control.subtract(4);
        assert!(!control.is_paused());
        control.subtract(8);

        assert_eq!(*recorder.calls.borrow(), vec!["pause", "resume"]);
    }

    #[test]
    fn exactly_at_limit_does_not_pause() {
        let recorder = Rc::new(Recorder::default());
        let control = BufferSizeControl::new(8, recorder.clone());

        control.add(8);
        assert!(!control.is_paused());
        control.add(1);
        assert!(control.is_paused());
        control.subtract(1);
        assert!(!control.is_paused());

        assert_eq!(*recorder.calls.borrow(), vec!["pause", "resume"]);
    }

    #[test]
    fn repeated_crossings_alternate() {
        let recorder = Rc::new(Recorder::default());
        let control = BufferSizeControl::new(2, recorder.clone());

        for _ in 0..3 {
            control.add(5);
            control.subtract(5);
        }

        assert_eq!(
            *recorder.calls.borrow(),
            vec!["pause", "resume", "pause", "resume", "pause", "resume"]
        );
    }
}
