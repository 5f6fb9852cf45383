//! Per-connection byte pipeline.
//!
//! - **`input`**: inbound chain fed by the reader task, consumed by the frame
//! - **`output`**: outbound chain fed by the frame, drained by the flusher task
//! - **`buffer_control`**: watermark tracking that pauses and resumes reads

pub mod buffer_control;
pub mod input;
pub mod output;

pub use buffer_control::{BufferSizeControl, ConnectionControl, ProduceEndType};
pub use input::{InputView, SocketInput};
pub use output::{OutputProducer, SocketOutput};
