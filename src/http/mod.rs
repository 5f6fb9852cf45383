//! HTTP/1.x protocol implementation.
//!
//! # Architecture
//!
//! - **`parser`**: incremental request-line and header parsing over pooled buffers
//! - **`headers`**: header collection with fixed slots for well-known names
//! - **`request`** / **`response`**: request head, status codes, reason phrases
//! - **`body`**: request body framing (length, chunked, until close)
//! - **`writer`**: response head serialization
//! - **`context`**: the per-request state handed to the application
//! - **`frame`**: the request/response state machine with keep-alive looping
//! - **`connection`**: binds a transport to the frame and the byte pipeline
//!
//! # Connection lifecycle
//!
//! ```text
//!        ┌─────────────────┐
//!        │ RequestPending  │ ← parse start line + headers
//!        └───────┬─────────┘
//!                │ head complete
//!                ▼
//!        ┌─────────────────┐
//!        │ RequestStarted  │ ← application reads body, sets status/headers
//!        └───────┬─────────┘
//!                │ first body write (or completion)
//!                ▼
//!        ┌─────────────────┐
//!        │ ResponseStarted │ ← headers read-only, body framed
//!        └───────┬─────────┘
//!                │ response complete
//!                ├─ Keep-Alive → RequestPending (same connection)
//!                └─ Close → Closed
//! ```

pub mod body;
pub mod connection;
pub mod context;
pub mod frame;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
