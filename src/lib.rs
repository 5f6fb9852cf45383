//! h1loop - HTTP/1.x transport engine
//!
//! A fixed set of event-loop threads serves many connections. Each
//! connection is pinned to one loop and runs an incremental parser over
//! pooled buffers, with read throttling when either direction backs up.

pub mod app;
pub mod config;
pub mod error;
pub mod http;
pub mod memory;
pub mod server;
pub mod socket;

pub use app::Application;
pub use config::ServerOptions;
pub use http::context::HttpContext;
pub use server::Server;
