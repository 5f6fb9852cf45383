//! Listening, loop threads and shutdown.

pub mod address;
pub mod event_loop;
pub mod filter;
pub mod listener;
pub mod manager;

pub use address::ServerAddress;
pub use listener::Server;
