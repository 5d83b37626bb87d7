//! Multi-room chat relay over a newline-delimited text protocol.
pub mod actions;
pub mod client;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod message;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
