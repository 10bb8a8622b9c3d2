//! Gateway: HTTP + WebSocket server, inbound message processing, and the
//! dashboard event stream.

pub mod protocol;
pub mod server;

pub use server::run_gateway;
