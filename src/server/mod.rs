//! WebSocket relay module
//!
//! Handshake, frame codec and per-connection session for the relay, plus the
//! accept loop that ties them to a TCP listener.

#[allow(dead_code)]
mod frame;
mod handshake;
mod http;
#[allow(dead_code)]
mod protocol;
mod session;
mod websocket;

pub use websocket::RelayServer;
