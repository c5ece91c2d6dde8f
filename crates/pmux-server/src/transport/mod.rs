//! Transport adapters: WebSocket mux for real clients, in-memory for tests.

#[cfg(test)]
pub mod memory;
pub mod websocket;

pub use websocket::{WebSocketConnection, WsConnection};
