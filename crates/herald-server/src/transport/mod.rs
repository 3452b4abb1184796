//! Client transports. Only WebSocket text frames are carried.

pub mod websocket;
