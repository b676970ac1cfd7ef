//! collabd - collaborative code rooms over WebSocket, with per-room
//! sandboxed execution.

pub mod access;
pub mod bridge;
pub mod config;
pub mod connections;
pub mod error;
pub mod http_server;
pub mod patch;
pub mod persistence;
pub mod position;
pub mod protocol;
pub mod room;
pub mod sandbox;
pub mod session;
pub mod state;

#[cfg(test)]
mod testing;
