//! Network surface of the proxy
//!
//! JSON requests over WebSocket, one task per client connection.

pub mod listener;
pub mod protocol;
pub mod service;
