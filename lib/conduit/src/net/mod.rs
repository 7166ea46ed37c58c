//! The transport layer: framing, buffering, connection objects and the
//! per-endpoint connection managers.

pub mod buffer;
pub mod connection;
pub mod frame;
pub mod manager;
pub mod support;
