//! Secure peer-to-peer networking core.
//!
//! `conduit` accepts and initiates TCP connections between peers, negotiates
//! symmetric session keys, authenticates each peer and multiplexes three
//! logical connection roles (bootstrap, control, bulk data) over distinct
//! endpoints. Framed messages are optionally encrypted and compressed before
//! delivery to upper layers.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod config;
pub mod core;
pub mod handlers;
pub mod metrics;
pub mod net;
pub mod secure;
pub mod store;
pub mod workers;

#[cfg(test)]
pub(crate) mod testkit;
