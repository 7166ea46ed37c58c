#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod compress;
pub mod crypto;
pub mod device;
pub mod encoding;
pub mod logging;
pub mod session;
pub mod time;

/// Wire protocol revision. Incompatible revisions refuse to talk to each other.
pub const PROTOCOL_VERSION: u8 = 1;
