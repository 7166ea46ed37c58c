//! Session collaborator surface. Session accounting lives outside the
//! workspace; the networking core only requests a session id once a peer has
//! authenticated.

use crate::device::DeviceId;
use std::fmt;

pub type SessionId = u64;

/// The kind of session being opened, matching the connection role that
/// authenticated the peer.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SessionType {
    Command,
    Data,
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionType::Command => f.write_str("command"),
            SessionType::Data => f.write_str("data"),
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum SessionError {
    /// The supplied password did not match the device's stored secret.
    AuthenticationFailed,
    /// The session collaborator refused or cannot issue sessions right now.
    Unavailable,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionError::AuthenticationFailed => f.write_str("authentication failed"),
            SessionError::Unavailable => f.write_str("session management unavailable"),
        }
    }
}

/// Session issuing capability.
pub trait SessionAccess: Send + Sync {
    /// Verifies the supplied peer password and opens a new session.
    fn open_session(
        &self,
        device: &DeviceId,
        raw_password: &[u8],
        kind: SessionType,
    ) -> Result<SessionId, SessionError>;
}
