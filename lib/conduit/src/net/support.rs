use serde_derive::Deserialize;
use std::fmt;
use std::io;
use std::net;

/// Connection identifier local to a single `ConnectionManager`.
pub type RawConnectionId = u64;
/// Process-global connection identifier.
pub type ConnectionId = u64;
/// Short-lived identifier agreed out-of-band, correlating an INIT connection
/// with the first DATA connection.
pub type TransientConnectionId = u32;
/// Identifier of a `ConnectionManager` (one per listener endpoint).
pub type ConnectionManagerId = u32;
/// Identifier correlating an instruction request with its response.
pub type CommandId = u32;
/// Aggregate statistics counter.
pub type StatCounter = u64;

/// The logical purpose of a socket, fixed at construction time.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionRole {
    Command,
    Data,
    Init,
}

impl ConnectionRole {
    /// Single-byte wire code carried in the intent frame.
    #[inline]
    pub fn code(self) -> u8 {
        match self {
            ConnectionRole::Command => b'C',
            ConnectionRole::Data => b'D',
            ConnectionRole::Init => b'I',
        }
    }

    #[inline]
    pub fn from_code(code: u8) -> Option<ConnectionRole> {
        match code {
            b'C' => Some(ConnectionRole::Command),
            b'D' => Some(ConnectionRole::Data),
            b'I' => Some(ConnectionRole::Init),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionRole::Command => f.write_str("command"),
            ConnectionRole::Data => f.write_str("data"),
            ConnectionRole::Init => f.write_str("init"),
        }
    }
}

/// Primary connection lifecycle state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    Invalid,
    Established,
    Closed,
}

/// Diagnostic sub-state, orthogonal to the lifecycle state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionSubstate {
    None,
    Reading,
    Writing,
    Waiting,
    Failed,
    Dropped,
}

/// Which endpoint initiated the connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionInitiation {
    Local,
    Remote,
}

/// Setup progress of a pending connection inside a protocol handler.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SetupState {
    Initiated,
    RequestSent,
    RequestSentConfirmed,
    RequestReceived,
    ResponseSent,
    ResponseSentConfirmed,
    ResponseReceived,
    Failed,
    Completed,
}

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    /// The operation cannot make progress right now and should be retried.
    Wait,
    /// The operation failed and the owning connection must be torn down.
    Fatal(ErrorType),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorType {
    Io(io::ErrorKind),
    /// The 2-byte intent frame carried an unknown code or a role that does
    /// not match the receiving manager.
    IncorrectIntent,
    /// A message header announced a payload above the receiver's hard cap.
    HeaderOverflow,
    /// A payload exceeded a configured size limit.
    PayloadTooLarge,
    /// The echoed setup nonce did not match the one last sent.
    SignatureMismatch,
    /// AEAD authentication, signature verification or key handling failed.
    Crypto,
    /// A message arrived in a setup state that does not expect it.
    InvalidSetupState,
    /// An entry already exists where uniqueness is required.
    Duplicate,
    /// A device, transient id or connection was not found where required.
    NotFound,
    /// A pending entry outlived its deadline.
    Expired,
    /// Packet serialization or deserialization failed.
    Serialization,
    AddrParse,
    /// Construction-time configuration rejection.
    Config,
    /// The component is stopping and refuses new work.
    Shutdown,
}

/// Coarse error class, used for logging and failure accounting.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorClass {
    Io,
    Protocol,
    Crypto,
    State,
    Capacity,
    NotFound,
}

impl ErrorType {
    pub fn class(self) -> ErrorClass {
        match self {
            ErrorType::Io(_) => ErrorClass::Io,
            ErrorType::IncorrectIntent
            | ErrorType::HeaderOverflow
            | ErrorType::SignatureMismatch
            | ErrorType::Serialization
            | ErrorType::AddrParse => ErrorClass::Protocol,
            ErrorType::Crypto => ErrorClass::Crypto,
            ErrorType::InvalidSetupState
            | ErrorType::Duplicate
            | ErrorType::Expired
            | ErrorType::Config
            | ErrorType::Shutdown => ErrorClass::State,
            ErrorType::PayloadTooLarge => ErrorClass::Capacity,
            ErrorType::NotFound => ErrorClass::NotFound,
        }
    }

    /// Returns true for I/O failures that represent the remote peer going
    /// away, as opposed to a local or protocol fault.
    pub fn is_peer_termination(self) -> bool {
        match self {
            ErrorType::Io(kind) => match kind {
                io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe => true,
                _ => false,
            },
            _ => false,
        }
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NetworkError::Wait => f.write_str("wait"),
            NetworkError::Fatal(err) => write!(f, "fatal: {:?}", err),
        }
    }
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}

/// Augmented `io::Write` that is aware of the amount of remaining free capacity in the destination.
pub trait SizedWrite: io::Write {
    /// Remaining free capacity in the destination.
    fn free_capacity(&self) -> usize;
}

/// Augmented `io::Read` that is aware of the amount of remaining data in the source.
pub trait SizedRead: io::Read {
    /// Remaining data in the source.
    fn remaining_data(&self) -> usize;
}

impl SizedWrite for io::Cursor<&mut [u8]> {
    #[inline]
    fn free_capacity(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

impl SizedWrite for io::Cursor<Vec<u8>> {
    #[inline]
    fn free_capacity(&self) -> usize {
        usize::max_value() - self.position() as usize
    }
}

impl SizedRead for io::Cursor<&[u8]> {
    #[inline]
    fn remaining_data(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

/// Trait for manually serialized packets. Implementors must validate the
/// remaining free capacity in the stream upfront and only write into it if
/// all of their content fits.
pub trait Serialize {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()>;
}

/// Trait for manually deserialized packets.
pub trait Deserialize: Sized {
    fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<Self>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let err: NetworkError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, NetworkError::Wait);

        let err: NetworkError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert_eq!(err, NetworkError::Fatal(ErrorType::Io(io::ErrorKind::ConnectionReset)));
    }

    #[test]
    fn test_peer_termination_classification() {
        assert!(ErrorType::Io(io::ErrorKind::UnexpectedEof).is_peer_termination());
        assert!(ErrorType::Io(io::ErrorKind::ConnectionReset).is_peer_termination());
        assert!(ErrorType::Io(io::ErrorKind::ConnectionAborted).is_peer_termination());
        assert!(!ErrorType::Io(io::ErrorKind::PermissionDenied).is_peer_termination());
        assert!(!ErrorType::Crypto.is_peer_termination());
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(ErrorType::IncorrectIntent.class(), ErrorClass::Protocol);
        assert_eq!(ErrorType::Crypto.class(), ErrorClass::Crypto);
        assert_eq!(ErrorType::PayloadTooLarge.class(), ErrorClass::Capacity);
        assert_eq!(ErrorType::NotFound.class(), ErrorClass::NotFound);
        assert_eq!(ErrorType::InvalidSetupState.class(), ErrorClass::State);
        assert_eq!(ErrorType::Io(io::ErrorKind::Other).class(), ErrorClass::Io);
    }

    #[test]
    fn test_has_failed() {
        let ok: NetworkResult<()> = Ok(());
        let wait: NetworkResult<()> = Err(NetworkError::Wait);
        let fatal: NetworkResult<()> = Err(NetworkError::Fatal(ErrorType::Crypto));

        assert!(!ok.has_failed());
        assert!(!wait.has_failed());
        assert!(fatal.has_failed());
    }

    #[test]
    fn test_connection_role_codes() {
        for role in &[ConnectionRole::Command, ConnectionRole::Data, ConnectionRole::Init] {
            assert_eq!(ConnectionRole::from_code(role.code()), Some(*role));
        }
        assert_eq!(ConnectionRole::from_code(b'X'), None);
    }
}
