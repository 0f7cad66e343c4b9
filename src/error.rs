use core::fmt;

use smoltcp::{
    socket::udp::{BindError, RecvError, SendError},
    wire::IpEndpoint,
};

use crate::packet::{self, ErrorCode, Message, Opcode};

#[cfg(feature = "std")]
use std::io::{Error as IoError, ErrorKind as IoErrorKind};

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    Bind(BindError),
    Send(SendError),
    Recv(RecvError),
    /// An invalid TID.
    InvalidAddr(IpEndpoint),
    /// A datagram shorter than the header or longer than one block.
    Length(usize),
    /// An opcode outside the five packet types.
    Opcode(u16),
    /// A request with a missing, empty or non-netascii field.
    Malformed,
    /// A transfer mode other than octet.
    Mode,
    /// A packet that doesn't fit the transfer's role.
    Unexpected(Opcode),
    /// The peer aborted the transfer with an ERROR packet.
    Remote(ErrorCode),
    /// No ephemeral port is left for a new transfer.
    PortsExhausted,
    /// The session limit is reached.
    Busy,
    /// A configuration value is out of range.
    Config(&'static str),
    #[cfg(feature = "std")]
    Io(IoError),
    #[cfg(feature = "std")]
    Toml(toml::de::Error),
}

impl Error {
    /// The ERROR packet to send the peer when this error ends a transfer, or
    /// `None` when nothing should be sent.
    pub fn reply(&self) -> Option<(ErrorCode, Message)> {
        let code = match self {
            Error::Bind(_) | Error::Send(_) | Error::Recv(_) | Error::Remote(_) => return None,
            Error::InvalidAddr(_) => ErrorCode::UnknownTransferId,
            Error::Length(_) | Error::Opcode(_) | Error::Malformed | Error::Unexpected(_) => {
                ErrorCode::IllegalOperation
            }
            Error::Mode | Error::PortsExhausted | Error::Busy | Error::Config(_) => {
                ErrorCode::NotDefined
            }
            #[cfg(feature = "std")]
            Error::Io(err) => io_code(err),
            #[cfg(feature = "std")]
            Error::Toml(_) => ErrorCode::NotDefined,
        };
        Some((code, packet::message(format_args!("{self}"))))
    }
}

#[cfg(feature = "std")]
fn io_code(err: &IoError) -> ErrorCode {
    #[cfg(unix)]
    {
        if let Some(libc::ENOSPC | libc::ENOMEM | libc::ENFILE | libc::EDQUOT) = err.raw_os_error() {
            return ErrorCode::DiskFull;
        }
    }
    match err.kind() {
        IoErrorKind::NotFound => ErrorCode::FileNotFound,
        IoErrorKind::PermissionDenied => ErrorCode::AccessViolation,
        IoErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
        IoErrorKind::OutOfMemory => ErrorCode::DiskFull,
        _ => ErrorCode::NotDefined,
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Bind(err) => write!(f, "bind: {err:?}"),
            Error::Send(err) => write!(f, "send: {err:?}"),
            Error::Recv(err) => write!(f, "recv: {err:?}"),
            Error::InvalidAddr(_) => f.write_str("Unknown transfer ID"),
            Error::Length(len) => write!(f, "Invalid packet length {len}"),
            Error::Opcode(op) => write!(f, "Invalid opcode {op}"),
            Error::Malformed => f.write_str("Malformed request"),
            Error::Mode => f.write_str("Unsupported transfer mode"),
            Error::Unexpected(op) => write!(f, "Unexpected {op} for this transfer ID"),
            Error::Remote(code) => write!(f, "peer aborted: {code}"),
            Error::PortsExhausted => f.write_str("No transfer ports available"),
            Error::Busy => f.write_str("Too many transfers"),
            Error::Config(what) => write!(f, "invalid configuration: {what}"),
            #[cfg(feature = "std")]
            Error::Io(err) => match io_code(err) {
                ErrorCode::NotDefined => write!(f, "{err}"),
                code => f.write_str(code.default_message()),
            },
            #[cfg(feature = "std")]
            Error::Toml(err) => write!(f, "config: {err}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Toml(err) => Some(err),
            _ => None,
        }
    }
}

impl From<BindError> for Error {
    fn from(value: BindError) -> Self {
        Self::Bind(value)
    }
}

impl From<RecvError> for Error {
    fn from(value: RecvError) -> Self {
        Self::Recv(value)
    }
}

impl From<SendError> for Error {
    fn from(value: SendError) -> Self {
        Self::Send(value)
    }
}

#[cfg(feature = "std")]
impl From<IoError> for Error {
    fn from(value: IoError) -> Self {
        Self::Io(value)
    }
}

#[cfg(feature = "std")]
impl From<toml::de::Error> for Error {
    fn from(value: toml::de::Error) -> Self {
        Self::Toml(value)
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_codes() {
        let reply = |kind| Error::Io(IoError::from(kind)).reply().unwrap().0;
        assert_eq!(reply(IoErrorKind::NotFound), ErrorCode::FileNotFound);
        assert_eq!(reply(IoErrorKind::PermissionDenied), ErrorCode::AccessViolation);
        assert_eq!(reply(IoErrorKind::AlreadyExists), ErrorCode::FileAlreadyExists);
        assert_eq!(reply(IoErrorKind::OutOfMemory), ErrorCode::DiskFull);
        assert_eq!(reply(IoErrorKind::BrokenPipe), ErrorCode::NotDefined);
    }

    #[cfg(unix)]
    #[test]
    fn no_space_is_disk_full() {
        let err = Error::Io(IoError::from_raw_os_error(libc::ENOSPC));
        assert_eq!(err.reply().unwrap().0, ErrorCode::DiskFull);
    }

    #[test]
    fn catch_all_carries_io_description() {
        let err = Error::Io(IoError::new(IoErrorKind::Other, "device wedged"));
        let (code, msg) = err.reply().unwrap();
        assert_eq!(code, ErrorCode::NotDefined);
        assert_eq!(msg.as_str(), "device wedged");
    }

    #[test]
    fn transport_errors_are_not_reported() {
        assert!(Error::Send(SendError::BufferFull).reply().is_none());
        assert!(Error::Remote(ErrorCode::DiskFull).reply().is_none());
    }

    #[test]
    fn foreign_sender_gets_unknown_transfer_id() {
        use smoltcp::wire::IpAddress;

        let from = IpEndpoint::new(IpAddress::v4(10, 0, 0, 9), 4000);
        let (code, msg) = Error::InvalidAddr(from).reply().unwrap();
        assert_eq!(code, ErrorCode::UnknownTransferId);
        assert_eq!(msg.as_str(), "Unknown transfer ID");
    }

    #[test]
    fn protocol_violations_are_illegal() {
        let (code, _) = Error::Unexpected(Opcode::Data).reply().unwrap();
        assert_eq!(code, ErrorCode::IllegalOperation);
        let (code, msg) = Error::Length(3).reply().unwrap();
        assert_eq!(code, ErrorCode::IllegalOperation);
        assert_eq!(msg.as_str(), "Invalid packet length 3");
    }
}
