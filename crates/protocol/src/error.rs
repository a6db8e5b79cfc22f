use core::error;
use core::fmt;

use std::io;

use crate::unit::Unit;

#[non_exhaustive]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    /// Create a new `Error` with the specified kind.
    #[inline]
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind }
    }

    /// Test if the error is a read deadline expiry.
    #[inline]
    pub fn is_timed_out(&self) -> bool {
        matches!(self.kind, ErrorKind::TimedOut)
    }

    /// Test if the error indicates that the peer has closed its end of the
    /// channel.
    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self.kind, ErrorKind::Closed)
    }
}

impl From<ErrorKind> for Error {
    #[inline]
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(e: io::Error) -> Self {
        Error::new(ErrorKind::Io(e))
    }
}

#[derive(Debug)]
pub(crate) enum ErrorKind {
    Io(io::Error),
    TimedOut,
    Closed,
    MalformedString,
    BadMagic { expected: u32, actual: u32 },
    UnknownDirection(u8),
    UnknownUnit(u8),
    UnknownOp(u8),
    InvalidValue { unit: Unit },
}

impl error::Error for Error {
    #[inline]
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Debug for Error {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}

impl fmt::Display for Error {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::Io(..) => write!(f, "I/O error"),
            ErrorKind::TimedOut => write!(f, "Read deadline expired"),
            ErrorKind::Closed => write!(f, "Channel closed by peer"),
            ErrorKind::MalformedString => write!(f, "Malformed string frame"),
            ErrorKind::BadMagic { expected, actual } => {
                write!(f, "Bad magic: expected {expected:#010x}, got {actual:#010x}")
            }
            ErrorKind::UnknownDirection(raw) => write!(f, "Unknown pipe direction {raw}"),
            ErrorKind::UnknownUnit(raw) => write!(f, "Unknown data unit {raw}"),
            ErrorKind::UnknownOp(raw) => write!(f, "Unknown command opcode {raw}"),
            ErrorKind::InvalidValue { unit } => {
                write!(f, "Value does not parse as {}", unit.name())
            }
        }
    }
}
