mod framed_read;
mod framed_write;

pub use self::framed_read::FramedRead;
pub use self::framed_write::FramedWrite;

use crate::error::Reason;
use crate::frame::StreamId;

use std::{fmt, io};

/// The fixed 24-byte sequence a client must send first on a new connection.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Errors raised while reading frames off the wire.
#[derive(Debug)]
pub enum RecvError {
    /// The connection is unrecoverable.
    Connection(Reason),

    /// Only the named stream is affected; the connection survives.
    Stream { id: StreamId, reason: Reason },

    /// The underlying byte channel failed.
    Io(io::Error),
}

impl From<io::Error> for RecvError {
    fn from(src: io::Error) -> RecvError {
        RecvError::Io(src)
    }
}

impl fmt::Display for RecvError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecvError::Connection(reason) => write!(fmt, "connection error: {}", reason),
            RecvError::Stream { id, reason } => {
                write!(fmt, "stream {} error: {}", id, reason)
            }
            RecvError::Io(err) => err.fmt(fmt),
        }
    }
}
