use crate::status::Status;

use std::borrow::Cow;
use std::sync::Arc;
use std::{fmt, io};

/// HTTP/2 error codes.
///
/// Error codes are 32-bit fields that are used in RST_STREAM and GOAWAY
/// frames to convey the reasons for the stream or connection error.
#[derive(PartialEq, Eq, Clone, Copy)]
pub struct Reason(u32);

impl Reason {
    /// The associated condition is not a result of an error.
    pub const NO_ERROR: Reason = Reason(0);
    /// The endpoint detected an unspecific protocol error.
    pub const PROTOCOL_ERROR: Reason = Reason(1);
    /// The endpoint encountered an unexpected internal error.
    pub const INTERNAL_ERROR: Reason = Reason(2);
    /// The endpoint detected that its peer violated the flow-control protocol.
    pub const FLOW_CONTROL_ERROR: Reason = Reason(3);
    /// The endpoint sent a SETTINGS frame but did not receive a response in
    /// a timely manner.
    pub const SETTINGS_TIMEOUT: Reason = Reason(4);
    /// The endpoint received a frame after a stream was half-closed.
    pub const STREAM_CLOSED: Reason = Reason(5);
    /// The endpoint received a frame with an invalid size.
    pub const FRAME_SIZE_ERROR: Reason = Reason(6);
    /// The endpoint refused the stream prior to performing any application
    /// processing.
    pub const REFUSED_STREAM: Reason = Reason(7);
    /// Used by the endpoint to indicate that the stream is no longer needed.
    pub const CANCEL: Reason = Reason(8);
    /// The endpoint is unable to maintain the header compression context for
    /// the connection.
    pub const COMPRESSION_ERROR: Reason = Reason(9);
    /// The connection established in response to a CONNECT request was reset
    /// or abnormally closed.
    pub const CONNECT_ERROR: Reason = Reason(10);
    /// The endpoint detected that its peer is exhibiting a behavior that
    /// might be generating excessive load.
    pub const ENHANCE_YOUR_CALM: Reason = Reason(11);
    /// The underlying transport has properties that do not meet minimum
    /// security requirements.
    pub const INADEQUATE_SECURITY: Reason = Reason(12);
    /// The endpoint requires that HTTP/1.1 be used instead of HTTP/2.
    pub const HTTP_1_1_REQUIRED: Reason = Reason(13);

    pub fn description(&self) -> &str {
        match self.0 {
            0 => "not a result of an error",
            1 => "unspecific protocol error detected",
            2 => "unexpected internal error encountered",
            3 => "flow-control protocol violated",
            4 => "settings ACK not received in timely manner",
            5 => "received frame when stream half-closed",
            6 => "frame with invalid size",
            7 => "refused stream before processing any application logic",
            8 => "stream no longer needed",
            9 => "unable to maintain the header compression context",
            10 => "connection established in response to a CONNECT request was reset or abnormally closed",
            11 => "detected excessive load generating behavior",
            12 => "security properties do not meet minimum requirements",
            13 => "endpoint requires HTTP/1.1",
            _ => "unknown reason",
        }
    }
}

impl From<u32> for Reason {
    fn from(src: u32) -> Reason {
        Reason(src)
    }
}

impl From<Reason> for u32 {
    fn from(src: Reason) -> u32 {
        src.0
    }
}

impl fmt::Debug for Reason {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let name = match self.0 {
            0 => "NO_ERROR",
            1 => "PROTOCOL_ERROR",
            2 => "INTERNAL_ERROR",
            3 => "FLOW_CONTROL_ERROR",
            4 => "SETTINGS_TIMEOUT",
            5 => "STREAM_CLOSED",
            6 => "FRAME_SIZE_ERROR",
            7 => "REFUSED_STREAM",
            8 => "CANCEL",
            9 => "COMPRESSION_ERROR",
            10 => "CONNECT_ERROR",
            11 => "ENHANCE_YOUR_CALM",
            12 => "INADEQUATE_SECURITY",
            13 => "HTTP_1_1_REQUIRED",
            other => return write!(fmt, "Reason({})", other),
        };
        fmt.write_str(name)
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(self.description())
    }
}

/// An error that takes down the whole transport.
///
/// Connection errors converge to UNAVAILABLE for every stream that was still
/// active when the transport closed. An *ignorable* connection error is an
/// orderly shutdown (graceful close or GOAWAY with no remaining streams); the
/// owning pool should not treat it as a connection failure.
#[derive(Debug, Clone)]
pub struct ConnectionError {
    message: Cow<'static, str>,
    reason: Option<Reason>,
    io: Option<Arc<io::Error>>,
    ignorable: bool,
}

impl ConnectionError {
    pub(crate) fn new(message: impl Into<Cow<'static, str>>) -> ConnectionError {
        ConnectionError {
            message: message.into(),
            reason: None,
            io: None,
            ignorable: false,
        }
    }

    pub(crate) fn ignorable(message: impl Into<Cow<'static, str>>) -> ConnectionError {
        ConnectionError {
            ignorable: true,
            ..ConnectionError::new(message)
        }
    }

    pub(crate) fn proto(reason: Reason) -> ConnectionError {
        ConnectionError {
            reason: Some(reason),
            ..ConnectionError::new(reason.description().to_owned())
        }
    }

    /// The transport is closing or already closed.
    pub(crate) fn conn_closing() -> ConnectionError {
        ConnectionError::new("transport is closing")
    }

    /// Returns true if the owning pool may treat this shutdown as orderly.
    pub fn is_ignorable(&self) -> bool {
        self.ignorable
    }

    pub fn reason(&self) -> Option<Reason> {
        self.reason
    }
}

impl From<io::Error> for ConnectionError {
    fn from(src: io::Error) -> ConnectionError {
        ConnectionError {
            message: Cow::Borrowed("connection I/O error"),
            reason: None,
            io: Some(Arc::new(src)),
            ignorable: false,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "connection error: {}", self.message)?;
        if let Some(ref io) = self.io {
            write!(fmt, ": {}", io)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConnectionError {}

/// The reason derived from the first GOAWAY frame, surfaced to the owner via
/// the `on_go_away` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoAwayReason {
    /// No reason could be derived from the GOAWAY frame.
    NoReason,
    /// ENHANCE_YOUR_CALM with "too_many_pings" debug data: the server thinks
    /// we are pinging too aggressively.
    TooManyPings,
}

/// Top-level error surfaced by transport operations.
///
/// Per-stream failures carry a `Status` (they become the stream's final
/// status); transport-wide failures carry a `ConnectionError`.
#[derive(Debug, Clone)]
pub enum Error {
    Connection(ConnectionError),
    Status(Status),
}

impl Error {
    pub fn status(&self) -> Option<&Status> {
        match self {
            Error::Status(status) => Some(status),
            Error::Connection(_) => None,
        }
    }
}

impl From<ConnectionError> for Error {
    fn from(src: ConnectionError) -> Error {
        Error::Connection(src)
    }
}

impl From<Status> for Error {
    fn from(src: Status) -> Error {
        Error::Status(src)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Connection(e) => e.fmt(fmt),
            Error::Status(s) => s.fmt(fmt),
        }
    }
}

impl std::error::Error for Error {}
