//! RPC status codes and the trailer-carried `Status` type.
//!
//! A stream's outcome is a `Status` decoded from the `grpc-status` /
//! `grpc-message` trailers. HTTP/2 level failures (RST_STREAM codes, non-200
//! `:status`) are mapped onto status codes through the fixed tables below.

use crate::error::Reason;

use bytes::Bytes;
use percent_encoding::percent_decode_str;

use std::fmt;

/// Canonical RPC status codes, carried on the wire as `grpc-status` 0..16.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    pub fn from_i32(value: i32) -> Option<Code> {
        use self::Code::*;

        Some(match value {
            0 => Ok,
            1 => Cancelled,
            2 => Unknown,
            3 => InvalidArgument,
            4 => DeadlineExceeded,
            5 => NotFound,
            6 => AlreadyExists,
            7 => PermissionDenied,
            8 => ResourceExhausted,
            9 => FailedPrecondition,
            10 => Aborted,
            11 => OutOfRange,
            12 => Unimplemented,
            13 => Internal,
            14 => Unavailable,
            15 => DataLoss,
            16 => Unauthenticated,
            _ => return None,
        })
    }
}

impl fmt::Display for Code {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{:?}", self)
    }
}

/// Final status of a stream: code, message and the opaque
/// `grpc-status-details-bin` payload when the peer sent one.
#[derive(Debug, Clone)]
pub struct Status {
    code: Code,
    message: String,
    details_bin: Option<Bytes>,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Status {
        Status {
            code,
            message: message.into(),
            details_bin: None,
        }
    }

    pub fn ok() -> Status {
        Status::new(Code::Ok, "")
    }

    pub(crate) fn with_details(mut self, details: Bytes) -> Status {
        self.details_bin = Some(details);
        self
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Raw serialized details from `grpc-status-details-bin`, if any.
    /// Decoding the payload is the caller's concern.
    pub fn details_bin(&self) -> Option<&Bytes> {
        self.details_bin.as_ref()
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "rpc error: code = {} desc = {}", self.code, self.message)
    }
}

impl std::error::Error for Status {}

/// Business status carried in trailers by the application layer
/// (`biz-status` / `biz-extra`). Not a transport error: the RPC itself
/// completed and the final status is still whatever `grpc-status` says.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BizStatus {
    pub status_code: i32,
    pub message: String,
    /// Raw `biz-extra` value; the serialization is owned by the caller.
    pub extra: Option<String>,
}

/// Maps HTTP/2 error codes (RST_STREAM) to status codes.
pub(crate) fn code_from_http2(reason: Reason) -> Option<Code> {
    Some(match reason {
        Reason::NO_ERROR => Code::Internal,
        Reason::PROTOCOL_ERROR => Code::Internal,
        Reason::INTERNAL_ERROR => Code::Internal,
        Reason::FLOW_CONTROL_ERROR => Code::Internal,
        Reason::SETTINGS_TIMEOUT => Code::Internal,
        Reason::STREAM_CLOSED => Code::Internal,
        Reason::FRAME_SIZE_ERROR => Code::Internal,
        Reason::REFUSED_STREAM => Code::Unavailable,
        Reason::CANCEL => Code::Cancelled,
        Reason::COMPRESSION_ERROR => Code::Internal,
        Reason::CONNECT_ERROR => Code::Internal,
        Reason::ENHANCE_YOUR_CALM => Code::ResourceExhausted,
        Reason::INADEQUATE_SECURITY => Code::PermissionDenied,
        Reason::HTTP_1_1_REQUIRED => Code::Internal,
        _ => return None,
    })
}

/// Maps non-200 HTTP `:status` values to status codes.
pub(crate) fn code_from_http_status(status: u16) -> Code {
    match status {
        400 => Code::Internal,
        401 => Code::Unauthenticated,
        403 => Code::PermissionDenied,
        404 => Code::Unimplemented,
        429 | 502 | 503 | 504 => Code::Unavailable,
        _ => Code::Unknown,
    }
}

/// Unescapes a percent-encoded `grpc-message` trailer value. The client
/// only ever receives the header, so there is no encode direction here.
/// Invalid escapes decode lossily rather than failing the RPC over a
/// mangled error string.
pub(crate) fn decode_grpc_message(msg: &str) -> String {
    percent_decode_str(msg).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn code_round_trips_all_registered_values() {
        for raw in 0..=16 {
            let code = Code::from_i32(raw).unwrap();
            assert_eq!(code as i32, raw);
        }
        assert!(Code::from_i32(17).is_none());
        assert!(Code::from_i32(-1).is_none());
    }

    #[test]
    fn refused_stream_maps_to_unavailable() {
        assert_eq!(
            code_from_http2(Reason::REFUSED_STREAM),
            Some(Code::Unavailable)
        );
        assert_eq!(code_from_http2(Reason::CANCEL), Some(Code::Cancelled));
        assert_eq!(code_from_http2(Reason::from(99)), None);
    }

    #[test]
    fn grpc_message_unescaping() {
        assert_eq!(decode_grpc_message("plain text"), "plain text");
        assert_eq!(decode_grpc_message("50%25"), "50%");
        assert_eq!(decode_grpc_message("tab%09here"), "tab\there");
        // Multi-byte characters arrive escaped byte by byte.
        assert_eq!(decode_grpc_message("se%C3%B1al perdida"), "señal perdida");
        // A stray '%' is passed through rather than rejected.
        assert_eq!(decode_grpc_message("50%"), "50%");
    }
}
