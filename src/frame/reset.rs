use crate::error::Reason;
use crate::frame::{Error, Head, StreamId};

/// A RST_STREAM frame, terminating a single stream.
#[derive(Debug, Clone, Copy)]
pub struct Reset {
    stream_id: StreamId,
    error_code: Reason,
}

impl Reset {
    pub fn new(stream_id: StreamId, error_code: Reason) -> Reset {
        Reset {
            stream_id,
            error_code,
        }
    }

    pub fn load(head: Head, payload: &[u8]) -> Result<Reset, Error> {
        if head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }
        // A RST_STREAM frame with a length other than 4 octets MUST be
        // treated as a connection error of type FRAME_SIZE_ERROR.
        if payload.len() != 4 {
            return Err(Error::BadFrameSize);
        }

        Ok(Reset {
            stream_id: head.stream_id(),
            error_code: Reason::from(unpack_octets_4!(payload, 0, u32)),
        })
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn reason(&self) -> Reason {
        self.error_code
    }
}
