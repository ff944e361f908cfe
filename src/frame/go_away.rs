use crate::error::Reason;
use crate::frame::{Error, Head, StreamId};

use bytes::Bytes;

/// A GOAWAY frame: the peer commits to processing no stream with an id above
/// `last_stream_id`. Servers use the debug data to explain themselves
/// (e.g. `too_many_pings`).
#[derive(Debug, Clone)]
pub struct GoAway {
    last_stream_id: StreamId,
    error_code: Reason,
    debug_data: Bytes,
}

impl GoAway {
    pub fn new(last_stream_id: StreamId, error_code: Reason) -> GoAway {
        GoAway {
            last_stream_id,
            error_code,
            debug_data: Bytes::new(),
        }
    }

    pub fn load(head: Head, payload: Bytes) -> Result<GoAway, Error> {
        // The GOAWAY frame applies to the connection, not a specific stream.
        if !head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }
        if payload.len() < 8 {
            return Err(Error::BadFrameSize);
        }

        let last_stream_id = StreamId::new(unpack_octets_4!(payload, 0, u32));
        let error_code = Reason::from(unpack_octets_4!(payload, 4, u32));

        Ok(GoAway {
            last_stream_id,
            error_code,
            debug_data: payload.slice(8..),
        })
    }

    pub fn last_stream_id(&self) -> StreamId {
        self.last_stream_id
    }

    pub fn reason(&self) -> Reason {
        self.error_code
    }

    pub fn debug_data(&self) -> &Bytes {
        &self.debug_data
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::Kind;

    #[test]
    fn load_with_debug_data() {
        let mut payload = vec![0, 0, 0, 5, 0, 0, 0, 11];
        payload.extend_from_slice(b"too_many_pings");

        let head = Head::new(Kind::GoAway, 0, StreamId::ZERO);
        let goaway = GoAway::load(head, Bytes::from(payload)).unwrap();

        assert_eq!(goaway.last_stream_id(), StreamId::new(5));
        assert_eq!(goaway.reason(), Reason::ENHANCE_YOUR_CALM);
        assert_eq!(&goaway.debug_data()[..], b"too_many_pings");
    }

    #[test]
    fn load_short_payload() {
        let head = Head::new(Kind::GoAway, 0, StreamId::ZERO);
        assert!(matches!(
            GoAway::load(head, Bytes::from_static(&[0, 0, 0])),
            Err(Error::BadFrameSize)
        ));
    }
}
