use crate::frame::{Error, Head, StreamId};

use bytes::Bytes;

const END_STREAM: u8 = 0x1;
const PADDED: u8 = 0x8;

/// A DATA frame, with any padding already validated and stripped.
#[derive(Debug)]
pub struct Data {
    stream_id: StreamId,
    data: Bytes,
    end_stream: bool,

    /// Length of the payload as it appeared on the wire, including padding.
    /// Flow control accounts for the padded size, not the stripped one.
    flow_len: u32,
}

impl Data {
    pub fn load(head: Head, mut payload: Bytes) -> Result<Data, Error> {
        // DATA frames MUST be associated with a stream. If a DATA frame is
        // received whose stream identifier field is 0x0, the recipient MUST
        // respond with a connection error (Section 5.4.1) of type
        // PROTOCOL_ERROR.
        if head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }

        let flow_len = payload.len() as u32;

        if head.flag() & PADDED == PADDED {
            if payload.is_empty() {
                return Err(Error::TooMuchPadding);
            }
            let pad_len = payload[0] as usize;
            if pad_len >= payload.len() {
                // If the length of the padding is the length of the frame
                // payload or greater, the recipient MUST treat this as a
                // connection error of type PROTOCOL_ERROR.
                return Err(Error::TooMuchPadding);
            }
            let _ = payload.split_to(1);
            payload.truncate(payload.len() - pad_len);
        }

        Ok(Data {
            stream_id: head.stream_id(),
            data: payload,
            end_stream: head.flag() & END_STREAM == END_STREAM,
            flow_len,
        })
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn is_end_stream(&self) -> bool {
        self.end_stream
    }

    /// Bytes charged against the flow-control windows: payload plus padding.
    pub fn flow_len(&self) -> u32 {
        self.flow_len
    }

    pub fn payload(&self) -> &Bytes {
        &self.data
    }

    pub fn into_payload(self) -> Bytes {
        self.data
    }
}
