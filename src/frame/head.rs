use byteorder::{BigEndian, ByteOrder};
use bytes::BufMut;

use std::fmt;

/// The 9-byte header shared by every HTTP/2 frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Head {
    kind: Kind,
    flag: u8,
    stream_id: StreamId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Data = 0,
    Headers = 1,
    Priority = 2,
    Reset = 3,
    Settings = 4,
    PushPromise = 5,
    Ping = 6,
    GoAway = 7,
    WindowUpdate = 8,
    Continuation = 9,
    Unknown,
}

impl Kind {
    pub fn new(byte: u8) -> Kind {
        match byte {
            0 => Kind::Data,
            1 => Kind::Headers,
            2 => Kind::Priority,
            3 => Kind::Reset,
            4 => Kind::Settings,
            5 => Kind::PushPromise,
            6 => Kind::Ping,
            7 => Kind::GoAway,
            8 => Kind::WindowUpdate,
            9 => Kind::Continuation,
            _ => Kind::Unknown,
        }
    }
}

/// A stream identifier, a 31-bit value carried in the frame header.
///
/// Client-initiated streams use odd identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId(u32);

impl StreamId {
    pub const ZERO: StreamId = StreamId(0);

    /// The largest stream identifier, used by a first GOAWAY to mean
    /// "everything sent so far may still be processed".
    pub const MAX: StreamId = StreamId((1 << 31) - 1);

    pub fn new(id: u32) -> StreamId {
        StreamId(id & ((1 << 31) - 1))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_client_initiated(&self) -> bool {
        self.0 % 2 == 1
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl From<u32> for StreamId {
    fn from(src: u32) -> StreamId {
        StreamId::new(src)
    }
}

impl From<StreamId> for u32 {
    fn from(src: StreamId) -> u32 {
        src.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(fmt)
    }
}

impl Head {
    pub fn new(kind: Kind, flag: u8, stream_id: StreamId) -> Head {
        Head {
            kind,
            flag,
            stream_id,
        }
    }

    /// Parses a frame header from the first `HEADER_LEN` bytes of `buf`.
    ///
    /// The length field is not returned; the caller already sliced the
    /// payload off the wire with it.
    pub fn parse(buf: &[u8]) -> Head {
        Head {
            kind: Kind::new(buf[3]),
            flag: buf[4],
            stream_id: StreamId::new(BigEndian::read_u32(&buf[5..9])),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn flag(&self) -> u8 {
        self.flag
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn encode<B: BufMut>(&self, payload_len: usize, dst: &mut B) {
        debug_assert!(payload_len < 1 << 24);

        dst.put_uint(payload_len as u64, 3);
        dst.put_u8(self.kind as u8);
        dst.put_u8(self.flag);
        dst.put_u32(self.stream_id.0);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_round_trips_encode() {
        let head = Head::new(Kind::Settings, 0x1, StreamId::ZERO);
        let mut buf = Vec::new();
        head.encode(0, &mut buf);
        assert_eq!(buf.len(), crate::frame::HEADER_LEN);
        assert_eq!(Head::parse(&buf), head);
    }

    #[test]
    fn reserved_bit_is_masked() {
        let head = Head::new(Kind::Data, 0, StreamId::new(7));
        let mut buf = Vec::new();
        head.encode(3, &mut buf);
        // Force the reserved high bit on the wire.
        buf[5] |= 0x80;
        assert_eq!(Head::parse(&buf).stream_id(), StreamId::new(7));
    }
}
