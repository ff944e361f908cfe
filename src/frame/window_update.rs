use crate::frame::{Error, Head, StreamId};

/// A WINDOW_UPDATE frame: credit extended on a stream, or on the connection
/// when the stream id is zero.
#[derive(Debug, Clone, Copy)]
pub struct WindowUpdate {
    stream_id: StreamId,
    size_increment: u32,
}

impl WindowUpdate {
    pub fn load(head: Head, payload: &[u8]) -> Result<WindowUpdate, Error> {
        if payload.len() != 4 {
            return Err(Error::BadFrameSize);
        }

        // The reserved high bit is masked off.
        let size_increment = unpack_octets_4!(payload, 0, u32) & !(1 << 31);

        Ok(WindowUpdate {
            stream_id: head.stream_id(),
            size_increment,
        })
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn size_increment(&self) -> u32 {
        self.size_increment
    }
}
