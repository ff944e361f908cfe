use crate::codec::RecvError;
use crate::error::Reason;
use crate::frame::{self, Frame, Head, Kind, HEADER_LEN};

use bytes::BytesMut;
use futures_core::Stream;
use tokio::io::AsyncRead;
use tokio_util::codec::length_delimited::{self, LengthDelimitedCodec, LengthDelimitedCodecError};
use tracing::{debug, trace};

use std::future::poll_fn;
use std::io;
use std::pin::Pin;

// 16 MB "sane default" taken from golang http2
const DEFAULT_MAX_HEADER_LIST_SIZE: usize = 16 << 20;

/// Reads whole frames off the byte channel: length-delimited chunking,
/// frame parsing, HPACK decoding and CONTINUATION collapsing. The returned
/// HEADERS frames are always complete "meta-headers".
pub struct FramedRead<T> {
    inner: tokio_util::codec::FramedRead<T, LengthDelimitedCodec>,

    // hpack decoder state
    hpack: fluke_hpack::Decoder<'static>,

    max_header_list_size: usize,

    partial: Option<Partial>,
}

/// Partially loaded headers frame
#[derive(Debug)]
struct Partial {
    /// Frame awaiting its remaining header block fragments.
    frame: frame::Headers,

    /// Accumulated header block.
    buf: BytesMut,
}

impl<T> FramedRead<T>
where
    T: AsyncRead + Unpin,
{
    pub fn new(io: T) -> FramedRead<T> {
        let inner = length_delimited::Builder::new()
            .big_endian()
            .length_field_length(3)
            .length_adjustment(HEADER_LEN as isize)
            .num_skip(0)
            .max_frame_length(frame::DEFAULT_MAX_FRAME_SIZE as usize + HEADER_LEN)
            .new_read(io);

        // The decoder's dynamic table is bounded by the header table size we
        // advertise, which is never anything but the protocol default.
        let mut hpack = fluke_hpack::Decoder::new();
        hpack.set_max_table_size(frame::DEFAULT_SETTINGS_HEADER_TABLE_SIZE);

        FramedRead {
            inner,
            hpack,
            max_header_list_size: DEFAULT_MAX_HEADER_LIST_SIZE,
            partial: None,
        }
    }

    /// Reads the next complete frame. `None` means the peer closed the
    /// channel.
    pub async fn next(&mut self) -> Option<Result<Frame, RecvError>> {
        loop {
            let bytes = match poll_fn(|cx| Pin::new(&mut self.inner).poll_next(cx)).await {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => return Some(Err(map_err(e))),
                None => return None,
            };

            trace!("read {}B chunk", bytes.len());
            match self.decode_frame(bytes) {
                Ok(Some(frame)) => {
                    trace!("received; frame={:?}", frame);
                    return Some(Ok(frame));
                }
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }

    fn decode_frame(&mut self, mut bytes: BytesMut) -> Result<Option<Frame>, RecvError> {
        use self::RecvError::*;

        // Parse the head
        let head = Head::parse(&bytes);
        let kind = head.kind();

        if self.partial.is_some() && kind != Kind::Continuation {
            debug!(
                "connection error PROTOCOL_ERROR -- expected CONTINUATION, got {:?}",
                kind
            );
            return Err(Connection(Reason::PROTOCOL_ERROR));
        }

        let frame = match kind {
            Kind::Settings => {
                let res = frame::Settings::load(head, &bytes[HEADER_LEN..]);

                res.map_err(|e| {
                    debug!("failed to load SETTINGS frame; err={:?}", e);
                    Connection(e.reason())
                })?
                .into()
            }
            Kind::Ping => {
                let _ = bytes.split_to(HEADER_LEN);
                let res = frame::Ping::load(head, bytes.freeze());

                res.map_err(|e| {
                    debug!("failed to load PING frame; err={:?}", e);
                    Connection(e.reason())
                })?
                .into()
            }
            Kind::WindowUpdate => {
                let frame = frame::WindowUpdate::load(head, &bytes[HEADER_LEN..])
                    .map_err(|e| Connection(e.reason()))?;

                // A WINDOW_UPDATE with a zero increment is a PROTOCOL_ERROR:
                // on the connection it takes the connection down, on a stream
                // only the stream.
                if frame.size_increment() == 0 {
                    if frame.stream_id().is_zero() {
                        return Err(Connection(Reason::PROTOCOL_ERROR));
                    }
                    return Err(Stream {
                        id: frame.stream_id(),
                        reason: Reason::PROTOCOL_ERROR,
                    });
                }

                frame.into()
            }
            Kind::Data => {
                let _ = bytes.split_to(HEADER_LEN);
                let res = frame::Data::load(head, bytes.freeze());

                res.map_err(|e| {
                    debug!("failed to load DATA frame; err={:?}", e);
                    Connection(e.reason())
                })?
                .into()
            }
            Kind::Headers => {
                let _ = bytes.split_to(HEADER_LEN);

                // Parse the header frame w/o touching the header block.
                let (mut headers, payload) = match frame::Headers::load(head, bytes) {
                    Ok(res) => res,
                    Err(e) => {
                        debug!("failed to load HEADERS frame; err={:?}", e);
                        return Err(Connection(e.reason()));
                    }
                };

                if !headers.is_end_headers() {
                    // Wait for the CONTINUATION frames.
                    self.partial = Some(Partial {
                        frame: headers,
                        buf: payload,
                    });
                    return Ok(None);
                }

                self.load_hpack(&mut headers, &payload)?;
                headers.into()
            }
            Kind::Continuation => {
                let is_end_headers = (head.flag() & 0x4) == 0x4;

                let mut partial = match self.partial.take() {
                    Some(partial) => partial,
                    None => {
                        debug!("received unexpected CONTINUATION frame");
                        return Err(Connection(Reason::PROTOCOL_ERROR));
                    }
                };

                // The stream identifiers must match
                if partial.frame.stream_id() != head.stream_id() {
                    debug!("CONTINUATION frame stream ID does not match previous frame stream ID");
                    return Err(Connection(Reason::PROTOCOL_ERROR));
                }

                partial.buf.extend_from_slice(&bytes[HEADER_LEN..]);

                // An unterminated header block must not buffer more than the
                // advertised header list bound. Aborting before HPACK runs
                // would desynchronize the dynamic table, so this is fatal for
                // the connection.
                if partial.buf.len() > self.max_header_list_size {
                    return Err(Connection(Reason::COMPRESSION_ERROR));
                }

                if !is_end_headers {
                    self.partial = Some(partial);
                    return Ok(None);
                }

                let mut headers = partial.frame;
                headers.set_end_headers();
                self.load_hpack(&mut headers, &partial.buf)?;
                headers.into()
            }
            Kind::Reset => {
                let res = frame::Reset::load(head, &bytes[HEADER_LEN..]);
                res.map_err(|e| Connection(e.reason()))?.into()
            }
            Kind::GoAway => {
                let _ = bytes.split_to(HEADER_LEN);
                let res = frame::GoAway::load(head, bytes.freeze());
                res.map_err(|e| Connection(e.reason()))?.into()
            }
            Kind::PushPromise => {
                // The client never enables push, so a PUSH_PROMISE is a
                // protocol violation by the server.
                debug!("received PUSH_PROMISE on a client connection");
                return Err(Connection(Reason::PROTOCOL_ERROR));
            }
            Kind::Priority => {
                // Stream prioritization is not supported; the frame is
                // parsed only far enough to discard it.
                return Ok(None);
            }
            Kind::Unknown => {
                // Unknown frames are ignored
                return Ok(None);
            }
        };

        Ok(Some(frame))
    }

    fn load_hpack(
        &mut self,
        headers: &mut frame::Headers,
        block: &BytesMut,
    ) -> Result<(), RecvError> {
        match headers.load_hpack(block, self.max_header_list_size, &mut self.hpack) {
            Ok(()) => Ok(()),
            Err(frame::Error::Hpack(e)) => {
                debug!("failed HPACK decoding; err={:?}", e);
                Err(RecvError::Connection(Reason::COMPRESSION_ERROR))
            }
            Err(e) => {
                debug!("malformed header block; err={:?}", e);
                Err(RecvError::Stream {
                    id: headers.stream_id(),
                    reason: Reason::PROTOCOL_ERROR,
                })
            }
        }
    }

    /// Updates the max frame size setting.
    ///
    /// Must be within 16,384 and 16,777,215.
    pub fn set_max_frame_size(&mut self, val: u32) {
        assert!((frame::DEFAULT_MAX_FRAME_SIZE..=frame::MAX_MAX_FRAME_SIZE).contains(&val));
        self.inner
            .decoder_mut()
            .set_max_frame_length(val as usize + HEADER_LEN);
    }

    /// Update the max header list size setting.
    pub fn set_max_header_list_size(&mut self, val: usize) {
        self.max_header_list_size = val;
    }
}

fn map_err(err: io::Error) -> RecvError {
    if let io::ErrorKind::InvalidData = err.kind() {
        if let Some(custom) = err.get_ref() {
            if custom.is::<LengthDelimitedCodecError>() {
                return RecvError::Connection(Reason::FRAME_SIZE_ERROR);
            }
        }
    }
    err.into()
}
