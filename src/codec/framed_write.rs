use crate::codec::PREFACE;
use crate::error::Reason;
use crate::frame::{self, Head, HeaderField, Kind, Settings, StreamId};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use std::cmp;
use std::io;

const END_STREAM: u8 = 0x1;
const END_HEADERS: u8 = 0x4;
const ACK_FLAG: u8 = 0x1;

/// Initialize the connection with this amount of write buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 32 * 1_024;

/// Encodes frames into an internal buffer and flushes them to the byte
/// channel in batches. Owns the HPACK encoder. One instance exists per
/// connection, driven only by the writer task, which is what keeps
/// HEADERS-before-DATA ordering per stream.
pub struct FramedWrite<T> {
    /// Upstream `AsyncWrite`
    inner: T,

    /// HPACK encoder
    hpack: fluke_hpack::Encoder<'static>,

    /// Write buffer
    buf: BytesMut,

    /// Max frame size, this is specified by the peer
    max_frame_size: u32,
}

impl<T> FramedWrite<T>
where
    T: AsyncWrite + Unpin,
{
    pub fn new(inner: T, capacity: usize) -> FramedWrite<T> {
        FramedWrite {
            inner,
            hpack: fluke_hpack::Encoder::new(),
            buf: BytesMut::with_capacity(cmp::max(capacity, DEFAULT_BUFFER_CAPACITY)),
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Queues the client connection preface.
    pub fn write_preface(&mut self) {
        trace!("encoding connection preface");
        self.buf.extend_from_slice(PREFACE);
    }

    pub fn write_settings(&mut self, settings: &Settings) {
        settings.encode(&mut self.buf);
        trace!("encoded settings; buffered={}B", self.buf.len());
    }

    pub fn write_settings_ack(&mut self) {
        Settings::ack().encode(&mut self.buf);
    }

    pub fn write_ping(&mut self, ack: bool, payload: [u8; 8]) {
        trace!("encoding PING; ack={}", ack);
        let head = Head::new(Kind::Ping, if ack { ACK_FLAG } else { 0 }, StreamId::ZERO);
        head.encode(8, &mut self.buf);
        self.buf.extend_from_slice(&payload);
    }

    pub fn write_window_update(&mut self, stream_id: StreamId, increment: u32) {
        trace!(
            "encoding WINDOW_UPDATE; stream={} increment={}",
            stream_id,
            increment
        );
        let head = Head::new(Kind::WindowUpdate, 0, stream_id);
        head.encode(4, &mut self.buf);
        self.buf.put_u32(increment);
    }

    pub fn write_rst_stream(&mut self, stream_id: StreamId, reason: Reason) {
        trace!("encoding RST_STREAM; stream={} reason={:?}", stream_id, reason);
        let head = Head::new(Kind::Reset, 0, stream_id);
        head.encode(4, &mut self.buf);
        self.buf.put_u32(reason.into());
    }

    /// Encodes one HEADERS frame, splitting the header block into
    /// CONTINUATION frames when it exceeds the peer's max frame size.
    pub fn write_headers(&mut self, stream_id: StreamId, fields: &[HeaderField], end_stream: bool) {
        let block = self
            .hpack
            .encode(fields.iter().map(|f| (f.name.as_bytes(), f.value.as_bytes())));

        let max = self.max_frame_size as usize;
        let first_len = cmp::min(block.len(), max);
        let one_frame = first_len == block.len();

        let mut flags = 0;
        if end_stream {
            flags |= END_STREAM;
        }
        if one_frame {
            flags |= END_HEADERS;
        }

        trace!(
            "encoding HEADERS; stream={} fields={} end_stream={}",
            stream_id,
            fields.len(),
            end_stream
        );
        Head::new(Kind::Headers, flags, stream_id).encode(first_len, &mut self.buf);
        self.buf.extend_from_slice(&block[..first_len]);

        let mut rest = &block[first_len..];
        while !rest.is_empty() {
            let len = cmp::min(rest.len(), max);
            let flags = if len == rest.len() { END_HEADERS } else { 0 };
            Head::new(Kind::Continuation, flags, stream_id).encode(len, &mut self.buf);
            self.buf.extend_from_slice(&rest[..len]);
            rest = &rest[len..];
        }
    }

    /// Encodes one DATA frame carrying `hdr` then `data`. The caller bounds
    /// `hdr.len() + data.len()` by the peer's max frame size.
    pub fn write_data(&mut self, stream_id: StreamId, end_stream: bool, hdr: &[u8], data: &[u8]) {
        let len = hdr.len() + data.len();
        debug_assert!(len <= self.max_frame_size as usize);

        let flags = if end_stream { END_STREAM } else { 0 };
        Head::new(Kind::Data, flags, stream_id).encode(len, &mut self.buf);
        self.buf.extend_from_slice(hdr);
        self.buf.extend_from_slice(data);
    }

    /// Writes the buffered frames to the channel and flushes it.
    pub async fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            trace!("flushing {}B", self.buf.len());
            self.inner.write_all(&self.buf).await?;
            self.buf.clear();
        }
        self.inner.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.flush().await?;
        self.inner.shutdown().await
    }

    /// Bytes encoded but not yet flushed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn set_max_frame_size(&mut self, val: u32) {
        assert!((frame::DEFAULT_MAX_FRAME_SIZE..=frame::MAX_MAX_FRAME_SIZE).contains(&val));
        self.max_frame_size = val;
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }
}
