//! A scripted HTTP/2 server speaking raw frames over an in-memory duplex
//! channel, for driving the client transport end to end.

#![allow(dead_code)]

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub mod kind {
    pub const DATA: u8 = 0;
    pub const HEADERS: u8 = 1;
    pub const RST_STREAM: u8 = 3;
    pub const SETTINGS: u8 = 4;
    pub const PING: u8 = 6;
    pub const GOAWAY: u8 = 7;
    pub const WINDOW_UPDATE: u8 = 8;
}

pub mod setting {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;

#[derive(Debug, Clone)]
pub struct RawFrame {
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl RawFrame {
    pub fn is_end_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }

    pub fn settings(&self) -> Vec<(u16, u32)> {
        self.payload
            .chunks(6)
            .map(|c| {
                (
                    u16::from_be_bytes([c[0], c[1]]),
                    u32::from_be_bytes([c[2], c[3], c[4], c[5]]),
                )
            })
            .collect()
    }

    pub fn window_increment(&self) -> u32 {
        u32::from_be_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]) & 0x7fff_ffff
    }

    pub fn rst_code(&self) -> u32 {
        u32::from_be_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ])
    }
}

pub struct MockServer {
    io: DuplexStream,
    decoder: fluke_hpack::Decoder<'static>,
    encoder: fluke_hpack::Encoder<'static>,
}

impl MockServer {
    pub fn new(io: DuplexStream) -> MockServer {
        MockServer {
            io,
            decoder: fluke_hpack::Decoder::new(),
            encoder: fluke_hpack::Encoder::new(),
        }
    }

    /// Reads and checks the 24-byte client preface.
    pub async fn expect_preface(&mut self) {
        let mut buf = [0u8; 24];
        self.io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], PREFACE, "client preface mismatch");
    }

    pub async fn read_frame(&mut self) -> RawFrame {
        let mut head = [0u8; 9];
        self.io.read_exact(&mut head).await.unwrap();
        let len = u32::from_be_bytes([0, head[0], head[1], head[2]]) as usize;
        let mut payload = vec![0u8; len];
        self.io.read_exact(&mut payload).await.unwrap();
        RawFrame {
            kind: head[3],
            flags: head[4],
            stream_id: u32::from_be_bytes([head[5], head[6], head[7], head[8]]) & 0x7fff_ffff,
            payload: Bytes::from(payload),
        }
    }

    /// Reads frames until one of `kind` arrives, discarding the rest.
    pub async fn read_until(&mut self, kind: u8) -> RawFrame {
        loop {
            let frame = self.read_frame().await;
            if frame.kind == kind {
                return frame;
            }
        }
    }

    /// Reads frames until a HEADERS frame arrives, returning its decoded
    /// fields.
    pub async fn expect_headers(&mut self) -> (RawFrame, Vec<(String, String)>) {
        let frame = self.read_until(kind::HEADERS).await;
        let fields = self.decode_headers(&frame.payload);
        (frame, fields)
    }

    pub fn decode_headers(&mut self, payload: &[u8]) -> Vec<(String, String)> {
        self.decoder
            .decode(payload)
            .unwrap()
            .into_iter()
            .map(|(n, v)| {
                (
                    String::from_utf8(n).unwrap(),
                    String::from_utf8(v).unwrap(),
                )
            })
            .collect()
    }

    /// Performs the server side of connection setup: preface, the client's
    /// SETTINGS, then our SETTINGS.
    pub async fn accept(&mut self, settings: &[(u16, u32)]) -> RawFrame {
        self.expect_preface().await;
        let client_settings = self.read_until(kind::SETTINGS).await;
        self.send_settings(settings).await;
        client_settings
    }

    async fn send_frame(&mut self, kind: u8, flags: u8, stream_id: u32, payload: &[u8]) {
        let mut buf = BytesMut::with_capacity(9 + payload.len());
        buf.put_uint(payload.len() as u64, 3);
        buf.put_u8(kind);
        buf.put_u8(flags);
        buf.put_u32(stream_id);
        buf.extend_from_slice(payload);
        self.io.write_all(&buf).await.unwrap();
        self.io.flush().await.unwrap();
    }

    pub async fn send_settings(&mut self, entries: &[(u16, u32)]) {
        let mut payload = BytesMut::new();
        for &(id, value) in entries {
            payload.put_u16(id);
            payload.put_u32(value);
        }
        self.send_frame(kind::SETTINGS, 0, 0, &payload).await;
    }

    pub async fn send_settings_ack(&mut self) {
        self.send_frame(kind::SETTINGS, FLAG_ACK, 0, &[]).await;
    }

    pub async fn send_headers(&mut self, stream_id: u32, fields: &[(&str, &str)], end_stream: bool) {
        let block = self
            .encoder
            .encode(fields.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())));
        let mut flags = FLAG_END_HEADERS;
        if end_stream {
            flags |= FLAG_END_STREAM;
        }
        self.send_frame(kind::HEADERS, flags, stream_id, &block).await;
    }

    /// Sends a body, chunked to the default max frame size.
    pub async fn send_data(&mut self, stream_id: u32, payload: &[u8], end_stream: bool) {
        let mut rest = payload;
        loop {
            let n = rest.len().min(16_384);
            let (chunk, tail) = rest.split_at(n);
            rest = tail;
            let last = rest.is_empty();
            let flags = if last && end_stream { FLAG_END_STREAM } else { 0 };
            self.send_frame(kind::DATA, flags, stream_id, chunk).await;
            if last {
                return;
            }
        }
    }

    pub async fn send_rst(&mut self, stream_id: u32, code: u32) {
        self.send_frame(kind::RST_STREAM, 0, stream_id, &code.to_be_bytes())
            .await;
    }

    pub async fn send_ping(&mut self, ack: bool, payload: [u8; 8]) {
        let flags = if ack { FLAG_ACK } else { 0 };
        self.send_frame(kind::PING, flags, 0, &payload).await;
    }

    pub async fn send_goaway(&mut self, last_stream_id: u32, code: u32, debug: &[u8]) {
        let mut payload = BytesMut::new();
        payload.put_u32(last_stream_id);
        payload.put_u32(code);
        payload.extend_from_slice(debug);
        self.send_frame(kind::GOAWAY, 0, 0, &payload).await;
    }

    pub async fn send_window_update(&mut self, stream_id: u32, increment: u32) {
        self.send_frame(kind::WINDOW_UPDATE, 0, stream_id, &increment.to_be_bytes())
            .await;
    }
}

/// Bounds an await so a broken scenario fails instead of hanging.
pub async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(std::time::Duration::from_secs(10), fut)
        .await
        .expect("test step timed out")
}
