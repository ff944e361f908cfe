//! The writer loop: single consumer of the control queue.
//!
//! All outbound frames funnel through here, which is what guarantees that a
//! stream's HEADERS precede its DATA and that DATA frames leave in `write`
//! call order. DATA is additionally subject to outbound flow control:
//! frames wait in per-stream queues until both the connection window and
//! the stream window have credit, and are chunked to the frame size limit.

use crate::codec::FramedWrite;
use crate::error::ConnectionError;
use crate::frame::{self, Settings, StreamId};
use crate::proto::control::{ControlBuffer, DataItem, Item};
use crate::proto::stream::Stream;
use crate::proto::transport::ClientTransport;

use bytes::Buf;
use fnv::FnvHashMap;
use tokio::io::AsyncWrite;
use tracing::trace;

use std::collections::VecDeque;
use std::sync::Arc;

/// Largest DATA chunk written at once. The peer's MAX_FRAME_SIZE can only
/// be this or larger.
const MAX_DATA_CHUNK: usize = 16_384;

/// Flush once this much output has accumulated mid-batch.
const FLUSH_THRESHOLD: usize = 32 * 1_024;

/// Why the writer loop stopped.
pub(crate) enum LoopyExit {
    /// The control queue finished: the transport is closing.
    Finished,
    /// Draining completed: the last established stream is gone after a
    /// GOAWAY or graceful close.
    DrainComplete,
}

/// Writer-side state for one established stream.
struct OutStream {
    id: StreamId,
    stream: Arc<Stream>,
    items: VecDeque<DataItem>,
    /// Bytes sent but not yet credited back by the peer. The stream window
    /// is `oiws - bytes_outstanding`; it goes negative when the peer lowers
    /// INITIAL_WINDOW_SIZE.
    bytes_outstanding: i64,
    /// Whether the stream sits in the round-robin list.
    queued: bool,
}

pub(crate) struct LoopyWriter<W> {
    cbuf: Arc<ControlBuffer>,
    framer: FramedWrite<W>,
    transport: Arc<ClientTransport>,

    /// Connection-level outbound window, credited by the peer.
    send_quota: u32,
    /// Outbound initial window size from the peer's SETTINGS.
    oiws: u32,

    est_streams: FnvHashMap<u32, OutStream>,
    /// Round-robin order over streams with pending data.
    active: VecDeque<u32>,
    draining: bool,
}

impl<W> LoopyWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(
        cbuf: Arc<ControlBuffer>,
        framer: FramedWrite<W>,
        transport: Arc<ClientTransport>,
    ) -> LoopyWriter<W> {
        LoopyWriter {
            cbuf,
            framer,
            transport,
            send_quota: frame::DEFAULT_INITIAL_WINDOW_SIZE,
            oiws: frame::DEFAULT_INITIAL_WINDOW_SIZE,
            est_streams: FnvHashMap::default(),
            active: VecDeque::new(),
            draining: false,
        }
    }

    pub async fn run(&mut self) -> Result<LoopyExit, ConnectionError> {
        loop {
            // Block for work, then drain the queue and interleave with data
            // writes; flush once everything writable has been written.
            let item = match self.cbuf.next().await {
                Ok(item) => item,
                Err(_) => {
                    let _ = self.framer.shutdown().await;
                    return Ok(LoopyExit::Finished);
                }
            };
            if let Some(exit) = self.handle(item).await {
                let _ = self.framer.flush().await;
                return Ok(exit);
            }

            loop {
                match self.cbuf.try_next() {
                    Ok(Some(item)) => {
                        if let Some(exit) = self.handle(item).await {
                            let _ = self.framer.flush().await;
                            return Ok(exit);
                        }
                        continue;
                    }
                    Ok(None) => {}
                    Err(_) => {
                        let _ = self.framer.shutdown().await;
                        return Ok(LoopyExit::Finished);
                    }
                }

                let is_empty = self.process_data();
                if self.framer.buffered() >= FLUSH_THRESHOLD {
                    self.framer.flush().await?;
                }
                if is_empty {
                    break;
                }
            }
            self.framer.flush().await?;
        }
    }

    async fn handle(&mut self, item: Item) -> Option<LoopyExit> {
        match item {
            Item::RegisterStream(reg) => {
                if self.draining {
                    self.transport
                        .orphan_stream(&reg.stream, super::transport::err_stream_drain())
                        .await;
                    return None;
                }
                if let Err(err) = self.transport.init_established_stream(&reg.stream) {
                    self.transport.orphan_stream(&reg.stream, err).await;
                    return None;
                }
                let id = reg.stream.id();
                trace!("sending HEADERS; stream={}", id);
                self.framer.write_headers(id, &reg.fields, false);
                self.est_streams.insert(
                    id.as_u32(),
                    OutStream {
                        id,
                        stream: reg.stream,
                        items: VecDeque::new(),
                        bytes_outstanding: 0,
                        queued: false,
                    },
                );
            }
            Item::Data(data) => {
                let id = data.stream_id.as_u32();
                if let Some(os) = self.est_streams.get_mut(&id) {
                    os.items.push_back(data);
                    if !os.queued {
                        os.queued = true;
                        self.active.push_back(id);
                    }
                }
                // Data for an unknown stream raced its cleanup; drop it.
            }
            Item::WindowUpdateOut {
                stream_id,
                increment,
            } => self.framer.write_window_update(stream_id, increment),
            Item::WindowUpdateIn {
                stream_id,
                increment,
            } => {
                if stream_id.is_zero() {
                    self.send_quota = self.send_quota.saturating_add(increment);
                } else if let Some(os) = self.est_streams.get_mut(&stream_id.as_u32()) {
                    os.bytes_outstanding -= i64::from(increment);
                    if !os.queued
                        && !os.items.is_empty()
                        && i64::from(self.oiws) > os.bytes_outstanding
                    {
                        os.queued = true;
                        self.active.push_back(stream_id.as_u32());
                    }
                }
            }
            Item::SettingsOut(settings) => self.framer.write_settings(&settings),
            Item::SettingsIn(settings) => {
                self.apply_settings(&settings);
                self.framer.write_settings_ack();
            }
            Item::Ping { ack, payload } => {
                if !ack {
                    if let Some(bdp) = self.transport.bdp_estimator() {
                        bdp.lock().unwrap().timesnap(&payload);
                    }
                }
                self.framer.write_ping(ack, payload);
            }
            Item::CleanupStream { stream_id, rst } => {
                self.transport.remove_active_stream(stream_id);
                if self.est_streams.remove(&stream_id.as_u32()).is_some() {
                    if let Some(reason) = rst {
                        self.framer.write_rst_stream(stream_id, reason);
                    }
                }
                if self.draining && self.est_streams.is_empty() {
                    return Some(LoopyExit::DrainComplete);
                }
            }
            Item::GoAwayIn => {
                self.draining = true;
                if self.est_streams.is_empty() {
                    return Some(LoopyExit::DrainComplete);
                }
            }
            Item::OutFlowSizeRequest(tx) => {
                let _ = tx.send(self.send_quota);
            }
        }
        None
    }

    fn apply_settings(&mut self, settings: &Settings) {
        if let Some(iws) = settings.initial_window_size() {
            // Windows of established streams shift implicitly: they are
            // derived from oiws and the bytes already outstanding.
            self.oiws = iws;
            for os in self.est_streams.values_mut() {
                if !os.queued
                    && !os.items.is_empty()
                    && i64::from(self.oiws) > os.bytes_outstanding
                {
                    os.queued = true;
                    self.active.push_back(os.id.as_u32());
                }
            }
        }
        if let Some(max) = settings.max_frame_size() {
            self.framer.set_max_frame_size(max);
        }
    }

    /// Writes one chunk for the stream at the head of the round-robin.
    /// Returns true when nothing (more) can be written right now.
    fn process_data(&mut self) -> bool {
        if self.send_quota == 0 {
            return true;
        }
        let id = loop {
            match self.active.pop_front() {
                None => return true,
                Some(id) if self.est_streams.contains_key(&id) => break id,
                // Stream cleaned up while queued.
                Some(_) => continue,
            }
        };
        let os = self.est_streams.get_mut(&id).expect("checked above");

        let Some(item) = os.items.front_mut() else {
            os.queued = false;
            return false;
        };

        let remaining = item.hdr.len() + item.data.len();
        if remaining == 0 {
            // An empty frame exists only to carry END_STREAM.
            self.framer.write_data(os.id, item.end_stream, &[], &[]);
            os.items.pop_front();
            if os.items.is_empty() {
                os.queued = false;
            } else {
                self.active.push_back(id);
            }
            return false;
        }

        let str_quota = i64::from(self.oiws) - os.bytes_outstanding;
        if str_quota <= 0 {
            // Parked until the peer credits this stream.
            os.queued = false;
            return false;
        }

        let size = (remaining as i64)
            .min(str_quota)
            .min(i64::from(self.send_quota))
            .min(MAX_DATA_CHUNK as i64) as usize;
        let hsize = size.min(item.hdr.len());
        let dsize = size - hsize;
        let end_stream = item.end_stream && size == remaining;

        self.framer
            .write_data(os.id, end_stream, &item.hdr[..hsize], &item.data[..dsize]);
        item.hdr.advance(hsize);
        item.data.advance(dsize);

        os.bytes_outstanding += size as i64;
        self.send_quota -= size as u32;
        // The caller's write quota frees up as its bytes drain to the wire.
        os.stream.wq.replenish(size as i32);

        if item.hdr.is_empty() && item.data.is_empty() {
            os.items.pop_front();
        }
        if os.items.is_empty() {
            os.queued = false;
        } else {
            self.active.push_back(id);
        }
        false
    }
}
