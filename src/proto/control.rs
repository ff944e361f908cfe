//! The control queue feeding the writer loop.
//!
//! Every outbound action is an `Item` in a FIFO consumed by the single
//! writer task. `execute_and_put` runs an admission predicate under the
//! queue lock and enqueues atomically with whatever the predicate reserved;
//! stream admission (id allocation, stream quota) lives entirely inside that
//! lock, so no partial reservation is ever visible.
//!
//! Lock discipline: the queue lock is taken before the transport mutex,
//! never after. Predicates may briefly take the transport mutex; transport
//! code holding its mutex must not touch the queue.

use crate::error::{ConnectionError, Error, Reason};
use crate::frame::{HeaderField, Settings, StreamId};
use crate::proto::stream::Stream;

use bytes::Bytes;
use tokio::sync::{oneshot, Notify};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Ceiling on queued frames that exist only to answer the peer (SETTINGS
/// ACK, PING ACK, RST from cleanup). Past it the reader throttles, so a peer
/// cannot grow the queue without bound by flooding pings.
const MAX_QUEUED_TRANSPORT_RESPONSE_FRAMES: usize = 50;

/// One unit of work for the writer loop.
pub(crate) enum Item {
    /// Open a stream on the wire: write HEADERS, establish writer-side state.
    RegisterStream(RegisterStream),

    /// Body bytes for an established stream, subject to outbound flow
    /// control.
    Data(DataItem),

    /// WINDOW_UPDATE to send. A zero stream id addresses the connection.
    WindowUpdateOut { stream_id: StreamId, increment: u32 },

    /// WINDOW_UPDATE received; credits the writer-side windows.
    WindowUpdateIn { stream_id: StreamId, increment: u32 },

    /// SETTINGS to send.
    SettingsOut(Settings),

    /// SETTINGS received; the writer applies the send-side parameters and
    /// acknowledges.
    SettingsIn(Settings),

    /// PING to send (ack echoes the peer's payload).
    Ping { ack: bool, payload: [u8; 8] },

    /// Tear down writer-side stream state, optionally emitting RST_STREAM,
    /// after the stream left the active table.
    CleanupStream {
        stream_id: StreamId,
        rst: Option<Reason>,
    },

    /// A GOAWAY took effect: stop opening streams, close once drained.
    GoAwayIn,

    /// Diagnostic probe for the connection-level outbound window.
    OutFlowSizeRequest(oneshot::Sender<u32>),
}

pub(crate) struct RegisterStream {
    pub stream: Arc<Stream>,
    pub fields: Vec<HeaderField>,
}

pub(crate) struct DataItem {
    pub stream_id: StreamId,
    pub end_stream: bool,
    /// Frame-level prefix written ahead of `data`; kept separate so the
    /// caller's buffers travel unmodified.
    pub hdr: Bytes,
    pub data: Bytes,
}

impl Item {
    fn is_transport_response_frame(&self) -> bool {
        matches!(
            self,
            Item::CleanupStream { rst: Some(_), .. }
                | Item::SettingsIn(_)
                | Item::Ping { ack: true, .. }
        )
    }
}

/// Admission state guarded by the queue lock.
///
/// `stream_quota` may go negative when the server lowers
/// MAX_CONCURRENT_STREAMS below the number of active streams; no new stream
/// is admitted until it recovers.
#[derive(Debug)]
pub(crate) struct ReserveState {
    /// Next client-initiated (odd) stream id.
    pub next_id: u32,
    pub stream_quota: i64,
    pub waiting_streams: u32,
    pub max_concurrent_streams: u32,
    /// Send-side cap from the peer's SETTINGS_MAX_HEADER_LIST_SIZE.
    pub max_send_header_list_size: Option<u32>,
}

struct Shared {
    list: VecDeque<Item>,
    reserve: ReserveState,
    err: Option<ConnectionError>,
    response_frames: usize,
}

pub(crate) struct ControlBuffer {
    shared: Mutex<Shared>,
    /// Wakes the writer when the queue becomes non-empty or finishes.
    consumer: Notify,
    /// Wakes a throttled reader once response frames drain.
    throttled: Notify,
}

impl ControlBuffer {
    pub fn new(default_max_streams: u32) -> ControlBuffer {
        ControlBuffer {
            shared: Mutex::new(Shared {
                list: VecDeque::new(),
                reserve: ReserveState {
                    next_id: 1,
                    stream_quota: i64::from(default_max_streams),
                    waiting_streams: 0,
                    max_concurrent_streams: default_max_streams,
                    max_send_header_list_size: None,
                },
                err: None,
                response_frames: 0,
            }),
            consumer: Notify::new(),
            throttled: Notify::new(),
        }
    }

    /// Enqueues unconditionally (unless the queue already finished).
    pub fn put(&self, item: Item) -> Result<(), ConnectionError> {
        match self.execute_and_put(|_, _| Ok(true), item) {
            Ok(_) => Ok(()),
            Err(Error::Connection(e)) => Err(e),
            Err(Error::Status(_)) => unreachable!("trivial predicate cannot fail with a status"),
        }
    }

    /// Runs `admit` under the queue lock; on `Ok(true)` the item is enqueued
    /// atomically with whatever the predicate mutated. `Ok(false)` means the
    /// caller must wait and retry. `Err` refuses the item.
    pub fn execute_and_put<F>(&self, admit: F, item: Item) -> Result<bool, Error>
    where
        F: FnOnce(&mut ReserveState, &mut Item) -> Result<bool, Error>,
    {
        let mut item = item;
        let mut shared = self.shared.lock().unwrap();

        if let Some(err) = &shared.err {
            return Err(Error::Connection(err.clone()));
        }
        if !admit(&mut shared.reserve, &mut item)? {
            return Ok(false);
        }
        if item.is_transport_response_frame() {
            shared.response_frames += 1;
        }
        shared.list.push_back(item);
        drop(shared);

        self.consumer.notify_one();
        Ok(true)
    }

    /// Runs `f` under the queue lock without enqueueing anything. Used to
    /// unwind reservation state when a parked caller gives up.
    pub fn execute<F>(&self, f: F) -> Result<(), ConnectionError>
    where
        F: FnOnce(&mut ReserveState),
    {
        let mut shared = self.shared.lock().unwrap();
        if let Some(err) = &shared.err {
            return Err(err.clone());
        }
        f(&mut shared.reserve);
        Ok(())
    }

    /// Pops the next item without waiting. `Err` once finished.
    pub fn try_next(&self) -> Result<Option<Item>, ConnectionError> {
        let mut shared = self.shared.lock().unwrap();
        match shared.list.pop_front() {
            Some(item) => {
                if item.is_transport_response_frame() {
                    shared.response_frames -= 1;
                    if shared.response_frames < MAX_QUEUED_TRANSPORT_RESPONSE_FRAMES {
                        self.throttled.notify_waiters();
                    }
                }
                Ok(Some(item))
            }
            None => match &shared.err {
                Some(err) => Err(err.clone()),
                None => Ok(None),
            },
        }
    }

    /// Waits for the next item. `Err` once finished and drained.
    pub async fn next(&self) -> Result<Item, ConnectionError> {
        loop {
            let notified = self.consumer.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_next()? {
                return Ok(item);
            }
            notified.await;
        }
    }

    /// Parks the caller while too many transport-response frames are queued.
    pub async fn throttle(&self) {
        loop {
            let notified = self.throttled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.lock().unwrap().response_frames < MAX_QUEUED_TRANSPORT_RESPONSE_FRAMES {
                return;
            }
            notified.await;
        }
    }

    /// Refuses all future work with `err` and drops what is queued.
    ///
    /// Streams whose HEADERS were queued but never written are returned so
    /// the caller can fail them as unprocessed.
    pub fn finish(&self, err: ConnectionError) -> Vec<Arc<Stream>> {
        let mut shared = self.shared.lock().unwrap();
        if shared.err.is_some() {
            return Vec::new();
        }
        shared.err = Some(err);
        shared.response_frames = 0;

        let mut orphans = Vec::new();
        for item in shared.list.drain(..) {
            if let Item::RegisterStream(reg) = item {
                orphans.push(reg.stream);
            }
            // Other items are dropped; a pending OutFlowSizeRequest observes
            // its channel closing.
        }
        drop(shared);

        self.consumer.notify_waiters();
        self.throttled.notify_waiters();
        orphans
    }

    /// Snapshot of the admission state, for diagnostics and tests.
    #[cfg(feature = "unstable")]
    pub fn reserve_snapshot(&self) -> (u32, i64, u32) {
        let shared = self.shared.lock().unwrap();
        (
            shared.reserve.next_id,
            shared.reserve.stream_quota,
            shared.reserve.max_concurrent_streams,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::status::{Code, Status};

    fn window_update(id: u32, increment: u32) -> Item {
        Item::WindowUpdateOut {
            stream_id: StreamId::new(id),
            increment,
        }
    }

    #[test]
    fn fifo_order_is_preserved() {
        let cbuf = ControlBuffer::new(100);
        cbuf.put(window_update(0, 1)).unwrap();
        cbuf.put(window_update(0, 2)).unwrap();

        for expected in [1, 2] {
            match cbuf.try_next().unwrap().unwrap() {
                Item::WindowUpdateOut { increment, .. } => assert_eq!(increment, expected),
                _ => panic!("unexpected item"),
            }
        }
        assert!(cbuf.try_next().unwrap().is_none());
    }

    #[test]
    fn predicate_reservation_is_atomic_with_enqueue() {
        let cbuf = ControlBuffer::new(1);

        let admitted = cbuf
            .execute_and_put(
                |reserve, _| {
                    if reserve.stream_quota <= 0 {
                        return Ok(false);
                    }
                    reserve.stream_quota -= 1;
                    reserve.next_id += 2;
                    Ok(true)
                },
                window_update(0, 1),
            )
            .unwrap();
        assert!(admitted);

        // Quota is spent: the same predicate now blocks, and nothing is
        // enqueued for the refused attempt.
        let admitted = cbuf
            .execute_and_put(
                |reserve, _| {
                    if reserve.stream_quota <= 0 {
                        return Ok(false);
                    }
                    reserve.stream_quota -= 1;
                    Ok(true)
                },
                window_update(0, 2),
            )
            .unwrap();
        assert!(!admitted);

        assert!(cbuf.try_next().unwrap().is_some());
        assert!(cbuf.try_next().unwrap().is_none());
    }

    #[test]
    fn predicate_errors_refuse_without_enqueue() {
        let cbuf = ControlBuffer::new(100);
        let res = cbuf.execute_and_put(
            |_, _| Err(Status::new(Code::Internal, "header list too large").into()),
            window_update(0, 1),
        );
        assert!(matches!(res, Err(Error::Status(_))));
        assert!(cbuf.try_next().unwrap().is_none());
    }

    #[test]
    fn execute_mutates_without_enqueueing() {
        let cbuf = ControlBuffer::new(1);
        cbuf.execute(|reserve| reserve.waiting_streams += 1).unwrap();
        cbuf.execute(|reserve| reserve.waiting_streams -= 1).unwrap();
        assert!(cbuf.try_next().unwrap().is_none());

        cbuf.finish(ConnectionError::new("going down"));
        assert!(cbuf.execute(|_| {}).is_err());
    }

    #[test]
    fn finish_fails_future_work() {
        let cbuf = ControlBuffer::new(100);
        cbuf.put(window_update(0, 1)).unwrap();
        cbuf.finish(ConnectionError::new("going down"));

        assert!(cbuf.put(window_update(0, 2)).is_err());
        assert!(cbuf.try_next().is_err());
    }

    #[tokio::test]
    async fn next_wakes_on_put() {
        let cbuf = Arc::new(ControlBuffer::new(100));
        let waiter = {
            let cbuf = cbuf.clone();
            tokio::spawn(async move { cbuf.next().await })
        };
        tokio::task::yield_now().await;

        cbuf.put(window_update(0, 9)).unwrap();
        match waiter.await.unwrap().unwrap() {
            Item::WindowUpdateOut { increment, .. } => assert_eq!(increment, 9),
            _ => panic!("unexpected item"),
        }
    }

    #[tokio::test]
    async fn throttle_parks_while_response_frames_pile_up() {
        let cbuf = Arc::new(ControlBuffer::new(100));
        for _ in 0..MAX_QUEUED_TRANSPORT_RESPONSE_FRAMES {
            cbuf.put(Item::Ping {
                ack: true,
                payload: [0; 8],
            })
            .unwrap();
        }

        let throttled = {
            let cbuf = cbuf.clone();
            tokio::spawn(async move { cbuf.throttle().await })
        };
        tokio::task::yield_now().await;
        assert!(!throttled.is_finished());

        // Draining one response frame releases the reader.
        cbuf.try_next().unwrap().unwrap();
        throttled.await.unwrap();
    }
}
