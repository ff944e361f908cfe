//! One logical RPC multiplexed on the transport.

use crate::error::Error;
use crate::frame::StreamId;
use crate::metadata::Metadata;
use crate::proto::flow::{InFlow, WriteQuota, DEFAULT_WRITE_QUOTA};
use crate::proto::transport::ClientTransport;
use crate::proto::Event;
use crate::status::{BizStatus, Code, Status};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Cancellation and deadline carried by a stream.
#[derive(Debug, Clone, Default)]
pub struct StreamContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl StreamContext {
    pub fn new() -> StreamContext {
        StreamContext::default()
    }

    pub fn with_timeout(timeout: Duration) -> StreamContext {
        StreamContext {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn with_deadline(deadline: Instant) -> StreamContext {
        StreamContext {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_done(&self) -> bool {
        if self.token.is_cancelled() {
            return true;
        }
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    pub async fn done(&self) {
        match self.deadline {
            Some(d) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(d) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// The status a stream terminated by this context reports.
    pub(crate) fn err_status(&self) -> Status {
        if matches!(self.deadline, Some(d) if Instant::now() >= d) {
            Status::new(Code::DeadlineExceeded, "context deadline exceeded")
        } else {
            Status::new(Code::Cancelled, "context canceled")
        }
    }
}

/// Stream lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Active = 0,
    /// The last outbound frame was accepted; reads may continue.
    WriteDone = 1,
    /// The peer half-closed; writes may continue.
    ReadDone = 2,
    Done = 3,
}

impl StreamState {
    fn from_u8(v: u8) -> StreamState {
        match v {
            0 => StreamState::Active,
            1 => StreamState::WriteDone,
            2 => StreamState::ReadDone,
            _ => StreamState::Done,
        }
    }
}

/// An entry in the receive buffer. The first terminal entry (`Eof` or
/// `Err`) wins; everything after it is dropped.
pub(crate) enum RecvMsg {
    Data(Bytes),
    /// Clean end of the read side; the final status tells the outcome.
    Eof,
    Err(Error),
}

struct RecvHalf {
    rx: mpsc::UnboundedReceiver<RecvMsg>,
    /// Latched terminal outcome; `Ok` is a clean EOF.
    term: Option<Result<(), Error>>,
}

/// A client stream: one RPC in flight on the transport.
///
/// Writes go through [`ClientTransport::write`]; the read side lives here.
pub struct Stream {
    id: AtomicU32,
    method: String,
    send_compress: Option<String>,
    ctx: StreamContext,
    ct: Weak<ClientTransport>,

    state: AtomicU8,

    tx: mpsc::UnboundedSender<RecvMsg>,
    recv: tokio::sync::Mutex<RecvHalf>,
    sent_terminal: AtomicBool,

    /// Inbound credit; installed with the real window at admission.
    pub(crate) fc: Mutex<InFlow>,
    pub(crate) wq: Arc<WriteQuota>,

    pub(crate) done: Arc<Event>,

    // headerChan: closed exactly once; `closing` is the CAS gate, `closed`
    // the waiter-visible flag set after the header fields are published.
    header_chan_closing: AtomicBool,
    header_chan_closed: AtomicBool,
    header_chan: Notify,

    header_valid: AtomicBool,
    no_headers: AtomicBool,
    unprocessed: AtomicBool,
    bytes_received: AtomicBool,

    recv_compress: Mutex<Option<String>>,
    header_md: Mutex<Option<Metadata>>,
    trailer: Mutex<Option<Metadata>>,
    status: Mutex<Option<Status>>,
    biz_status: Mutex<Option<BizStatus>>,
    close_stream_err: Mutex<Option<Error>>,
}

impl Stream {
    pub(crate) fn new(
        ctx: StreamContext,
        method: String,
        send_compress: Option<String>,
        ct: Weak<ClientTransport>,
    ) -> Stream {
        let (tx, rx) = mpsc::unbounded_channel();
        let done = Arc::new(Event::new());

        Stream {
            id: AtomicU32::new(0),
            method,
            send_compress,
            ctx,
            ct,
            state: AtomicU8::new(StreamState::Active as u8),
            tx,
            recv: tokio::sync::Mutex::new(RecvHalf { rx, term: None }),
            sent_terminal: AtomicBool::new(false),
            fc: Mutex::new(InFlow::new(0)),
            wq: Arc::new(WriteQuota::new(DEFAULT_WRITE_QUOTA, done.clone())),
            done,
            header_chan_closing: AtomicBool::new(false),
            header_chan_closed: AtomicBool::new(false),
            header_chan: Notify::new(),
            header_valid: AtomicBool::new(false),
            no_headers: AtomicBool::new(false),
            unprocessed: AtomicBool::new(false),
            bytes_received: AtomicBool::new(false),
            recv_compress: Mutex::new(None),
            header_md: Mutex::new(None),
            trailer: Mutex::new(None),
            status: Mutex::new(None),
            biz_status: Mutex::new(None),
            close_stream_err: Mutex::new(None),
        }
    }

    pub fn id(&self) -> StreamId {
        StreamId::new(self.id.load(Ordering::Acquire))
    }

    pub(crate) fn set_id(&self, id: StreamId) {
        self.id.store(id.as_u32(), Ordering::Release);
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn context(&self) -> &StreamContext {
        &self.ctx
    }

    /// The compression tag the peer announced in its initial headers.
    pub fn recv_compress(&self) -> Option<String> {
        self.recv_compress.lock().unwrap().clone()
    }

    pub fn send_compress(&self) -> Option<&str> {
        self.send_compress.as_deref()
    }

    // ===== state machine =====

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn swap_state(&self, to: StreamState) -> StreamState {
        StreamState::from_u8(self.state.swap(to as u8, Ordering::AcqRel))
    }

    pub(crate) fn compare_and_swap_state(&self, from: StreamState, to: StreamState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // ===== receive buffer =====

    /// Feeds the receive buffer. Anything after the first terminal entry is
    /// dropped.
    pub(crate) fn write_msg(&self, msg: RecvMsg) {
        if self.sent_terminal.load(Ordering::Acquire) {
            return;
        }
        if !matches!(msg, RecvMsg::Data(_)) {
            self.sent_terminal.store(true, Ordering::Release);
        }
        let _ = self.tx.send(msg);
    }

    /// Receives the next chunk of body bytes. `Ok(None)` is a clean end of
    /// stream with an OK status; a non-OK final status surfaces as `Err`.
    ///
    /// Consumed bytes are credited back to the peer through the transport's
    /// window accounting.
    pub async fn recv_data(&self) -> Result<Option<Bytes>, Error> {
        let mut half = self.recv.lock().await;
        if let Some(term) = &half.term {
            return term.clone().map(|()| None);
        }

        match half.rx.recv().await {
            Some(RecvMsg::Data(data)) => {
                drop(half);
                if let Some(ct) = self.ct.upgrade() {
                    ct.update_window(self, data.len() as u32);
                }
                Ok(Some(data))
            }
            Some(RecvMsg::Eof) => {
                let status = self.final_status();
                let outcome = if status.is_ok() {
                    Ok(())
                } else {
                    Err(Error::Status(status))
                };
                half.term = Some(outcome.clone());
                outcome.map(|()| None)
            }
            Some(RecvMsg::Err(err)) => {
                half.term = Some(Err(err.clone()));
                Err(err)
            }
            // The sender lives on `self`, so the channel cannot drop first.
            None => Err(self.get_close_stream_err()),
        }
    }

    /// Hints that the application wants `n` bytes; the transport may extend
    /// the stream window beyond its initial size.
    pub fn request_read(&self, n: u32) {
        if let Some(ct) = self.ct.upgrade() {
            ct.adjust_window(self, n);
        }
    }

    // ===== headerChan =====

    /// Claims the right to close the header channel. The winner publishes
    /// header fields and then calls `header_chan_broadcast`.
    pub(crate) fn header_chan_cas(&self) -> bool {
        self.header_chan_closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn header_chan_broadcast(&self) {
        self.header_chan_closed.store(true, Ordering::Release);
        self.header_chan.notify_waiters();
    }

    pub(crate) fn header_chan_is_closing(&self) -> bool {
        self.header_chan_closing.load(Ordering::Acquire)
    }

    async fn wait_header_chan(&self) {
        loop {
            let notified = self.header_chan.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.header_chan_closed.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    /// Waits for the peer's initial metadata. A trailers-only response
    /// yields empty metadata; a failed stream yields its close error.
    ///
    /// Cancelling the stream context while waiting closes the stream.
    pub async fn headers(&self) -> Result<Metadata, Error> {
        if !self.header_chan_closed.load(Ordering::Acquire) {
            tokio::select! {
                _ = self.wait_header_chan() => {}
                _ = self.ctx.done() => {
                    let status = self.ctx.err_status();
                    if let Some(ct) = self.ct.upgrade() {
                        ct.close_stream(self, Some(Error::Status(status))).await;
                    }
                    self.wait_header_chan().await;
                }
            }
        }

        if self.header_valid.load(Ordering::Acquire) {
            Ok(self.header_md.lock().unwrap().clone().unwrap_or_default())
        } else {
            Err(self.get_close_stream_err())
        }
    }

    /// The initial metadata, if it has already arrived. Non-blocking
    /// variant of [`Stream::headers`], used by diagnostics.
    pub fn try_headers(&self) -> Option<Metadata> {
        if !self.header_valid.load(Ordering::Acquire) {
            return None;
        }
        Some(self.header_md.lock().unwrap().clone().unwrap_or_default())
    }

    pub(crate) fn set_header_data(&self, md: Option<Metadata>, recv_compress: Option<String>) {
        self.header_valid.store(true, Ordering::Release);
        if md.is_some() {
            *self.header_md.lock().unwrap() = md;
        }
        if recv_compress.is_some() {
            *self.recv_compress.lock().unwrap() = recv_compress;
        }
    }

    pub(crate) fn set_no_headers(&self) {
        self.no_headers.store(true, Ordering::Release);
    }

    pub fn header_valid(&self) -> bool {
        self.header_valid.load(Ordering::Acquire)
    }

    /// True when the second header block was a trailers-only response (or
    /// the stream closed before any headers arrived).
    pub fn no_headers(&self) -> bool {
        self.no_headers.load(Ordering::Acquire)
    }

    // ===== terminal state =====

    pub(crate) fn mark_unprocessed(&self) {
        self.unprocessed.store(true, Ordering::Release);
    }

    /// True when the server demonstrably never processed this stream
    /// (REFUSED_STREAM, or admitted past the server's GOAWAY id); such a
    /// call is safe to retry on another transport.
    pub fn is_unprocessed(&self) -> bool {
        self.unprocessed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_bytes_received(&self) {
        self.bytes_received.store(true, Ordering::Release);
    }

    pub fn bytes_received(&self) -> bool {
        self.bytes_received.load(Ordering::Acquire)
    }

    /// Waits for full termination of the stream.
    pub async fn done(&self) {
        self.done.wait().await;
    }

    pub fn is_done(&self) -> bool {
        self.done.is_fired()
    }

    /// The final status. `Unknown` until the stream terminates.
    pub fn final_status(&self) -> Status {
        self.status
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Status::new(Code::Unknown, "stream not yet terminated"))
    }

    pub(crate) fn set_status(&self, status: Status) {
        *self.status.lock().unwrap() = Some(status);
    }

    pub fn trailers(&self) -> Option<Metadata> {
        self.trailer.lock().unwrap().clone()
    }

    pub(crate) fn set_trailers(&self, md: Metadata) {
        *self.trailer.lock().unwrap() = Some(md);
    }

    pub fn biz_status(&self) -> Option<BizStatus> {
        self.biz_status.lock().unwrap().clone()
    }

    pub(crate) fn set_biz_status(&self, biz: Option<BizStatus>) {
        if biz.is_some() {
            *self.biz_status.lock().unwrap() = biz;
        }
    }

    /// Tears down a stream that never made it onto the wire: no id, no
    /// quota slot, no table entry. Used when admission is refused because
    /// the transport is draining or closing.
    pub(crate) fn cleanup_unadmitted(&self, err: Error) {
        if self.swap_state(StreamState::Done) == StreamState::Done {
            return;
        }
        self.mark_unprocessed();
        let status = match &err {
            Error::Status(st) => st.clone(),
            Error::Connection(e) => Status::new(Code::Unavailable, e.to_string()),
        };
        self.set_status(status);
        self.store_close_stream_err(err.clone());
        self.write_msg(RecvMsg::Err(err));
        if self.header_chan_cas() {
            self.set_no_headers();
            self.header_chan_broadcast();
        }
        self.done.fire();
    }

    /// The error a write observes after the stream was closed.
    pub(crate) fn get_close_stream_err(&self) -> Error {
        if let Some(err) = self.close_stream_err.lock().unwrap().clone() {
            return err;
        }
        Error::Status(self.final_status())
    }

    pub(crate) fn store_close_stream_err(&self, err: Error) {
        *self.close_stream_err.lock().unwrap() = Some(err);
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Stream")
            .field("id", &self.id())
            .field("method", &self.method)
            .field("state", &self.state())
            .finish()
    }
}
