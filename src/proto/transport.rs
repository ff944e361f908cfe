//! The client transport: one connection, many streams.
//!
//! Four tasks cooperate around the control queue and one mutex: the reader
//! parses inbound frames and dispatches them, the writer drains the control
//! queue under outbound flow control, the keepalive task pings an idle
//! connection, and the janitor sweeps cancelled streams. Application tasks
//! enter through [`ClientTransport::new_stream`] and
//! [`ClientTransport::write`].
//!
//! Lock discipline: the control-queue lock is never acquired while the
//! transport mutex is held. Admission predicates running under the queue
//! lock may briefly take the transport mutex; that one-way bridge is what
//! makes stream reservation atomic without deadlocking against GOAWAY
//! handling.

use crate::codec::{FramedRead, FramedWrite, RecvError};
use crate::error::{ConnectionError, Error, GoAwayReason, Reason};
use crate::frame::{self, Frame, HeaderField, Settings, StreamId};
use crate::metadata::{self, Metadata};
use crate::proto::bdp::BdpEstimator;
use crate::proto::control::{ControlBuffer, DataItem, Item, RegisterStream};
use crate::proto::flow::{InFlow, TrInFlow};
use crate::proto::headers::{content_type, DecodeState};
use crate::proto::loopy::{LoopyExit, LoopyWriter};
use crate::proto::stream::{RecvMsg, Stream, StreamContext, StreamState};
use crate::proto::Event;
use crate::status::{self, Code, Status};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

const DEFAULT_WINDOW_SIZE: u32 = frame::DEFAULT_INITIAL_WINDOW_SIZE;

/// Stream concurrency assumed until the server's first SETTINGS arrives.
const DEFAULT_MAX_STREAMS_CLIENT: u32 = 100;

/// How often cancelled-but-parked streams are swept.
const JANITOR_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) const ERR_STREAM_DRAIN_MSG: &str = "the connection is draining";
const STATUS_GOAWAY_MSG: &str = "the stream is rejected because server is draining the connection";
const GRACEFUL_SHUTDOWN_MSG: &str = "the connection is graceful shutdown";

/// RST_STREAM code used for client-initiated graceful shutdown. NO_ERROR is
/// a registered code; a private value would not survive intermediaries.
const GRACEFUL_SHUTDOWN_CODE: Reason = Reason::NO_ERROR;

/// The status carried by streams torn down for client-side graceful
/// shutdown. Passing an error equal to it to [`ClientTransport::close_stream`]
/// selects the graceful RST code.
pub fn graceful_shutdown_status() -> Status {
    Status::new(Code::Unavailable, GRACEFUL_SHUTDOWN_MSG)
}

pub(crate) fn err_stream_drain() -> Error {
    Error::Status(Status::new(Code::Unavailable, ERR_STREAM_DRAIN_MSG))
}

fn status_from_error(err: &Error) -> Status {
    match err {
        Error::Status(st) => st.clone(),
        Error::Connection(e) => Status::new(Code::Unavailable, e.to_string()),
    }
}

/// Keepalive configuration. Omitting it disables the keepalive task.
#[derive(Debug, Clone, Copy)]
pub struct KeepaliveParams {
    /// Idle time after which a PING is sent.
    pub time: Duration,
    /// How long to wait for the PING ACK before declaring the connection
    /// dead.
    pub timeout: Duration,
    /// Ping even when no stream is active; otherwise the keepalive task goes
    /// dormant while the transport is idle.
    pub permit_without_stream: bool,
}

/// Connection-level options. The byte channel itself is dialed by the owner.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Initial per-stream window. Values below 64 KiB are ignored; setting
    /// it disables dynamic (BDP) window sizing.
    pub initial_window_size: u32,
    /// Initial connection window. Same rules as `initial_window_size`.
    pub initial_conn_window_size: u32,
    /// Write buffer hint for the framer.
    pub write_buffer_size: usize,
    /// Cap on inbound header list size.
    pub max_header_list_size: Option<u32>,
    pub keepalive: Option<KeepaliveParams>,
    /// True when the byte channel is TLS; selects the `:scheme`.
    pub secure: bool,
    pub user_agent: String,
    /// Peer address label, surfaced in diagnostics.
    pub remote_addr: String,
    /// Local address label, surfaced in diagnostics.
    pub local_addr: String,
}

impl Default for ConnectOptions {
    fn default() -> ConnectOptions {
        ConnectOptions {
            initial_window_size: 0,
            initial_conn_window_size: 0,
            write_buffer_size: 0,
            max_header_list_size: None,
            keepalive: None,
            secure: false,
            user_agent: concat!("h2rpc/", env!("CARGO_PKG_VERSION")).to_owned(),
            remote_addr: String::new(),
            local_addr: String::new(),
        }
    }
}

/// Per-call parameters for [`ClientTransport::new_stream`].
#[derive(Debug, Clone, Default)]
pub struct CallHeader {
    /// Full method path, e.g. `/package.Service/Method`.
    pub method: String,
    /// Value for `:authority`.
    pub host: String,
    /// Compression tag announced in `grpc-encoding`.
    pub send_compress: Option<String>,
    /// Content subtype, e.g. `proto` for `application/grpc+proto`.
    pub content_subtype: Option<String>,
    /// Number of previous attempts of this RPC, for `grpc-previous-rpc-attempts`.
    pub previous_attempts: u32,
    pub metadata: Metadata,
}

/// Callbacks into the owning pool.
///
/// Both run while the transport mutex is held: implementations must not call
/// back into the transport.
pub struct TransportCallbacks {
    pub on_go_away: Box<dyn Fn(GoAwayReason) + Send + Sync>,
    pub on_close: Box<dyn Fn() + Send + Sync>,
}

impl Default for TransportCallbacks {
    fn default() -> TransportCallbacks {
        TransportCallbacks {
            on_go_away: Box::new(|_| {}),
            on_close: Box::new(|| {}),
        }
    }
}

impl std::fmt::Debug for TransportCallbacks {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("TransportCallbacks").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Reachable,
    Draining,
    Closing,
}

/// Fields guarded by the transport mutex.
struct Inner {
    state: TransportState,
    /// `None` once the transport detached it on close.
    active_streams: Option<fnv::FnvHashMap<u32, Arc<Stream>>>,
    /// Last-Stream-ID of the previous GOAWAY frame.
    prev_goaway_id: u32,
    goaway_reason: GoAwayReason,
    /// Whether the keepalive task is parked on the dormancy signal.
    kp_dormant: bool,
}

/// An HTTP/2 client transport: a single connection multiplexing concurrent
/// RPC streams.
pub struct ClientTransport {
    start: Instant,
    /// Monotonic nanos (since `start`) of the last inbound read.
    last_read: AtomicI64,
    ctx: CancellationToken,
    scheme: &'static str,
    user_agent: String,
    remote_addr: String,
    local_addr: String,

    reader_done: Event,
    writer_done: Event,
    /// Cancelled when the server sends GOAWAY on this transport.
    go_away: CancellationToken,

    cbuf: Arc<ControlBuffer>,
    /// Connection-level inbound flow accounting; reader-driven.
    fc: Mutex<TrInFlow>,

    kp: KeepaliveParams,
    keepalive_enabled: bool,
    /// Window installed into newly admitted streams; rewritten by the BDP
    /// estimator.
    initial_window_size: AtomicU32,
    bdp: Option<Mutex<BdpEstimator>>,

    inner: Mutex<Inner>,
    kp_dormancy: Notify,
    /// Edge-triggered wakeup for stream-quota waiters.
    streams_quota_available: Notify,

    callbacks: TransportCallbacks,

    /// Handed to streams as their back-reference; does not extend the
    /// transport's lifetime.
    self_ref: Weak<ClientTransport>,
}

impl ClientTransport {
    /// Builds a transport over an established byte channel, performs the
    /// client preface and starts the background tasks.
    pub async fn connect<T>(
        io: T,
        opts: ConnectOptions,
        callbacks: TransportCallbacks,
    ) -> Result<Arc<ClientTransport>, ConnectionError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut dynamic_window = true;
        let mut icwz = DEFAULT_WINDOW_SIZE;
        if opts.initial_conn_window_size >= DEFAULT_WINDOW_SIZE {
            icwz = opts.initial_conn_window_size;
            dynamic_window = false;
        }
        let mut initial_window_size = DEFAULT_WINDOW_SIZE;
        if opts.initial_window_size >= DEFAULT_WINDOW_SIZE {
            initial_window_size = opts.initial_window_size;
            dynamic_window = false;
        }

        let (read_half, write_half) = tokio::io::split(io);
        let mut framed_read = FramedRead::new(read_half);
        if let Some(max) = opts.max_header_list_size {
            framed_read.set_max_header_list_size(max as usize);
        }
        let mut framer = FramedWrite::new(write_half, opts.write_buffer_size);

        let keepalive_enabled = opts.keepalive.is_some();
        let kp = opts.keepalive.unwrap_or(KeepaliveParams {
            time: Duration::MAX,
            timeout: Duration::from_secs(20),
            permit_without_stream: false,
        });

        let t = Arc::new_cyclic(|self_ref| ClientTransport {
            self_ref: self_ref.clone(),
            start: Instant::now(),
            last_read: AtomicI64::new(0),
            ctx: CancellationToken::new(),
            scheme: if opts.secure { "https" } else { "http" },
            user_agent: opts.user_agent,
            remote_addr: opts.remote_addr,
            local_addr: opts.local_addr,
            reader_done: Event::new(),
            writer_done: Event::new(),
            go_away: CancellationToken::new(),
            cbuf: Arc::new(ControlBuffer::new(DEFAULT_MAX_STREAMS_CLIENT)),
            fc: Mutex::new(TrInFlow::new(icwz)),
            kp,
            keepalive_enabled,
            initial_window_size: AtomicU32::new(initial_window_size),
            bdp: dynamic_window.then(|| Mutex::new(BdpEstimator::new(DEFAULT_WINDOW_SIZE))),
            inner: Mutex::new(Inner {
                state: TransportState::Reachable,
                active_streams: Some(fnv::FnvHashMap::default()),
                prev_goaway_id: 0,
                goaway_reason: GoAwayReason::NoReason,
                kp_dormant: false,
            }),
            kp_dormancy: Notify::new(),
            streams_quota_available: Notify::new(),
            callbacks,
        });

        // Send the connection preface to the server before any task runs.
        framer.write_preface();
        let mut settings = Settings::new();
        settings.set_initial_window_size(Some(initial_window_size));
        framer.write_settings(&settings);
        if icwz > DEFAULT_WINDOW_SIZE {
            framer.write_window_update(StreamId::ZERO, icwz - DEFAULT_WINDOW_SIZE);
        }
        if let Err(e) = framer.flush().await {
            let err = ConnectionError::from(e);
            t.close(err.clone()).await;
            return Err(err);
        }

        let reader = t.clone();
        tokio::spawn(async move {
            reader.clone().read_loop(&mut framed_read).await;
            reader.reader_done.fire();
        });

        let writer = t.clone();
        tokio::spawn(async move {
            let mut loopy = LoopyWriter::new(writer.cbuf.clone(), framer, writer.clone());
            match loopy.run().await {
                Ok(LoopyExit::Finished) => {}
                Ok(LoopyExit::DrainComplete) => {
                    writer
                        .close(ConnectionError::ignorable(
                            "no active streams left to process while draining",
                        ))
                        .await;
                }
                Err(e) => {
                    debug!("writer loop failed; err={}", e);
                    writer.close(e).await;
                }
            }
            writer.writer_done.fire();
        });

        if keepalive_enabled {
            let keepalive = t.clone();
            tokio::spawn(async move { keepalive.keepalive().await });
        }

        let janitor = t.clone();
        tokio::spawn(async move { janitor.janitor().await });

        Ok(t)
    }

    // ===== accessors =====

    pub fn is_active(&self) -> bool {
        self.inner.lock().unwrap().state == TransportState::Reachable
    }

    pub fn is_closed(&self) -> bool {
        self.ctx.is_cancelled()
    }

    /// Completes when the transport has shut down.
    pub async fn closed(&self) {
        self.ctx.cancelled().await;
    }

    /// Completes once the server has sent a GOAWAY on this transport.
    pub async fn go_away_received(&self) {
        self.go_away.cancelled().await;
    }

    pub fn goaway_reason(&self) -> GoAwayReason {
        self.inner.lock().unwrap().goaway_reason
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    fn now_nanos(&self) -> i64 {
        self.start.elapsed().as_nanos() as i64
    }

    fn touch_last_read(&self) {
        // Only the keepalive task consumes the timestamp.
        if self.keepalive_enabled {
            self.last_read.store(self.now_nanos(), Ordering::Release);
        }
    }

    pub(crate) fn bdp_estimator(&self) -> Option<&Mutex<BdpEstimator>> {
        self.bdp.as_ref()
    }

    fn get_stream(&self, id: StreamId) -> Option<Arc<Stream>> {
        let inner = self.inner.lock().unwrap();
        inner
            .active_streams
            .as_ref()
            .and_then(|m| m.get(&id.as_u32()).cloned())
    }

    // ===== stream creation =====

    fn create_header_fields(&self, ctx: &StreamContext, call: &CallHeader) -> Vec<HeaderField> {
        let mut fields = Vec::with_capacity(7 + call.metadata.len());
        fields.push(HeaderField::new(":method", "POST"));
        fields.push(HeaderField::new(":scheme", self.scheme));
        fields.push(HeaderField::new(":path", call.method.clone()));
        fields.push(HeaderField::new(":authority", call.host.clone()));
        fields.push(HeaderField::new(
            "content-type",
            content_type(call.content_subtype.as_deref()),
        ));
        fields.push(HeaderField::new("user-agent", self.user_agent.clone()));
        fields.push(HeaderField::new("te", "trailers"));

        if call.previous_attempts > 0 {
            fields.push(HeaderField::new(
                "grpc-previous-rpc-attempts",
                call.previous_attempts.to_string(),
            ));
        }
        if let Some(send_compress) = &call.send_compress {
            fields.push(HeaderField::new("grpc-encoding", send_compress.clone()));
            fields.push(HeaderField::new(
                "grpc-accept-encoding",
                send_compress.clone(),
            ));
        }
        if let Some(deadline) = ctx.deadline() {
            // Send the timeout regardless of how little is left; the server
            // can detect an already-expired deadline by itself.
            let timeout = deadline.saturating_duration_since(Instant::now());
            fields.push(HeaderField::new(
                "grpc-timeout",
                metadata::encode_timeout(timeout),
            ));
        }
        for (name, value) in call.metadata.iter() {
            if metadata::is_reserved_header(name) {
                continue;
            }
            fields.push(HeaderField::new(
                name,
                String::from_utf8_lossy(value).into_owned(),
            ));
        }
        fields
    }

    /// Creates a stream and registers it as active.
    ///
    /// Blocks while the stream quota is exhausted; fails fast when the
    /// header list exceeds the server's advertised cap, the context ends,
    /// a GOAWAY arrives, or the transport shuts down.
    pub async fn new_stream(
        &self,
        ctx: StreamContext,
        call: CallHeader,
    ) -> Result<Arc<Stream>, Error> {
        let s = Arc::new(Stream::new(
            ctx,
            call.method.clone(),
            call.send_compress.clone(),
            self.self_ref.clone(),
        ));
        let fields = self.create_header_fields(s.context(), &call);

        let mut first_try = true;
        loop {
            let notified = self.streams_quota_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let res = self.cbuf.execute_and_put(
                |reserve, item| {
                    let fields = match item {
                        Item::RegisterStream(reg) => &reg.fields,
                        _ => unreachable!("admission runs on the register item"),
                    };

                    // 1. The assembled header list must fit the server's cap.
                    if let Some(max) = reserve.max_send_header_list_size {
                        let mut size: u64 = 0;
                        for field in fields {
                            size += field.size() as u64;
                            if size > u64::from(max) {
                                return Err(Error::Status(Status::new(
                                    Code::Internal,
                                    format!(
                                        "header list size to send violates the maximum size ({} bytes) set by server",
                                        max
                                    ),
                                )));
                            }
                        }
                    }

                    // 2. A quota slot must be free. The counter can be
                    // negative after the server lowered its limit.
                    if reserve.stream_quota <= 0 {
                        if first_try {
                            reserve.waiting_streams += 1;
                        }
                        return Ok(false);
                    }
                    if !first_try {
                        reserve.waiting_streams -= 1;
                    }
                    reserve.stream_quota -= 1;

                    {
                        let mut inner = self.inner.lock().unwrap();
                        match inner.state {
                            TransportState::Reachable if inner.active_streams.is_some() => {
                                let id = StreamId::new(reserve.next_id);
                                reserve.next_id += 2;
                                s.set_id(id);
                                *s.fc.lock().unwrap() =
                                    InFlow::new(self.initial_window_size.load(Ordering::Acquire));
                                inner
                                    .active_streams
                                    .as_mut()
                                    .expect("checked above")
                                    .insert(id.as_u32(), s.clone());
                                if inner.kp_dormant {
                                    self.kp_dormancy.notify_one();
                                }
                            }
                            TransportState::Draining => {
                                reserve.stream_quota += 1;
                                return Err(err_stream_drain());
                            }
                            _ => {
                                reserve.stream_quota += 1;
                                return Err(Error::Connection(ConnectionError::conn_closing()));
                            }
                        }
                    }

                    if reserve.stream_quota > 0 && reserve.waiting_streams > 0 {
                        self.streams_quota_available.notify_one();
                    }
                    Ok(true)
                },
                Item::RegisterStream(RegisterStream {
                    stream: s.clone(),
                    fields: fields.clone(),
                }),
            );

            match res {
                Ok(true) => return Ok(s),
                Ok(false) => {
                    first_try = false;
                    let give_up = tokio::select! {
                        _ = &mut notified => None,
                        _ = s.context().done() => Some(Error::Status(s.context().err_status())),
                        _ = self.go_away.cancelled() => Some(err_stream_drain()),
                        _ = self.ctx.cancelled() => {
                            Some(Error::Connection(ConnectionError::conn_closing()))
                        }
                    };
                    if let Some(err) = give_up {
                        // The parked reservation is abandoned; the waiter
                        // count must shrink with it or quota wakeups target
                        // waiters that no longer exist.
                        let _ = self.cbuf.execute(|reserve| {
                            reserve.waiting_streams -= 1;
                        });
                        return Err(err);
                    }
                }
                Err(err) => {
                    let drained = matches!(&err, Error::Connection(_))
                        || matches!(&err, Error::Status(st) if st.message() == ERR_STREAM_DRAIN_MSG);
                    if drained {
                        s.cleanup_unadmitted(err.clone());
                    }
                    return Err(err);
                }
            }
        }
    }

    // ===== writes =====

    /// Formats `hdr` and `data` into DATA frame(s) and schedules them. The
    /// caller should proceed only if this returns `Ok`.
    pub async fn write(&self, s: &Stream, hdr: Bytes, data: Bytes, last: bool) -> Result<(), Error> {
        if last {
            // The final write moves the state machine; any other initial
            // state reports the cached close error.
            if !s.compare_and_swap_state(StreamState::Active, StreamState::WriteDone) {
                return Err(s.get_close_stream_err());
            }
        } else if s.state() != StreamState::Active {
            return Err(s.get_close_stream_err());
        }

        if !hdr.is_empty() || !data.is_empty() {
            let size = (hdr.len() + data.len()) as i32;
            if !s.wq.get(size).await {
                return Err(s.get_close_stream_err());
            }
        }

        self.cbuf
            .put(Item::Data(DataItem {
                stream_id: s.id(),
                end_stream: last,
                hdr,
                data,
            }))
            .map_err(Error::Connection)
    }

    // ===== stream teardown =====

    /// Clears the footprint of a stream. A non-`None` error emits
    /// RST_STREAM: CANCEL normally, or the graceful-shutdown code when the
    /// error equals [`graceful_shutdown_status`].
    ///
    /// Must not be called from the reader task.
    pub async fn close_stream(&self, s: &Stream, err: Option<Error>) {
        let (rst, st) = match &err {
            Some(e) => {
                let code = if is_graceful_shutdown_error(e) {
                    GRACEFUL_SHUTDOWN_CODE
                } else {
                    Reason::CANCEL
                };
                info!(
                    "stream {} closed by caller; err={}, rst={:?}",
                    s.id(),
                    e,
                    code
                );
                (Some(code), status_from_error(e))
            }
            None => (None, Status::ok()),
        };
        self.close_stream_inner(s, err, rst, st, None).await;
    }

    /// The single teardown path. Idempotent; a second closer waits for the
    /// first to finish. Must not be called while holding the transport
    /// mutex: it touches the control queue.
    async fn close_stream_inner(
        &self,
        s: &Stream,
        err: Option<Error>,
        rst: Option<Reason>,
        st: Status,
        mdata: Option<Metadata>,
    ) {
        if s.swap_state(StreamState::Done) == StreamState::Done {
            s.done.wait().await;
            return;
        }

        // Status and trailers settle before the terminal buffer entry and
        // the done signal; readers observe them only afterwards.
        s.set_status(st.clone());
        if let Some(md) = mdata {
            s.set_trailers(md);
        }
        match &err {
            Some(e) => s.write_msg(RecvMsg::Err(e.clone())),
            None => s.write_msg(RecvMsg::Eof),
        }
        let store = match &err {
            Some(e) => Some(e.clone()),
            None if !st.is_ok() => Some(Error::Status(st)),
            None => None,
        };
        if let Some(e) = store {
            s.store_close_stream_err(e);
        }

        if s.header_chan_cas() {
            s.set_no_headers();
            s.header_chan_broadcast();
        }

        // Writer-side cleanup: de-register, optional RST, and return one
        // stream-quota unit, waking a waiter if any.
        let _ = self.cbuf.execute_and_put(
            |reserve, _| {
                reserve.stream_quota += 1;
                if reserve.stream_quota > 0 && reserve.waiting_streams > 0 {
                    self.streams_quota_available.notify_one();
                }
                Ok(true)
            },
            Item::CleanupStream {
                stream_id: s.id(),
                rst,
            },
        );

        s.done.fire();
    }

    /// Called by the writer when a queued stream can no longer be opened
    /// (drain or shutdown raced its HEADERS).
    pub(crate) async fn orphan_stream(&self, s: &Stream, err: Error) {
        s.mark_unprocessed();
        let st = status_from_error(&err);
        self.close_stream_inner(s, Some(err), None, st, None).await;
    }

    /// Writer-side admission recheck immediately before HEADERS hit the
    /// wire; also wakes a dormant keepalive task now that a stream exists.
    pub(crate) fn init_established_stream(&self, _s: &Stream) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            TransportState::Reachable => {
                if inner.kp_dormant {
                    self.kp_dormancy.notify_one();
                }
                Ok(())
            }
            TransportState::Draining => Err(err_stream_drain()),
            TransportState::Closing => Err(Error::Connection(ConnectionError::conn_closing())),
        }
    }

    /// Writer-side callback of the cleanup item.
    pub(crate) fn remove_active_stream(&self, id: StreamId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(streams) = inner.active_streams.as_mut() {
            streams.remove(&id.as_u32());
        }
    }

    // ===== transport shutdown =====

    /// Kicks off transport shutdown. Idempotent: only the first call does
    /// anything. `on_close` fires before the state moves to `Closing`, so
    /// the owner stops routing to this transport before anything else is
    /// observable.
    pub async fn close(&self, err: ConnectionError) {
        let streams = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == TransportState::Closing {
                return;
            }
            (self.callbacks.on_close)();
            inner.state = TransportState::Closing;
            if inner.kp_dormant {
                self.kp_dormancy.notify_one();
            }
            inner.active_streams.take()
        };

        info!("transport closing; err={}", err);
        let orphans = self.cbuf.finish(err.clone());
        self.ctx.cancel();

        let st = Status::new(Code::Unavailable, ConnectionError::conn_closing().to_string());
        for s in orphans {
            s.mark_unprocessed();
            self.close_stream_inner(
                &s,
                Some(Error::Connection(err.clone())),
                None,
                st.clone(),
                None,
            )
            .await;
        }
        if let Some(streams) = streams {
            for (_, s) in streams {
                self.close_stream_inner(
                    &s,
                    Some(Error::Connection(err.clone())),
                    None,
                    st.clone(),
                    None,
                )
                .await;
            }
        }
    }

    /// Moves to draining: no new streams, close once the last active stream
    /// finishes. With no active streams the transport closes immediately.
    pub async fn graceful_close(&self) {
        let active = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != TransportState::Reachable {
                return;
            }
            inner.state = TransportState::Draining;
            inner.active_streams.as_ref().map_or(0, |m| m.len())
        };
        if active == 0 {
            self.close(ConnectionError::ignorable(
                "no active streams left to process while draining",
            ))
            .await;
            return;
        }
        let _ = self.cbuf.put(Item::GoAwayIn);
    }

    // ===== window management =====

    /// Credits the peer for bytes the application consumed on `s`.
    pub(crate) fn update_window(&self, s: &Stream, n: u32) {
        let w = s.fc.lock().unwrap().on_read(n);
        if w > 0 {
            let _ = self.cbuf.put(Item::WindowUpdateOut {
                stream_id: s.id(),
                increment: w,
            });
        }
    }

    /// Extends the stream window beyond its initial size when the
    /// application asks for a read larger than the window.
    pub(crate) fn adjust_window(&self, s: &Stream, n: u32) {
        let w = s.fc.lock().unwrap().maybe_adjust(n);
        if w > 0 {
            let _ = self.cbuf.put(Item::WindowUpdateOut {
                stream_id: s.id(),
                increment: w,
            });
        }
    }

    /// Applies a new BDP-derived window: connection window first, then the
    /// SETTINGS announcement, then the retroactive per-stream credit.
    fn update_flow_control(&self, n: u32) {
        let conn_delta = self.fc.lock().unwrap().new_limit(n);
        let mut per_stream = Vec::new();

        let _ = self.cbuf.execute_and_put(
            |_, _| {
                self.initial_window_size.store(n, Ordering::Release);
                let inner = self.inner.lock().unwrap();
                if let Some(streams) = inner.active_streams.as_ref() {
                    for s in streams.values() {
                        let d = s.fc.lock().unwrap().new_limit(n);
                        if d > 0 {
                            per_stream.push((s.id(), d));
                        }
                    }
                }
                // The state update above must run even when there is no
                // connection-level delta to announce.
                Ok(conn_delta > 0)
            },
            Item::WindowUpdateOut {
                stream_id: StreamId::ZERO,
                increment: conn_delta,
            },
        );

        let mut settings = Settings::new();
        settings.set_initial_window_size(Some(n));
        let _ = self.cbuf.put(Item::SettingsOut(settings));

        for (stream_id, increment) in per_stream {
            let _ = self.cbuf.put(Item::WindowUpdateOut {
                stream_id,
                increment,
            });
        }
    }

    // ===== reader =====

    async fn read_loop<R>(self: Arc<Self>, framer: &mut FramedRead<R>)
    where
        R: AsyncRead + Unpin,
    {
        // The server preface is a SETTINGS frame; anything else is fatal.
        let first = tokio::select! {
            f = framer.next() => f,
            _ = self.ctx.cancelled() => return,
        };
        self.touch_last_read();
        match first {
            Some(Ok(Frame::Settings(s))) if !s.is_ack() => self.handle_settings(s, true),
            Some(Ok(_)) => {
                self.close(ConnectionError::new(
                    "first frame received is not a settings frame",
                ))
                .await;
                return;
            }
            Some(Err(e)) => {
                self.close(recv_err_to_conn_err(e)).await;
                return;
            }
            None => {
                self.close(ConnectionError::new(
                    "connection closed before the server preface",
                ))
                .await;
                return;
            }
        }

        loop {
            self.cbuf.throttle().await;
            let frame = tokio::select! {
                f = framer.next() => f,
                _ = self.ctx.cancelled() => return,
            };
            self.touch_last_read();

            match frame {
                None => {
                    self.close(ConnectionError::new("error reading from server: EOF"))
                        .await;
                    return;
                }
                Some(Err(RecvError::Stream { id, reason })) => {
                    // Malformed response on one stream; the transport
                    // survives.
                    if let Some(s) = self.get_stream(id) {
                        let code = status::code_from_http2(reason).unwrap_or(Code::Unknown);
                        let st = Status::new(code, reason.description());
                        info!("stream error on {}; reason={:?}", id, reason);
                        self.close_stream_inner(
                            &s,
                            Some(Error::Status(st.clone())),
                            Some(Reason::PROTOCOL_ERROR),
                            st,
                            None,
                        )
                        .await;
                    }
                    continue;
                }
                Some(Err(e)) => {
                    self.close(recv_err_to_conn_err(e)).await;
                    return;
                }
                Some(Ok(frame)) => match frame {
                    Frame::Headers(f) => self.operate_headers(f).await,
                    Frame::Data(f) => self.handle_data(f).await,
                    Frame::Reset(f) => self.handle_rst_stream(f).await,
                    Frame::Settings(f) => self.handle_settings(f, false),
                    Frame::Ping(f) => self.handle_ping(f),
                    Frame::GoAway(f) => self.handle_go_away(f).await,
                    Frame::WindowUpdate(f) => self.handle_window_update(f),
                },
            }
        }
    }

    async fn handle_data(&self, f: frame::Data) {
        let size = f.flow_len();

        let mut send_bdp_ping = false;
        if let Some(bdp) = &self.bdp {
            send_bdp_ping = bdp.lock().unwrap().add(size);
        }

        // Connection flow control is decoupled from application reads: it
        // replenishes as data arrives so fast streams are not starved by
        // slow ones. Only the stream window ties the sender to the reader.
        let w = self.fc.lock().unwrap().on_data(size);
        if w > 0 {
            let _ = self.cbuf.put(Item::WindowUpdateOut {
                stream_id: StreamId::ZERO,
                increment: w,
            });
        }
        if send_bdp_ping {
            // Flush any withheld window credit ahead of the ping so an L7
            // proxy does not mistake it for ping abuse.
            let w = self.fc.lock().unwrap().reset();
            if w > 0 {
                let _ = self.cbuf.put(Item::WindowUpdateOut {
                    stream_id: StreamId::ZERO,
                    increment: w,
                });
            }
            let _ = self.cbuf.put(Item::Ping {
                ack: false,
                payload: frame::Ping::BDP,
            });
        }

        let Some(s) = self.get_stream(f.stream_id()) else {
            return;
        };
        if size > 0 {
            let res = s.fc.lock().unwrap().on_data(size);
            if let Err(overrun) = res {
                info!(
                    "stream {} inbound flow control violated: {}",
                    s.id(),
                    overrun
                );
                let st = Status::new(Code::Internal, overrun.to_string());
                self.close_stream_inner(&s, None, Some(Reason::FLOW_CONTROL_ERROR), st, None)
                    .await;
                return;
            }
            let padding = size - f.payload().len() as u32;
            if padding > 0 {
                let w = s.fc.lock().unwrap().on_read(padding);
                if w > 0 {
                    let _ = self.cbuf.put(Item::WindowUpdateOut {
                        stream_id: s.id(),
                        increment: w,
                    });
                }
            }
            let end_stream = f.is_end_stream();
            let payload = f.into_payload();
            if !payload.is_empty() {
                s.write_msg(RecvMsg::Data(payload));
            }
            if end_stream {
                self.close_read_without_trailers(&s).await;
            }
            return;
        }
        if f.is_end_stream() {
            self.close_read_without_trailers(&s).await;
        }
    }

    /// The server half-closed with DATA instead of trailers.
    async fn close_read_without_trailers(&self, s: &Stream) {
        let st = Status::new(
            Code::Internal,
            "server closed the stream without sending trailers",
        );
        self.close_stream_inner(s, None, None, st, None).await;
    }

    async fn operate_headers(&self, f: frame::Headers) {
        let Some(s) = self.get_stream(f.stream_id()) else {
            return;
        };
        let end_stream = f.is_end_stream();
        s.mark_bytes_received();
        let initial_header = !s.header_chan_is_closing();

        if !initial_header && !end_stream {
            // A header block may only open a stream or close it: the second
            // block must carry END_STREAM.
            let st = Status::new(
                Code::Internal,
                "a HEADERS frame cannot appear in the middle of a stream",
            );
            info!("stream {} received mid-stream HEADERS", s.id());
            self.close_stream_inner(
                &s,
                Some(Error::Status(st.clone())),
                Some(Reason::PROTOCOL_ERROR),
                st,
                None,
            )
            .await;
            return;
        }

        // If a response header block was seen already, the peer is known to
        // speak the protocol and trailers need not repeat content-type.
        let state = match DecodeState::decode(f.fields(), !initial_header) {
            Ok(state) => state,
            Err(st) => {
                info!("stream {} headers failed to decode: {}", s.id(), st);
                self.close_stream_inner(
                    &s,
                    Some(Error::Status(st.clone())),
                    Some(Reason::PROTOCOL_ERROR),
                    st,
                    None,
                )
                .await;
                return;
            }
        };

        if s.header_chan_cas() {
            if !end_stream {
                let md = (!state.mdata.is_empty()).then(|| state.mdata.clone());
                s.set_header_data(md.or_else(|| Some(Metadata::new())), state.encoding.clone());
            } else {
                // Trailers-only response.
                s.set_header_data(Some(Metadata::new()), None);
                s.set_no_headers();
            }
            s.header_chan_broadcast();
        }

        if !end_stream {
            return;
        }

        // END_STREAM while we were still writing: tell the peer we are done
        // with a benign reset in addition to surfacing the status.
        let rst = (s.state() == StreamState::Active).then_some(Reason::NO_ERROR);
        s.set_biz_status(state.biz_status());
        let st = state.status();
        self.close_stream_inner(&s, None, rst, st, Some(state.mdata))
            .await;
    }

    async fn handle_rst_stream(&self, f: frame::Reset) {
        let Some(s) = self.get_stream(f.stream_id()) else {
            return;
        };
        if f.reason() == Reason::REFUSED_STREAM {
            // The server demonstrably did not process the stream.
            s.mark_unprocessed();
        }
        let mut code = match status::code_from_http2(f.reason()) {
            Some(code) => code,
            None => {
                warn!(
                    "no mapped status for HTTP/2 error {:?} on stream {}",
                    f.reason(),
                    s.id()
                );
                Code::Unknown
            }
        };
        if code == Code::Cancelled {
            if let Some(deadline) = s.context().deadline() {
                if Instant::now() >= deadline {
                    // The deadline expired first and is the likelier cause.
                    code = Code::DeadlineExceeded;
                }
            }
        }
        let msg = if f.reason() == GRACEFUL_SHUTDOWN_CODE {
            GRACEFUL_SHUTDOWN_MSG.to_owned()
        } else {
            format!(
                "stream terminated by RST_STREAM with error code: {:?}",
                f.reason()
            )
        };
        self.close_stream_inner(&s, None, None, Status::new(code, msg), None)
            .await;
    }

    fn handle_settings(&self, f: Settings, is_first: bool) {
        if f.is_ack() {
            return;
        }
        let mut max_streams = f.max_concurrent_streams();
        if is_first && max_streams.is_none() {
            max_streams = Some(u32::MAX);
        }
        let max_header_list = f.max_header_list_size();

        // Quota and header-cap updates happen under the queue lock so they
        // serialize with stream admission; the writer applies the rest and
        // acks.
        let _ = self.cbuf.execute_and_put(
            |reserve, _| {
                if let Some(max) = max_header_list {
                    reserve.max_send_header_list_size = Some(max);
                }
                if let Some(max) = max_streams {
                    let delta = i64::from(max) - i64::from(reserve.max_concurrent_streams);
                    reserve.max_concurrent_streams = max;
                    reserve.stream_quota += delta;
                    if delta > 0 && reserve.waiting_streams > 0 {
                        // Wake every waiter at once.
                        self.streams_quota_available.notify_waiters();
                    }
                }
                Ok(true)
            },
            Item::SettingsIn(f),
        );
    }

    fn handle_ping(&self, f: frame::Ping) {
        if f.is_ack() {
            if let Some(bdp) = &self.bdp {
                let grown = bdp.lock().unwrap().calculate(f.payload());
                if let Some(n) = grown {
                    debug!("bdp estimate grew; new window={}", n);
                    self.update_flow_control(n);
                }
            }
            return;
        }
        let _ = self.cbuf.put(Item::Ping {
            ack: true,
            payload: *f.payload(),
        });
    }

    async fn handle_go_away(&self, f: frame::GoAway) {
        // Computed entirely while the lock is held so the guard never has to
        // live across an `.await` (the control queue is only touched after).
        enum GoAwayOutcome<S> {
            ReturnNow,
            Close(ConnectionError),
            Proceed(Vec<S>, bool),
        }

        let outcome = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == TransportState::Closing {
                GoAwayOutcome::ReturnNow
            } else {
                if f.reason() == Reason::ENHANCE_YOUR_CALM {
                    info!("received GOAWAY with ENHANCE_YOUR_CALM");
                }
                let id = f.last_stream_id();
                if !id.is_zero() && !id.is_client_initiated() {
                    GoAwayOutcome::Close(ConnectionError::new(format!(
                        "received goaway with non-zero even-numbered stream id: {}",
                        id
                    )))
                } else {
                    // A server may send two GOAWAYs: first a large id as an
                    // advance notice, then, one RTT later, the id of the
                    // last stream it will actually process. Streams in
                    // between are unprocessed and safe to retry elsewhere; a
                    // GOAWAY id that grows instead is a protocol violation.
                    let exceeded = if self.go_away.is_cancelled() {
                        let prev = inner.prev_goaway_id;
                        if id.as_u32() > prev {
                            Some(prev)
                        } else {
                            None
                        }
                    } else {
                        inner.goaway_reason = derive_goaway_reason(&f);
                        self.go_away.cancel();
                        // Tell the owner before refusing new streams, so it
                        // stops picking this transport first.
                        if inner.state != TransportState::Draining {
                            (self.callbacks.on_go_away)(inner.goaway_reason);
                            inner.state = TransportState::Draining;
                        }
                        None
                    };

                    if let Some(prev) = exceeded {
                        GoAwayOutcome::Close(ConnectionError::new(format!(
                            "received goaway with stream id {} exceeding the id of the previous goaway {}",
                            id, prev
                        )))
                    } else {
                        let mut upper = inner.prev_goaway_id;
                        if upper == 0 {
                            upper = u32::MAX;
                        }
                        inner.prev_goaway_id = id.as_u32();

                        let streams = inner.active_streams.as_ref();
                        let active = streams.map_or(0, |m| m.len());
                        if active == 0 {
                            GoAwayOutcome::Proceed(Vec::new(), true)
                        } else {
                            let mut to_close = Vec::new();
                            for s in streams.expect("active > 0").values() {
                                let sid = s.id().as_u32();
                                if sid > id.as_u32() && sid <= upper {
                                    s.mark_unprocessed();
                                    to_close.push(s.clone());
                                }
                            }
                            GoAwayOutcome::Proceed(to_close, false)
                        }
                    }
                }
            }
            // The mutex drops here.
        };

        let (to_close, close_transport) = match outcome {
            GoAwayOutcome::ReturnNow => return,
            GoAwayOutcome::Close(err) => {
                self.close(err).await;
                return;
            }
            GoAwayOutcome::Proceed(to_close, close_transport) => (to_close, close_transport),
        };

        if close_transport {
            self.close(ConnectionError::ignorable(
                "received goaway and there are no active streams",
            ))
            .await;
            return;
        }

        let st = Status::new(Code::Unavailable, STATUS_GOAWAY_MSG);
        for s in &to_close {
            self.close_stream_inner(s, Some(err_stream_drain()), None, st.clone(), None)
                .await;
        }
        let _ = self.cbuf.put(Item::GoAwayIn);
    }

    fn handle_window_update(&self, f: frame::WindowUpdate) {
        let _ = self.cbuf.put(Item::WindowUpdateIn {
            stream_id: f.stream_id(),
            increment: f.size_increment(),
        });
    }

    // ===== keepalive =====

    /// Sends pings while the connection is idle; closes the transport when
    /// an ACK misses its deadline. Parks on the dormancy signal while no
    /// stream is active (unless pinging without streams is permitted).
    async fn keepalive(self: Arc<Self>) {
        let mut outstanding_ping = false;
        let mut timeout_left = Duration::ZERO;
        let mut prev_nanos = self.now_nanos();
        let mut sleep_for = self.kp.time;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.ctx.cancelled() => return,
            }

            let last_read = self.last_read.load(Ordering::Acquire);
            if last_read > prev_nanos {
                // Read activity since the last tick; push the next ping out
                // to a full idle period after it.
                outstanding_ping = false;
                let elapsed_since_read = self.now_nanos() - last_read;
                sleep_for = self
                    .kp
                    .time
                    .saturating_sub(Duration::from_nanos(elapsed_since_read.max(0) as u64));
                prev_nanos = last_read;
                continue;
            }
            if outstanding_ping && timeout_left.is_zero() {
                self.close(ConnectionError::new(
                    "keepalive ping failed to receive ACK within timeout",
                ))
                .await;
                return;
            }

            // The listener is created and potentially enabled up front so it
            // can be armed while the lock is held, without ever holding the
            // guard across an `.await`.
            let notified = self.kp_dormancy.notified();
            tokio::pin!(notified);

            let wait_for_wake = {
                let mut inner = self.inner.lock().unwrap();
                if inner.state == TransportState::Closing {
                    // Exiting here avoids racing a dormancy wake-up from
                    // close against a wait that would never be signalled
                    // again.
                    return;
                }
                let idle = inner.active_streams.as_ref().map_or(true, |m| m.is_empty());
                if idle && !self.kp.permit_without_stream {
                    // A ping sent before dormancy may never be acked once we
                    // stop watching; send a fresh one on wake-up.
                    outstanding_ping = false;
                    inner.kp_dormant = true;
                    notified.as_mut().enable();
                    true
                } else {
                    inner.kp_dormant = false;
                    false
                }
                // The mutex drops here.
            };

            if wait_for_wake {
                tokio::select! {
                    _ = notified => {}
                    _ = self.ctx.cancelled() => return,
                }
                self.inner.lock().unwrap().kp_dormant = false;
            }

            // Either the timer expired with no traffic, or a new stream
            // woke us from dormancy. Both mean: ping.
            if !outstanding_ping {
                trace!("sending keepalive ping");
                let _ = self.cbuf.put(Item::Ping {
                    ack: false,
                    payload: frame::Ping::KEEPALIVE,
                });
                timeout_left = self.kp.timeout;
                outstanding_ping = true;
            }
            let sleep_duration = self.kp.time.min(timeout_left);
            timeout_left -= sleep_duration;
            sleep_for = sleep_duration;
        }
    }

    // ===== janitor =====

    /// Sweeps streams whose context ended while nothing was reading or
    /// writing them; without the sweep a parked stream would only notice
    /// cancellation on its next operation.
    async fn janitor(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.ctx.cancelled() => return,
            }

            let expired: Vec<Arc<Stream>> = {
                let inner = self.inner.lock().unwrap();
                match inner.active_streams.as_ref() {
                    Some(streams) => streams
                        .values()
                        .filter(|s| s.context().is_done())
                        .cloned()
                        .collect(),
                    None => return,
                }
            };

            for s in expired {
                let st = s.context().err_status();
                debug!("janitor closing cancelled stream {}; {}", s.id(), st);
                self.close_stream_inner(
                    &s,
                    Some(Error::Status(st.clone())),
                    Some(Reason::CANCEL),
                    st,
                    None,
                )
                .await;
            }
        }
    }

    // ===== diagnostics =====

    /// Snapshot of the transport and its active streams.
    pub async fn dump(&self) -> TransportDump {
        let out_flow_control_size = self.get_out_flow_window().await;
        let inner = self.inner.lock().unwrap();

        let mut active_streams = Vec::new();
        if let Some(streams) = inner.active_streams.as_ref() {
            let mut ids: Vec<u32> = streams.keys().copied().collect();
            ids.sort_unstable();
            for id in ids {
                let s = &streams[&id];
                let mut remote_address = self.remote_addr.clone();
                if let Some(md) = s.try_headers() {
                    if let Some(rip) = md.get("rip") {
                        if !rip.is_empty() {
                            remote_address = rip.to_owned();
                        }
                    }
                }
                active_streams.push(StreamDump {
                    id,
                    remote_address,
                    method: s.method().to_owned(),
                    state: s.state(),
                    write_quota: s.wq.current(),
                    valid_header_received: s.header_valid(),
                });
            }
        }

        TransportDump {
            local_address: self.local_addr.clone(),
            state: inner.state,
            out_flow_control_size,
            active_streams,
        }
    }

    async fn get_out_flow_window(&self) -> i64 {
        let (tx, rx) = oneshot::channel();
        if self.cbuf.put(Item::OutFlowSizeRequest(tx)).is_err() {
            return -1;
        }
        tokio::select! {
            sz = rx => sz.map(i64::from).unwrap_or(-1),
            _ = self.ctx.cancelled() => -1,
            _ = tokio::time::sleep(Duration::from_secs(1)) => -2,
        }
    }
}

impl std::fmt::Debug for ClientTransport {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("ClientTransport")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.inner.lock().unwrap().state)
            .finish_non_exhaustive()
    }
}

fn is_graceful_shutdown_error(err: &Error) -> bool {
    matches!(err, Error::Status(st)
        if st.code() == Code::Unavailable && st.message() == GRACEFUL_SHUTDOWN_MSG)
}

fn derive_goaway_reason(f: &frame::GoAway) -> GoAwayReason {
    if f.reason() == Reason::ENHANCE_YOUR_CALM && &f.debug_data()[..] == b"too_many_pings" {
        return GoAwayReason::TooManyPings;
    }
    GoAwayReason::NoReason
}

fn recv_err_to_conn_err(err: RecvError) -> ConnectionError {
    match err {
        RecvError::Connection(reason) => ConnectionError::proto(reason),
        RecvError::Io(e) => e.into(),
        RecvError::Stream { reason, .. } => ConnectionError::proto(reason),
    }
}

/// Diagnostic snapshot of the transport.
#[derive(Debug, Clone)]
pub struct TransportDump {
    pub local_address: String,
    pub state: TransportState,
    /// Connection-level outbound window; -1 when the transport is closed,
    /// -2 when the writer did not answer in time.
    pub out_flow_control_size: i64,
    pub active_streams: Vec<StreamDump>,
}

/// Diagnostic snapshot of one active stream.
#[derive(Debug, Clone)]
pub struct StreamDump {
    pub id: u32,
    /// The peer address, overridden by an `rip` response metadata entry
    /// when present.
    pub remote_address: String,
    pub method: String,
    pub state: StreamState,
    pub write_quota: i32,
    pub valid_header_received: bool,
}
