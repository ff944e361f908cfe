//! An HTTP/2 based RPC client transport.
//!
//! A single connection (plain TCP or TLS, dialed by the caller) is
//! multiplexed into many concurrent logical streams, each carrying one
//! length-delimited RPC with trailer-carried status. The crate implements
//! the client side of the wire protocol (framing, HPACK, per-stream and
//! per-connection flow control, SETTINGS, PING/GOAWAY liveness) and the RPC
//! semantics layered on top: deadlines propagated as a timeout header,
//! trailer status codes, compression negotiation and graceful shutdown.
//!
//! # Layout
//!
//! The transport runs four background tasks. A reader parses inbound frames
//! and dispatches them to streams; a writer drains the control queue onto
//! the wire, enforcing outbound flow control; a keepalive task pings idle
//! connections; a janitor sweeps cancelled streams. Applications interact
//! through [`ClientTransport`] and [`Stream`].
//!
//! ```no_run
//! use h2rpc::{CallHeader, ClientTransport, ConnectOptions, StreamContext, TransportCallbacks};
//! use bytes::Bytes;
//!
//! # async fn doc(io: tokio::io::DuplexStream) -> Result<(), h2rpc::Error> {
//! let transport =
//!     ClientTransport::connect(io, ConnectOptions::default(), TransportCallbacks::default())
//!         .await?;
//!
//! let call = CallHeader {
//!     method: "/package.Service/Method".to_owned(),
//!     host: "example.com".to_owned(),
//!     ..CallHeader::default()
//! };
//! let ctx = StreamContext::with_timeout(std::time::Duration::from_secs(1));
//! let stream = transport.new_stream(ctx, call).await?;
//!
//! transport
//!     .write(&stream, Bytes::new(), Bytes::from_static(b"..."), true)
//!     .await?;
//! while let Some(chunk) = stream.recv_data().await? {
//!     let _ = chunk;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Out of scope: stub generation, dialing and TLS, connection pooling,
//! retries, load balancing and message encoding. The owning pool observes
//! the transport through [`TransportCallbacks`] and the `closed` /
//! `go_away_received` signals.

#![deny(missing_debug_implementations)]

mod codec;
mod error;
mod frame;
mod metadata;
mod proto;
mod status;

pub use crate::error::{ConnectionError, Error, GoAwayReason, Reason};
pub use crate::metadata::Metadata;
pub use crate::proto::stream::{Stream, StreamContext, StreamState};
pub use crate::proto::transport::{
    graceful_shutdown_status, CallHeader, ClientTransport, ConnectOptions, KeepaliveParams,
    StreamDump, TransportCallbacks, TransportDump, TransportState,
};
pub use crate::status::{BizStatus, Code, Status};
