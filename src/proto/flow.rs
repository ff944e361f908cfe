//! Inbound and outbound credit accounting.
//!
//! Three controllers cooperate: `TrInFlow` meters inbound bytes for the whole
//! connection, `InFlow` meters inbound bytes per stream, and `WriteQuota` is
//! the per-stream outbound throttle decoupled from the HTTP/2 windows (which
//! the writer loop enforces separately).
//!
//! Inbound replenishment is hysteretic: credit is handed back to the peer in
//! WINDOW_UPDATE frames only once a quarter of the window has accumulated,
//! keeping the update stream coarse-grained.

use crate::proto::Event;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Inbound flow accounting for the connection as a whole.
///
/// Connection-level credit is replenished as data arrives, independent of
/// whether the application has consumed it; only the per-stream window ties
/// the sender to application reads. This keeps fast streams from starving
/// behind slow ones.
#[derive(Debug)]
pub(crate) struct TrInFlow {
    limit: u32,
    unacked: u32,
}

impl TrInFlow {
    pub fn new(limit: u32) -> TrInFlow {
        TrInFlow { limit, unacked: 0 }
    }

    /// Re-bases the window. Windows only grow (the BDP estimator never
    /// shrinks them); returns the delta to advertise.
    pub fn new_limit(&mut self, n: u32) -> u32 {
        let d = n.saturating_sub(self.limit);
        self.limit = n;
        d
    }

    /// Accounts for received bytes. Returns the WINDOW_UPDATE increment to
    /// send, or 0 while below the replenishment threshold.
    pub fn on_data(&mut self, n: u32) -> u32 {
        self.unacked += n;
        if self.unacked >= self.limit / 4 {
            let w = self.unacked;
            self.unacked = 0;
            w
        } else {
            0
        }
    }

    /// Returns and clears all unacknowledged credit. Sent ahead of a BDP
    /// ping so the measurement is not skewed by withheld updates.
    pub fn reset(&mut self) -> u32 {
        let w = self.unacked;
        self.unacked = 0;
        w
    }
}

/// Inbound flow accounting for one stream.
#[derive(Debug, Default)]
pub(crate) struct InFlow {
    /// The advertised window.
    limit: u32,

    /// Bytes received but not yet consumed by the application.
    pending_data: u32,

    /// Bytes consumed but not yet re-advertised to the peer.
    pending_update: u32,

    /// Extra credit advertised beyond `limit` (large-read adjustments and
    /// window re-basing). Burned down before `pending_update` accrues.
    delta: u32,
}

impl InFlow {
    pub fn new(limit: u32) -> InFlow {
        InFlow {
            limit,
            ..InFlow::default()
        }
    }

    /// Re-bases the window after a flow-control update, returning the extra
    /// credit to advertise to the peer.
    pub fn new_limit(&mut self, n: u32) -> u32 {
        let d = n.saturating_sub(self.limit);
        self.limit = n;
        self.delta += d;
        d
    }

    /// Extra window to advertise when the application asks for `n` bytes and
    /// the estimated sender quota cannot cover them.
    pub fn maybe_adjust(&mut self, n: u32) -> u32 {
        let n = n.min(i32::MAX as u32);

        // Estimate the bytes the sender may still push, and the portion of
        // the requested read that is not already buffered here.
        let est_sender_quota =
            self.limit as i64 + self.delta as i64 - (self.pending_data + self.pending_update) as i64;
        let est_untransmitted = n as i64 - self.pending_data as i64;

        if est_untransmitted > est_sender_quota {
            // Total advertised credit stays inside the legal window range.
            let add = n.min(crate::frame::MAX_WINDOW_SIZE.saturating_sub(self.limit + self.delta));
            self.delta += add;
            return add;
        }
        0
    }

    /// Accounts for received bytes. Errors when the peer overruns the
    /// advertised window; the stream is then reset with FLOW_CONTROL_ERROR
    /// while the transport stays alive.
    pub fn on_data(&mut self, n: u32) -> Result<(), InFlowOverrun> {
        self.pending_data += n;
        if self.pending_data + self.pending_update > self.limit + self.delta {
            let err = InFlowOverrun {
                received: self.pending_data + self.pending_update,
                limit: self.limit + self.delta,
            };
            self.pending_data -= n;
            return Err(err);
        }
        Ok(())
    }

    /// Accounts for bytes the application consumed. Returns the
    /// WINDOW_UPDATE increment to send once the hysteresis threshold is
    /// crossed.
    pub fn on_read(&mut self, n: u32) -> u32 {
        if self.pending_data == 0 {
            return 0;
        }
        let n = n.min(self.pending_data);
        self.pending_data -= n;

        let mut n = n;
        if n > self.delta {
            n -= self.delta;
            self.delta = 0;
        } else {
            self.delta -= n;
            n = 0;
        }
        self.pending_update += n;
        if self.pending_update >= self.limit / 4 {
            let w = self.pending_update;
            self.pending_update = 0;
            return w;
        }
        0
    }
}

/// The peer pushed more data than the stream window allows.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct InFlowOverrun {
    pub received: u32,
    pub limit: u32,
}

impl std::fmt::Display for InFlowOverrun {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            fmt,
            "received {}-bytes data exceeding the limit {} bytes",
            self.received, self.limit
        )
    }
}

/// Outbound write throttle for one stream: a signed credit that bounds how
/// much data a stream may park in the control queue before the writer has
/// drained it to the wire.
///
/// `get` may overdraw the quota into the negative; it only blocks while the
/// quota is non-positive. The writer replenishes as bytes are written out.
#[derive(Debug)]
pub(crate) struct WriteQuota {
    quota: AtomicI32,
    notify: Notify,
    done: Arc<Event>,
}

/// Default per-stream write quota: 64 KiB.
pub(crate) const DEFAULT_WRITE_QUOTA: i32 = 64 * 1024;

impl WriteQuota {
    pub fn new(quota: i32, done: Arc<Event>) -> WriteQuota {
        WriteQuota {
            quota: AtomicI32::new(quota),
            notify: Notify::new(),
            done,
        }
    }

    /// Acquires `sz` credits, waiting while the quota is exhausted.
    /// Returns false if the stream terminated first.
    pub async fn get(&self, sz: i32) -> bool {
        loop {
            if self.quota.load(Ordering::Acquire) > 0 {
                self.quota.fetch_sub(sz, Ordering::AcqRel);
                return true;
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.quota.load(Ordering::Acquire) > 0 {
                continue;
            }
            if self.done.is_fired() {
                return false;
            }

            tokio::select! {
                _ = notified => {}
                _ = self.done.wait() => return false,
            }
        }
    }

    pub fn replenish(&self, n: i32) {
        let after = self.quota.fetch_add(n, Ordering::AcqRel) + n;
        if after > 0 && after - n <= 0 {
            self.notify.notify_one();
        }
    }

    pub fn current(&self) -> i32 {
        self.quota.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tr_in_flow_quarter_threshold() {
        let mut fc = TrInFlow::new(64 * 1024);

        assert_eq!(fc.on_data(100), 0);
        // Crossing a quarter of the window releases everything unacked.
        assert_eq!(fc.on_data(16_300), 16_400);
        // Counter restarts after replenishment.
        assert_eq!(fc.on_data(1), 0);
        assert_eq!(fc.reset(), 1);
        assert_eq!(fc.reset(), 0);
    }

    #[test]
    fn tr_in_flow_new_limit_returns_delta() {
        let mut fc = TrInFlow::new(65_535);
        assert_eq!(fc.new_limit(262_144), 262_144 - 65_535);
        // The bigger window raises the replenishment threshold.
        assert_eq!(fc.on_data(64_000), 0);
        assert_eq!(fc.on_data(2_000), 66_000);
    }

    #[test]
    fn in_flow_overrun_is_detected() {
        let mut fc = InFlow::new(1_000);
        assert!(fc.on_data(1_000).is_ok());
        let err = fc.on_data(1).unwrap_err();
        assert_eq!(
            err,
            InFlowOverrun {
                received: 1_001,
                limit: 1_000
            }
        );
    }

    #[test]
    fn in_flow_read_hysteresis() {
        let mut fc = InFlow::new(64 * 1024);
        assert!(fc.on_data(40_000).is_ok());

        // Below a quarter of the window: no update yet.
        assert_eq!(fc.on_read(10_000), 0);
        // Crossing the threshold releases everything accumulated.
        assert_eq!(fc.on_read(10_000), 20_000);
        assert_eq!(fc.on_read(20_000), 20_000);
    }

    #[test]
    fn in_flow_window_balance() {
        // Property: total advertised updates equal total consumed bytes,
        // modulo the outstanding unreplenished threshold.
        let mut fc = InFlow::new(16 * 1024);
        let mut consumed = 0u64;
        let mut advertised = 0u64;

        for chunk in [1_000u32, 3_000, 4_096, 500, 7_000, 2_048] {
            fc.on_data(chunk).unwrap();
            advertised += u64::from(fc.on_read(chunk));
            consumed += u64::from(chunk);
        }
        assert!(consumed - advertised < 16 * 1024 / 4);
    }

    #[test]
    fn in_flow_maybe_adjust_extends_credit() {
        let mut fc = InFlow::new(1_024);
        // The application wants far more than the window can deliver.
        let extra = fc.maybe_adjust(10_000);
        assert_eq!(extra, 10_000);
        // The extension is real credit: the peer may now push that much.
        assert!(fc.on_data(10_000).is_ok());
        // Reads burn the delta before accruing pending updates.
        assert_eq!(fc.on_read(10_000), 0);
    }

    #[test]
    fn in_flow_new_limit_advertises_growth() {
        let mut fc = InFlow::new(65_535);
        assert_eq!(fc.new_limit(262_144), 262_144 - 65_535);
        assert_eq!(fc.new_limit(262_144), 0);
    }

    #[tokio::test]
    async fn write_quota_blocks_until_replenished() {
        let done = Arc::new(Event::new());
        let wq = Arc::new(WriteQuota::new(10, done.clone()));

        assert!(wq.get(10).await);
        // Quota is now zero; the next get parks.
        let waiter = {
            let wq = wq.clone();
            tokio::spawn(async move { wq.get(5).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        wq.replenish(10);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn write_quota_released_by_stream_termination() {
        let done = Arc::new(Event::new());
        let wq = Arc::new(WriteQuota::new(1, done.clone()));

        assert!(wq.get(100).await); // overdraw is allowed
        let waiter = {
            let wq = wq.clone();
            tokio::spawn(async move { wq.get(1).await })
        };
        tokio::task::yield_now().await;

        done.fire();
        assert!(!waiter.await.unwrap());
    }
}
