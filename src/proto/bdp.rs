//! Bandwidth-delay-product estimation.
//!
//! Active only when neither window size was configured by the user. The
//! estimator samples how many bytes arrive between a BDP ping and its ACK;
//! when the sample approaches the current window and the measured bandwidth
//! is still climbing, the window doubles (gated by an upper limit) and the
//! transport re-advertises its flow control limits.

use crate::frame::Ping;

use tokio::time::Instant;

/// Hard cap on the dynamic window: 16 MiB.
const BDP_LIMIT: u32 = (1 << 20) * 16;

/// EWMA weight for RTT samples once enough samples have been taken.
const ALPHA: f64 = 0.9;

/// Fraction of the current BDP the sample must reach before the window is
/// considered undersized.
const BETA: f64 = 0.66;

/// Growth factor applied to an undersized window.
const GAMMA: f64 = 2.0;

#[derive(Debug)]
pub(crate) struct BdpEstimator {
    /// Current BDP estimate, which is also the advertised window size.
    bdp: u32,

    /// Bytes received between the in-flight ping and its ACK.
    sample: u32,

    /// Largest bandwidth observed so far, bytes/sec.
    bw_max: f64,

    /// True while a BDP ping is in flight.
    is_sent: bool,

    /// When the in-flight ping hit the wire. Stamped by the writer.
    sent_at: Option<Instant>,

    sample_count: u64,

    /// Smoothed round-trip time, seconds.
    rtt: f64,
}

impl BdpEstimator {
    pub fn new(bdp: u32) -> BdpEstimator {
        BdpEstimator {
            bdp,
            sample: 0,
            bw_max: 0.0,
            is_sent: false,
            sent_at: None,
            sample_count: 0,
            rtt: 0.0,
        }
    }

    /// Called by the writer when the BDP ping is actually written, so the
    /// RTT measurement excludes queueing delay.
    pub fn timesnap(&mut self, payload: &[u8; 8]) {
        if payload != &Ping::BDP {
            return;
        }
        self.sent_at = Some(Instant::now());
    }

    /// Accounts for `n` inbound DATA bytes. Returns true when the caller
    /// should send the next BDP ping.
    pub fn add(&mut self, n: u32) -> bool {
        if self.is_sent {
            self.sample += n;
            return false;
        }
        self.is_sent = true;
        self.sample = n;
        self.sent_at = None;
        self.sample_count += 1;
        true
    }

    /// Handles a BDP ping ACK. Returns the new window size when the sample
    /// indicates the current window is too small.
    pub fn calculate(&mut self, payload: &[u8; 8]) -> Option<u32> {
        if payload != &Ping::BDP {
            return None;
        }

        let rtt_sample = match self.sent_at.take() {
            Some(at) => at.elapsed().as_secs_f64(),
            None => return None,
        };

        if self.sample_count < 10 {
            // Bootstrap with a running average before switching to EWMA.
            self.rtt += (rtt_sample - self.rtt) / self.sample_count as f64;
        } else {
            self.rtt += (rtt_sample - self.rtt) * ALPHA;
        }
        self.is_sent = false;

        // The ping and its ACK travelled a full round trip while the sample
        // accumulated, so a window of 1.5x the sample would have kept the
        // pipe full.
        let bw_current = f64::from(self.sample) / (self.rtt * 1.5);
        if bw_current > self.bw_max {
            self.bw_max = bw_current;
        }

        if f64::from(self.sample) >= BETA * f64::from(self.bdp)
            && bw_current == self.bw_max
            && self.bdp != BDP_LIMIT
        {
            self.bdp = ((GAMMA * f64::from(self.sample)) as u32).min(BDP_LIMIT);
            return Some(self.bdp);
        }
        None
    }
}
