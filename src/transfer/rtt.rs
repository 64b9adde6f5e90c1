//! Round-trip time estimation.
//!
//! One estimator per upload. The mean and deviation are exponentially
//! weighted moving averages fed only by unambiguous samples: an ACK for a
//! packet that was transmitted exactly once (Karn's rule — the sender
//! never calls [`RttEstimator::sample`] for a retransmitted packet).
//! When the operator supplies a fixed timeout the estimator is bypassed
//! entirely.

use std::time::Duration;

use crate::constants::{INITIAL_TIMEOUT, RTT_ALPHA, RTT_BETA, TIMEOUT_CEIL, TIMEOUT_FLOOR};

/// EWMA RTT estimator with a clamped retransmission timeout.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    estimated: Option<Duration>,
    dev: Duration,
    fixed: Option<Duration>,
}

impl RttEstimator {
    /// An adaptive estimator; the timeout is [`INITIAL_TIMEOUT`] until the
    /// first sample arrives.
    pub fn new() -> Self {
        Self {
            estimated: None,
            dev: Duration::ZERO,
            fixed: None,
        }
    }

    /// An estimator pinned to a fixed timeout; samples are ignored.
    pub fn fixed(timeout: Duration) -> Self {
        Self {
            estimated: None,
            dev: Duration::ZERO,
            fixed: Some(timeout),
        }
    }

    /// Feeds one RTT sample.
    pub fn sample(&mut self, rtt: Duration) {
        if self.fixed.is_some() {
            return;
        }

        match self.estimated {
            None => {
                self.estimated = Some(rtt);
                self.dev = rtt / 2;
            }
            Some(estimated) => {
                let est = estimated.as_secs_f64();
                let s = rtt.as_secs_f64();
                let new_est = (1.0 - RTT_ALPHA) * est + RTT_ALPHA * s;
                let new_dev =
                    (1.0 - RTT_BETA) * self.dev.as_secs_f64() + RTT_BETA * (s - new_est).abs();
                self.estimated = Some(Duration::from_secs_f64(new_est));
                self.dev = Duration::from_secs_f64(new_dev);
            }
        }
    }

    /// The current retransmission timeout.
    pub fn timeout(&self) -> Duration {
        if let Some(fixed) = self.fixed {
            return fixed;
        }
        match self.estimated {
            None => INITIAL_TIMEOUT,
            Some(estimated) => (estimated + 4 * self.dev).clamp(TIMEOUT_FLOOR, TIMEOUT_CEIL),
        }
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}
