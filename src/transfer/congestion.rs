//! Reno congestion control.
//!
//! Packet-counted Reno over a single upload: slow start doubles the window
//! every round trip, congestion avoidance grows it by one packet per round
//! trip, and loss (three duplicate ACKs or a retransmission timeout)
//! halves the threshold and collapses the window to one packet.
//!
//! The window is kept as a float so the `+1/⌊cwnd⌋` avoidance update
//! preserves fractional progress; the effective window used for admission
//! is the floor.

use crate::constants::{DUP_ACK_THRESHOLD, INITIAL_SSTHRESH, MIN_SSTHRESH};

/// Reno growth phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Exponential growth: +1 packet per ACK.
    SlowStart,
    /// Linear growth: +1/⌊cwnd⌋ packets per ACK.
    CongestionAvoidance,
}

/// Per-upload Reno state machine.
#[derive(Debug, Clone)]
pub struct Reno {
    cwnd: f64,
    ssthresh: u32,
    phase: Phase,
    dup_acks: u32,
    fast_retransmit_fired: bool,
}

impl Reno {
    pub fn new() -> Self {
        Self {
            cwnd: 1.0,
            ssthresh: INITIAL_SSTHRESH,
            phase: Phase::SlowStart,
            dup_acks: 0,
            fast_retransmit_fired: false,
        }
    }

    /// Effective window in packets (`⌊cwnd⌋`, never below 1).
    pub fn window(&self) -> u32 {
        (self.cwnd as u32).max(1)
    }

    /// The raw fractional window.
    pub fn cwnd(&self) -> f64 {
        self.cwnd
    }

    /// The slow-start threshold in packets.
    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    /// The current growth phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// A cumulative ACK advanced the window base by `newly_acked` packets.
    pub fn on_new_ack(&mut self, newly_acked: u32) {
        for _ in 0..newly_acked {
            match self.phase {
                Phase::SlowStart => {
                    self.cwnd += 1.0;
                    if self.cwnd >= self.ssthresh as f64 {
                        self.phase = Phase::CongestionAvoidance;
                    }
                }
                Phase::CongestionAvoidance => {
                    self.cwnd += 1.0 / self.window() as f64;
                }
            }
        }
        self.dup_acks = 0;
        self.fast_retransmit_fired = false;
    }

    /// A duplicate of the last cumulative ACK arrived. Returns true when
    /// the caller must fast-retransmit the packet at the window base.
    ///
    /// The duplicate counter keeps climbing past the threshold; the fired
    /// flag guarantees at most one fast retransmit per ACK value.
    pub fn on_dup_ack(&mut self) -> bool {
        self.dup_acks += 1;
        if self.dup_acks == DUP_ACK_THRESHOLD && !self.fast_retransmit_fired {
            self.collapse();
            self.fast_retransmit_fired = true;
            return true;
        }
        false
    }

    /// The retransmission timer fired.
    pub fn on_timeout(&mut self) {
        self.collapse();
        self.dup_acks = 0;
        self.fast_retransmit_fired = false;
    }

    fn collapse(&mut self) {
        self.ssthresh = (self.cwnd as u32 / 2).max(MIN_SSTHRESH);
        self.cwnd = 1.0;
        self.phase = Phase::SlowStart;
    }
}

impl Default for Reno {
    fn default() -> Self {
        Self::new()
    }
}
