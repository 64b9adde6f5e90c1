//! Sliding-window sender.
//!
//! One `Upload` streams one chunk to one remote peer: 378 DATA packets
//! with sequence numbers 1..=378, sent under the Reno window, cumulatively
//! acknowledged, and retransmitted Go-Back-N style from the window base on
//! timeout or fast retransmit.
//!
//! The engine owns the socket; this type is a pure state machine that
//! returns the packets to put on the wire.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tracing::debug;

use super::congestion::Reno;
use super::rtt::RttEstimator;
use crate::constants::{CHUNK_SIZE, MAX_CONSECUTIVE_TIMEOUTS, MSS, PACKETS_PER_CHUNK};
use crate::hash::ChunkHash;
use crate::packet::Packet;

/// What an incoming ACK did to the upload.
#[derive(Debug)]
pub enum AckOutcome {
    /// The window base advanced; call [`Upload::fill_window`] next.
    Advanced,
    /// Every packet is acknowledged; the upload is finished.
    Complete,
    /// A duplicate ACK, possibly carrying a fast retransmission to send.
    Duplicate(Option<Packet>),
    /// A stale or impossible ACK number.
    Ignored,
}

/// What an expired retransmission timer demands.
#[derive(Debug)]
pub enum TimerFire {
    /// Resend this packet.
    Retransmit(Packet),
    /// Too many consecutive timeouts; the peer is gone.
    Abandon,
}

/// Sender state for one outgoing chunk.
#[derive(Debug)]
pub struct Upload {
    remote: SocketAddr,
    hash: ChunkHash,
    data: Bytes,
    /// Oldest unacknowledged sequence number.
    base: u32,
    /// Next sequence number to transmit.
    next_seq: u32,
    total: u32,
    /// Send times of packets transmitted exactly once (Karn's rule:
    /// entries are dropped on retransmission and never repopulated).
    sent_at: HashMap<u32, Instant>,
    rtt: RttEstimator,
    reno: Reno,
    deadline: Option<Instant>,
    consecutive_timeouts: u32,
}

impl Upload {
    pub fn new(remote: SocketAddr, hash: ChunkHash, data: Bytes, rtt: RttEstimator) -> Self {
        debug_assert_eq!(data.len(), CHUNK_SIZE);
        Self {
            remote,
            hash,
            data,
            base: 1,
            next_seq: 1,
            total: PACKETS_PER_CHUNK,
            sent_at: HashMap::new(),
            rtt,
            reno: Reno::new(),
            deadline: None,
            consecutive_timeouts: 0,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn hash(&self) -> ChunkHash {
        self.hash
    }

    /// Oldest unacknowledged sequence number.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Packets currently unacknowledged.
    pub fn in_flight(&self) -> u32 {
        self.next_seq - self.base
    }

    /// True once every packet has been acknowledged.
    pub fn is_complete(&self) -> bool {
        self.base > self.total
    }

    /// The pending retransmission deadline, if a timer is running.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The congestion controller, for observation.
    pub fn reno(&self) -> &Reno {
        &self.reno
    }

    /// Transmits as much new data as the window allows.
    ///
    /// Returns the DATA packets to send, in sequence order, and starts the
    /// retransmission timer if it was idle.
    pub fn fill_window(&mut self, now: Instant) -> Vec<Packet> {
        let mut out = Vec::new();
        while self.in_flight() < self.reno.window() && self.next_seq <= self.total {
            let seq = self.next_seq;
            out.push(self.data_packet(seq));
            self.sent_at.insert(seq, now);
            if self.deadline.is_none() {
                self.deadline = Some(now + self.rtt.timeout());
            }
            self.next_seq += 1;
        }
        out
    }

    /// Handles one cumulative ACK.
    pub fn on_ack(&mut self, ack: u32, now: Instant) -> AckOutcome {
        if ack >= self.next_seq {
            // Acknowledges data never sent.
            return AckOutcome::Ignored;
        }

        if ack >= self.base {
            let newly_acked = ack - self.base + 1;

            // RTT sample from the newest covered packet, single-transmission only.
            if let Some(sent) = self.sent_at.get(&ack) {
                self.rtt.sample(now.duration_since(*sent));
            }
            self.sent_at.retain(|&seq, _| seq > ack);

            self.base = ack + 1;
            self.consecutive_timeouts = 0;
            self.reno.on_new_ack(newly_acked);
            self.deadline = if self.in_flight() > 0 {
                Some(now + self.rtt.timeout())
            } else {
                None
            };

            if self.is_complete() {
                return AckOutcome::Complete;
            }
            return AckOutcome::Advanced;
        }

        if ack + 1 == self.base {
            // Duplicate of the last cumulative ACK: the packet at `base`
            // is the one the receiver is missing.
            let retransmit = self.reno.on_dup_ack().then(|| {
                debug!(remote = %self.remote, seq = self.base, "fast retransmit");
                self.sent_at.remove(&self.base);
                self.data_packet(self.base)
            });
            return AckOutcome::Duplicate(retransmit);
        }

        AckOutcome::Ignored
    }

    /// Fires the retransmission timer if its deadline has passed.
    pub fn fire_timer(&mut self, now: Instant) -> Option<TimerFire> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }

        self.consecutive_timeouts += 1;
        if self.consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
            return Some(TimerFire::Abandon);
        }

        debug!(remote = %self.remote, seq = self.base, "retransmission timeout");
        self.reno.on_timeout();
        self.sent_at.remove(&self.base);
        self.deadline = Some(now + self.rtt.timeout());
        Some(TimerFire::Retransmit(self.data_packet(self.base)))
    }

    fn data_packet(&self, seq: u32) -> Packet {
        let start = (seq - 1) as usize * MSS;
        let end = (start + MSS).min(CHUNK_SIZE);
        Packet::Data {
            seq,
            payload: self.data.slice(start..end),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::INITIAL_TIMEOUT;
    use std::time::Duration;

    fn upload() -> Upload {
        Upload::new(
            "127.0.0.1:10002".parse().unwrap(),
            ChunkHash::from_bytes([1; 20]),
            Bytes::from(vec![0xab; CHUNK_SIZE]),
            RttEstimator::new(),
        )
    }

    fn seqs(packets: &[Packet]) -> Vec<u32> {
        packets
            .iter()
            .map(|p| match p {
                Packet::Data { seq, .. } => *seq,
                other => panic!("expected DATA, got {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_window_bounds_initial_send() {
        let mut up = upload();
        let now = Instant::now();

        // cwnd starts at 1: exactly one packet goes out.
        assert_eq!(seqs(&up.fill_window(now)), vec![1]);
        assert!(up.fill_window(now).is_empty());
        assert_eq!(up.in_flight(), 1);
        assert!(up.deadline().is_some());
    }

    #[test]
    fn test_ack_advances_and_window_grows() {
        let mut up = upload();
        let now = Instant::now();
        up.fill_window(now);

        assert!(matches!(up.on_ack(1, now), AckOutcome::Advanced));
        // Slow start: cwnd is now 2.
        assert_eq!(seqs(&up.fill_window(now)), vec![2, 3]);
    }

    #[test]
    fn test_last_segment_is_short() {
        let mut up = upload();
        let now = Instant::now();

        // Ack everything up to the final packet, then inspect it.
        up.fill_window(now);
        let mut last = None;
        while !up.is_complete() {
            let sent = up.fill_window(now);
            if let Some(p) = sent.last() {
                last = Some(p.clone());
            }
            let ack = up.next_seq - 1;
            up.on_ack(ack, now);
        }
        match last {
            Some(Packet::Data { seq, payload }) => {
                assert_eq!(seq, PACKETS_PER_CHUNK);
                assert_eq!(payload.len(), CHUNK_SIZE - (PACKETS_PER_CHUNK as usize - 1) * MSS);
            }
            other => panic!("expected final DATA, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_acks_trigger_single_fast_retransmit() {
        let mut up = upload();
        let now = Instant::now();
        for _ in 0..4 {
            up.fill_window(now);
            up.on_ack(up.base, now);
        }
        up.fill_window(now);
        let base = up.base;

        // Two duplicates: nothing yet.
        assert!(matches!(up.on_ack(base - 1, now), AckOutcome::Duplicate(None)));
        assert!(matches!(up.on_ack(base - 1, now), AckOutcome::Duplicate(None)));

        // Third fires exactly one retransmission of the base packet.
        match up.on_ack(base - 1, now) {
            AckOutcome::Duplicate(Some(Packet::Data { seq, .. })) => assert_eq!(seq, base),
            other => panic!("expected fast retransmit, got {other:?}"),
        }

        // Fourth and beyond are absorbed by the fired flag.
        assert!(matches!(up.on_ack(base - 1, now), AckOutcome::Duplicate(None)));
        assert_eq!(up.reno().window(), 1);
    }

    #[test]
    fn test_timeout_retransmits_base() {
        let mut up = upload();
        let now = Instant::now();
        up.fill_window(now);

        assert!(up.fire_timer(now).is_none());

        let later = now + INITIAL_TIMEOUT + Duration::from_millis(1);
        match up.fire_timer(later) {
            Some(TimerFire::Retransmit(Packet::Data { seq, .. })) => assert_eq!(seq, 1),
            other => panic!("expected retransmit, got {other:?}"),
        }
        assert_eq!(up.reno().ssthresh(), 2);
    }

    #[test]
    fn test_consecutive_timeouts_abandon() {
        let mut up = upload();
        let mut now = Instant::now();
        up.fill_window(now);

        for _ in 0..MAX_CONSECUTIVE_TIMEOUTS - 1 {
            now = up.deadline().unwrap() + Duration::from_millis(1);
            assert!(matches!(up.fire_timer(now), Some(TimerFire::Retransmit(_))));
        }
        now = up.deadline().unwrap() + Duration::from_millis(1);
        assert!(matches!(up.fire_timer(now), Some(TimerFire::Abandon)));
    }

    #[test]
    fn test_ack_progress_resets_timeout_streak() {
        let mut up = upload();
        let mut now = Instant::now();
        up.fill_window(now);

        now = up.deadline().unwrap() + Duration::from_millis(1);
        assert!(matches!(up.fire_timer(now), Some(TimerFire::Retransmit(_))));

        assert!(matches!(up.on_ack(1, now), AckOutcome::Advanced));
        assert_eq!(up.consecutive_timeouts, 0);
    }

    #[test]
    fn test_retransmitted_packet_yields_no_rtt_sample() {
        let mut up = upload();
        let now = Instant::now();
        up.fill_window(now);

        // Timeout retransmits seq 1, dropping its send-time entry.
        let later = now + INITIAL_TIMEOUT + Duration::from_millis(1);
        up.fire_timer(later);
        assert!(!up.sent_at.contains_key(&1));

        // Acking seq 1 must not feed the estimator: the timeout is still
        // the pre-sample initial value.
        up.on_ack(1, later + Duration::from_millis(5));
        assert_eq!(up.rtt.timeout(), INITIAL_TIMEOUT);
    }

    #[test]
    fn test_completion() {
        let mut up = upload();
        let now = Instant::now();
        up.fill_window(now);

        let mut outcome = up.on_ack(1, now);
        while !matches!(outcome, AckOutcome::Complete) {
            up.fill_window(now);
            let ack = up.next_seq - 1;
            outcome = up.on_ack(ack, now);
        }
        assert!(up.is_complete());
        assert!(up.deadline().is_none());
        assert_eq!(up.in_flight(), 0);
    }

    #[test]
    fn test_future_ack_ignored() {
        let mut up = upload();
        let now = Instant::now();
        up.fill_window(now);
        assert!(matches!(up.on_ack(50, now), AckOutcome::Ignored));
    }
}
