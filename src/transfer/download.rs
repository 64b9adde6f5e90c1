//! Cumulative-ACK receiver.
//!
//! One `Download` reassembles one chunk from one source peer. The receiver
//! is Go-Back-N: only the next expected sequence is accepted; anything
//! else is dropped and answered with a duplicate ACK for the last in-order
//! packet (ACK 0 when nothing has arrived yet), which is what drives the
//! sender's fast retransmit.
//!
//! The receiver keeps no retransmission timer of its own. A source that
//! stops delivering DATA for the stall window is abandoned and the hash
//! goes back to the handshake.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::constants::{CHUNK_SIZE, MSS, PACKETS_PER_CHUNK};
use crate::hash::ChunkHash;
use crate::packet::Packet;

/// Where a download stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    /// GET sent, no DATA yet.
    Handshaking,
    /// DATA arriving.
    Transferring,
}

/// What one DATA packet did to the download.
#[derive(Debug)]
pub enum DataOutcome {
    /// Send this ACK; the transfer continues.
    Ack(Packet),
    /// The chunk reassembled and verified; commit it and send the final ACK.
    Complete { ack: Packet, chunk: Bytes },
    /// The chunk reassembled but its SHA-1 does not match the requested
    /// hash; discard and re-handshake.
    Corrupt { ack: Packet },
    /// Malformed segment; nothing to send.
    Ignored,
}

/// Receiver state for one chunk being fetched.
#[derive(Debug)]
pub struct Download {
    remote: SocketAddr,
    hash: ChunkHash,
    /// Next expected sequence number.
    expected: u32,
    buf: BytesMut,
    status: DownloadStatus,
    stall: Duration,
    deadline: Instant,
}

impl Download {
    pub fn new(remote: SocketAddr, hash: ChunkHash, stall: Duration, now: Instant) -> Self {
        Self {
            remote,
            hash,
            expected: 1,
            buf: BytesMut::with_capacity(CHUNK_SIZE),
            status: DownloadStatus::Handshaking,
            stall,
            deadline: now + stall,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn hash(&self) -> ChunkHash {
        self.hash
    }

    pub fn status(&self) -> DownloadStatus {
        self.status
    }

    /// When this download is considered stalled.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// True once the stall window elapsed with no DATA.
    pub fn is_stalled(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Handles one DATA packet from the source.
    pub fn on_data(&mut self, seq: u32, payload: &[u8], now: Instant) -> DataOutcome {
        self.status = DownloadStatus::Transferring;
        self.deadline = now + self.stall;

        if seq != self.expected {
            // Go-Back-N: drop duplicates and gaps alike, re-ACK the last
            // in-order sequence so the sender sees a duplicate ACK.
            return DataOutcome::Ack(Packet::Ack {
                ack: self.expected - 1,
            });
        }

        if payload.len() != self.segment_len(seq) {
            return DataOutcome::Ignored;
        }

        self.buf.extend_from_slice(payload);
        self.expected += 1;
        let ack = Packet::Ack { ack: seq };

        if seq < PACKETS_PER_CHUNK {
            return DataOutcome::Ack(ack);
        }

        // Final packet: the buffer now holds the whole chunk.
        let chunk = self.buf.split().freeze();
        debug_assert_eq!(chunk.len(), CHUNK_SIZE);
        if ChunkHash::of_chunk(&chunk) == self.hash {
            DataOutcome::Complete { ack, chunk }
        } else {
            DataOutcome::Corrupt { ack }
        }
    }

    fn segment_len(&self, seq: u32) -> usize {
        if seq < PACKETS_PER_CHUNK {
            MSS
        } else {
            CHUNK_SIZE - (PACKETS_PER_CHUNK as usize - 1) * MSS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_bytes() -> Bytes {
        Bytes::from(vec![0x5a; CHUNK_SIZE])
    }

    fn segment(data: &Bytes, seq: u32) -> Bytes {
        let start = (seq - 1) as usize * MSS;
        let end = (start + MSS).min(CHUNK_SIZE);
        data.slice(start..end)
    }

    fn download(hash: ChunkHash) -> Download {
        Download::new(
            "127.0.0.1:10002".parse().unwrap(),
            hash,
            Duration::from_secs(10),
            Instant::now(),
        )
    }

    fn ack_of(outcome: DataOutcome) -> u32 {
        match outcome {
            DataOutcome::Ack(Packet::Ack { ack }) => ack,
            other => panic!("expected plain ACK, got {other:?}"),
        }
    }

    #[test]
    fn test_in_order_acks() {
        let data = chunk_bytes();
        let mut dl = download(ChunkHash::of_chunk(&data));
        let now = Instant::now();

        assert_eq!(ack_of(dl.on_data(1, &segment(&data, 1), now)), 1);
        assert_eq!(ack_of(dl.on_data(2, &segment(&data, 2), now)), 2);
        assert_eq!(dl.status(), DownloadStatus::Transferring);
    }

    #[test]
    fn test_gap_answers_duplicate_ack() {
        let data = chunk_bytes();
        let mut dl = download(ChunkHash::of_chunk(&data));
        let now = Instant::now();

        for seq in 1..=6 {
            dl.on_data(seq, &segment(&data, seq), now);
        }
        // Packet 7 lost; 8, 9, 10 arrive and each re-ACKs 6.
        for seq in 8..=10 {
            assert_eq!(ack_of(dl.on_data(seq, &segment(&data, seq), now)), 6);
        }
        // The retransmitted 7 is then accepted normally.
        assert_eq!(ack_of(dl.on_data(7, &segment(&data, 7), now)), 7);
    }

    #[test]
    fn test_loss_of_first_packet_acks_zero() {
        let data = chunk_bytes();
        let mut dl = download(ChunkHash::of_chunk(&data));
        let now = Instant::now();

        assert_eq!(ack_of(dl.on_data(2, &segment(&data, 2), now)), 0);
    }

    #[test]
    fn test_duplicate_packet_reacked_without_growing_buffer() {
        let data = chunk_bytes();
        let mut dl = download(ChunkHash::of_chunk(&data));
        let now = Instant::now();

        dl.on_data(1, &segment(&data, 1), now);
        assert_eq!(ack_of(dl.on_data(1, &segment(&data, 1), now)), 1);
        assert_eq!(dl.buf.len(), MSS);
    }

    #[test]
    fn test_complete_chunk_verifies() {
        let data = chunk_bytes();
        let mut dl = download(ChunkHash::of_chunk(&data));
        let now = Instant::now();

        for seq in 1..PACKETS_PER_CHUNK {
            dl.on_data(seq, &segment(&data, seq), now);
        }
        match dl.on_data(PACKETS_PER_CHUNK, &segment(&data, PACKETS_PER_CHUNK), now) {
            DataOutcome::Complete { ack, chunk } => {
                assert_eq!(ack, Packet::Ack { ack: PACKETS_PER_CHUNK });
                assert_eq!(chunk, data);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_chunk_rejected() {
        let data = chunk_bytes();
        // Demand a different hash than the data will produce.
        let mut dl = download(ChunkHash::from_bytes([9; 20]));
        let now = Instant::now();

        for seq in 1..PACKETS_PER_CHUNK {
            dl.on_data(seq, &segment(&data, seq), now);
        }
        assert!(matches!(
            dl.on_data(PACKETS_PER_CHUNK, &segment(&data, PACKETS_PER_CHUNK), now),
            DataOutcome::Corrupt { .. }
        ));
    }

    #[test]
    fn test_wrong_segment_length_ignored() {
        let data = chunk_bytes();
        let mut dl = download(ChunkHash::of_chunk(&data));
        let now = Instant::now();

        assert!(matches!(dl.on_data(1, &data[..100], now), DataOutcome::Ignored));
        assert_eq!(dl.expected, 1);
    }

    #[test]
    fn test_stall_deadline_advances_on_data() {
        let data = chunk_bytes();
        let mut dl = download(ChunkHash::of_chunk(&data));
        let start = Instant::now();

        assert!(!dl.is_stalled(start));
        let later = start + Duration::from_secs(5);
        dl.on_data(1, &segment(&data, 1), later);
        assert!(!dl.is_stalled(start + Duration::from_secs(11)));
        assert!(dl.is_stalled(later + Duration::from_secs(10)));
    }
}
