//! Protocol constants and tuning parameters.
//!
//! All sizes, thresholds, and intervals used by the transfer engine live
//! here. The wire-format values (header layout, packet budget, chunk size)
//! are fixed by the protocol; the rest are tuning knobs.

use std::time::Duration;

// ============================================================================
// Chunks
// ============================================================================

/// Fixed chunk size (512 KiB). Chunks are the unit of transfer and are
/// identified by the SHA-1 of their contents.
pub const CHUNK_SIZE: usize = 512 * 1024;

/// SHA-1 digest length in bytes.
pub const HASH_SIZE: usize = 20;

// ============================================================================
// Wire format
// ============================================================================

/// Packet header length: type (1) + header length (1) + total length (2)
/// + sequence (4) + acknowledgment (4), all big-endian.
pub const HEADER_LEN: usize = 12;

/// Maximum datagram size on the wire.
pub const MAX_PACKET: usize = 1400;

/// Maximum payload per packet (`MAX_PACKET - HEADER_LEN`).
pub const MAX_PAYLOAD: usize = MAX_PACKET - HEADER_LEN;

/// Sender maximum segment size: every DATA packet except the last carries
/// this many chunk bytes.
pub const MSS: usize = MAX_PAYLOAD;

/// DATA packets per chunk (`ceil(CHUNK_SIZE / MSS)` = 378).
pub const PACKETS_PER_CHUNK: u32 = CHUNK_SIZE.div_ceil(MSS) as u32;

/// Most chunk hashes that fit a WHOHAS/IHAVE/DENIED payload
/// (4-byte count + N x 20-byte hashes within `MAX_PAYLOAD`).
pub const MAX_HASHES_PER_PACKET: usize = (MAX_PAYLOAD - 4) / HASH_SIZE;

// ============================================================================
// RTT estimation
// ============================================================================

/// EWMA gain for the RTT mean. The upstream assignment fixes 0.15
/// (its README says 0.125; the assignment value wins).
pub const RTT_ALPHA: f64 = 0.15;

/// EWMA gain for the RTT deviation (assignment value, see `RTT_ALPHA`).
pub const RTT_BETA: f64 = 0.3;

/// Retransmission timeout before the first RTT sample (RFC 6298 initial RTO).
pub const INITIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Lower clamp for the computed retransmission timeout.
pub const TIMEOUT_FLOOR: Duration = Duration::from_millis(50);

/// Upper clamp for the computed retransmission timeout.
pub const TIMEOUT_CEIL: Duration = Duration::from_secs(60);

// ============================================================================
// Congestion control
// ============================================================================

/// Initial slow-start threshold, in packets.
pub const INITIAL_SSTHRESH: u32 = 64;

/// Slow-start threshold never drops below this many packets.
pub const MIN_SSTHRESH: u32 = 2;

/// Duplicate ACKs that trigger a fast retransmit.
pub const DUP_ACK_THRESHOLD: u32 = 3;

// ============================================================================
// Failure detection
// ============================================================================

/// Consecutive retransmission timeouts before an upload is abandoned.
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 5;

/// A download with no DATA arrival for this many handshake windows is
/// abandoned and its hash re-handshaked.
pub const DOWNLOAD_STALL_WINDOWS: u32 = 5;

// ============================================================================
// Handshake
// ============================================================================

/// How long the requester waits for IHAVE answers before re-flooding
/// WHOHAS for the still-unassigned hashes.
pub const WHOHAS_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// WHOHAS re-flood attempts before the download is declared failed.
pub const MAX_WHOHAS_RETRIES: u32 = 5;

// ============================================================================
// Event loop
// ============================================================================

/// Default poll interval when no protocol timer is pending.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);
