//! Wire codec for the chunk transfer protocol.
//!
//! Every datagram carries a fixed 12-byte big-endian header followed by a
//! type-specific payload of at most 1388 bytes:
//!
//! ```text
//! +--------+--------+----------------+----------------+----------------+
//! | type 1B| hlen 1B| total length 2B| sequence     4B| acknowledgment 4B|
//! +--------+--------+----------------+----------------+----------------+
//! ```
//!
//! Sequence and acknowledgment numbers are per-packet and per-connection,
//! starting at 1 for the first DATA packet of a chunk transfer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::constants::{HASH_SIZE, HEADER_LEN, MAX_HASHES_PER_PACKET, MAX_PAYLOAD};
use crate::hash::ChunkHash;

/// Errors produced while decoding a datagram.
#[derive(Debug, Error)]
pub enum PacketError {
    /// The datagram is shorter than the fixed header.
    #[error("datagram too short: {0} bytes")]
    Truncated(usize),

    /// The header length field is not 12.
    #[error("bad header length: {0}")]
    BadHeaderLength(u8),

    /// The declared total length disagrees with the datagram length.
    #[error("declared length {declared} != datagram length {actual}")]
    LengthMismatch { declared: u16, actual: usize },

    /// Unknown packet type byte.
    #[error("unknown packet type: {0}")]
    UnknownType(u8),

    /// The payload does not match the type's layout.
    #[error("bad {0:?} payload: {1}")]
    BadPayload(PacketType, &'static str),
}

/// Packet type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Ask every peer which of the listed chunks it holds.
    WhoHas = 0,
    /// Announce ownership of the listed chunks.
    IHave = 1,
    /// Request one chunk by hash.
    Get = 2,
    /// Carry chunk bytes.
    Data = 3,
    /// Cumulatively acknowledge DATA.
    Ack = 4,
    /// Refuse a request, naming the refused hashes.
    Denied = 5,
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::WhoHas),
            1 => Ok(PacketType::IHave),
            2 => Ok(PacketType::Get),
            3 => Ok(PacketType::Data),
            4 => Ok(PacketType::Ack),
            5 => Ok(PacketType::Denied),
            _ => Err(PacketError::UnknownType(value)),
        }
    }
}

/// A decoded protocol packet.
///
/// WHOHAS, IHAVE, and DENIED share a payload layout: a 4-byte count
/// followed by that many 20-byte hashes. GET carries exactly one hash.
/// DATA carries raw chunk bytes; ACK carries nothing beyond its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Which of these chunks do you hold?
    WhoHas(Vec<ChunkHash>),
    /// I hold these chunks.
    IHave(Vec<ChunkHash>),
    /// Send me this chunk.
    Get(ChunkHash),
    /// Chunk bytes for sequence `seq` (1-based).
    Data { seq: u32, payload: Bytes },
    /// Everything up to and including `ack` arrived.
    Ack { ack: u32 },
    /// Request refused for these hashes.
    Denied(Vec<ChunkHash>),
}

impl Packet {
    /// Returns the wire type of this packet.
    pub fn kind(&self) -> PacketType {
        match self {
            Packet::WhoHas(_) => PacketType::WhoHas,
            Packet::IHave(_) => PacketType::IHave,
            Packet::Get(_) => PacketType::Get,
            Packet::Data { .. } => PacketType::Data,
            Packet::Ack { .. } => PacketType::Ack,
            Packet::Denied(_) => PacketType::Denied,
        }
    }

    fn seq(&self) -> u32 {
        match self {
            Packet::Data { seq, .. } => *seq,
            _ => 0,
        }
    }

    fn ack(&self) -> u32 {
        match self {
            Packet::Ack { ack } => *ack,
            _ => 0,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Packet::WhoHas(hashes) | Packet::IHave(hashes) | Packet::Denied(hashes) => {
                4 + hashes.len() * HASH_SIZE
            }
            Packet::Get(_) => HASH_SIZE,
            Packet::Data { payload, .. } => payload.len(),
            Packet::Ack { .. } => 0,
        }
    }

    /// Encodes the packet to bytes for transmission.
    ///
    /// Hash lists longer than [`MAX_HASHES_PER_PACKET`] and DATA payloads
    /// longer than the MSS are the caller's bug; both are truncated-free
    /// protocol violations, so this asserts in debug builds.
    pub fn encode(&self) -> Bytes {
        debug_assert!(self.payload_len() <= MAX_PAYLOAD);

        let total = HEADER_LEN + self.payload_len();
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u8(self.kind() as u8);
        buf.put_u8(HEADER_LEN as u8);
        buf.put_u16(total as u16);
        buf.put_u32(self.seq());
        buf.put_u32(self.ack());

        match self {
            Packet::WhoHas(hashes) | Packet::IHave(hashes) | Packet::Denied(hashes) => {
                buf.put_u32(hashes.len() as u32);
                for hash in hashes {
                    buf.put_slice(hash.as_bytes());
                }
            }
            Packet::Get(hash) => buf.put_slice(hash.as_bytes()),
            Packet::Data { payload, .. } => buf.put_slice(payload),
            Packet::Ack { .. } => {}
        }

        buf.freeze()
    }

    /// Decodes one datagram.
    pub fn decode(mut data: Bytes) -> Result<Self, PacketError> {
        let datagram_len = data.len();
        if datagram_len < HEADER_LEN {
            return Err(PacketError::Truncated(datagram_len));
        }

        let kind = PacketType::try_from(data.get_u8())?;
        let hlen = data.get_u8();
        if hlen as usize != HEADER_LEN {
            return Err(PacketError::BadHeaderLength(hlen));
        }
        let declared = data.get_u16();
        if declared as usize != datagram_len {
            return Err(PacketError::LengthMismatch {
                declared,
                actual: datagram_len,
            });
        }
        let seq = data.get_u32();
        let ack = data.get_u32();

        match kind {
            PacketType::WhoHas => Ok(Packet::WhoHas(get_hashes(kind, data)?)),
            PacketType::IHave => Ok(Packet::IHave(get_hashes(kind, data)?)),
            PacketType::Denied => Ok(Packet::Denied(get_hashes(kind, data)?)),
            PacketType::Get => {
                if data.remaining() != HASH_SIZE {
                    return Err(PacketError::BadPayload(kind, "expected exactly one hash"));
                }
                let mut arr = [0u8; HASH_SIZE];
                data.copy_to_slice(&mut arr);
                Ok(Packet::Get(ChunkHash::from_bytes(arr)))
            }
            PacketType::Data => {
                if seq == 0 {
                    return Err(PacketError::BadPayload(kind, "sequence numbers start at 1"));
                }
                Ok(Packet::Data { seq, payload: data })
            }
            PacketType::Ack => {
                if data.has_remaining() {
                    return Err(PacketError::BadPayload(kind, "unexpected payload"));
                }
                Ok(Packet::Ack { ack })
            }
        }
    }
}

fn get_hashes(kind: PacketType, mut data: Bytes) -> Result<Vec<ChunkHash>, PacketError> {
    if data.remaining() < 4 {
        return Err(PacketError::BadPayload(kind, "missing hash count"));
    }
    let count = data.get_u32() as usize;
    if count > MAX_HASHES_PER_PACKET || data.remaining() != count * HASH_SIZE {
        return Err(PacketError::BadPayload(kind, "count disagrees with payload"));
    }

    let mut hashes = Vec::with_capacity(count);
    for _ in 0..count {
        let mut arr = [0u8; HASH_SIZE];
        data.copy_to_slice(&mut arr);
        hashes.push(ChunkHash::from_bytes(arr));
    }
    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashes(n: u8) -> Vec<ChunkHash> {
        (0..n).map(|i| ChunkHash::from_bytes([i; 20])).collect()
    }

    #[test]
    fn test_round_trip_all_types() {
        let packets = vec![
            Packet::WhoHas(hashes(3)),
            Packet::IHave(hashes(1)),
            Packet::Get(ChunkHash::from_bytes([7; 20])),
            Packet::Data {
                seq: 42,
                payload: Bytes::from(vec![0xaa; 1388]),
            },
            Packet::Ack { ack: 41 },
            Packet::Denied(hashes(2)),
        ];

        for packet in packets {
            let encoded = packet.encode();
            let decoded = Packet::decode(encoded).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn test_header_layout() {
        let encoded = Packet::Data {
            seq: 5,
            payload: Bytes::from_static(b"abc"),
        }
        .encode();

        assert_eq!(encoded[0], 3); // type
        assert_eq!(encoded[1], 12); // header length
        assert_eq!(u16::from_be_bytes([encoded[2], encoded[3]]), 15); // total
        assert_eq!(u32::from_be_bytes([encoded[4], encoded[5], encoded[6], encoded[7]]), 5);
        assert_eq!(u32::from_be_bytes([encoded[8], encoded[9], encoded[10], encoded[11]]), 0);
    }

    #[test]
    fn test_rejects_short_datagram() {
        let err = Packet::decode(Bytes::from_static(&[3, 12, 0])).unwrap_err();
        assert!(matches!(err, PacketError::Truncated(3)));
    }

    #[test]
    fn test_rejects_unknown_type() {
        let mut raw = Packet::Ack { ack: 1 }.encode().to_vec();
        raw[0] = 9;
        let err = Packet::decode(Bytes::from(raw)).unwrap_err();
        assert!(matches!(err, PacketError::UnknownType(9)));
    }

    #[test]
    fn test_rejects_bad_header_length() {
        let mut raw = Packet::Ack { ack: 1 }.encode().to_vec();
        raw[1] = 16;
        let err = Packet::decode(Bytes::from(raw)).unwrap_err();
        assert!(matches!(err, PacketError::BadHeaderLength(16)));
    }

    #[test]
    fn test_rejects_length_mismatch() {
        let mut raw = Packet::Get(ChunkHash::from_bytes([1; 20])).encode().to_vec();
        raw.push(0); // datagram longer than declared
        let err = Packet::decode(Bytes::from(raw)).unwrap_err();
        assert!(matches!(err, PacketError::LengthMismatch { .. }));
    }

    #[test]
    fn test_rejects_hash_count_mismatch() {
        let mut raw = Packet::WhoHas(hashes(2)).encode().to_vec();
        // Claim three hashes while carrying two.
        raw[15] = 3;
        let err = Packet::decode(Bytes::from(raw)).unwrap_err();
        assert!(matches!(err, PacketError::BadPayload(PacketType::WhoHas, _)));
    }

    #[test]
    fn test_rejects_data_seq_zero() {
        let mut raw = Packet::Data {
            seq: 1,
            payload: Bytes::from_static(b"x"),
        }
        .encode()
        .to_vec();
        raw[7] = 0;
        let err = Packet::decode(Bytes::from(raw)).unwrap_err();
        assert!(matches!(err, PacketError::BadPayload(PacketType::Data, _)));
    }

    #[test]
    fn test_hash_list_capacity() {
        let packet = Packet::WhoHas(
            (0..MAX_HASHES_PER_PACKET)
                .map(|i| ChunkHash::from_bytes([i as u8; 20]))
                .collect(),
        );
        let encoded = packet.encode();
        assert!(encoded.len() <= crate::constants::MAX_PACKET);
        assert_eq!(Packet::decode(encoded).unwrap(), packet);
    }
}
