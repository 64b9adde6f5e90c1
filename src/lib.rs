//! rswarm - peer-to-peer chunk transfer over UDP
//!
//! Each peer holds a subset of a file's 512 KiB chunks, identified by the
//! SHA-1 of their contents, and downloads missing chunks from any peer
//! that holds them. Reliability is built on top of raw datagrams: a
//! Go-Back-N sliding-window sender with cumulative ACKs, EWMA RTT
//! estimation, and Reno congestion control, all multiplexed through one
//! single-task event loop.
//!
//! # Modules
//!
//! - [`packet`] - Wire codec for the six protocol packet types
//! - [`transfer`] - RTT estimation, Reno, sender/receiver state machines,
//!   handshake planning, and admission control
//! - [`engine`] - The peer event loop
//! - [`store`] - In-memory chunk store and the fragment/chunkhash formats
//! - [`roster`] - The peer roster file
//! - [`socket`] - Datagram endpoint with optional simulator routing
//! - [`hash`] - Chunk identity
//! - [`constants`] - Protocol constants and tuning parameters

pub mod constants;
pub mod engine;
pub mod hash;
pub mod packet;
pub mod roster;
pub mod socket;
pub mod store;
pub mod transfer;

pub use engine::{Peer, PeerConfig, PeerError};
pub use hash::ChunkHash;
pub use packet::{Packet, PacketError, PacketType};
pub use roster::{PeerInfo, Roster, RosterError};
pub use socket::SimSock;
pub use store::{ChunkStore, StoreError};
pub use transfer::{
    AckOutcome, Admission, ConnectionTable, DataOutcome, Download, DownloadPlan, Phase, Reno,
    RttEstimator, TickAction, TimerFire, Upload,
};
