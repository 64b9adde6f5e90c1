//! Peer roster file.
//!
//! The roster is a static text mapping from peer identifier to transport
//! address, one `<id> <host> <port>` entry per line. Lines starting with
//! `#` are comments. Every peer loads the full roster once at startup and
//! looks up its own identity to find the address to bind.

use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

use thiserror::Error;

/// Errors produced while loading the roster.
#[derive(Debug, Error)]
pub enum RosterError {
    /// The roster file could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A non-comment line is not `<id> <host> <port>`.
    #[error("bad roster line {0}: {1:?}")]
    BadLine(usize, String),

    /// A host:port pair did not resolve to an address.
    #[error("cannot resolve {0}:{1}")]
    Unresolvable(String, u16),

    /// The requested identity has no roster entry.
    #[error("no roster entry for peer {0}")]
    UnknownPeer(u32),
}

/// One roster entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    /// The peer's identifier.
    pub id: u32,
    /// The peer's transport address.
    pub addr: SocketAddr,
}

/// The full set of known peers.
#[derive(Debug, Clone)]
pub struct Roster {
    peers: Vec<PeerInfo>,
}

impl Roster {
    /// Loads and parses a roster file, resolving each host:port.
    pub fn load(path: &Path) -> Result<Self, RosterError> {
        let text = fs::read_to_string(path)?;
        let mut peers = Vec::new();

        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            let [id, host, port] = fields.as_slice() else {
                return Err(RosterError::BadLine(index + 1, line.to_string()));
            };
            let (Ok(id), Ok(port)) = (id.parse::<u32>(), port.parse::<u16>()) else {
                return Err(RosterError::BadLine(index + 1, line.to_string()));
            };
            let addr = (*host, port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| RosterError::Unresolvable(host.to_string(), port))?;
            peers.push(PeerInfo { id, addr });
        }

        Ok(Self { peers })
    }

    /// Looks up a peer by identifier.
    pub fn get(&self, id: u32) -> Result<&PeerInfo, RosterError> {
        self.peers
            .iter()
            .find(|p| p.id == id)
            .ok_or(RosterError::UnknownPeer(id))
    }

    /// Iterates every peer except the given identity, in roster order.
    pub fn others(&self, id: u32) -> impl Iterator<Item = &PeerInfo> {
        self.peers.iter().filter(move |p| p.id != id)
    }

    /// Number of known peers, self included.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True when the roster is empty.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
