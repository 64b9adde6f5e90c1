//! Chunk discovery and source selection.
//!
//! A `DownloadPlan` tracks one user `DOWNLOAD` command from WHOHAS flood
//! to the finished output fragment. The requester floods WHOHAS for its
//! missing hashes, collects IHAVE announcements in arrival order, assigns
//! each hash to the first announcer that is free to serve it, and retreats
//! when a DENIED retracts a provisional choice. Hashes still unassigned
//! when the retry window closes are re-flooded, a bounded number of times.
//!
//! Only one chunk may be in flight per peer pair per direction, so an
//! assignment round hands each source at most one hash; the rest of that
//! source's announcements stay remembered for later rounds.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::debug;

use crate::constants::{MAX_HASHES_PER_PACKET, MAX_WHOHAS_RETRIES, WHOHAS_RETRY_INTERVAL};
use crate::hash::ChunkHash;

/// What an expired handshake timer demands.
#[derive(Debug, PartialEq, Eq)]
pub enum TickAction {
    /// Nothing due.
    Idle,
    /// Re-flood WHOHAS with these hash groups (one packet each).
    Flood(Vec<Vec<ChunkHash>>),
    /// Retries exhausted; the download failed with these hashes unmet.
    Failed(Vec<ChunkHash>),
}

/// Handshake and completion bookkeeping for one `DOWNLOAD` command.
#[derive(Debug)]
pub struct DownloadPlan {
    /// Every hash the command asked for, in chunkhash-file order.
    requested: Vec<ChunkHash>,
    /// Hashes not yet committed to the store.
    outstanding: HashSet<ChunkHash>,
    /// Hashes with no current source.
    unassigned: HashSet<ChunkHash>,
    /// Current source per in-flight hash.
    assigned: HashMap<ChunkHash, SocketAddr>,
    /// IHAVE announcers per hash, in arrival order.
    announcers: HashMap<ChunkHash, Vec<SocketAddr>>,
    /// Peers that refused a hash; skipped until the next discovery round.
    denied: HashMap<ChunkHash, HashSet<SocketAddr>>,
    output: PathBuf,
    retry_at: Option<Instant>,
    floods: u32,
}

impl DownloadPlan {
    /// Builds a plan; `missing` is the subset of `requested` absent from
    /// the local store. The first flood is due immediately.
    pub fn new(requested: Vec<ChunkHash>, missing: &[ChunkHash], output: PathBuf, now: Instant) -> Self {
        let outstanding: HashSet<ChunkHash> = missing.iter().copied().collect();
        Self {
            unassigned: outstanding.clone(),
            outstanding,
            requested,
            assigned: HashMap::new(),
            announcers: HashMap::new(),
            denied: HashMap::new(),
            output,
            retry_at: Some(now),
            floods: 0,
        }
    }

    /// The output fragment path.
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// The requested hashes, in file order.
    pub fn requested(&self) -> &[ChunkHash] {
        &self.requested
    }

    /// True once every requested chunk is in the store.
    pub fn is_complete(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// When the handshake timer next needs service.
    pub fn deadline(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Records an IHAVE and returns new `(hash, source)` assignments to GET.
    pub fn on_ihave(
        &mut self,
        from: SocketAddr,
        hashes: &[ChunkHash],
        busy: &HashSet<SocketAddr>,
    ) -> Vec<(ChunkHash, SocketAddr)> {
        for hash in hashes {
            if !self.outstanding.contains(hash) {
                continue;
            }
            let peers = self.announcers.entry(*hash).or_default();
            if !peers.contains(&from) {
                peers.push(from);
            }
        }
        self.try_assign(busy)
    }

    /// Records a DENIED. Returns the hashes whose in-flight download from
    /// `from` must be aborted; they rejoin the unassigned set.
    pub fn on_denied(&mut self, from: SocketAddr, hashes: &[ChunkHash]) -> Vec<ChunkHash> {
        let mut aborted = Vec::new();
        for hash in hashes {
            if !self.outstanding.contains(hash) {
                continue;
            }
            self.denied.entry(*hash).or_default().insert(from);
            if self.assigned.get(hash) == Some(&from) {
                self.assigned.remove(hash);
                self.unassigned.insert(*hash);
                aborted.push(*hash);
            }
        }
        if !aborted.is_empty() {
            debug!(%from, count = aborted.len(), "DENIED retracted provisional sources");
        }
        aborted
    }

    /// A chunk arrived, verified, and was committed.
    pub fn on_complete(&mut self, hash: ChunkHash) {
        self.outstanding.remove(&hash);
        self.assigned.remove(&hash);
        self.unassigned.remove(&hash);
    }

    /// The transfer from `hash`'s current source was abandoned (stall or
    /// integrity failure). The hash re-enters discovery: its remembered
    /// announcers are dropped and the next flood is due now.
    pub fn on_failed(&mut self, hash: ChunkHash, now: Instant) {
        if !self.outstanding.contains(&hash) {
            return;
        }
        self.assigned.remove(&hash);
        self.announcers.remove(&hash);
        self.denied.remove(&hash);
        self.unassigned.insert(hash);
        self.retry_at = Some(self.retry_at.map_or(now, |at| at.min(now)));
    }

    /// Assigns unassigned hashes to remembered announcers: first announcer
    /// wins, each source takes at most one hash, denied and busy sources
    /// are skipped.
    pub fn try_assign(&mut self, busy: &HashSet<SocketAddr>) -> Vec<(ChunkHash, SocketAddr)> {
        let mut taken: HashSet<SocketAddr> = busy.clone();
        let mut assignments = Vec::new();

        for hash in &self.requested {
            if !self.unassigned.contains(hash) {
                continue;
            }
            let Some(peers) = self.announcers.get(hash) else {
                continue;
            };
            let refused = self.denied.get(hash);
            let source = peers.iter().copied().find(|p| {
                !taken.contains(p) && refused.map_or(true, |d| !d.contains(p))
            });
            if let Some(source) = source {
                taken.insert(source);
                self.assigned.insert(*hash, source);
                assignments.push((*hash, source));
            }
        }

        for (hash, _) in &assignments {
            self.unassigned.remove(hash);
        }
        assignments
    }

    /// Services the handshake timer.
    pub fn on_tick(&mut self, now: Instant) -> TickAction {
        let Some(at) = self.retry_at else {
            return TickAction::Idle;
        };
        if now < at {
            return TickAction::Idle;
        }
        if self.unassigned.is_empty() {
            // Everything has a source; the timer idles until a failure.
            self.retry_at = None;
            return TickAction::Idle;
        }

        if self.floods > MAX_WHOHAS_RETRIES {
            let unmet: Vec<ChunkHash> = self
                .requested
                .iter()
                .filter(|h| self.outstanding.contains(h))
                .copied()
                .collect();
            return TickAction::Failed(unmet);
        }

        self.floods += 1;
        self.retry_at = Some(now + WHOHAS_RETRY_INTERVAL);
        // A fresh round may change answers; stale refusals are forgotten.
        self.denied.clear();
        TickAction::Flood(self.whohas_groups())
    }

    fn whohas_groups(&self) -> Vec<Vec<ChunkHash>> {
        let pending: Vec<ChunkHash> = self
            .requested
            .iter()
            .filter(|h| self.unassigned.contains(h))
            .copied()
            .collect();
        pending
            .chunks(MAX_HASHES_PER_PACKET)
            .map(|c| c.to_vec())
            .collect()
    }
}
