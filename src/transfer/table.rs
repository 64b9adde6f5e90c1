//! Connection table and admission control.
//!
//! Active transfers are keyed by remote address, which enforces the
//! one-chunk-per-direction-per-pair rule by construction. Admission is
//! counted on the upload side only: at most `max_send` distinct remotes
//! may be receiving DATA from this peer at once. Downloads are unbounded.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

use super::download::Download;
use super::upload::Upload;
use crate::hash::ChunkHash;

/// Why a GET was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Start streaming.
    Accept,
    /// Already streaming this very chunk to this remote; the GET is a
    /// duplicate and the running upload covers it.
    AlreadyServing,
    /// A different chunk is in flight to this remote, or the upload table
    /// is full.
    Denied,
}

/// All active transfers, both directions.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    uploads: HashMap<SocketAddr, Upload>,
    downloads: HashMap<SocketAddr, Download>,
    max_send: usize,
}

impl ConnectionTable {
    pub fn new(max_send: usize) -> Self {
        Self {
            uploads: HashMap::new(),
            downloads: HashMap::new(),
            max_send,
        }
    }

    /// Distinct remotes currently receiving DATA from this peer.
    pub fn upload_count(&self) -> usize {
        self.uploads.len()
    }

    /// True while another inbound upload can be admitted.
    pub fn has_upload_capacity(&self) -> bool {
        self.uploads.len() < self.max_send
    }

    /// Decides whether a GET from `remote` for `hash` may start.
    pub fn admit_upload(&self, remote: SocketAddr, hash: ChunkHash) -> Admission {
        if let Some(active) = self.uploads.get(&remote) {
            return if active.hash() == hash {
                Admission::AlreadyServing
            } else {
                Admission::Denied
            };
        }
        if self.has_upload_capacity() {
            Admission::Accept
        } else {
            Admission::Denied
        }
    }

    pub fn insert_upload(&mut self, upload: Upload) {
        debug_assert!(self.has_upload_capacity());
        self.uploads.insert(upload.remote(), upload);
    }

    pub fn upload_mut(&mut self, remote: SocketAddr) -> Option<&mut Upload> {
        self.uploads.get_mut(&remote)
    }

    /// Removes an upload, freeing its admission slot.
    pub fn remove_upload(&mut self, remote: SocketAddr) -> Option<Upload> {
        self.uploads.remove(&remote)
    }

    pub fn insert_download(&mut self, download: Download) {
        debug_assert!(!self.downloads.contains_key(&download.remote()));
        self.downloads.insert(download.remote(), download);
    }

    pub fn download_mut(&mut self, remote: SocketAddr) -> Option<&mut Download> {
        self.downloads.get_mut(&remote)
    }

    pub fn remove_download(&mut self, remote: SocketAddr) -> Option<Download> {
        self.downloads.remove(&remote)
    }

    /// Remotes this peer is currently downloading from; these cannot be
    /// handed a second hash until they finish.
    pub fn busy_sources(&self) -> HashSet<SocketAddr> {
        self.downloads.keys().copied().collect()
    }

    /// Uploads whose retransmission deadline has passed.
    pub fn expired_uploads(&self, now: Instant) -> Vec<SocketAddr> {
        self.uploads
            .iter()
            .filter(|(_, up)| up.deadline().is_some_and(|d| now >= d))
            .map(|(&addr, _)| addr)
            .collect()
    }

    /// Downloads whose source stopped delivering.
    pub fn stalled_downloads(&self, now: Instant) -> Vec<SocketAddr> {
        self.downloads
            .iter()
            .filter(|(_, dl)| dl.is_stalled(now))
            .map(|(&addr, _)| addr)
            .collect()
    }

    /// Earliest pending transfer deadline, for the event loop.
    pub fn next_deadline(&self) -> Option<Instant> {
        let uploads = self.uploads.values().filter_map(|up| up.deadline());
        let downloads = self.downloads.values().map(|dl| dl.deadline());
        uploads.chain(downloads).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CHUNK_SIZE;
    use crate::transfer::rtt::RttEstimator;
    use bytes::Bytes;
    use std::time::Duration;

    fn hash(n: u8) -> ChunkHash {
        ChunkHash::from_bytes([n; 20])
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn upload(remote: SocketAddr, h: ChunkHash) -> Upload {
        Upload::new(
            remote,
            h,
            Bytes::from(vec![0; CHUNK_SIZE]),
            RttEstimator::new(),
        )
    }

    #[test]
    fn test_admission_bound() {
        let mut table = ConnectionTable::new(1);
        assert_eq!(table.admit_upload(addr(2), hash(1)), Admission::Accept);
        table.insert_upload(upload(addr(2), hash(1)));

        // Table full: another remote is refused.
        assert_eq!(table.admit_upload(addr(3), hash(1)), Admission::Denied);

        // Completion frees the slot.
        table.remove_upload(addr(2));
        assert_eq!(table.admit_upload(addr(3), hash(1)), Admission::Accept);
    }

    #[test]
    fn test_one_chunk_per_pair() {
        let mut table = ConnectionTable::new(4);
        table.insert_upload(upload(addr(2), hash(1)));

        // Same remote, different chunk: refused despite free capacity.
        assert_eq!(table.admit_upload(addr(2), hash(2)), Admission::Denied);
        // Same remote, same chunk: duplicate GET, already covered.
        assert_eq!(table.admit_upload(addr(2), hash(1)), Admission::AlreadyServing);
    }

    #[test]
    fn test_deadlines() {
        let now = Instant::now();
        let mut table = ConnectionTable::new(2);
        assert!(table.next_deadline().is_none());

        let mut up = upload(addr(2), hash(1));
        up.fill_window(now);
        let up_deadline = up.deadline().unwrap();
        table.insert_upload(up);

        table.insert_download(Download::new(
            addr(3),
            hash(2),
            Duration::from_secs(100),
            now,
        ));

        assert_eq!(table.next_deadline(), Some(up_deadline));
        assert!(table.expired_uploads(now).is_empty());
        assert_eq!(table.expired_uploads(up_deadline + Duration::from_millis(1)), vec![addr(2)]);
        assert_eq!(
            table.stalled_downloads(now + Duration::from_secs(101)),
            vec![addr(3)]
        );
    }
}
