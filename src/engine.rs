//! The peer itself: a single-task event loop.
//!
//! Every protocol action happens between returns to one `tokio::select!`:
//! datagram readiness, standard-input commands, the earliest protocol
//! timer, and Ctrl-C. Handlers run to completion without yielding, so the
//! connection tables need no locking. Per-packet and per-command failures
//! are logged and the loop continues; only endpoint receive errors
//! terminate the peer.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::constants::{DEFAULT_TICK, DOWNLOAD_STALL_WINDOWS, WHOHAS_RETRY_INTERVAL};
use crate::hash::ChunkHash;
use crate::packet::Packet;
use crate::roster::{Roster, RosterError};
use crate::socket::{SimSock, RECV_BUF_LEN};
use crate::store::{read_chunkhash_file, ChunkStore, StoreError};
use crate::transfer::{
    Admission, AckOutcome, ConnectionTable, DataOutcome, Download, DownloadPlan, RttEstimator,
    TickAction, TimerFire, Upload,
};

/// Fatal peer errors: anything that prevents startup, plus unrecoverable
/// endpoint I/O.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Roster(#[from] RosterError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("peer identity must not be zero")]
    ZeroIdentity,

    #[error("max-send must be at least 1")]
    ZeroMaxSend,
}

/// Startup configuration, straight from the command line.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Roster file mapping peer ids to addresses.
    pub roster_path: PathBuf,
    /// Fragment file with this peer's initial chunks.
    pub fragment_path: PathBuf,
    /// Cap on distinct remotes receiving DATA concurrently.
    pub max_send: usize,
    /// This peer's roster identity.
    pub identity: u32,
    /// Fixed retransmission timeout; `None` enables RTT estimation.
    pub fixed_timeout: Option<Duration>,
}

enum Wake {
    Datagram(usize, SocketAddr),
    Line(Option<String>),
    Timer,
    Shutdown,
}

/// One running peer.
pub struct Peer {
    sock: SimSock,
    roster: Roster,
    store: ChunkStore,
    table: ConnectionTable,
    plan: Option<DownloadPlan>,
    identity: u32,
    fixed_timeout: Option<Duration>,
    buf: Vec<u8>,
}

impl Peer {
    /// Loads the roster and fragment, binds the endpoint, and builds the
    /// peer.
    pub async fn new(config: PeerConfig) -> Result<Self, PeerError> {
        if config.identity == 0 {
            return Err(PeerError::ZeroIdentity);
        }
        if config.max_send == 0 {
            return Err(PeerError::ZeroMaxSend);
        }

        let roster = Roster::load(&config.roster_path)?;
        let local = roster.get(config.identity)?.addr;
        let store = ChunkStore::load(&config.fragment_path)?;
        let sock = SimSock::bind(config.identity, local).await?;

        info!(
            identity = config.identity,
            addr = %sock.local_addr(),
            chunks = store.len(),
            max_send = config.max_send,
            "peer ready"
        );

        Ok(Self {
            sock,
            roster,
            store,
            table: ConnectionTable::new(config.max_send),
            plan: None,
            identity: config.identity,
            fixed_timeout: config.fixed_timeout,
            buf: vec![0u8; RECV_BUF_LEN],
        })
    }

    /// The chunk store, for inspection.
    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    /// True when no download command is in progress.
    pub fn download_idle(&self) -> bool {
        self.plan.is_none()
    }

    /// Runs the event loop until Ctrl-C or a fatal endpoint error.
    pub async fn run(&mut self) -> Result<(), PeerError> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            let deadline = self.wake_deadline();
            let wake = tokio::select! {
                received = self.sock.recv_from(&mut self.buf) => match received {
                    Ok((len, from)) => Wake::Datagram(len, from),
                    Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                        warn!(error = %e, "dropping undeliverable datagram");
                        Wake::Timer
                    }
                    Err(e) => return Err(e.into()),
                },
                line = lines.next_line(), if stdin_open => Wake::Line(line?),
                _ = tokio::time::sleep_until(deadline) => Wake::Timer,
                _ = &mut shutdown => Wake::Shutdown,
            };

            match wake {
                Wake::Datagram(len, from) => {
                    let datagram = Bytes::copy_from_slice(&self.buf[..len]);
                    self.handle_datagram(datagram, from).await;
                    self.drain_socket().await?;
                }
                Wake::Line(Some(line)) => self.handle_command(&line).await,
                Wake::Line(None) => {
                    debug!("stdin closed; serving uploads only");
                    stdin_open = false;
                }
                Wake::Timer => {}
                Wake::Shutdown => {
                    info!("interrupted, shutting down");
                    return Ok(());
                }
            }

            self.fire_timers(Instant::now()).await;
        }
    }

    /// Services one readiness event (datagram or timer) and the timers.
    /// This is the event loop body without stdin, used by tests.
    pub async fn poll_once(&mut self, max_wait: Duration) -> Result<(), PeerError> {
        let deadline = self
            .wake_deadline()
            .min(tokio::time::Instant::from_std(Instant::now() + max_wait));
        let wake = tokio::select! {
            received = self.sock.recv_from(&mut self.buf) => match received {
                Ok((len, from)) => Wake::Datagram(len, from),
                Err(e) if e.kind() == io::ErrorKind::InvalidData => Wake::Timer,
                Err(e) => return Err(e.into()),
            },
            _ = tokio::time::sleep_until(deadline) => Wake::Timer,
        };

        if let Wake::Datagram(len, from) = wake {
            let datagram = Bytes::copy_from_slice(&self.buf[..len]);
            self.handle_datagram(datagram, from).await;
            self.drain_socket().await?;
        }
        self.fire_timers(Instant::now()).await;
        Ok(())
    }

    fn wake_deadline(&self) -> tokio::time::Instant {
        let mut deadline = Instant::now() + DEFAULT_TICK;
        if let Some(d) = self.table.next_deadline() {
            deadline = deadline.min(d);
        }
        if let Some(d) = self.plan.as_ref().and_then(|p| p.deadline()) {
            deadline = deadline.min(d);
        }
        tokio::time::Instant::from_std(deadline)
    }

    async fn drain_socket(&mut self) -> Result<(), PeerError> {
        loop {
            match self.sock.try_recv_from(&mut self.buf) {
                Ok((len, from)) => {
                    let datagram = Bytes::copy_from_slice(&self.buf[..len]);
                    self.handle_datagram(datagram, from).await;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    warn!(error = %e, "dropping undeliverable datagram");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn handle_datagram(&mut self, datagram: Bytes, from: SocketAddr) {
        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(%from, error = %e, "malformed packet dropped");
                return;
            }
        };

        match packet {
            Packet::WhoHas(hashes) => self.on_whohas(from, &hashes).await,
            Packet::IHave(hashes) => self.on_ihave(from, &hashes).await,
            Packet::Get(hash) => self.on_get(from, hash).await,
            Packet::Data { seq, payload } => self.on_data(from, seq, payload).await,
            Packet::Ack { ack } => self.on_ack(from, ack).await,
            Packet::Denied(hashes) => self.on_denied(from, &hashes).await,
        }
    }

    /// WHOHAS: answer IHAVE for the chunks we hold, DENIED when the upload
    /// table is full, nothing when we hold none of them.
    async fn on_whohas(&mut self, from: SocketAddr, hashes: &[ChunkHash]) {
        let held = self.store.intersection(hashes);
        if held.is_empty() {
            return;
        }
        let reply = if self.table.has_upload_capacity() {
            Packet::IHave(held)
        } else {
            debug!(%from, "at capacity, refusing WHOHAS");
            Packet::Denied(held)
        };
        self.send(&reply, from).await;
    }

    /// IHAVE: assign newly announced chunks to sources and GET them.
    async fn on_ihave(&mut self, from: SocketAddr, hashes: &[ChunkHash]) {
        let busy = self.table.busy_sources();
        let assignments = match self.plan.as_mut() {
            Some(plan) => plan.on_ihave(from, hashes, &busy),
            None => return,
        };
        self.dispatch_assignments(assignments).await;
    }

    /// GET: admit and start streaming, or refuse.
    async fn on_get(&mut self, from: SocketAddr, hash: ChunkHash) {
        let Some(data) = self.store.get(&hash) else {
            debug!(%from, %hash, "GET for a chunk we do not hold");
            self.send(&Packet::Denied(vec![hash]), from).await;
            return;
        };

        match self.table.admit_upload(from, hash) {
            Admission::AlreadyServing => {}
            Admission::Denied => {
                debug!(%from, %hash, "GET refused by admission control");
                self.send(&Packet::Denied(vec![hash]), from).await;
            }
            Admission::Accept => {
                let rtt = self.rtt_estimator();
                let mut upload = Upload::new(from, hash, data, rtt);
                let burst = upload.fill_window(Instant::now());
                self.table.insert_upload(upload);
                info!(%from, %hash, "upload started");
                for packet in burst {
                    self.send(&packet, from).await;
                }
            }
        }
    }

    /// ACK: advance the matching upload.
    async fn on_ack(&mut self, from: SocketAddr, ack: u32) {
        let now = Instant::now();
        let Some(upload) = self.table.upload_mut(from) else {
            return;
        };

        let to_send = match upload.on_ack(ack, now) {
            AckOutcome::Advanced => upload.fill_window(now),
            AckOutcome::Duplicate(Some(retransmit)) => vec![retransmit],
            AckOutcome::Duplicate(None) | AckOutcome::Ignored => Vec::new(),
            AckOutcome::Complete => {
                let hash = upload.hash();
                self.table.remove_upload(from);
                info!(%from, %hash, "upload complete");
                Vec::new()
            }
        };
        for packet in to_send {
            self.send(&packet, from).await;
        }
    }

    /// DATA: feed the matching download, commit on verified completion.
    async fn on_data(&mut self, from: SocketAddr, seq: u32, payload: Bytes) {
        let now = Instant::now();
        let Some(download) = self.table.download_mut(from) else {
            debug!(%from, seq, "DATA with no matching download");
            return;
        };
        let hash = download.hash();

        match download.on_data(seq, &payload, now) {
            DataOutcome::Ack(ack) => self.send(&ack, from).await,
            DataOutcome::Complete { ack, chunk } => {
                self.send(&ack, from).await;
                self.table.remove_download(from);
                self.store.insert(hash, chunk);
                info!(%from, %hash, "chunk verified and committed");
                self.finish_chunk(hash).await;
            }
            DataOutcome::Corrupt { ack } => {
                self.send(&ack, from).await;
                self.table.remove_download(from);
                warn!(%from, %hash, "chunk failed verification, re-entering handshake");
                if let Some(plan) = self.plan.as_mut() {
                    plan.on_failed(hash, now);
                }
            }
            DataOutcome::Ignored => {}
        }
    }

    /// DENIED: retract provisional sources and look for replacements.
    async fn on_denied(&mut self, from: SocketAddr, hashes: &[ChunkHash]) {
        let aborted = match self.plan.as_mut() {
            Some(plan) => plan.on_denied(from, hashes),
            None => return,
        };
        if !aborted.is_empty() {
            self.table.remove_download(from);
        }

        let busy = self.table.busy_sources();
        let assignments = match self.plan.as_mut() {
            Some(plan) => plan.try_assign(&busy),
            None => Vec::new(),
        };
        self.dispatch_assignments(assignments).await;
    }

    /// Book a committed chunk against the plan; a freed source may pick up
    /// another remembered announcement, and a finished plan writes the
    /// output fragment.
    async fn finish_chunk(&mut self, hash: ChunkHash) {
        let busy = self.table.busy_sources();
        let assignments = match self.plan.as_mut() {
            Some(plan) => {
                plan.on_complete(hash);
                plan.try_assign(&busy)
            }
            None => return,
        };
        self.dispatch_assignments(assignments).await;

        if self.plan.as_ref().is_some_and(|p| p.is_complete()) {
            let Some(plan) = self.plan.take() else { return };
            match self.store.write_fragment(plan.output(), plan.requested()) {
                Ok(()) => println!("GOT {}", plan.output().display()),
                Err(e) => warn!(error = %e, "failed to write output fragment"),
            }
        }
    }

    async fn dispatch_assignments(&mut self, assignments: Vec<(ChunkHash, SocketAddr)>) {
        let now = Instant::now();
        for (hash, source) in assignments {
            info!(%source, %hash, "requesting chunk");
            self.table
                .insert_download(Download::new(source, hash, self.stall_window(), now));
            self.send(&Packet::Get(hash), source).await;
        }
    }

    async fn handle_command(&mut self, line: &str) {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("DOWNLOAD") => {
                let (Some(chunkhash), Some(output)) = (parts.next(), parts.next()) else {
                    warn!("usage: DOWNLOAD <chunkhash-file> <output-fragment-file>");
                    return;
                };
                let output = PathBuf::from(output);
                if let Err(e) = self.start_download(Path::new(chunkhash), output).await {
                    warn!(error = %e, "DOWNLOAD command failed");
                }
            }
            Some(other) => warn!(command = other, "unknown command"),
            None => {}
        }
    }

    /// Begins a download: reads the chunkhash file, floods WHOHAS for the
    /// missing hashes. Completes immediately when nothing is missing.
    pub async fn start_download(
        &mut self,
        chunkhash: &Path,
        output: PathBuf,
    ) -> Result<(), PeerError> {
        if self.plan.is_some() {
            warn!("a download is already in progress");
            return Ok(());
        }

        let requested = read_chunkhash_file(chunkhash)?;
        if requested.is_empty() {
            warn!(file = %chunkhash.display(), "chunkhash file names no chunks");
            return Ok(());
        }

        let missing: Vec<ChunkHash> = requested
            .iter()
            .filter(|h| !self.store.contains(h))
            .copied()
            .collect();
        info!(
            requested = requested.len(),
            missing = missing.len(),
            output = %output.display(),
            "download starting"
        );

        if missing.is_empty() {
            self.store.write_fragment(&output, &requested)?;
            println!("GOT {}", output.display());
            return Ok(());
        }

        let now = Instant::now();
        self.plan = Some(DownloadPlan::new(requested, &missing, output, now));
        self.pump_plan(now).await;
        Ok(())
    }

    async fn fire_timers(&mut self, now: Instant) {
        // Upload retransmission timers.
        for addr in self.table.expired_uploads(now) {
            let fired = self
                .table
                .upload_mut(addr)
                .and_then(|up| up.fire_timer(now));
            match fired {
                Some(TimerFire::Retransmit(packet)) => self.send(&packet, addr).await,
                Some(TimerFire::Abandon) => {
                    self.table.remove_upload(addr);
                    warn!(%addr, "upload abandoned: peer unresponsive");
                }
                None => {}
            }
        }

        // Download inactivity.
        for addr in self.table.stalled_downloads(now) {
            if let Some(download) = self.table.remove_download(addr) {
                warn!(%addr, hash = %download.hash(), "download stalled, re-entering handshake");
                if let Some(plan) = self.plan.as_mut() {
                    plan.on_failed(download.hash(), now);
                }
            }
        }

        // Handshake retry.
        self.pump_plan(now).await;
    }

    async fn pump_plan(&mut self, now: Instant) {
        let action = match self.plan.as_mut() {
            Some(plan) => plan.on_tick(now),
            None => return,
        };

        match action {
            TickAction::Idle => {}
            TickAction::Flood(groups) => {
                let targets: Vec<SocketAddr> = self
                    .roster
                    .others(self.identity)
                    .map(|p| p.addr)
                    .collect();
                debug!(packets = groups.len(), peers = targets.len(), "flooding WHOHAS");
                for group in groups {
                    let packet = Packet::WhoHas(group);
                    for addr in &targets {
                        self.send(&packet, *addr).await;
                    }
                }
            }
            TickAction::Failed(unmet) => {
                let hex: Vec<String> = unmet.iter().map(|h| h.to_hex()).collect();
                println!("DOWNLOAD FAILED {}", hex.join(" "));
                warn!(unmet = unmet.len(), "download failed: handshake exhausted");
                self.plan = None;
            }
        }
    }

    fn rtt_estimator(&self) -> RttEstimator {
        match self.fixed_timeout {
            Some(timeout) => RttEstimator::fixed(timeout),
            None => RttEstimator::new(),
        }
    }

    /// Receiver-side failure window: the receiver keeps no retransmission
    /// timer, so the sender-side timeout budget is approximated as a DATA
    /// inactivity window.
    fn stall_window(&self) -> Duration {
        self.fixed_timeout.unwrap_or(WHOHAS_RETRY_INTERVAL) * DOWNLOAD_STALL_WINDOWS
    }

    async fn send(&self, packet: &Packet, dest: SocketAddr) {
        if let Err(e) = self.sock.send_to(&packet.encode(), dest).await {
            warn!(%dest, kind = ?packet.kind(), error = %e, "send failed");
        }
    }
}
