//! Connection and disconnection handshake.
//!
//! A batch walks every peer through `PREREQ -> POSTREQ -> DONE`. The blocking
//! [`AmPtl::connect`], [`AmPtl::disconnect`] and [`AmPtl::abort`] wrappers
//! drive a batch with full progress so that requests arriving from the
//! peers we are waiting on still get answered.
//!
//! Handshake packets all go to the connection handler with
//! `a0 = op | shmidx << 16 | phase << 32`, `a1 = epid`,
//! `a2 = pid | gpu << 22 | err << 32` and `a3` echoed back unchanged.

use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::EpId;
use crate::deferred::{DeferredKind, DeferredSend};
use crate::directory::{IncomingState, OutgoingState, PID_UNKNOWN, PeerSlot};
use crate::error::AmError;
use crate::layout::check_version;
use crate::mq::MatchedQueue;
use crate::packet::{Args, HandlerIdx, NO_SHMIDX};
use crate::ptl::{AmPtl, Inbound};

const CONN_REQ: u64 = 1;
const CONN_REP: u64 = 2;
const DISC_REQ: u64 = 3;
const DISC_REP: u64 = 4;

const PID_MASK: u32 = (1 << 22) - 1;
const GPU_SHIFT: u32 = 22;

/// Iterations without progress between yields when attaching politely.
const POLITE_YIELD_EVERY: u32 = 20;

/// Abort never waits for replies.
const ABORT_ITERATIONS: usize = 2;

/// What a batch does to its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnOp {
    Connect,
    Disconnect,
    /// Disconnect without waiting; replies arriving later are still accepted.
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnMask {
    /// Nothing to do for this peer.
    None,
    PreReq,
    PostReq,
    Done,
}

#[derive(Debug)]
struct BatchEntry {
    epid: EpId,
    shmidx: Option<u16>,
    mask: ConnMask,
    error: Option<AmError>,
}

/// In-flight connect, disconnect or abort over a set of peers.
#[derive(Debug)]
pub struct ConnectionBatch {
    op: ConnOp,
    phase: u32,
    entries: Vec<BatchEntry>,
    left: usize,
}

impl ConnectionBatch {
    pub fn op(&self) -> ConnOp {
        self.op
    }

    /// Peers still in progress.
    pub fn remaining(&self) -> usize {
        self.left
    }

    pub fn is_done(&self) -> bool {
        self.left == 0
    }

    fn into_results(self) -> Vec<Result<(), AmError>> {
        self.entries
            .into_iter()
            .map(|e| e.error.map_or(Ok(()), Err))
            .collect()
    }
}

fn parse_extra(word: u64) -> (u32, u32) {
    let extra = word as u32;
    (extra & PID_MASK, extra >> GPU_SHIFT)
}

impl<M: MatchedQueue> AmPtl<M> {
    /// Start a batch. Peers that need no work are settled immediately.
    pub fn connreq_init(&mut self, op: ConnOp, peers: &[EpId]) -> ConnectionBatch {
        let mut entries = Vec::with_capacity(peers.len());
        for &epid in peers {
            let found = self.directory.find(epid);
            let established = found
                .and_then(|idx| self.directory.get(idx))
                .is_some_and(|slot| slot.outgoing == OutgoingState::Established);

            let (mask, error) = match op {
                ConnOp::Connect if !self.epid.can_reach(epid) => {
                    (ConnMask::None, Some(AmError::Unreachable(epid)))
                }
                ConnOp::Connect if established => (ConnMask::None, None),
                ConnOp::Connect => (ConnMask::PreReq, None),
                ConnOp::Disconnect | ConnOp::Abort if established => (ConnMask::PreReq, None),
                ConnOp::Disconnect | ConnOp::Abort => (ConnMask::None, None),
            };
            entries.push(BatchEntry {
                epid,
                shmidx: if op == ConnOp::Connect { None } else { found },
                mask,
                error,
            });
        }

        let left = entries.iter().filter(|e| e.mask == ConnMask::PreReq).count();
        let batch = ConnectionBatch {
            op,
            phase: self.phase,
            entries,
            left,
        };
        if left == 0 && op != ConnOp::Abort {
            self.phase = self.phase.wrapping_add(1);
        }
        tracing::debug!(?op, peers = peers.len(), left, phase = batch.phase, "connection batch started");
        batch
    }

    /// Advance a batch. Returns true when every peer is settled.
    pub fn connreq_poll(&mut self, batch: &mut ConnectionBatch) -> Result<bool, AmError> {
        if batch.left > 0 {
            match batch.op {
                ConnOp::Connect => self.poll_connect(batch)?,
                ConnOp::Disconnect | ConnOp::Abort => self.poll_disconnect(batch)?,
            }
        }
        if batch.left == 0 {
            return Ok(true);
        }
        std::thread::yield_now();
        Ok(false)
    }

    fn poll_connect(&mut self, batch: &mut ConnectionBatch) -> Result<(), AmError> {
        let wait = self.config.init_wait;

        for entry in batch.entries.iter_mut() {
            if entry.mask != ConnMask::PostReq {
                continue;
            }
            let Some(idx) = entry.shmidx else {
                continue;
            };
            let Some(slot) = self.directory.get_mut(idx) else {
                entry.mask = ConnMask::PreReq;
                entry.shmidx = None;
                continue;
            };
            if slot.pid_changed() {
                tracing::debug!(epid = %entry.epid, "peer restarted during connect");
                slot.outgoing = OutgoingState::None;
                entry.mask = ConnMask::PreReq;
                if let Err(e) = self.directory.epaddr_update(idx, wait) {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    tracing::debug!(epid = %entry.epid, error = %e, "restarted peer not usable");
                    entry.error = Some(e);
                    entry.mask = ConnMask::Done;
                    batch.left -= 1;
                }
                continue;
            }
            if slot.outgoing == OutgoingState::Replied {
                slot.outgoing = OutgoingState::Established;
                entry.mask = ConnMask::Done;
                batch.left -= 1;
                tracing::debug!(shmidx = idx, epid = %entry.epid, "connected");
            }
        }

        for (i, entry) in batch.entries.iter_mut().enumerate() {
            if entry.mask != ConnMask::PreReq {
                continue;
            }
            let mapped = self
                .directory
                .find(entry.epid)
                .filter(|idx| self.directory.get(*idx).is_some_and(PeerSlot::is_mapped));
            let Some(idx) = mapped else {
                match self
                    .directory
                    .map_remote(&self.config.prefix, entry.epid, false, wait)
                {
                    // Request goes out on the next poll.
                    Ok(_) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        tracing::debug!(epid = %entry.epid, error = %e, "peer not reachable");
                        entry.error = Some(e);
                        entry.mask = ConnMask::Done;
                        batch.left -= 1;
                    }
                }
                continue;
            };

            let Some(slot) = self.directory.get_mut(idx) else {
                continue;
            };
            if check_version(slot.version).is_err() {
                tracing::info!(epid = %entry.epid, version = slot.version, "peer speaks another protocol version");
                entry.error = Some(AmError::InvalidVersion {
                    peer: entry.epid,
                    found: slot.version,
                });
                entry.mask = ConnMask::Done;
                batch.left -= 1;
                continue;
            }
            slot.outgoing = OutgoingState::Requested;
            entry.shmidx = Some(idx);
            entry.mask = ConnMask::PostReq;

            let args = self.conn_args(CONN_REQ, idx, batch.phase, i as u64)?;
            self.send_or_defer(conn_packet(idx, entry.epid, false, args));
            tracing::trace!(shmidx = idx, epid = %entry.epid, "sent connect request");
        }
        Ok(())
    }

    fn poll_disconnect(&mut self, batch: &mut ConnectionBatch) -> Result<(), AmError> {
        for (i, entry) in batch.entries.iter_mut().enumerate() {
            let idx = entry.shmidx.unwrap_or(NO_SHMIDX);
            match entry.mask {
                ConnMask::PreReq => {
                    match self.directory.get_mut(idx) {
                        Some(slot) if slot.epid == entry.epid && slot.is_mapped() => {}
                        Some(slot) if slot.epid == entry.epid => {
                            slot.outgoing = OutgoingState::None;
                            entry.mask = ConnMask::Done;
                            batch.left -= 1;
                            continue;
                        }
                        _ => {
                            entry.mask = ConnMask::Done;
                            batch.left -= 1;
                            continue;
                        }
                    }

                    let args = self.conn_args(DISC_REQ, idx, batch.phase, i as u64)?;
                    let sent = self.send_or_defer(conn_packet(idx, entry.epid, false, args));
                    if let Some(slot) = self.directory.get_mut(idx) {
                        slot.outgoing = OutgoingState::DiscRequested;
                        if sent && slot.incoming == IncomingState::DiscRequested {
                            slot.unmap();
                        }
                    }
                    entry.mask = ConnMask::PostReq;
                    tracing::trace!(shmidx = idx, epid = %entry.epid, "sent disconnect request");
                }
                ConnMask::PostReq => match self.directory.get_mut(idx) {
                    Some(slot) if slot.epid == entry.epid => {
                        if slot.outgoing == OutgoingState::DiscReplied {
                            slot.outgoing = OutgoingState::None;
                            entry.mask = ConnMask::Done;
                            batch.left -= 1;
                        }
                    }
                    _ => {
                        entry.mask = ConnMask::Done;
                        batch.left -= 1;
                    }
                },
                ConnMask::None | ConnMask::Done => {}
            }
        }
        Ok(())
    }

    /// Settle whatever the batch did not finish and report per-peer results.
    pub fn connreq_fini(&mut self, mut batch: ConnectionBatch) -> Vec<Result<(), AmError>> {
        if batch.op != ConnOp::Abort {
            self.phase = self.phase.wrapping_add(1);
        }

        for entry in batch.entries.iter_mut() {
            match entry.mask {
                _ if batch.op == ConnOp::Abort => {
                    if entry.mask != ConnMask::None && entry.mask != ConnMask::Done {
                        entry.mask = ConnMask::None;
                    }
                }
                ConnMask::PostReq => {
                    entry.mask = ConnMask::Done;
                    let slot = entry.shmidx.and_then(|idx| self.directory.get_mut(idx));
                    match slot {
                        Some(slot) if slot.outgoing == OutgoingState::Replied => {
                            slot.outgoing = OutgoingState::Established;
                            batch.left -= 1;
                        }
                        _ => entry.error = Some(AmError::Timeout),
                    }
                }
                ConnMask::PreReq => {
                    entry.mask = ConnMask::Done;
                    entry.error = Some(AmError::Timeout);
                    batch.left -= 1;
                }
                ConnMask::None | ConnMask::Done => {}
            }
        }

        if batch.op != ConnOp::Connect {
            for entry in batch.entries.iter().filter(|e| e.mask == ConnMask::Done) {
                let Some(idx) = entry.shmidx else {
                    continue;
                };
                let gone = self.directory.get(idx).is_some_and(|slot| {
                    slot.epid == entry.epid
                        && (slot.incoming == IncomingState::DiscRequested
                            || (slot.outgoing == OutgoingState::None
                                && slot.incoming == IncomingState::None))
                });
                if gone {
                    self.forget_peer(idx);
                }
            }
        }

        tracing::debug!(op = ?batch.op, phase = self.phase, "connection batch finished");
        batch.into_results()
    }

    /// Connect to `peers`, waiting at most `timeout`.
    ///
    /// The outer error is fatal; per-peer failures (unreachable, version
    /// mismatch, timeout) come back in the vector, in the order of `peers`.
    pub fn connect(
        &mut self,
        peers: &[EpId],
        timeout: Duration,
    ) -> Result<Vec<Result<(), AmError>>, AmError> {
        self.run_batch(ConnOp::Connect, peers, timeout)
    }

    /// Disconnect from `peers`, waiting at most `timeout` for their replies.
    pub fn disconnect(
        &mut self,
        peers: &[EpId],
        timeout: Duration,
    ) -> Result<Vec<Result<(), AmError>>, AmError> {
        self.run_batch(ConnOp::Disconnect, peers, timeout)
    }

    /// Tell `peers` we are leaving without waiting for them.
    pub fn abort(&mut self, peers: &[EpId]) -> Result<Vec<Result<(), AmError>>, AmError> {
        let mut batch = self.connreq_init(ConnOp::Abort, peers);
        if batch.is_done() {
            return Ok(batch.into_results());
        }
        for _ in 0..ABORT_ITERATIONS {
            self.progress(false)?;
            if self.connreq_poll(&mut batch)? {
                break;
            }
        }
        Ok(self.connreq_fini(batch))
    }

    fn run_batch(
        &mut self,
        op: ConnOp,
        peers: &[EpId],
        timeout: Duration,
    ) -> Result<Vec<Result<(), AmError>>, AmError> {
        let mut batch = self.connreq_init(op, peers);
        if batch.is_done() {
            return Ok(batch.into_results());
        }

        let deadline = Instant::now() + timeout;
        let mut idle = 0;
        loop {
            let n = self.progress(false)?;
            if self.connreq_poll(&mut batch)? {
                break;
            }
            if self.config.polite_attach && n == 0 {
                idle += 1;
                if idle == POLITE_YIELD_EVERY {
                    idle = 0;
                    std::thread::yield_now();
                }
            }
            if Instant::now() >= deadline {
                tracing::debug!(?op, left = batch.remaining(), "connection batch timed out");
                break;
            }
        }
        Ok(self.connreq_fini(batch))
    }

    fn conn_args(&self, op: u64, shmidx: u16, phase: u32, cookie: u64) -> Result<Args, AmError> {
        let extra = (std::process::id() & PID_MASK) | self.device.device_index() << GPU_SHIFT;
        Args::from_slice(&[
            op | (shmidx as u64) << 16 | (phase as u64) << 32,
            self.epid.0,
            extra as u64,
            cookie,
        ])
    }

    pub(crate) fn handle_conn(&mut self, inb: Inbound, args: &[u64]) -> Result<(), AmError> {
        let &[a0, a1, a2, cookie, ..] = args else {
            return Err(AmError::protocol(format!(
                "connection packet with {} arguments",
                args.len()
            )));
        };
        let op = a0 & 0xffff;
        let their_idx = (a0 >> 16) as u16;
        let phase = (a0 >> 32) as u32;
        let epid = EpId(a1);
        let (pid, gpu) = parse_extra(a2);
        let err = (a2 >> 32) as u32;
        if err != 0 {
            tracing::debug!(%epid, err, "peer reported a connection error");
        }

        match op {
            CONN_REQ => self.on_conn_req(epid, pid, gpu, their_idx, phase, cookie),
            CONN_REP => {
                self.on_conn_rep(inb, their_idx, phase);
                Ok(())
            }
            DISC_REQ => {
                self.on_disc_req(inb, epid, phase, cookie)?;
                Ok(())
            }
            DISC_REP => {
                self.on_disc_rep(inb, phase);
                Ok(())
            }
            other => Err(AmError::protocol(format!(
                "unknown connection op {} from {}",
                other, epid
            ))),
        }
    }

    fn on_conn_req(
        &mut self,
        epid: EpId,
        pid: u32,
        gpu: u32,
        their_idx: u16,
        phase: u32,
        cookie: u64,
    ) -> Result<(), AmError> {
        let mut force_remap = false;
        if let Some(idx) = self.directory.find(epid) {
            if let Some(slot) = self.directory.get_mut(idx) {
                if slot.conn_pid == PID_UNKNOWN {
                    slot.conn_pid = pid;
                    slot.gpu_id = gpu;
                } else if slot.conn_pid != pid {
                    tracing::debug!(%epid, old = slot.conn_pid, new = pid, "peer came back as another process");
                    force_remap = true;
                }
            }
            if force_remap {
                self.memcache.purge_peer(&*self.device, epid);
            }
        }

        let idx = self.directory.map_remote(
            &self.config.prefix,
            epid,
            force_remap,
            self.config.init_wait,
        )?;
        let Some(slot) = self.directory.get_mut(idx) else {
            return Err(AmError::SegmentFault("mapped peer vanished"));
        };
        if slot.conn_pid == PID_UNKNOWN {
            slot.conn_pid = pid;
            slot.gpu_id = gpu;
        }
        slot.incoming = IncomingState::Established;
        slot.return_shmidx = their_idx;
        self.connect_incoming += 1;

        let args = self.conn_args(CONN_REP, idx, phase, cookie)?;
        self.send_or_defer(conn_packet(idx, epid, true, args));
        tracing::debug!(shmidx = idx, %epid, "accepted connection");
        Ok(())
    }

    fn on_conn_rep(&mut self, inb: Inbound, their_idx: u16, phase: u32) {
        if phase != self.phase {
            tracing::debug!(phase, current = self.phase, "dropping stale connect reply");
            return;
        }
        let Some(slot) = self.directory.get_mut(inb.shmidx) else {
            tracing::debug!(shmidx = inb.shmidx, "connect reply for unknown peer");
            return;
        };
        if slot.pid_changed() {
            tracing::debug!(epid = %slot.epid, "dropping connect reply from replaced peer");
            return;
        }
        slot.outgoing = OutgoingState::Replied;
        slot.return_shmidx = their_idx;
        self.connect_outgoing += 1;
    }

    fn on_disc_req(
        &mut self,
        inb: Inbound,
        epid: EpId,
        phase: u32,
        cookie: u64,
    ) -> Result<(), AmError> {
        let Some(idx) = self.directory.find(epid) else {
            tracing::debug!(%epid, "disconnect from unknown peer");
            return Ok(());
        };
        let Some(slot) = self.directory.get_mut(idx) else {
            return Ok(());
        };
        slot.incoming = IncomingState::DiscRequested;
        self.connect_incoming -= 1;
        if idx != inb.shmidx || !slot.is_mapped() {
            return Ok(());
        }

        let args = self.conn_args(DISC_REP, idx, phase, cookie)?;
        let sent = self.send_or_defer(conn_packet(idx, epid, true, args));
        let outgoing = self.directory.get(idx).map(|slot| slot.outgoing);
        match outgoing {
            Some(OutgoingState::DiscRequested) => {
                if let Some(slot) = self.directory.get_mut(idx) {
                    slot.unmap();
                }
            }
            Some(OutgoingState::None) if sent => self.forget_peer(idx),
            _ => {}
        }
        tracing::debug!(shmidx = idx, %epid, "peer disconnected");
        Ok(())
    }

    fn on_disc_rep(&mut self, inb: Inbound, phase: u32) {
        if phase != self.phase {
            tracing::debug!(phase, current = self.phase, "dropping stale disconnect reply");
            return;
        }
        let Some(slot) = self.directory.get_mut(inb.shmidx) else {
            tracing::debug!(shmidx = inb.shmidx, "disconnect reply for unknown peer");
            return;
        };
        slot.outgoing = OutgoingState::DiscReplied;
        self.connect_outgoing -= 1;
    }
}

fn conn_packet(shmidx: u16, epid: EpId, is_reply: bool, args: Args) -> DeferredSend {
    DeferredSend {
        shmidx,
        epid,
        is_reply,
        handler: HandlerIdx::Conn,
        args,
        payload: Bytes::new(),
        kind: DeferredKind::Short,
    }
}
