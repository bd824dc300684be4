//! Peer directory: `shmidx` to mapped segment and connection state.
//!
//! An index is handed out on first contact and stays with the peer until
//! the slot is removed. Both sides learn each other's index during the
//! handshake, so packets carry the receiver-side index of their sender.

use std::time::Duration;

use crate::EpId;
use crate::error::{AmError, SegmentError};
use crate::layout::{QueueDirectory, SegmentFeatures};
use crate::packet::NO_SHMIDX;
use crate::queue::SegmentQueues;
use crate::segment::RemoteSegment;

/// Initial directory size; the table doubles when full.
pub const DIRBLOCK_SIZE: usize = 32;

/// Pid of a peer we have not heard from yet.
pub const PID_UNKNOWN: u32 = 0;

/// Our side of the relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingState {
    None,
    /// CONN_REQ sent.
    Requested,
    /// CONN_REP received, not yet observed by the batch.
    Replied,
    Established,
    DiscRequested,
    DiscReplied,
}

/// The peer's side, as we have seen it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingState {
    None,
    Established,
    DiscRequested,
}

/// One directory entry.
pub struct PeerSlot {
    pub epid: EpId,
    /// Pid published in the peer's segment header when we mapped it.
    pub pid: u32,
    /// Pid the peer announced in its connect request.
    pub conn_pid: u32,
    pub gpu_id: u32,
    pub version: u32,
    pub features: SegmentFeatures,
    /// Our index in the peer's directory.
    pub return_shmidx: u16,
    pub outgoing: OutgoingState,
    pub incoming: IncomingState,
    queues: Option<SegmentQueues>,
    dir: Option<QueueDirectory>,
    segment: Option<RemoteSegment>,
}

impl PeerSlot {
    fn new(epid: EpId) -> Self {
        Self {
            epid,
            pid: PID_UNKNOWN,
            conn_pid: PID_UNKNOWN,
            gpu_id: 0,
            version: 0,
            features: SegmentFeatures::empty(),
            return_shmidx: NO_SHMIDX,
            outgoing: OutgoingState::None,
            incoming: IncomingState::None,
            queues: None,
            dir: None,
            segment: None,
        }
    }

    fn install(&mut self, segment: RemoteSegment) -> Result<(), AmError> {
        let dir = segment.directory().map_err(SegmentError::from)?;
        let queues = segment.queues(&dir)?;
        let info = segment.info();
        self.pid = info.pid;
        self.version = info.version;
        self.features = info.features();
        self.dir = Some(dir);
        self.queues = Some(queues);
        self.segment = Some(segment);
        Ok(())
    }

    /// Queues of the peer's segment, while it is mapped.
    pub fn queues(&self) -> Option<&SegmentQueues> {
        self.queues.as_ref()
    }

    pub fn segment(&self) -> Option<&RemoteSegment> {
        self.segment.as_ref()
    }

    pub fn is_mapped(&self) -> bool {
        self.segment.is_some()
    }

    /// Pid currently published in the peer's header.
    pub fn mapped_pid(&self) -> Option<u32> {
        self.segment.as_ref().map(|s| s.info().pid)
    }

    /// True if the segment now belongs to a different process than the one
    /// we mapped (the name was reused).
    pub fn pid_changed(&self) -> bool {
        self.mapped_pid().is_some_and(|pid| pid != self.pid)
    }

    /// Drop the mapping but keep the entry.
    pub fn unmap(&mut self) {
        self.queues = None;
        self.dir = None;
        if self.segment.take().is_some() {
            tracing::debug!(epid = %self.epid, "unmapped peer segment");
        }
    }
}

/// Table of known peers, indexed by `shmidx`.
pub struct PeerDirectory {
    slots: Vec<Option<PeerSlot>>,
}

impl Default for PeerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerDirectory {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(DIRBLOCK_SIZE);
        slots.resize_with(DIRBLOCK_SIZE, || None);
        Self { slots }
    }

    /// Current table size.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied entries.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, epid: EpId) -> Option<u16> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.epid == epid))
            .map(|i| i as u16)
    }

    pub fn get(&self, idx: u16) -> Option<&PeerSlot> {
        self.slots.get(idx as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, idx: u16) -> Option<&mut PeerSlot> {
        self.slots.get_mut(idx as usize)?.as_mut()
    }

    /// Find `epid` or give it the first free index.
    pub fn lookup_or_create(&mut self, epid: EpId) -> Result<u16, AmError> {
        if let Some(idx) = self.find(epid) {
            return Ok(idx);
        }
        let idx = match self.slots.iter().position(|s| s.is_none()) {
            Some(idx) => idx,
            None => {
                let old = self.slots.len();
                let new = old * 2;
                if new > NO_SHMIDX as usize {
                    return Err(AmError::ResourceExhausted);
                }
                self.slots.resize_with(new, || None);
                tracing::debug!(from = old, to = new, "grew peer directory");
                old
            }
        };
        self.slots[idx] = Some(PeerSlot::new(epid));
        Ok(idx as u16)
    }

    pub fn remove(&mut self, idx: u16) -> Option<PeerSlot> {
        let slot = self.slots.get_mut(idx as usize)?.take();
        if let Some(slot) = &slot {
            tracing::debug!(shmidx = idx, epid = %slot.epid, "removed peer");
        }
        slot
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &PeerSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i as u16, s)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u16, &mut PeerSlot)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|s| (i as u16, s)))
    }

    /// Map the segment of `epid` and return its index.
    ///
    /// An already mapped peer keeps its index unless `force_remap` is set, in
    /// which case the old entry is dropped first.
    pub fn map_remote(
        &mut self,
        prefix: &str,
        epid: EpId,
        force_remap: bool,
        init_wait: Duration,
    ) -> Result<u16, AmError> {
        if let Some(idx) = self.find(epid) {
            if force_remap {
                self.remove(idx);
            } else if self.get(idx).is_some_and(PeerSlot::is_mapped) {
                return Ok(idx);
            }
        }

        let segment = RemoteSegment::map(prefix, epid, init_wait)?;
        let idx = self.lookup_or_create(epid)?;
        if let Some(slot) = self.get_mut(idx) {
            if let Err(e) = slot.install(segment) {
                self.remove(idx);
                return Err(e);
            }
        }
        tracing::debug!(shmidx = idx, epid = %epid, "mapped peer");
        Ok(idx)
    }

    /// Recompute the queue directory of a mapped peer.
    ///
    /// A non-zero `expected_size` that disagrees with the layout is fatal.
    pub fn update_after_remap(&mut self, idx: u16, expected_size: usize) -> Result<(), AmError> {
        let slot = self
            .get_mut(idx)
            .ok_or(AmError::InvalidArgument("no such peer"))?;
        let segment = slot
            .segment
            .as_ref()
            .ok_or(AmError::SegmentFault("peer is not mapped"))?;
        let qsizes = segment.info().qsizes;
        let dir = crate::layout::QueueDirectory::calculate_checked(
            &qsizes,
            crate::segment::page_size(),
            expected_size,
        )
        .map_err(SegmentError::from)?;
        slot.queues = Some(segment.queues(&dir)?);
        slot.dir = Some(dir);
        Ok(())
    }

    /// Re-read a peer whose segment was republished by another process.
    pub fn epaddr_update(&mut self, idx: u16, wait: Duration) -> Result<(), AmError> {
        let slot = self
            .get_mut(idx)
            .ok_or(AmError::InvalidArgument("no such peer"))?;
        let segment = slot
            .segment
            .as_ref()
            .ok_or(AmError::SegmentFault("peer is not mapped"))?;
        segment.refresh(wait)?;
        let info = segment.info();
        let (pid, version, features) = (info.pid, info.version, info.features());
        let size = segment.size();
        tracing::debug!(shmidx = idx, old_pid = slot.pid, new_pid = pid, "peer segment republished");
        slot.pid = pid;
        slot.version = version;
        slot.features = features;
        slot.conn_pid = PID_UNKNOWN;
        self.update_after_remap(idx, size)
    }
}
