//! The transport context.
//!
//! One [`AmPtl`] owns the local segment, the peer directory, the deferred
//! queue and every piece of per-endpoint state. It is driven by a single
//! thread; packets only move when that thread calls [`AmPtl::poll`] or one of
//! the blocking connection helpers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use bytes::Bytes;
use shm_primitives::FifoCursor;

use crate::EpId;
use crate::config::{AmConfig, KassistMode};
use crate::deferred::{DeferredKind, DeferredQueue, DeferredSend, Replay};
use crate::directory::{IncomingState, OutgoingState, PeerDirectory};
use crate::error::AmError;
use crate::gpu::{MemhandleCache, NoDevice, SharedDevice};
use crate::kassist::{CrossMemoryAttach, KernelCopy};
use crate::layout::{QueueSizes, SegmentFeatures};
use crate::mq::{Completion, MatchedQueue};
use crate::packet::{Args, HandlerIdx, MAX_ARGS};
use crate::rendezvous::{PendingRecv, PendingRts, PendingSend};
use crate::segment::LocalSegment;
use crate::send::{send_long, try_send_short};
use crate::stats::AmStats;

/// Most user handlers one endpoint can register.
pub const MAX_USER_HANDLERS: usize = 64;

/// Argument words available to a user handler (one word carries the id).
pub const MAX_USER_ARGS: usize = MAX_ARGS - 1;

bitflags! {
    /// Per-send options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SendFlags: u32 {
        /// Always use rendezvous, whatever the length.
        const SYNC = 1 << 0;
        /// Send eagerly even above the rendezvous threshold.
        const INJECT = 1 << 1;
    }
}

/// Index of a registered user handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u16);

/// What a user handler learns about the packet it runs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmToken {
    pub source: EpId,
    pub is_reply: bool,
}

/// Reply a user handler asks to send back to the requester.
#[derive(Debug, Clone)]
pub struct AmReply {
    pub handler: HandlerId,
    pub args: Vec<u64>,
    pub payload: Bytes,
}

/// A user AM handler.
pub type AmHandler = Box<dyn FnMut(&AmToken, &[u64], &[u8]) -> Option<AmReply> + Send>;

/// Limits of the user AM interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmParameters {
    pub max_handlers: usize,
    pub max_nargs: usize,
    pub max_request_short: usize,
    pub max_reply_short: usize,
}

/// Where an inbound packet came from.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Inbound {
    /// Our index of the sender, as carried by the packet.
    pub shmidx: u16,
    pub is_reply: bool,
}

/// Shared-memory Active-Message endpoint.
pub struct AmPtl<M: MatchedQueue> {
    pub(crate) epid: EpId,
    pub(crate) config: AmConfig,
    pub(crate) kassist_mode: KassistMode,
    /// Sticky: set by the first failed kernel-assisted copy.
    pub(crate) kassist_disabled: bool,

    pub(crate) directory: PeerDirectory,
    pub(crate) local: LocalSegment,
    pub(crate) req_cursor: FifoCursor,
    pub(crate) rep_cursor: FifoCursor,
    pub(crate) deferred: DeferredQueue,

    pub(crate) phase: u32,
    pub(crate) connect_incoming: i32,
    pub(crate) connect_outgoing: i32,
    pub(crate) zero_polls: u32,

    pub(crate) mq: M,
    pub(crate) device: SharedDevice,
    pub(crate) kcopy: Box<dyn KernelCopy + Send>,
    pub(crate) memcache: MemhandleCache,
    pub(crate) handlers: Vec<AmHandler>,

    pub(crate) sends: HashMap<u64, PendingSend>,
    pub(crate) recvs: HashMap<u64, PendingRecv>,
    pub(crate) rts: HashMap<u64, PendingRts>,
    pub(crate) next_recv: u64,
    pub(crate) next_rts: u64,

    pub(crate) stats: AmStats,
}

impl<M: MatchedQueue> AmPtl<M> {
    /// Create a host-only endpoint using cross-memory attach when available.
    pub fn new(epid: EpId, config: AmConfig, mq: M) -> Result<Self, AmError> {
        Self::with_parts(
            epid,
            config,
            mq,
            Arc::new(NoDevice),
            Box::new(CrossMemoryAttach),
        )
    }

    /// Create an endpoint with explicit device and kernel-copy capabilities.
    pub fn with_parts(
        epid: EpId,
        config: AmConfig,
        mq: M,
        device: SharedDevice,
        kcopy: Box<dyn KernelCopy + Send>,
    ) -> Result<Self, AmError> {
        let kassist_mode = if config.kassist_mode != KassistMode::Off && !kcopy.available() {
            tracing::debug!(
                requested = config.kassist_mode.as_str(),
                "kernel-assisted copy unavailable, disabling"
            );
            KassistMode::Off
        } else {
            config.kassist_mode
        };
        let features = if kassist_mode == KassistMode::Off {
            SegmentFeatures::empty()
        } else {
            SegmentFeatures::HAVE_CMA
        };

        let qsizes = QueueSizes::new(
            config.short_q_depth,
            config.long_q_depth,
            config.long_elem_size,
        );
        let local = LocalSegment::create(
            &config.prefix,
            epid,
            qsizes,
            features,
            config.acquire_mode,
            device.clone(),
        )?;

        tracing::debug!(
            %epid,
            kassist = kassist_mode.as_str(),
            mtu = qsizes.long_mtu(),
            "endpoint ready"
        );

        Ok(Self {
            epid,
            kassist_mode,
            kassist_disabled: false,
            directory: PeerDirectory::new(),
            local,
            req_cursor: FifoCursor::new(),
            rep_cursor: FifoCursor::new(),
            deferred: DeferredQueue::new(),
            phase: 0,
            connect_incoming: 0,
            connect_outgoing: 0,
            zero_polls: 0,
            mq,
            device,
            kcopy,
            memcache: MemhandleCache::new(config.memcache_size),
            handlers: Vec::new(),
            sends: HashMap::new(),
            recvs: HashMap::new(),
            rts: HashMap::new(),
            next_recv: 1,
            next_rts: 1,
            stats: AmStats::new(),
            config,
        })
    }

    pub fn epid(&self) -> EpId {
        self.epid
    }

    pub fn config(&self) -> &AmConfig {
        &self.config
    }

    pub fn stats(&self) -> AmStats {
        self.stats
    }

    /// Effective kernel-assist mode after probing.
    pub fn kassist_mode(&self) -> KassistMode {
        self.kassist_mode
    }

    pub fn kassist_disabled(&self) -> bool {
        self.kassist_disabled
    }

    pub fn mq(&self) -> &M {
        &self.mq
    }

    pub fn mq_mut(&mut self) -> &mut M {
        &mut self.mq
    }

    /// Payload bytes one packet into our segment can carry.
    pub fn local_mtu(&self) -> usize {
        self.local.qsizes().long_mtu() as usize
    }

    pub fn am_parameters(&self) -> AmParameters {
        AmParameters {
            max_handlers: MAX_USER_HANDLERS,
            max_nargs: MAX_USER_ARGS,
            max_request_short: self.local_mtu(),
            max_reply_short: self.local_mtu(),
        }
    }

    /// True once our connection to `peer` is established.
    pub fn is_connected(&self, peer: EpId) -> bool {
        self.directory
            .find(peer)
            .and_then(|idx| self.directory.get(idx))
            .is_some_and(|slot| slot.outgoing == OutgoingState::Established)
    }

    /// Both directions of our relationship with `peer`, if we know it.
    pub fn peer_state(&self, peer: EpId) -> Option<(OutgoingState, IncomingState)> {
        let slot = self.directory.get(self.directory.find(peer)?)?;
        Some((slot.outgoing, slot.incoming))
    }

    /// Number of peers in the directory.
    pub fn peer_count(&self) -> usize {
        self.directory.len()
    }

    /// Peers connected to us and peers we are connected to.
    pub fn connect_counts(&self) -> (i32, i32) {
        (self.connect_incoming, self.connect_outgoing)
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Register a user handler.
    pub fn register_handler(&mut self, handler: AmHandler) -> Result<HandlerId, AmError> {
        if self.handlers.len() >= MAX_USER_HANDLERS {
            return Err(AmError::ResourceExhausted);
        }
        self.handlers.push(handler);
        Ok(HandlerId((self.handlers.len() - 1) as u16))
    }

    /// Run user handler `id` on `peer` with `args` and a short payload.
    pub fn am_short_request(
        &mut self,
        peer: EpId,
        id: HandlerId,
        args: &[u64],
        payload: &[u8],
    ) -> Result<(), AmError> {
        let idx = self.connected_peer(peer)?;
        let send = self.user_am(idx, false, id, args, Bytes::copy_from_slice(payload))?;
        self.stats.tx_num += 1;
        self.send_or_defer(send);
        Ok(())
    }

    /// Build a user AM packet, checking it against the destination MTU.
    pub(crate) fn user_am(
        &self,
        shmidx: u16,
        is_reply: bool,
        id: HandlerId,
        args: &[u64],
        payload: Bytes,
    ) -> Result<DeferredSend, AmError> {
        if args.len() > MAX_USER_ARGS {
            return Err(AmError::InvalidArgument("too many handler arguments"));
        }
        let (epid, mtu) = self
            .directory
            .get(shmidx)
            .and_then(|slot| Some((slot.epid, slot.queues()?.channel(is_reply).mtu())))
            .ok_or(AmError::SegmentFault("peer is not mapped"))?;
        if payload.len() > mtu {
            return Err(AmError::InvalidArgument("payload exceeds the AM MTU"));
        }
        let mut words = Vec::with_capacity(args.len() + 1);
        words.push(id.0 as u64);
        words.extend_from_slice(args);
        Ok(DeferredSend {
            shmidx,
            epid,
            is_reply,
            handler: HandlerIdx::Am,
            args: Args::from_slice(&words)?,
            payload,
            kind: DeferredKind::Short,
        })
    }

    /// Directory index of `peer` if our side of the connection is up.
    pub(crate) fn connected_peer(&self, peer: EpId) -> Result<u16, AmError> {
        self.directory
            .find(peer)
            .filter(|idx| {
                self.directory.get(*idx).is_some_and(|slot| {
                    slot.outgoing == OutgoingState::Established && slot.is_mapped()
                })
            })
            .ok_or(AmError::Unreachable(peer))
    }

    /// Endpoint behind an inbound `shmidx`.
    pub(crate) fn peer_epid(&self, shmidx: u16) -> Result<EpId, AmError> {
        self.directory
            .get(shmidx)
            .map(|slot| slot.epid)
            .ok_or_else(|| AmError::protocol(format!("packet from unknown shmidx {}", shmidx)))
    }

    /// Send now, or queue behind earlier deferred sends.
    ///
    /// Returns true if the send left (or was dropped because its peer is
    /// gone) without touching the deferred queue.
    pub(crate) fn send_or_defer(&mut self, send: DeferredSend) -> bool {
        if !self.deferred.is_empty() {
            self.deferred.add(send);
            return false;
        }
        match self.replay(send) {
            Replay::Done => true,
            Replay::Stalled(rest) => {
                self.deferred.add(rest);
                false
            }
        }
    }

    /// Try to put `send` into its peer's queues.
    pub(crate) fn replay(&mut self, send: DeferredSend) -> Replay {
        let Some(slot) = self.directory.get(send.shmidx) else {
            tracing::debug!(shmidx = send.shmidx, "dropping send to removed peer");
            return Replay::Done;
        };
        if slot.epid != send.epid {
            tracing::trace!(
                shmidx = send.shmidx,
                epid = %send.epid,
                now = %slot.epid,
                "dropping send to a peer whose index was reused"
            );
            return Replay::Done;
        }
        let Some(queues) = slot.queues() else {
            tracing::debug!(shmidx = send.shmidx, epid = %slot.epid, "dropping send to unmapped peer");
            return Replay::Done;
        };
        let channel = *queues.channel(send.is_reply);
        let shmidx = slot.return_shmidx;

        match send.kind {
            DeferredKind::Short => {
                if !try_send_short(&channel, shmidx, send.handler, &send.args, &send.payload) {
                    return Replay::Stalled(send);
                }
                self.stats.tx_shm_num += 1;
                self.stats.tx_shm_bytes += send.payload.len() as u64;
                Replay::Done
            }
            DeferredKind::Long { dest, dest_off } => {
                let (sent, done) =
                    send_long(&channel, shmidx, send.handler, dest, dest_off, &send.payload);
                self.stats.tx_shm_num += if send.payload.is_empty() {
                    done as u64
                } else {
                    sent.div_ceil(channel.mtu()) as u64
                };
                self.stats.tx_shm_bytes += sent as u64;
                if done {
                    return Replay::Done;
                }
                Replay::Stalled(DeferredSend {
                    payload: send.payload.slice(sent..),
                    kind: DeferredKind::Long {
                        dest,
                        dest_off: dest_off + sent as u32,
                    },
                    ..send
                })
            }
        }
    }

    /// Replay deferred sends. Returns how many completed.
    pub(crate) fn drain_deferred(&mut self) -> usize {
        if self.deferred.is_empty() {
            return 0;
        }
        let mut pending = std::mem::take(&mut self.deferred);
        let done = pending.drain(|send| self.replay(send));
        pending.append(&mut self.deferred);
        self.deferred = pending;
        done
    }

    /// Remove peer `idx` from the directory and fail every send and receive
    /// still waiting on it.
    ///
    /// Unmatched announcements from the peer stay; matching one later fails
    /// the receive.
    pub(crate) fn forget_peer(&mut self, idx: u16) {
        let Some(epid) = self.directory.remove(idx).map(|slot| slot.epid) else {
            return;
        };
        self.memcache.purge_peer(&*self.device, epid);

        let mut failed = Vec::new();
        self.sends.retain(|_, send| {
            let keep = send.peer != epid;
            if !keep {
                failed.push(send.req);
            }
            keep
        });
        self.recvs.retain(|_, recv| {
            let keep = recv.src != epid;
            if !keep {
                failed.push(recv.req);
            }
            keep
        });
        if !failed.is_empty() {
            tracing::debug!(%epid, requests = failed.len(), "failing transfers of removed peer");
        }
        for req in failed {
            self.mq.complete_request(req, Completion::Failed);
        }
    }

    /// Disconnect from every established peer, wait for peers connected to
    /// us to go away, then withdraw our segment.
    pub fn fini(&mut self, timeout: Duration) -> Result<(), AmError> {
        let deadline = std::time::Instant::now() + timeout;
        let peers: Vec<EpId> = self
            .directory
            .iter()
            .filter(|(_, slot)| slot.outgoing == OutgoingState::Established)
            .map(|(_, slot)| slot.epid)
            .collect();
        if !peers.is_empty() {
            for (peer, result) in peers.iter().zip(self.disconnect(&peers, timeout)?) {
                if let Err(e) = result {
                    tracing::debug!(%peer, error = %e, "disconnect during fini failed");
                }
            }
        }
        while (self.connect_incoming > 0 || self.connect_outgoing > 0)
            && std::time::Instant::now() < deadline
        {
            self.progress(false)?;
        }
        if self.connect_incoming > 0 {
            tracing::debug!(
                remaining = self.connect_incoming,
                "peers still connected at fini"
            );
        }
        self.release_resources();
        Ok(())
    }

    fn release_resources(&mut self) {
        self.memcache.clear(&*self.device);
        self.directory = PeerDirectory::new();
        self.local.detach(self.config.detach_wait);
    }
}

impl<M: MatchedQueue> Drop for AmPtl<M> {
    fn drop(&mut self) {
        if self.local.is_attached() {
            self.release_resources();
        }
    }
}
