//! Matched-queue sends: eager messages and the rendezvous protocol.
//!
//! Eager messages travel through the peer's request queue in MTU-sized
//! chunks. Larger (or SYNC) messages announce themselves with an RTS; once
//! the receiver has a buffer it tries, in order, to import a device IPC
//! handle, to pull with kernel-assisted GET, or else asks the sender (CTS) to
//! push with kernel-assisted PUT or with LONG packets.

use bytes::Bytes;

use crate::EpId;
use crate::config::KassistMode;
use crate::deferred::{DeferredKind, DeferredSend};
use crate::error::AmError;
use crate::gpu::CacheLookup;
use crate::layout::SegmentFeatures;
use crate::mq::{Completion, MatchedQueue, RecvTarget, RequestId, RtsToken, Tag};
use crate::packet::{Args, HandlerIdx, fits_inline};
use crate::ptl::{AmPtl, Inbound, SendFlags};

const MQ_TINY: u64 = 1;
const MQ_SHORT: u64 = 2;
const MQ_EAGER: u64 = 3;
const MQ_LONGRTS: u64 = 4;

/// Send whose buffer the receiver has not taken yet.
#[derive(Debug)]
pub(crate) struct PendingSend {
    pub shmidx: u16,
    pub peer: EpId,
    pub req: RequestId,
    pub buf: Bytes,
}

/// Receive buffer being filled by LONG packets.
#[derive(Debug)]
pub(crate) struct PendingRecv {
    pub src: EpId,
    pub req: RequestId,
    pub buf: Vec<u8>,
}

/// Announcement waiting for the matched queue to post a receive.
#[derive(Debug)]
pub(crate) struct PendingRts {
    pub shmidx: u16,
    pub src: EpId,
    pub len: usize,
    pub sreq: u64,
    pub addr: u64,
    pub ipc_offset: u32,
    pub handle: Option<Vec<u8>>,
}

impl<M: MatchedQueue> AmPtl<M> {
    /// Send `data` to `peer` under `tag`.
    ///
    /// `req` is completed with [`Completion::Sent`] through the matched queue
    /// once `data` may be released: immediately for eager sends, after the
    /// receiver took the data for rendezvous.
    pub fn mq_isend(
        &mut self,
        peer: EpId,
        flags: SendFlags,
        tag: Tag,
        data: Bytes,
        req: RequestId,
    ) -> Result<(), AmError> {
        let idx = self.connected_peer(peer)?;
        if self.sends.contains_key(&req.0) {
            return Err(AmError::InvalidArgument("send request already in flight"));
        }
        if data.len() > u32::MAX as usize {
            return Err(AmError::InvalidArgument("message too long"));
        }
        self.stats.tx_num += 1;

        let rndv = flags.contains(SendFlags::SYNC)
            || (data.len() > self.config.rndv_thresh as usize
                && !flags.contains(SendFlags::INJECT));
        if rndv {
            self.send_rts(idx, peer, tag, data, req)
        } else {
            self.send_eager(idx, peer, tag, data)?;
            self.mq.complete_request(req, Completion::Sent);
            Ok(())
        }
    }

    fn send_eager(&mut self, idx: u16, peer: EpId, tag: Tag, data: Bytes) -> Result<(), AmError> {
        let mtu = self
            .directory
            .get(idx)
            .and_then(|slot| slot.queues())
            .map(|q| q.req.mtu())
            .ok_or(AmError::SegmentFault("peer is not mapped"))?;
        let len = data.len();
        let kind = if fits_inline(3, len) {
            MQ_TINY
        } else if len <= mtu {
            MQ_SHORT
        } else {
            MQ_EAGER
        };
        let len_word = (len as u64) << 32;
        let tail = tag.0[2] as u64;

        let first = data.slice(..len.min(mtu));
        let mut off = first.len();
        self.send_or_defer(mq_packet(
            idx,
            peer,
            HandlerIdx::Mq,
            Args::from_slice(&[kind | len_word, tag.head_word(), tail])?,
            first,
        ));
        while off < len {
            let chunk = data.slice(off..(off + mtu).min(len));
            let args = Args::from_slice(&[MQ_EAGER | len_word, tag.head_word(), tail | (off as u64) << 32])?;
            off += chunk.len();
            self.send_or_defer(mq_packet(idx, peer, HandlerIdx::MqData, args, chunk));
        }

        self.stats.tx_eager_num += 1;
        self.stats.tx_eager_bytes += len as u64;
        tracing::trace!(shmidx = idx, len, %tag, "eager send");
        Ok(())
    }

    fn send_rts(
        &mut self,
        idx: u16,
        peer: EpId,
        tag: Tag,
        data: Bytes,
        req: RequestId,
    ) -> Result<(), AmError> {
        let len = data.len();
        let peer_gpu = self.directory.get(idx).map(|slot| slot.gpu_id).unwrap_or(0);

        let mut ipc = None;
        let buf = if self.device.is_device(data.as_ptr(), len) {
            ipc = if self.device.peer_to_peer(peer_gpu) {
                self.device.export_handle(data.as_ptr(), len)
            } else {
                None
            };
            if ipc.is_some() {
                data
            } else {
                let mut host = Vec::new();
                host.try_reserve_exact(len).map_err(|_| AmError::NoMemory)?;
                host.resize(len, 0);
                if !self.device.copy_to_host(data.as_ptr(), &mut host) {
                    return Err(AmError::InvalidArgument("device buffer could not be staged"));
                }
                tracing::trace!(len, "staged device buffer through host memory");
                Bytes::from(host)
            }
        } else {
            data
        };

        let (handle, ipc_offset) = ipc.unwrap_or_default();
        let args = Args::from_slice(&[
            MQ_LONGRTS | (len as u64) << 32,
            tag.head_word(),
            tag.0[2] as u64 | (ipc_offset as u64) << 32,
            req.0,
            buf.as_ptr() as u64,
        ])?;
        self.sends.insert(
            req.0,
            PendingSend {
                shmidx: idx,
                peer,
                req,
                buf,
            },
        );
        self.send_or_defer(mq_packet(idx, peer, HandlerIdx::Mq, args, Bytes::from(handle)));

        self.stats.tx_rndv_num += 1;
        tracing::trace!(shmidx = idx, len, %tag, "sent rts");
        Ok(())
    }

    pub(crate) fn handle_mq(&mut self, inb: Inbound, args: &[u64], payload: &[u8]) -> Result<(), AmError> {
        let src = self.peer_epid(inb.shmidx)?;
        let &[a0, a1, a2, ..] = args else {
            return Err(AmError::protocol("mq packet with too few arguments"));
        };
        let kind = a0 & 0xffff_ffff;
        let len = (a0 >> 32) as usize;
        let tag = Tag::from_words(a1, a2 as u32);
        match kind {
            MQ_TINY | MQ_SHORT | MQ_EAGER => {
                self.mq.deliver_envelope(src, tag, len, payload);
                Ok(())
            }
            MQ_LONGRTS => {
                let &[_, _, _, sreq, addr, ..] = args else {
                    return Err(AmError::protocol("rts with too few arguments"));
                };
                let id = self.next_rts;
                self.next_rts += 1;
                self.rts.insert(
                    id,
                    PendingRts {
                        shmidx: inb.shmidx,
                        src,
                        len,
                        sreq,
                        addr,
                        ipc_offset: (a2 >> 32) as u32,
                        handle: (!payload.is_empty()).then(|| payload.to_vec()),
                    },
                );
                if let Some(target) = self.mq.deliver_rts(src, tag, len, RtsToken(id)) {
                    self.rts_match(RtsToken(id), target)?;
                }
                Ok(())
            }
            other => Err(AmError::protocol(format!("unknown mq packet kind {}", other))),
        }
    }

    pub(crate) fn handle_mq_data(
        &mut self,
        inb: Inbound,
        args: &[u64],
        payload: &[u8],
    ) -> Result<(), AmError> {
        let src = self.peer_epid(inb.shmidx)?;
        let &[_, a1, a2, ..] = args else {
            return Err(AmError::protocol("mq data packet with too few arguments"));
        };
        let tag = Tag::from_words(a1, a2 as u32);
        self.mq.deliver_data(src, tag, (a2 >> 32) as usize, payload);
        Ok(())
    }

    /// Resume a rendezvous once the matched queue posted a receive for it.
    ///
    /// At most `target.len` bytes are received. If the sender has gone away
    /// meanwhile, `target.req` completes with [`Completion::Failed`].
    pub fn rts_match(&mut self, token: RtsToken, target: RecvTarget) -> Result<(), AmError> {
        let rts = self
            .rts
            .remove(&token.0)
            .ok_or(AmError::InvalidArgument("unknown rendezvous token"))?;
        let Some((pid, features)) = self
            .directory
            .get(rts.shmidx)
            .filter(|slot| slot.epid == rts.src && slot.is_mapped())
            .map(|slot| (slot.pid, slot.features))
        else {
            tracing::debug!(src = %rts.src, req = target.req.0, "rendezvous sender is gone");
            self.mq.complete_request(target.req, Completion::Failed);
            return Ok(());
        };

        let n = rts.len.min(target.len);
        let mut buf = Vec::new();
        buf.try_reserve_exact(n).map_err(|_| AmError::NoMemory)?;
        buf.resize(n, 0);

        let mode = self.effective_kassist().to_wire() as u64;
        if self.pull(&rts, pid, features, &mut buf) {
            let args = Args::from_slice(&[0, 0, mode | 1 << 32, rts.sreq, n as u64])?;
            self.send_or_defer(mq_packet(rts.shmidx, rts.src, HandlerIdx::RtsMatch, args, Bytes::new()));
            self.stats.rx_rndv_pull_num += 1;
            tracing::trace!(len = n, src = %rts.src, "pulled rendezvous data");
            self.mq.complete_request(target.req, Completion::Received(buf));
            return Ok(());
        }

        let dest = self.next_recv;
        self.next_recv += 1;
        let addr = buf.as_mut_ptr() as u64;
        self.recvs.insert(
            dest,
            PendingRecv {
                src: rts.src,
                req: target.req,
                buf,
            },
        );
        let args = Args::from_slice(&[dest, addr, mode, rts.sreq, n as u64])?;
        self.send_or_defer(mq_packet(rts.shmidx, rts.src, HandlerIdx::RtsMatch, args, Bytes::new()));
        tracing::trace!(dest, len = n, src = %rts.src, "sent cts");
        Ok(())
    }

    /// Try to copy the announced data ourselves.
    fn pull(&mut self, rts: &PendingRts, pid: u32, features: SegmentFeatures, buf: &mut [u8]) -> bool {
        if let Some(handle) = &rts.handle {
            if self.pull_ipc(rts, pid, handle, buf) {
                return true;
            }
        }
        if self.kassist_mode == KassistMode::CmaGet
            && features.contains(SegmentFeatures::HAVE_CMA)
            && !self.kassist_disabled
        {
            match self.kcopy.read_remote(pid, rts.addr, buf) {
                Ok(got) if got == buf.len() => return true,
                Ok(got) => {
                    tracing::warn!(src = %rts.src, got, want = buf.len(), "short kernel-assisted read, falling back")
                }
                Err(e) => {
                    tracing::warn!(src = %rts.src, error = %e, "kernel-assisted read failed, falling back")
                }
            }
            self.disable_kassist();
        }
        false
    }

    fn pull_ipc(&mut self, rts: &PendingRts, pid: u32, handle: &[u8], buf: &mut [u8]) -> bool {
        if !self.config.memcache_enabled {
            let Some(id) = self.device.import_handle(pid, handle) else {
                return false;
            };
            let ok = self.device.copy_from_import(id, rts.ipc_offset, buf);
            self.device.release_handle(id);
            return ok;
        }
        let Some(lookup) = self
            .memcache
            .get_or_import(&*self.device, rts.src, pid, handle)
        else {
            tracing::debug!(src = %rts.src, "could not import ipc handle");
            return false;
        };
        match lookup {
            CacheLookup::Hit(_) => self.stats.memcache_hits += 1,
            CacheLookup::Miss(_) => self.stats.memcache_misses += 1,
        }
        self.device.copy_from_import(lookup.id(), rts.ipc_offset, buf)
    }

    /// Mode we can still use: the configured one until a copy fails.
    fn effective_kassist(&self) -> KassistMode {
        if self.kassist_disabled {
            KassistMode::Off
        } else {
            self.kassist_mode
        }
    }

    fn disable_kassist(&mut self) {
        if !self.kassist_disabled {
            tracing::warn!(mode = self.kassist_mode.as_str(), "disabling kernel-assisted copies");
        }
        self.kassist_disabled = true;
        self.stats.kassist_fallbacks += 1;
    }

    pub(crate) fn handle_cts(&mut self, inb: Inbound, args: &[u64]) -> Result<(), AmError> {
        let &[dest, addr, a2, sreq, rlen, ..] = args else {
            return Err(AmError::protocol("cts with too few arguments"));
        };
        let pulled = a2 >> 32 != 0;
        let receiver_mode = KassistMode::from_wire(a2 as u32);
        let Some(send) = self.sends.remove(&sreq) else {
            return Err(AmError::protocol(format!("cts for unknown send {}", sreq)));
        };
        if send.shmidx != inb.shmidx {
            tracing::debug!(expected = send.shmidx, got = inb.shmidx, "cts arrived from another index");
        }
        let n = send.buf.len().min(rlen as usize);

        if !pulled && !self.push(&send, receiver_mode, dest, addr, n)? {
            self.send_or_defer(DeferredSend {
                shmidx: send.shmidx,
                epid: send.peer,
                is_reply: false,
                handler: HandlerIdx::RtsDone,
                args: Args::new(),
                payload: send.buf.slice(..n),
                kind: DeferredKind::Long { dest, dest_off: 0 },
            });
        }

        self.stats.tx_rndv_bytes += n as u64;
        self.mq.complete_request(send.req, Completion::Sent);
        Ok(())
    }

    /// Push with kernel-assisted PUT if both sides run in PUT mode.
    fn push(
        &mut self,
        send: &PendingSend,
        receiver_mode: KassistMode,
        dest: u64,
        addr: u64,
        n: usize,
    ) -> Result<bool, AmError> {
        let Some((pid, features)) = self
            .directory
            .get(send.shmidx)
            .map(|slot| (slot.pid, slot.features))
        else {
            return Ok(false);
        };
        if self.effective_kassist() != KassistMode::CmaPut
            || receiver_mode != KassistMode::CmaPut
            || !features.contains(SegmentFeatures::HAVE_CMA)
        {
            return Ok(false);
        }
        match self.kcopy.write_remote(pid, addr, &send.buf[..n]) {
            Ok(put) if put == n => {
                let args = Args::from_slice(&[dest, n as u64])?;
                self.send_or_defer(mq_packet(send.shmidx, send.peer, HandlerIdx::RtsDone, args, Bytes::new()));
                Ok(true)
            }
            Ok(put) => {
                tracing::warn!(put, want = n, "short kernel-assisted write, falling back");
                self.disable_kassist();
                Ok(false)
            }
            Err(e) => {
                tracing::warn!(error = %e, "kernel-assisted write failed, falling back");
                self.disable_kassist();
                Ok(false)
            }
        }
    }

    pub(crate) fn handle_rts_done(&mut self, args: &[u64]) -> Result<(), AmError> {
        let &[dest, len, ..] = args else {
            return Err(AmError::protocol("rts done with too few arguments"));
        };
        let Some(mut recv) = self.recvs.remove(&dest) else {
            return Err(AmError::protocol(format!("rts done for unknown receive {}", dest)));
        };
        recv.buf.truncate(len as usize);
        tracing::trace!(dest, len, "rendezvous receive complete");
        self.mq.complete_request(recv.req, Completion::Received(recv.buf));
        Ok(())
    }
}

fn mq_packet(shmidx: u16, epid: EpId, handler: HandlerIdx, args: Args, payload: Bytes) -> DeferredSend {
    DeferredSend {
        shmidx,
        epid,
        is_reply: false,
        handler,
        args,
        payload,
        kind: DeferredKind::Short,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::NoDevice;
    use crate::kassist::KernelCopy;
    use crate::testing::{CompletionLog, NullMq, test_config};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mapped_pair(a_id: EpId, b_id: EpId) -> (AmPtl<CompletionLog>, AmPtl<NullMq>, u16) {
        let config = test_config();
        let mut a = AmPtl::new(a_id, config.clone(), CompletionLog::default()).unwrap();
        let b = AmPtl::new(b_id, config.clone(), NullMq).unwrap();
        let idx = a
            .directory
            .map_remote(&config.prefix, b_id, false, config.init_wait)
            .unwrap();
        (a, b, idx)
    }

    #[test]
    fn test_unknown_rts_token() {
        let mut ptl = AmPtl::new(EpId::new(7, 1), test_config(), NullMq).unwrap();
        let err = ptl
            .rts_match(
                RtsToken(99),
                RecvTarget {
                    req: RequestId(1),
                    len: 10,
                },
            )
            .unwrap_err();
        assert!(matches!(err, AmError::InvalidArgument(_)));
    }

    #[test]
    fn test_rts_done_for_unknown_receive_is_fatal() {
        let mut ptl = AmPtl::new(EpId::new(7, 2), test_config(), NullMq).unwrap();
        assert!(ptl.handle_rts_done(&[5, 10]).unwrap_err().is_fatal());
    }

    #[test]
    fn test_send_requires_connection() {
        let mut ptl = AmPtl::new(EpId::new(7, 3), test_config(), NullMq).unwrap();
        let err = ptl
            .mq_isend(
                EpId::new(7, 4),
                SendFlags::empty(),
                Tag::default(),
                Bytes::from_static(b"hello"),
                RequestId(1),
            )
            .unwrap_err();
        assert!(matches!(err, AmError::Unreachable(_)));
        assert_eq!(ptl.stats().tx_num, 0);
    }

    #[test]
    fn test_rts_match_after_sender_left_fails_receive() {
        let b_id = EpId::new(7, 6);
        let (mut a, _b, idx) = mapped_pair(EpId::new(7, 5), b_id);
        a.rts.insert(
            1,
            PendingRts {
                shmidx: idx,
                src: b_id,
                len: 100,
                sreq: 3,
                addr: 0,
                ipc_offset: 0,
                handle: None,
            },
        );
        a.forget_peer(idx);

        a.rts_match(
            RtsToken(1),
            RecvTarget {
                req: RequestId(9),
                len: 100,
            },
        )
        .unwrap();
        assert_eq!(a.mq().completions, vec![(RequestId(9), Completion::Failed)]);
        assert!(a.rts.is_empty());
        assert_eq!(a.deferred_len(), 0);
    }

    #[test]
    fn test_forget_peer_fails_its_transfers() {
        let b_id = EpId::new(7, 8);
        let (mut a, _b, idx) = mapped_pair(EpId::new(7, 7), b_id);
        let other = EpId::new(7, 99);
        a.sends.insert(
            5,
            PendingSend {
                shmidx: idx,
                peer: b_id,
                req: RequestId(5),
                buf: Bytes::from_static(b"to b"),
            },
        );
        a.sends.insert(
            6,
            PendingSend {
                shmidx: idx + 1,
                peer: other,
                req: RequestId(6),
                buf: Bytes::from_static(b"elsewhere"),
            },
        );
        a.recvs.insert(
            1,
            PendingRecv {
                src: b_id,
                req: RequestId(7),
                buf: vec![0; 16],
            },
        );

        a.forget_peer(idx);
        assert!(a.directory.get(idx).is_none());
        assert_eq!(
            a.mq().completions,
            vec![
                (RequestId(5), Completion::Failed),
                (RequestId(7), Completion::Failed)
            ]
        );
        assert!(a.sends.contains_key(&6));
        assert!(a.recvs.is_empty());
    }

    struct CountingCopy(Arc<AtomicUsize>);

    impl KernelCopy for CountingCopy {
        fn read_remote(&self, _: u32, _: u64, dst: &mut [u8]) -> std::io::Result<usize> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(dst.len())
        }

        fn write_remote(&self, _: u32, _: u64, src: &[u8]) -> std::io::Result<usize> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(src.len())
        }

        fn available(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_push_needs_put_mode_on_both_sides() {
        let mut config = test_config();
        config.kassist_mode = KassistMode::CmaPut;
        let calls = Arc::new(AtomicUsize::new(0));
        let (a_id, b_id) = (EpId::new(7, 10), EpId::new(7, 11));
        let mut a = AmPtl::with_parts(
            a_id,
            config.clone(),
            CompletionLog::default(),
            Arc::new(NoDevice),
            Box::new(CountingCopy(calls.clone())),
        )
        .unwrap();
        let _b = AmPtl::with_parts(
            b_id,
            config.clone(),
            NullMq,
            Arc::new(NoDevice),
            Box::new(CountingCopy(Arc::new(AtomicUsize::new(0)))),
        )
        .unwrap();
        let idx = a
            .directory
            .map_remote(&config.prefix, b_id, false, config.init_wait)
            .unwrap();
        let inb = Inbound {
            shmidx: idx,
            is_reply: false,
        };

        let cases = [
            (KassistMode::CmaGet, 0),
            (KassistMode::Off, 0),
            (KassistMode::CmaPut, 1),
        ];
        for (sreq, (receiver_mode, pushes)) in (1u64..).zip(cases) {
            a.sends.insert(
                sreq,
                PendingSend {
                    shmidx: idx,
                    peer: b_id,
                    req: RequestId(sreq),
                    buf: Bytes::from(vec![5u8; 64]),
                },
            );
            let cts = [sreq, 0x1000, receiver_mode.to_wire() as u64, sreq, 64];
            a.handle_cts(inb, &cts).unwrap();
            assert_eq!(calls.load(Ordering::Relaxed), pushes, "receiver in {:?}", receiver_mode);
        }
        assert_eq!(a.mq().completions.len(), 3);
        assert_eq!(a.stats().kassist_fallbacks, 0);
        assert_eq!(a.deferred_len(), 0);
    }
}

