//! Inbound progress: drain our queues and run handlers.

use crate::error::AmError;
use crate::mq::MatchedQueue;
use crate::packet::{BulkHeader, HandlerIdx, Packet, ShortPacket, ShortView, gather_args};
use crate::ptl::{AmPtl, AmToken, Inbound};
use crate::queue::Channel;

/// Consecutive empty progress calls before yielding the CPU.
const ZERO_POLLS_BEFORE_YIELD: u32 = 64;

impl<M: MatchedQueue> AmPtl<M> {
    /// Handle everything waiting in our queues and retry deferred sends.
    ///
    /// Returns the number of packets and deferred sends completed. An
    /// [`AmError::InternalProtocol`] error means a peer corrupted our queues;
    /// the offending packet has been consumed.
    pub fn poll(&mut self) -> Result<usize, AmError> {
        self.progress(false)
    }

    pub(crate) fn progress(&mut self, reply_only: bool) -> Result<usize, AmError> {
        if !self.local.is_attached() {
            return Ok(0);
        }
        let mut n = self.process_queue(true)?;
        if !reply_only {
            n += self.drain_deferred();
            n += self.process_queue(false)?;
        }

        if n == 0 {
            self.zero_polls += 1;
            if self.zero_polls >= ZERO_POLLS_BEFORE_YIELD {
                self.zero_polls = 0;
                std::thread::yield_now();
            }
        } else {
            self.zero_polls = 0;
        }
        Ok(n)
    }

    fn process_queue(&mut self, is_reply: bool) -> Result<usize, AmError> {
        let channel = *self.local.queues().channel(is_reply);
        let mut cursor = if is_reply {
            self.rep_cursor
        } else {
            self.req_cursor
        };

        let mut n = 0;
        let mut result = Ok(());
        while let Some(idx) = cursor.peek(&channel.short) {
            // SAFETY: the slot is published and stays ours until the cursor moves.
            let step = unsafe { ShortPacket::read(channel.short_packet(idx)) }
                .and_then(|view| self.process_packet(&channel, view, is_reply));
            cursor.advance(&channel.short);
            n += 1;
            if let Err(e) = step {
                result = Err(e);
                break;
            }
        }

        if is_reply {
            self.rep_cursor = cursor;
        } else {
            self.req_cursor = cursor;
        }
        result.map(|()| n)
    }

    fn process_packet(
        &mut self,
        channel: &Channel,
        view: ShortView,
        is_reply: bool,
    ) -> Result<(), AmError> {
        let bulkidx = match view.packet {
            Packet::ShortInline { .. } => None,
            Packet::Short { bulkidx } | Packet::Long { bulkidx } | Packet::LongEnd { bulkidx } => {
                if bulkidx >= channel.bulk.capacity() {
                    return Err(AmError::protocol(format!(
                        "bulk index {} out of range",
                        bulkidx
                    )));
                }
                Some(bulkidx)
            }
        };
        let handler = match HandlerIdx::try_from(view.handler) {
            Ok(handler) => handler,
            Err(e) => {
                if let Some(bulkidx) = bulkidx {
                    channel.bulk.release(bulkidx);
                }
                return Err(e);
            }
        };
        let inb = Inbound {
            shmidx: view.shmidx,
            is_reply,
        };
        tracing::trace!(shmidx = view.shmidx, ?handler, packet = ?view.packet, is_reply, "inbound packet");

        let Some(bulkidx) = bulkidx else {
            let args = gather_args(&view.args, None, view.nargs);
            return self.invoke(handler, inb, args.as_slice(), view.inline_payload());
        };
        // SAFETY: the sender published the bulk slot before the short packet.
        let bulk = unsafe { BulkHeader::read(channel.bulk_header(bulkidx)) };
        if bulk.idx != bulkidx || bulk.len as usize > channel.mtu() {
            channel.bulk.release(bulkidx);
            return Err(AmError::protocol(format!(
                "bulk slot {} is corrupt (idx {}, len {})",
                bulkidx, bulk.idx, bulk.len
            )));
        }
        // SAFETY: index and length checked above; the slot is ours until released.
        let payload = unsafe { channel.bulk_payload(bulkidx, bulk.len as usize) };

        let result = match view.packet {
            Packet::Short { .. } => {
                let args = gather_args(&view.args, Some(&bulk.args), view.nargs);
                self.invoke(handler, inb, args.as_slice(), payload)
            }
            _ => self.copy_long(bulk.dest, bulk.dest_off, payload),
        };
        channel.bulk.release(bulkidx);
        result?;

        if let Packet::LongEnd { .. } = view.packet {
            let end = bulk.dest_off as u64 + bulk.len as u64;
            self.invoke(handler, inb, &[bulk.dest, end], &[])?;
        }
        Ok(())
    }

    /// Place one chunk of a multi-packet transfer.
    fn copy_long(&mut self, dest: u64, dest_off: u32, payload: &[u8]) -> Result<(), AmError> {
        let recv = self
            .recvs
            .get_mut(&dest)
            .ok_or_else(|| AmError::protocol(format!("chunk for unknown receive {}", dest)))?;
        let start = dest_off as usize;
        let Some(dst) = recv.buf.get_mut(start..start + payload.len()) else {
            return Err(AmError::protocol(format!(
                "chunk at {}+{} overruns receive {}",
                start,
                payload.len(),
                dest
            )));
        };
        dst.copy_from_slice(payload);
        Ok(())
    }

    fn invoke(
        &mut self,
        handler: HandlerIdx,
        inb: Inbound,
        args: &[u64],
        payload: &[u8],
    ) -> Result<(), AmError> {
        match handler {
            HandlerIdx::Conn => self.handle_conn(inb, args),
            HandlerIdx::Mq => self.handle_mq(inb, args, payload),
            HandlerIdx::MqData => self.handle_mq_data(inb, args, payload),
            HandlerIdx::RtsMatch => self.handle_cts(inb, args),
            HandlerIdx::RtsDone => self.handle_rts_done(args),
            HandlerIdx::Am => self.handle_user_am(inb, args, payload),
        }
    }

    fn handle_user_am(&mut self, inb: Inbound, args: &[u64], payload: &[u8]) -> Result<(), AmError> {
        let Some((&id, rest)) = args.split_first() else {
            return Err(AmError::protocol("user AM without a handler id"));
        };
        let source = self.peer_epid(inb.shmidx)?;
        let Some(handler) = self.handlers.get_mut(id as usize) else {
            tracing::warn!(%source, id, "no user handler registered, dropping");
            return Ok(());
        };
        let token = AmToken {
            source,
            is_reply: inb.is_reply,
        };
        let Some(reply) = handler(&token, rest, payload) else {
            return Ok(());
        };
        if inb.is_reply {
            tracing::warn!(%source, id, "handler replied to a reply, dropping");
            return Ok(());
        }
        let send = self.user_am(inb.shmidx, true, reply.handler, &reply.args, reply.payload)?;
        self.send_or_defer(send);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::EpId;
    use crate::error::AmError;
    use crate::packet::{Args, HandlerIdx, Packet, ShortPacket};
    use crate::ptl::AmPtl;
    use crate::send::try_send_short;
    use crate::testing::{NullMq, test_config};
    use shm_primitives::SlotFlag;

    #[test]
    fn test_packet_from_unknown_peer_is_fatal_and_consumed() {
        let mut ptl = AmPtl::new(EpId::new(2, 1), test_config(), NullMq).unwrap();
        let queues = ptl.local.queues();
        let args = Args::from_slice(&[1, 2, 3]).unwrap();
        assert!(try_send_short(&queues.req, 7, HandlerIdx::Mq, &args, b"abc"));

        let err = ptl.poll().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(ptl.poll().unwrap(), 0);
    }

    #[test]
    fn test_out_of_range_bulk_index_is_fatal() {
        let mut ptl = AmPtl::new(EpId::new(2, 2), test_config(), NullMq).unwrap();
        let queues = ptl.local.queues();
        let idx = queues.req.short.try_acquire().unwrap();
        unsafe {
            ShortPacket::write(
                queues.req.short_packet(idx),
                Packet::Short { bulkidx: 10_000 },
                HandlerIdx::Mq,
                0,
                &Args::new(),
                &[],
            )
        };
        queues.req.short.mark_ready(idx);

        let err = ptl.poll().unwrap_err();
        assert!(matches!(err, AmError::InternalProtocol(_)));
        assert_eq!(ptl.poll().unwrap(), 0);
    }

    #[test]
    fn test_unknown_handler_index_is_fatal() {
        let mut ptl = AmPtl::new(EpId::new(2, 3), test_config(), NullMq).unwrap();
        let queues = ptl.local.queues();
        let idx = queues.rep.short.try_acquire().unwrap();
        unsafe {
            let p = queues.rep.short_packet(idx);
            ShortPacket::write(p, Packet::ShortInline { len: 0 }, HandlerIdx::Am, 0, &Args::new(), &[]);
            (*p).handler = 42;
        }
        queues.rep.short.mark_ready(idx);
        assert!(ptl.poll().unwrap_err().is_fatal());
    }

    #[test]
    fn test_unknown_handler_releases_bulk_slot() {
        let mut ptl = AmPtl::new(EpId::new(2, 4), test_config(), NullMq).unwrap();
        let queues = ptl.local.queues();
        let args = Args::from_slice(&[1]).unwrap();
        assert!(try_send_short(&queues.req, 0, HandlerIdx::Mq, &args, &[7u8; 200]));
        assert_eq!(queues.req.bulk.slot_flag(0), SlotFlag::Ready);
        unsafe { (*queues.req.short_packet(0)).handler = 42 };

        assert!(ptl.poll().unwrap_err().is_fatal());
        assert_eq!(queues.req.bulk.slot_flag(0), SlotFlag::Free);
    }
}
