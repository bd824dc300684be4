//! Writing packets into a peer's queues.
//!
//! Nothing here blocks: a full queue is reported to the caller, which defers
//! the rest of the send.

use crate::packet::{
    Args, BulkHeader, HandlerIdx, NSHORT_ARGS, Packet, ShortPacket, fits_inline,
};
use crate::queue::Channel;

/// Send one short packet, inline when it fits, otherwise with a bulk slot.
///
/// `payload` must not exceed the channel MTU. Returns false when either
/// queue is full; nothing is published in that case.
pub(crate) fn try_send_short(
    channel: &Channel,
    shmidx: u16,
    handler: HandlerIdx,
    args: &Args,
    payload: &[u8],
) -> bool {
    debug_assert!(payload.len() <= channel.mtu());
    if args.len() <= NSHORT_ARGS && fits_inline(args.len(), payload.len()) {
        let Some(idx) = channel.short.try_acquire() else {
            return false;
        };
        // SAFETY: slot `idx` is ours until marked ready.
        unsafe {
            ShortPacket::write(
                channel.short_packet(idx),
                Packet::ShortInline {
                    len: payload.len() as u32,
                },
                handler,
                shmidx,
                args,
                payload,
            )
        };
        channel.short.mark_ready(idx);
        tracing::trace!(shmidx, slot = idx, len = payload.len(), "sent inline packet");
        return true;
    }
    send_with_bulk(channel, shmidx, handler, args, payload, 0, 0, |bulkidx| {
        Packet::Short { bulkidx }
    })
}

/// Send `data` as LONG chunks ending in LONG_END, into receive buffer `dest`.
///
/// Returns the number of bytes published and whether the final chunk went
/// out. When it did not, the queue filled up and the caller resumes at that
/// offset.
pub(crate) fn send_long(
    channel: &Channel,
    shmidx: u16,
    handler: HandlerIdx,
    dest: u64,
    dest_off: u32,
    data: &[u8],
) -> (usize, bool) {
    let args = Args::new();
    if data.is_empty() {
        let done = send_with_bulk(channel, shmidx, handler, &args, &[], dest, dest_off, |bulkidx| {
            Packet::LongEnd { bulkidx }
        });
        return (0, done);
    }

    let mut sent = 0;
    for chunk in data.chunks(channel.mtu()) {
        let last = sent + chunk.len() == data.len();
        let off = dest_off + sent as u32;
        let ok = send_with_bulk(channel, shmidx, handler, &args, chunk, dest, off, |bulkidx| {
            if last {
                Packet::LongEnd { bulkidx }
            } else {
                Packet::Long { bulkidx }
            }
        });
        if !ok {
            return (sent, false);
        }
        sent += chunk.len();
    }
    (sent, true)
}

#[allow(clippy::too_many_arguments)]
fn send_with_bulk(
    channel: &Channel,
    shmidx: u16,
    handler: HandlerIdx,
    args: &Args,
    payload: &[u8],
    dest: u64,
    dest_off: u32,
    packet: impl FnOnce(u32) -> Packet,
) -> bool {
    let Some(bulkidx) = channel.bulk.try_acquire() else {
        return false;
    };
    let Some(idx) = channel.short.try_acquire() else {
        channel.bulk.release(bulkidx);
        return false;
    };

    let spill = args.as_slice().get(NSHORT_ARGS..).unwrap_or(&[]);
    // SAFETY: both slots are ours until marked ready; payload fits the MTU.
    unsafe {
        BulkHeader::write(channel.bulk_header(bulkidx), dest, dest_off, spill, payload);
    }
    channel.bulk.mark_ready(bulkidx);

    let packet = packet(bulkidx);
    // SAFETY: as above.
    unsafe { ShortPacket::write(channel.short_packet(idx), packet, handler, shmidx, args, &[]) };
    channel.short.mark_ready(idx);
    tracing::trace!(shmidx, slot = idx, bulkidx, len = payload.len(), ?packet, "sent bulk packet");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{QueueDirectory, QueueSizes};
    use crate::packet::BULK_HEADER_SIZE;
    use crate::queue::SegmentQueues;
    use shm_primitives::{AcquireMode, FifoCursor, HeapRegion};

    fn queues(short: u32, bulk: u32) -> (HeapRegion, SegmentQueues) {
        let qsizes = QueueSizes::new(short, bulk, 1024);
        let dir = QueueDirectory::calculate(&qsizes, 4096).unwrap();
        let heap = HeapRegion::new_zeroed(dir.total_size);
        let q = unsafe { SegmentQueues::init(heap.region(), &dir, &qsizes, AcquireMode::Cas) };
        (heap, q)
    }

    #[test]
    fn test_small_payload_goes_inline() {
        let (_heap, q) = queues(4, 2);
        let args = Args::from_slice(&[1, 2]).unwrap();
        assert!(try_send_short(&q.req, 5, HandlerIdx::Mq, &args, &[9; 16]));
        let view = unsafe { ShortPacket::read(q.req.short_packet(0)) }.unwrap();
        assert_eq!(view.packet, Packet::ShortInline { len: 16 });
        assert_eq!(view.shmidx, 5);
        assert_eq!(view.inline_payload(), &[9; 16]);
        // No bulk slot used.
        assert!(q.req.bulk.try_acquire().is_some());
    }

    #[test]
    fn test_many_args_spill_into_bulk() {
        let (_heap, q) = queues(4, 2);
        let words: Vec<u64> = (1..=9).collect();
        let args = Args::from_slice(&words).unwrap();
        assert!(try_send_short(&q.req, 0, HandlerIdx::Am, &args, b"hi"));
        let view = unsafe { ShortPacket::read(q.req.short_packet(0)) }.unwrap();
        let Packet::Short { bulkidx } = view.packet else {
            panic!("expected bulk packet, got {:?}", view.packet);
        };
        let bulk = unsafe { BulkHeader::read(q.req.bulk_header(bulkidx)) };
        assert_eq!(bulk.len, 2);
        assert_eq!(&bulk.args[..3], &[7, 8, 9]);
        assert_eq!(unsafe { q.req.bulk_payload(bulkidx, 2) }, b"hi");
    }

    #[test]
    fn test_full_short_queue_releases_bulk() {
        let (_heap, q) = queues(1, 2);
        let args = Args::new();
        let big = vec![1u8; 200];
        assert!(try_send_short(&q.req, 0, HandlerIdx::Mq, &args, &big));
        assert!(!try_send_short(&q.req, 0, HandlerIdx::Mq, &args, &big));
        // The bulk slot claimed by the failed send went back.
        assert_eq!(q.req.bulk.slot_flag(1), shm_primitives::SlotFlag::Free);
    }

    #[test]
    fn test_long_send_stops_when_full() {
        let (_heap, q) = queues(8, 2);
        let mtu = 1024 - BULK_HEADER_SIZE;
        let data = vec![3u8; mtu * 3 + 10];
        let (sent, done) = send_long(&q.req, 0, HandlerIdx::RtsDone, 77, 0, &data);
        assert_eq!(sent, 2 * mtu);
        assert!(!done);

        // Consume both, then resume.
        let mut cursor = FifoCursor::new();
        for _ in 0..2 {
            let idx = cursor.peek(&q.req.short).unwrap();
            let view = unsafe { ShortPacket::read(q.req.short_packet(idx)) }.unwrap();
            let Packet::Long { bulkidx } = view.packet else {
                panic!("expected LONG, got {:?}", view.packet);
            };
            let bulk = unsafe { BulkHeader::read(q.req.bulk_header(bulkidx)) };
            assert_eq!(bulk.dest, 77);
            q.req.bulk.release(bulkidx);
            cursor.advance(&q.req.short);
        }
        let (rest, done) = send_long(&q.req, 0, HandlerIdx::RtsDone, 77, sent as u32, &data[sent..]);
        assert_eq!(rest, mtu + 10);
        assert!(done);

        cursor.advance(&q.req.short);
        let idx = cursor.peek(&q.req.short).unwrap();
        let view = unsafe { ShortPacket::read(q.req.short_packet(idx)) }.unwrap();
        let Packet::LongEnd { bulkidx } = view.packet else {
            panic!("expected LONG_END, got {:?}", view.packet);
        };
        let bulk = unsafe { BulkHeader::read(q.req.bulk_header(bulkidx)) };
        assert_eq!(bulk.dest_off as usize, 3 * mtu);
        assert_eq!(bulk.len, 10);
    }

    #[test]
    fn test_empty_long_send_is_one_long_end() {
        let (_heap, q) = queues(2, 1);
        assert_eq!(send_long(&q.req, 0, HandlerIdx::RtsDone, 1, 0, &[]), (0, true));
        assert_eq!(send_long(&q.req, 0, HandlerIdx::RtsDone, 1, 0, &[]), (0, false));
    }
}
