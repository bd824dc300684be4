//! The four queues of a segment, located through a [`QueueDirectory`].

use shm_primitives::{AcquireMode, FifoError, FifoQueue, Region};

use crate::layout::{BlockOffsets, QueueDirectory, QueueSize, QueueSizes};
use crate::packet::{BULK_HEADER_SIZE, BulkHeader, ShortPacket};

/// Short and bulk queue of one direction.
#[derive(Debug, Clone, Copy)]
pub struct Channel {
    pub short: FifoQueue,
    pub bulk: FifoQueue,
}

impl Channel {
    /// # Safety
    ///
    /// The region must be exclusively owned and large enough for `offsets`.
    unsafe fn init(
        region: Region,
        offsets: &BlockOffsets,
        short: QueueSize,
        bulk: QueueSize,
        mode: AcquireMode,
    ) -> Self {
        unsafe {
            Self {
                short: FifoQueue::init(
                    region,
                    offsets.short_header,
                    offsets.short_slots,
                    short.cnt,
                    short.elem_sz,
                    mode,
                ),
                bulk: FifoQueue::init(
                    region,
                    offsets.bulk_header,
                    offsets.bulk_slots,
                    bulk.cnt,
                    bulk.elem_sz,
                    mode,
                ),
            }
        }
    }

    /// # Safety
    ///
    /// The region must hold initialized queues at `offsets`.
    unsafe fn attach(region: Region, offsets: &BlockOffsets) -> Result<Self, FifoError> {
        unsafe {
            Ok(Self {
                short: FifoQueue::attach(region, offsets.short_header, offsets.short_slots)?,
                bulk: FifoQueue::attach(region, offsets.bulk_header, offsets.bulk_slots)?,
            })
        }
    }

    #[inline]
    pub fn short_packet(&self, idx: u32) -> *mut ShortPacket {
        self.short.slot_ptr(idx) as *mut ShortPacket
    }

    #[inline]
    pub fn bulk_header(&self, idx: u32) -> *mut BulkHeader {
        self.bulk.slot_ptr(idx) as *mut BulkHeader
    }

    /// Payload bytes one bulk slot carries.
    #[inline]
    pub fn mtu(&self) -> usize {
        self.bulk.elem_size() as usize - BULK_HEADER_SIZE
    }

    /// Payload area of bulk slot `idx`.
    ///
    /// # Safety
    ///
    /// The caller must own the slot and `len` must not exceed [`Channel::mtu`].
    pub unsafe fn bulk_payload(&self, idx: u32, len: usize) -> &[u8] {
        let off = self.bulk.slot_offset(idx) + BULK_HEADER_SIZE;
        let region = self.bulk.region();
        unsafe { &*(region.bytes(off, len) as *const [u8]) }
    }
}

/// Request and reply channels of one segment.
#[derive(Debug, Clone, Copy)]
pub struct SegmentQueues {
    pub req: Channel,
    pub rep: Channel,
}

impl SegmentQueues {
    /// Lay out fresh queues in a zeroed region.
    ///
    /// # Safety
    ///
    /// The region must be exclusively owned and at least `dir.total_size` bytes.
    pub unsafe fn init(
        region: Region,
        dir: &QueueDirectory,
        qsizes: &QueueSizes,
        mode: AcquireMode,
    ) -> Self {
        unsafe {
            Self {
                req: Channel::init(region, &dir.req, qsizes.req_short, qsizes.req_bulk, mode),
                rep: Channel::init(region, &dir.rep, qsizes.rep_short, qsizes.rep_bulk, mode),
            }
        }
    }

    /// Attach to queues initialized by the segment owner.
    ///
    /// # Safety
    ///
    /// The owner must have published the segment.
    pub unsafe fn attach(region: Region, dir: &QueueDirectory) -> Result<Self, FifoError> {
        unsafe {
            Ok(Self {
                req: Channel::attach(region, &dir.req)?,
                rep: Channel::attach(region, &dir.rep)?,
            })
        }
    }

    /// Channel for requests (`is_reply == false`) or replies.
    #[inline]
    pub fn channel(&self, is_reply: bool) -> &Channel {
        if is_reply { &self.rep } else { &self.req }
    }
}
