//! Shared-memory segment layout.
//!
//! Every endpoint owns one segment. Peers map it and push packets into its
//! request and reply queues; the owner is the only consumer.
//!
//! # Memory Layout
//!
//! ```text
//! +-------------------------------------------------------------------+
//! | SEGMENT INFO (128 bytes, padded to a page)                        |
//! |   magic "SHMAM\0\0\0", version, features, pid, epid, is_init      |
//! |   segment_size, base_addr, mappers, queue sizes                   |
//! +-------------------------------------------------------------------+
//! | REQUEST BLOCK HEADER (short FifoHeader + bulk FifoHeader, 1 page) |
//! +-------------------------------------------------------------------+
//! | REQUEST SHORT SLOTS (cnt * 64 bytes, page aligned)                |
//! +-------------------------------------------------------------------+
//! | REQUEST BULK SLOTS (cnt * elem_sz, page aligned)                  |
//! +-------------------------------------------------------------------+
//! | REPLY BLOCK HEADER                                                |
//! | REPLY SHORT SLOTS                                                 |
//! | REPLY BULK SLOTS                                                  |
//! +-------------------------------------------------------------------+
//! ```

use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use shm_primitives::FifoHeader;
use static_assertions::const_assert_eq;

use crate::error::LayoutError;
use crate::packet::{BULK_HEADER_SIZE, SHORT_PACKET_SIZE};

// =============================================================================
// Constants
// =============================================================================

/// Magic bytes identifying a shm-am segment.
pub const SEGMENT_MAGIC: [u8; 8] = *b"SHMAM\0\0\0";

/// Current protocol version (major.minor packed into u32).
pub const PROTOCOL_VERSION: u32 = 1 << 16; // v1.0

/// Size of [`SegmentInfo`] before page padding.
pub const SEGMENT_INFO_SIZE: usize = 128;

bitflags! {
    /// Capabilities the owner of a segment advertises to its peers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFeatures: u32 {
        /// The owner accepts cross-memory-attach reads and writes.
        const HAVE_CMA = 1 << 0;
    }
}

// =============================================================================
// Queue Sizes
// =============================================================================

/// Element count and size of one queue.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueSize {
    pub cnt: u32,
    pub elem_sz: u32,
}

impl QueueSize {
    fn bytes(&self) -> Result<usize, LayoutError> {
        (self.cnt as usize)
            .checked_mul(self.elem_sz as usize)
            .ok_or(LayoutError::InvalidConfig("queue size overflow"))
    }
}

/// Sizes of the four queues of a segment.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueSizes {
    pub req_short: QueueSize,
    pub req_bulk: QueueSize,
    pub rep_short: QueueSize,
    pub rep_bulk: QueueSize,
}

impl QueueSizes {
    /// Sizes for the given depths and bulk element size, same for both directions.
    pub fn new(short_depth: u32, long_depth: u32, long_elem_size: u32) -> Self {
        let short = QueueSize {
            cnt: short_depth,
            elem_sz: SHORT_PACKET_SIZE as u32,
        };
        let bulk = QueueSize {
            cnt: long_depth,
            elem_sz: long_elem_size,
        };
        Self {
            req_short: short,
            req_bulk: bulk,
            rep_short: short,
            rep_bulk: bulk,
        }
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        for q in [self.req_short, self.rep_short] {
            if q.cnt == 0 || q.elem_sz as usize != SHORT_PACKET_SIZE {
                return Err(LayoutError::InvalidConfig("bad short queue geometry"));
            }
        }
        for q in [self.req_bulk, self.rep_bulk] {
            if q.cnt == 0 || (q.elem_sz as usize) <= BULK_HEADER_SIZE || q.elem_sz % 8 != 0 {
                return Err(LayoutError::InvalidConfig("bad bulk queue geometry"));
            }
        }
        Ok(())
    }

    /// Payload bytes a bulk slot of the request queue can carry.
    pub fn long_mtu(&self) -> u32 {
        self.req_bulk.elem_sz - BULK_HEADER_SIZE as u32
    }
}

// =============================================================================
// Segment Info
// =============================================================================

/// Header at the start of every segment (128 bytes).
///
/// `is_init` is written last by the owner; readers spin on it before touching
/// anything else.
#[repr(C, align(64))]
pub struct SegmentInfo {
    /// Magic bytes: "SHMAM\0\0\0".
    pub magic: [u8; 8],
    /// Protocol version (major.minor packed).
    pub version: u32,
    /// [`SegmentFeatures`] bits.
    pub features: u32,
    /// Owning process id.
    pub pid: u32,
    /// Non-zero once every queue is initialized.
    pub is_init: AtomicU32,
    /// Owning endpoint id.
    pub epid: u64,
    /// Total bytes of the segment.
    pub segment_size: u64,
    /// Address of the mapping in the owner's address space.
    pub base_addr: u64,
    /// Number of peers currently mapping this segment.
    pub mappers: AtomicU32,
    pub _pad0: u32,
    /// Queue geometry.
    pub qsizes: QueueSizes,
    pub _pad1: [u8; 40],
}

const_assert_eq!(size_of::<SegmentInfo>(), SEGMENT_INFO_SIZE);

impl SegmentInfo {
    /// Initialize a new header. `is_init` stays clear.
    pub fn init(&mut self, pid: u32, epid: u64, features: SegmentFeatures, qsizes: QueueSizes) {
        self.magic = SEGMENT_MAGIC;
        self.version = PROTOCOL_VERSION;
        self.features = features.bits();
        self.pid = pid;
        self.is_init = AtomicU32::new(0);
        self.epid = epid;
        self.segment_size = 0;
        self.base_addr = 0;
        self.mappers = AtomicU32::new(0);
        self._pad0 = 0;
        self.qsizes = qsizes;
        self._pad1 = [0; 40];
    }

    /// Validate magic and queue geometry.
    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.magic != SEGMENT_MAGIC {
            return Err(LayoutError::InvalidMagic);
        }
        self.qsizes.validate()
    }

    /// Check that the owner speaks a compatible protocol.
    pub fn check_version(&self) -> Result<(), LayoutError> {
        check_version(self.version)
    }

    pub fn features(&self) -> SegmentFeatures {
        SegmentFeatures::from_bits_truncate(self.features)
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.is_init.load(Ordering::Acquire) != 0
    }

    /// Publish the segment. Must be the last write of initialization.
    #[inline]
    pub fn mark_ready(&self) {
        self.is_init.store(1, Ordering::Release);
    }

    #[inline]
    pub fn mark_not_ready(&self) {
        self.is_init.store(0, Ordering::Release);
    }
}

/// Major versions must match.
pub fn check_version(found: u32) -> Result<(), LayoutError> {
    if found >> 16 != PROTOCOL_VERSION >> 16 {
        return Err(LayoutError::IncompatibleVersion {
            expected: PROTOCOL_VERSION,
            found,
        });
    }
    Ok(())
}

// =============================================================================
// Queue Directory
// =============================================================================

/// Offsets of the two queues of one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOffsets {
    pub short_header: usize,
    pub bulk_header: usize,
    pub short_slots: usize,
    pub bulk_slots: usize,
}

/// Derived offsets of every queue in a segment.
///
/// Never stored in shared memory; recomputed from [`QueueSizes`] whenever a
/// segment is (re)mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDirectory {
    pub req: BlockOffsets,
    pub rep: BlockOffsets,
    pub total_size: usize,
}

impl QueueDirectory {
    /// Calculate offsets for the given queue sizes.
    pub fn calculate(qsizes: &QueueSizes, page: usize) -> Result<Self, LayoutError> {
        qsizes.validate()?;
        if !page.is_power_of_two() || page < size_of::<SegmentInfo>() {
            return Err(LayoutError::InvalidConfig("page size"));
        }

        let block_header = align_up(2 * size_of::<FifoHeader>(), page)?;
        let mut cursor = align_up(size_of::<SegmentInfo>(), page)?;

        let mut block = |short: QueueSize, bulk: QueueSize| -> Result<BlockOffsets, LayoutError> {
            let short_header = cursor;
            let bulk_header = short_header + size_of::<FifoHeader>();
            let short_slots = cursor
                .checked_add(block_header)
                .ok_or(LayoutError::InvalidConfig("segment offset overflow"))?;
            let bulk_slots = short_slots
                .checked_add(align_up(short.bytes()?, page)?)
                .ok_or(LayoutError::InvalidConfig("segment offset overflow"))?;
            cursor = bulk_slots
                .checked_add(align_up(bulk.bytes()?, page)?)
                .ok_or(LayoutError::InvalidConfig("segment offset overflow"))?;
            Ok(BlockOffsets {
                short_header,
                bulk_header,
                short_slots,
                bulk_slots,
            })
        };

        let req = block(qsizes.req_short, qsizes.req_bulk)?;
        let rep = block(qsizes.rep_short, qsizes.rep_bulk)?;
        Ok(Self {
            req,
            rep,
            total_size: cursor,
        })
    }

    /// Recompute and check against the size of an actual mapping.
    pub fn calculate_checked(
        qsizes: &QueueSizes,
        page: usize,
        expected_size: usize,
    ) -> Result<Self, LayoutError> {
        let dir = Self::calculate(qsizes, page)?;
        if expected_size != 0 && dir.total_size != expected_size {
            return Err(LayoutError::SizeMismatch {
                computed: dir.total_size,
                mapped: expected_size,
            });
        }
        Ok(dir)
    }
}

fn align_up(v: usize, align: usize) -> Result<usize, LayoutError> {
    v.checked_add(align - 1)
        .map(|v| v & !(align - 1))
        .ok_or(LayoutError::InvalidConfig("segment offset overflow"))
}
