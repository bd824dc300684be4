//! Flagged-slot circular queue for shared memory.
//!
//! ```text
//! ┌──────────────┐ header_offset
//! │ FifoHeader   │ lock, head, tail, elem_cnt, elem_sz, mode
//! └──────────────┘
//! ┌──────────────┐ slots_offset
//! │ slot 0       │ [flag: u32][body ...............] elem_sz bytes
//! │ slot 1       │
//! │ ...          │
//! │ slot n-1     │
//! └──────────────┘
//! ```
//!
//! Producers race on `tail` to claim an index, then move the slot flag from
//! FREE to USED, fill the body and publish it as READY. The single consumer
//! walks a private head cursor, processes READY slots in order and flips them
//! back to FREE. The header and slots may live in different places of the same
//! region; the header is never touched by the consumer in steady state.

use core::mem::size_of;
use core::ptr;

use crate::region::Region;
use crate::spinlock::SpinLock;
use crate::sync::{AtomicU32, Ordering, spin_loop};

/// Slot is owned by nobody.
pub const SLOT_FREE: u32 = 0;
/// Slot is owned by a producer that is filling it.
pub const SLOT_USED: u32 = 1;
/// Slot is published and owned by the consumer.
pub const SLOT_READY: u32 = 2;

const MODE_CAS: u32 = 0;
const MODE_SPINLOCK: u32 = 1;

/// How producers claim a slot.
///
/// The mode is fixed at init and stored in the header, so every producer
/// attached to the queue uses the same discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Compare-and-swap on the tail counter, then on the slot flag.
    Cas,
    /// Take the header spinlock around the tail/flag update.
    SpinLock,
}

/// Decoded slot flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotFlag {
    Free,
    Used,
    Ready,
    Unknown(u32),
}

impl From<u32> for SlotFlag {
    fn from(v: u32) -> Self {
        match v {
            SLOT_FREE => SlotFlag::Free,
            SLOT_USED => SlotFlag::Used,
            SLOT_READY => SlotFlag::Ready,
            other => SlotFlag::Unknown(other),
        }
    }
}

/// Queue header (64 bytes, cache-line aligned).
#[repr(C, align(64))]
pub struct FifoHeader {
    /// Producer spinlock word (only used in [`AcquireMode::SpinLock`]).
    pub lock: AtomicU32,
    /// Consumer progress snapshot, informational only.
    pub head: AtomicU32,
    /// Next index a producer will claim.
    pub tail: AtomicU32,
    /// Number of slots (immutable after init).
    pub elem_cnt: u32,
    /// Bytes per slot, including the flag word (immutable after init).
    pub elem_sz: u32,
    /// Acquire mode (immutable after init).
    pub mode: u32,
    _pad: [u8; 40],
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(core::mem::size_of::<FifoHeader>() == 64);

impl FifoHeader {
    pub fn init(&mut self, elem_cnt: u32, elem_sz: u32, mode: AcquireMode) {
        self.lock = AtomicU32::new(0);
        self.head = AtomicU32::new(0);
        self.tail = AtomicU32::new(0);
        self.elem_cnt = elem_cnt;
        self.elem_sz = elem_sz;
        self.mode = match mode {
            AcquireMode::Cas => MODE_CAS,
            AcquireMode::SpinLock => MODE_SPINLOCK,
        };
        self._pad = [0; 40];
    }

    pub fn acquire_mode(&self) -> Option<AcquireMode> {
        match self.mode {
            MODE_CAS => Some(AcquireMode::Cas),
            MODE_SPINLOCK => Some(AcquireMode::SpinLock),
            _ => None,
        }
    }
}

/// Errors from attaching to an existing queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoError {
    /// Header offset is misaligned or out of bounds.
    BadHeader,
    /// Header holds zero slots, a slot smaller than the flag word, or an unknown mode.
    InvalidConfig,
    /// Slots would run past the end of the region.
    TooSmall { required: usize, found: usize },
}

impl core::fmt::Display for FifoError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::BadHeader => write!(f, "queue header misaligned or out of bounds"),
            Self::InvalidConfig => write!(f, "queue header holds an invalid configuration"),
            Self::TooSmall { required, found } => {
                write!(f, "queue needs {} bytes, region has {}", required, found)
            }
        }
    }
}

/// A flagged-slot queue living in a region.
#[derive(Debug, Clone, Copy)]
pub struct FifoQueue {
    region: Region,
    header_offset: usize,
    slots_offset: usize,
    elem_cnt: u32,
    elem_sz: u32,
}

// SAFETY: all shared state is accessed through atomics.
unsafe impl Send for FifoQueue {}
unsafe impl Sync for FifoQueue {}

impl FifoQueue {
    /// Bytes needed for the slots of a queue (header excluded).
    pub const fn slots_size(elem_cnt: u32, elem_sz: u32) -> usize {
        elem_cnt as usize * elem_sz as usize
    }

    /// Initialize a new queue and mark every slot free.
    ///
    /// # Safety
    ///
    /// The region must be writable and exclusively owned during initialization.
    pub unsafe fn init(
        region: Region,
        header_offset: usize,
        slots_offset: usize,
        elem_cnt: u32,
        elem_sz: u32,
        mode: AcquireMode,
    ) -> Self {
        assert!(elem_cnt > 0, "queue needs at least one slot");
        assert!(
            elem_sz as usize >= size_of::<AtomicU32>() && elem_sz % 8 == 0,
            "slot size must hold the flag word and be 8-byte aligned"
        );
        assert!(
            header_offset.is_multiple_of(64),
            "header_offset must be 64-byte aligned"
        );
        assert!(
            slots_offset.is_multiple_of(8),
            "slots_offset must be 8-byte aligned"
        );
        let required = slots_offset + Self::slots_size(elem_cnt, elem_sz);
        assert!(required <= region.len(), "region too small for queue");

        let header = unsafe { region.get_mut::<FifoHeader>(header_offset) };
        header.init(elem_cnt, elem_sz, mode);

        let queue = Self {
            region,
            header_offset,
            slots_offset,
            elem_cnt,
            elem_sz,
        };
        for idx in 0..elem_cnt {
            unsafe {
                ptr::write(
                    queue.slot_ptr(idx) as *mut AtomicU32,
                    AtomicU32::new(SLOT_FREE),
                )
            };
        }
        queue
    }

    /// Attach to a queue initialized by another party.
    ///
    /// # Safety
    ///
    /// The region must contain an initialized queue at these offsets.
    pub unsafe fn attach(
        region: Region,
        header_offset: usize,
        slots_offset: usize,
    ) -> Result<Self, FifoError> {
        if !region.fits::<FifoHeader>(header_offset) {
            return Err(FifoError::BadHeader);
        }
        let header = unsafe { region.get::<FifoHeader>(header_offset) };
        let (elem_cnt, elem_sz) = (header.elem_cnt, header.elem_sz);
        if elem_cnt == 0
            || (elem_sz as usize) < size_of::<AtomicU32>()
            || header.acquire_mode().is_none()
        {
            return Err(FifoError::InvalidConfig);
        }
        let required = slots_offset
            .checked_add(Self::slots_size(elem_cnt, elem_sz))
            .ok_or(FifoError::InvalidConfig)?;
        if required > region.len() {
            return Err(FifoError::TooSmall {
                required,
                found: region.len(),
            });
        }
        Ok(Self {
            region,
            header_offset,
            slots_offset,
            elem_cnt,
            elem_sz,
        })
    }

    #[inline]
    pub fn header(&self) -> &FifoHeader {
        unsafe { self.region.get::<FifoHeader>(self.header_offset) }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.elem_cnt
    }

    #[inline]
    pub fn elem_size(&self) -> u32 {
        self.elem_sz
    }

    /// Offset of slot `idx` within the region.
    #[inline]
    pub fn slot_offset(&self, idx: u32) -> usize {
        assert!(idx < self.elem_cnt, "slot index out of range");
        self.slots_offset + idx as usize * self.elem_sz as usize
    }

    /// Raw pointer to the start of slot `idx` (its flag word).
    #[inline]
    pub fn slot_ptr(&self, idx: u32) -> *mut u8 {
        self.region.offset(self.slot_offset(idx))
    }

    #[inline]
    pub fn region(&self) -> Region {
        self.region
    }

    #[inline]
    fn flag(&self, idx: u32) -> &AtomicU32 {
        unsafe { self.region.get::<AtomicU32>(self.slot_offset(idx)) }
    }

    #[inline]
    fn next_index(&self, idx: u32) -> u32 {
        if idx + 1 == self.elem_cnt { 0 } else { idx + 1 }
    }

    /// Current flag of slot `idx`.
    pub fn slot_flag(&self, idx: u32) -> SlotFlag {
        SlotFlag::from(self.flag(idx).load(Ordering::Acquire))
    }

    /// Claim the next slot for writing.
    ///
    /// Returns `None` when the slot at the tail is still owned by someone,
    /// i.e. the queue is full. Never sleeps.
    pub fn try_acquire(&self) -> Option<u32> {
        match self.header().acquire_mode() {
            Some(AcquireMode::SpinLock) => self.acquire_locked(),
            _ => self.acquire_cas(),
        }
    }

    fn acquire_cas(&self) -> Option<u32> {
        let header = self.header();
        let idx = loop {
            let idx = header.tail.load(Ordering::Acquire);
            if self.flag(idx).load(Ordering::Acquire) != SLOT_FREE {
                return None;
            }
            let next = self.next_index(idx);
            if header
                .tail
                .compare_exchange(idx, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break idx;
            }
            spin_loop();
        };

        // The index is ours; the slot may still be held by a producer that
        // claimed it one full lap earlier.
        while self
            .flag(idx)
            .compare_exchange(SLOT_FREE, SLOT_USED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
        Some(idx)
    }

    fn acquire_locked(&self) -> Option<u32> {
        let header = self.header();
        let _guard = SpinLock::new(&header.lock).lock();
        let idx = header.tail.load(Ordering::Relaxed);
        let flag = self.flag(idx);
        if flag.load(Ordering::Acquire) != SLOT_FREE {
            return None;
        }
        flag.store(SLOT_USED, Ordering::Relaxed);
        header.tail.store(self.next_index(idx), Ordering::Relaxed);
        Some(idx)
    }

    /// Publish a slot previously returned by [`FifoQueue::try_acquire`].
    #[inline]
    pub fn mark_ready(&self, idx: u32) {
        self.flag(idx).store(SLOT_READY, Ordering::Release);
    }

    /// Return a slot to the free pool.
    ///
    /// Used by the consumer after it is done with a READY slot, and by a
    /// producer that claimed a slot it will not publish.
    #[inline]
    pub fn release(&self, idx: u32) {
        self.flag(idx).store(SLOT_FREE, Ordering::Release);
    }

    #[inline]
    pub fn is_ready(&self, idx: u32) -> bool {
        self.flag(idx).load(Ordering::Acquire) == SLOT_READY
    }

    /// Borrow the bytes of slot `idx` after the flag word.
    ///
    /// # Safety
    ///
    /// The caller must own the slot (USED for a producer, READY for the consumer).
    #[inline]
    pub unsafe fn body(&self, idx: u32) -> &[u8] {
        let off = self.slot_offset(idx) + size_of::<u32>();
        unsafe { self.region.bytes(off, self.elem_sz as usize - size_of::<u32>()) }
    }

    /// Mutably borrow the bytes of slot `idx` after the flag word.
    ///
    /// # Safety
    ///
    /// The caller must own the slot (USED for a producer, READY for the consumer).
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn body_mut(&self, idx: u32) -> &mut [u8] {
        let off = self.slot_offset(idx) + size_of::<u32>();
        unsafe {
            self.region
                .bytes_mut(off, self.elem_sz as usize - size_of::<u32>())
        }
    }
}

/// Consumer-side read cursor.
///
/// Lives in the consumer's private memory, never in the shared region.
#[derive(Debug, Default, Clone, Copy)]
pub struct FifoCursor {
    head: u32,
}

impl FifoCursor {
    pub fn new() -> Self {
        Self { head: 0 }
    }

    #[inline]
    pub fn head(&self) -> u32 {
        self.head
    }

    /// Index of the head slot if it has been published.
    #[inline]
    pub fn peek(&self, queue: &FifoQueue) -> Option<u32> {
        queue.is_ready(self.head).then_some(self.head)
    }

    /// Free the head slot and move to the next one.
    #[inline]
    pub fn advance(&mut self, queue: &FifoQueue) {
        queue.release(self.head);
        self.head = queue.next_index(self.head);
        queue.header().head.store(self.head, Ordering::Relaxed);
    }
}
