//! Wire packets.
//!
//! A short packet is one 64-byte slot of a short queue. Its payload is either
//! inline (overlaying unused argument words) or in a bulk slot whose index the
//! short packet carries.
//!
//! ```text
//! ShortPacket (64 bytes)
//! +------+------+-------+---------+--------+---------+-----------------+
//! | flag | kind | nargs | handler | shmidx | bulkidx | args[6]: u64    |
//! | u32  | u16  | u16   | u16     | u16    | u32     | (inline payload)|
//! +------+------+-------+---------+--------+---------+-----------------+
//!
//! BulkPacket (elem_sz bytes)
//! +------+-----+-----+----------+------+-------------+------+---------+
//! | flag | idx | len | dest_off | dest | args[7]:u64 | pad  | payload |
//! +------+-----+-----+----------+------+-------------+------+---------+
//! |<------------------------ 128 bytes ------------------->|
//! ```

use std::mem::size_of;
use std::ptr;

use static_assertions::const_assert_eq;

use crate::error::AmError;

/// Argument words carried in the short packet.
pub const NSHORT_ARGS: usize = 6;

/// Argument words that spill over into the bulk packet.
pub const NBULK_ARGS: usize = 7;

/// Largest argument count a packet can carry.
pub const MAX_ARGS: usize = NSHORT_ARGS + NBULK_ARGS;

pub const SHORT_PACKET_SIZE: usize = 64;
pub const BULK_HEADER_SIZE: usize = 128;

/// `shmidx` value meaning "the receiver does not know me yet".
pub const NO_SHMIDX: u16 = 0xFFFF;

// =============================================================================
// Handlers
// =============================================================================

/// Index into the receiver's handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum HandlerIdx {
    Conn = 1,
    Mq = 2,
    MqData = 3,
    RtsMatch = 4,
    RtsDone = 5,
    Am = 6,
}

/// Number of handler table entries, including the unused slot 0.
pub const NUM_HANDLERS: usize = 7;

impl TryFrom<u16> for HandlerIdx {
    type Error = AmError;

    fn try_from(v: u16) -> Result<Self, AmError> {
        Ok(match v {
            1 => Self::Conn,
            2 => Self::Mq,
            3 => Self::MqData,
            4 => Self::RtsMatch,
            5 => Self::RtsDone,
            6 => Self::Am,
            other => return Err(AmError::protocol(format!("unknown handler index {}", other))),
        })
    }
}

// =============================================================================
// Packet kinds
// =============================================================================

const KIND_SHORT_INLINE: u16 = 1;
const KIND_SHORT: u16 = 2;
const KIND_LONG: u16 = 3;
const KIND_LONG_END: u16 = 4;

/// Decoded short packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    /// Payload lives in the argument words.
    ShortInline { len: u32 },
    /// Payload and spill-over arguments live in a bulk slot.
    Short { bulkidx: u32 },
    /// One chunk of a multi-packet transfer.
    Long { bulkidx: u32 },
    /// Final chunk of a multi-packet transfer.
    LongEnd { bulkidx: u32 },
}

impl Packet {
    fn kind(&self) -> u16 {
        match self {
            Self::ShortInline { .. } => KIND_SHORT_INLINE,
            Self::Short { .. } => KIND_SHORT,
            Self::Long { .. } => KIND_LONG,
            Self::LongEnd { .. } => KIND_LONG_END,
        }
    }

    fn bulkidx(&self) -> u32 {
        match *self {
            Self::ShortInline { len } => len,
            Self::Short { bulkidx } | Self::Long { bulkidx } | Self::LongEnd { bulkidx } => bulkidx,
        }
    }
}

/// True if `len` payload bytes fit next to `nargs` argument words.
#[inline]
pub fn fits_inline(nargs: usize, len: usize) -> bool {
    len + 8 * nargs <= 8 * NSHORT_ARGS
}

// =============================================================================
// Arguments
// =============================================================================

/// Fixed-capacity argument list.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Args {
    words: [u64; MAX_ARGS],
    len: u8,
}

impl Args {
    pub fn new() -> Self {
        Self {
            words: [0; MAX_ARGS],
            len: 0,
        }
    }

    pub fn from_slice(words: &[u64]) -> Result<Self, AmError> {
        if words.len() > MAX_ARGS {
            return Err(AmError::InvalidArgument("too many arguments"));
        }
        let mut args = Self::new();
        args.words[..words.len()].copy_from_slice(words);
        args.len = words.len() as u8;
        Ok(args)
    }

    #[inline]
    pub fn as_slice(&self) -> &[u64] {
        &self.words[..self.len as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Word `i`, or 0 past the end.
    #[inline]
    pub fn get(&self, i: usize) -> u64 {
        self.as_slice().get(i).copied().unwrap_or(0)
    }
}

impl Default for Args {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Args {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

// =============================================================================
// Short packet
// =============================================================================

/// Short-queue slot (64 bytes). `flag` is owned by the queue.
#[repr(C)]
pub struct ShortPacket {
    pub flag: u32,
    pub kind: u16,
    pub nargs: u16,
    pub handler: u16,
    pub shmidx: u16,
    /// Bulk slot index, or the inline payload length.
    pub bulkidx: u32,
    pub args: [u64; NSHORT_ARGS],
}

const_assert_eq!(size_of::<ShortPacket>(), SHORT_PACKET_SIZE);

/// Fields of an inbound short packet, copied out of shared memory.
#[derive(Debug, Clone, Copy)]
pub struct ShortView {
    pub packet: Packet,
    pub handler: u16,
    pub shmidx: u16,
    pub nargs: usize,
    pub args: [u64; NSHORT_ARGS],
    pub inline: [u8; 8 * NSHORT_ARGS],
}

impl ShortView {
    /// Inline payload bytes, if this is an inline packet.
    pub fn inline_payload(&self) -> &[u8] {
        match self.packet {
            Packet::ShortInline { len } => {
                let start = 8 * self.nargs;
                &self.inline[start..start + len as usize]
            }
            _ => &[],
        }
    }
}

impl ShortPacket {
    /// Fill every field but `flag`.
    ///
    /// # Safety
    ///
    /// `p` must point to a short slot the caller owns (state USED).
    pub unsafe fn write(
        p: *mut ShortPacket,
        packet: Packet,
        handler: HandlerIdx,
        shmidx: u16,
        args: &Args,
        inline: &[u8],
    ) {
        let nargs = args.len();
        unsafe {
            (*p).kind = packet.kind();
            (*p).nargs = nargs as u16;
            (*p).handler = handler as u16;
            (*p).shmidx = shmidx;
            (*p).bulkidx = packet.bulkidx();

            let words = ptr::addr_of_mut!((*p).args) as *mut u64;
            for (i, w) in args.as_slice().iter().take(NSHORT_ARGS).enumerate() {
                words.add(i).write(*w);
            }
            if let Packet::ShortInline { .. } = packet {
                debug_assert!(fits_inline(nargs, inline.len()));
                let bytes = (words as *mut u8).add(8 * nargs);
                ptr::copy_nonoverlapping(inline.as_ptr(), bytes, inline.len());
            }
        }
    }

    /// Copy a packet out of its slot.
    ///
    /// # Safety
    ///
    /// `p` must point to a short slot the caller owns (state READY).
    pub unsafe fn read(p: *const ShortPacket) -> Result<ShortView, AmError> {
        let (kind, nargs, handler, shmidx, bulkidx, raw) = unsafe {
            (
                (*p).kind,
                (*p).nargs as usize,
                (*p).handler,
                (*p).shmidx,
                (*p).bulkidx,
                ptr::read(ptr::addr_of!((*p).args)),
            )
        };
        if nargs > MAX_ARGS {
            return Err(AmError::protocol(format!("packet claims {} arguments", nargs)));
        }
        let packet = match kind {
            KIND_SHORT_INLINE => {
                if !fits_inline(nargs, bulkidx as usize) {
                    return Err(AmError::protocol(format!(
                        "inline payload of {} bytes with {} arguments",
                        bulkidx, nargs
                    )));
                }
                Packet::ShortInline { len: bulkidx }
            }
            KIND_SHORT => Packet::Short { bulkidx },
            KIND_LONG => Packet::Long { bulkidx },
            KIND_LONG_END => Packet::LongEnd { bulkidx },
            other => {
                return Err(AmError::protocol(format!(
                    "unknown packet type {:#x}",
                    other
                )));
            }
        };
        let mut inline = [0u8; 8 * NSHORT_ARGS];
        for (chunk, w) in inline.chunks_exact_mut(8).zip(raw.iter()) {
            chunk.copy_from_slice(&w.to_ne_bytes());
        }
        Ok(ShortView {
            packet,
            handler,
            shmidx,
            nargs,
            args: raw,
            inline,
        })
    }
}

// =============================================================================
// Bulk packet
// =============================================================================

/// Header of a bulk-queue slot (128 bytes). The payload follows it.
#[repr(C)]
pub struct BulkHeader {
    pub flag: u32,
    /// Own index in the queue, set at init.
    pub idx: u32,
    pub len: u32,
    pub dest_off: u32,
    pub dest: u64,
    pub args: [u64; NBULK_ARGS],
    pub _pad: [u8; 48],
}

const_assert_eq!(size_of::<BulkHeader>(), BULK_HEADER_SIZE);

/// Fields of an inbound bulk packet header.
#[derive(Debug, Clone, Copy)]
pub struct BulkView {
    pub idx: u32,
    pub len: u32,
    pub dest: u64,
    pub dest_off: u32,
    pub args: [u64; NBULK_ARGS],
}

impl BulkHeader {
    /// Preset the slot index; done once by the segment owner.
    ///
    /// # Safety
    ///
    /// `p` must point to a bulk slot during segment initialization.
    pub unsafe fn init(p: *mut BulkHeader, idx: u32) {
        unsafe { (*p).idx = idx };
    }

    /// Fill the header and copy the payload in.
    ///
    /// # Safety
    ///
    /// `p` must point to a bulk slot the caller owns, with room for `payload`.
    pub unsafe fn write(p: *mut BulkHeader, dest: u64, dest_off: u32, spill: &[u64], payload: &[u8]) {
        unsafe {
            (*p).len = payload.len() as u32;
            (*p).dest = dest;
            (*p).dest_off = dest_off;
            let words = ptr::addr_of_mut!((*p).args) as *mut u64;
            for (i, w) in spill.iter().take(NBULK_ARGS).enumerate() {
                words.add(i).write(*w);
            }
            let body = (p as *mut u8).add(BULK_HEADER_SIZE);
            ptr::copy_nonoverlapping(payload.as_ptr(), body, payload.len());
        }
    }

    /// Copy the header out of its slot.
    ///
    /// # Safety
    ///
    /// `p` must point to a READY bulk slot.
    pub unsafe fn read(p: *const BulkHeader) -> BulkView {
        unsafe {
            BulkView {
                idx: (*p).idx,
                len: (*p).len,
                dest: (*p).dest,
                dest_off: (*p).dest_off,
                args: ptr::read(ptr::addr_of!((*p).args)),
            }
        }
    }
}

/// Merge short and spill-over arguments into one list.
pub fn gather_args(short: &[u64; NSHORT_ARGS], bulk: Option<&[u64; NBULK_ARGS]>, nargs: usize) -> Args {
    let mut args = Args::new();
    let n = nargs.min(MAX_ARGS);
    for i in 0..n {
        args.words[i] = if i < NSHORT_ARGS {
            short[i]
        } else {
            bulk.map(|b| b[i - NSHORT_ARGS]).unwrap_or(0)
        };
    }
    args.len = n as u8;
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fits_inline_boundary() {
        assert!(fits_inline(0, 48));
        assert!(!fits_inline(0, 49));
        assert!(fits_inline(3, 24));
        assert!(!fits_inline(3, 25));
        assert!(fits_inline(6, 0));
        assert!(!fits_inline(7, 0));
    }

    #[test]
    fn test_inline_payload_overlays_args() {
        let mut slot = ShortPacket {
            flag: 0,
            kind: 0,
            nargs: 0,
            handler: 0,
            shmidx: 0,
            bulkidx: 0,
            args: [0; NSHORT_ARGS],
        };
        let args = Args::from_slice(&[11, 22]).unwrap();
        let payload: Vec<u8> = (0..16).collect();
        unsafe {
            ShortPacket::write(
                &mut slot,
                Packet::ShortInline { len: 16 },
                HandlerIdx::Mq,
                3,
                &args,
                &payload,
            )
        };
        let view = unsafe { ShortPacket::read(&slot) }.unwrap();
        assert_eq!(view.packet, Packet::ShortInline { len: 16 });
        assert_eq!(view.handler, HandlerIdx::Mq as u16);
        assert_eq!(view.shmidx, 3);
        assert_eq!(&view.args[..2], &[11, 22]);
        assert_eq!(view.inline_payload(), &payload[..]);
    }

    #[test]
    fn test_unknown_kind_is_protocol_error() {
        let slot = ShortPacket {
            flag: 2,
            kind: 0x77,
            nargs: 1,
            handler: 2,
            shmidx: 0,
            bulkidx: 0,
            args: [0; NSHORT_ARGS],
        };
        let err = unsafe { ShortPacket::read(&slot) }.unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_oversized_inline_rejected() {
        let slot = ShortPacket {
            flag: 2,
            kind: KIND_SHORT_INLINE,
            nargs: 4,
            handler: 2,
            shmidx: 0,
            bulkidx: 17,
            args: [0; NSHORT_ARGS],
        };
        assert!(unsafe { ShortPacket::read(&slot) }.is_err());
    }

    #[test]
    fn test_gather_args_spills_into_bulk() {
        let short = [1, 2, 3, 4, 5, 6];
        let bulk = [7, 8, 9, 0, 0, 0, 0];
        let args = gather_args(&short, Some(&bulk), 9);
        assert_eq!(args.as_slice(), &[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let args = gather_args(&short, None, 4);
        assert_eq!(args.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_handler_idx_rejects_unknown() {
        assert_eq!(HandlerIdx::try_from(4).unwrap(), HandlerIdx::RtsMatch);
        assert!(HandlerIdx::try_from(0).is_err());
        assert!(HandlerIdx::try_from(7).is_err());
    }
}
