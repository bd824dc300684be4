//! Lock-free primitives for shared memory IPC.
//!
//! This crate provides `no_std`-compatible data structures designed for use
//! in memory-mapped segments shared between processes. Everything here works
//! on a [`Region`] (a base pointer plus a length) and never owns the mapping.
//!
//! # Primitives
//!
//! - [`FifoQueue`]: fixed-capacity circular queue of fixed-size slots. Many
//!   producers (other processes) acquire slots, exactly one consumer drains
//!   them. The per-slot flag word is the only synchronization state.
//! - [`SpinLock`]: a cross-process spinlock over a single `u32` word, used by
//!   [`FifoQueue`] on segments created with [`AcquireMode::SpinLock`].
//!
//! # Loom Testing
//!
//! Enable the `loom` feature for concurrency verification:
//!
//! ```text
//! cargo test -p shm-primitives --features loom
//! ```

#![no_std]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod fifo;
pub mod region;
pub mod spinlock;
pub mod sync;

pub use fifo::{
    AcquireMode, FifoCursor, FifoError, FifoHeader, FifoQueue, SLOT_FREE, SLOT_READY, SLOT_USED,
    SlotFlag,
};
#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::Region;
pub use spinlock::{SpinLock, SpinLockGuard};

#[cfg(all(test, feature = "loom"))]
mod loom_tests;
