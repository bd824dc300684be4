use core::mem::{align_of, size_of};

/// A view of a contiguous byte range, typically a shared memory mapping.
///
/// `Region` is `Copy` and does not own the memory. Whoever created the
/// mapping keeps it alive for as long as any `Region` derived from it is used.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    base: *mut u8,
    len: usize,
}

// SAFETY: Region is a plain pointer/length pair; all cross-thread access to the
// underlying bytes goes through atomics or the slot ownership protocol.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Create a region from a raw pointer and length.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes for as long as
    /// the region (or any copy of it) is used.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    /// Pointer to `offset` bytes into the region.
    ///
    /// Panics if `offset` is past the end of the region.
    #[inline]
    pub fn offset(&self, offset: usize) -> *mut u8 {
        assert!(offset <= self.len, "offset out of bounds");
        // SAFETY: offset is within the region.
        unsafe { self.base.add(offset) }
    }

    /// Returns true if a `T` fits at `offset` and is properly aligned there.
    #[inline]
    pub fn fits<T>(&self, offset: usize) -> bool {
        match offset.checked_add(size_of::<T>()) {
            Some(end) => end <= self.len && (self.base as usize + offset) % align_of::<T>() == 0,
            None => false,
        }
    }

    /// Borrow a `T` at `offset`.
    ///
    /// # Safety
    ///
    /// The bytes at `offset` must hold a valid `T`. Shared fields must only be
    /// mutated through interior mutability (atomics).
    #[inline]
    pub unsafe fn get<T>(&self, offset: usize) -> &T {
        assert!(self.fits::<T>(offset), "misaligned or out of bounds access");
        unsafe { &*(self.base.add(offset) as *const T) }
    }

    /// Mutably borrow a `T` at `offset`.
    ///
    /// # Safety
    ///
    /// Same as [`Region::get`], and the caller must have exclusive access to
    /// those bytes (typically during initialization).
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut<T>(&self, offset: usize) -> &mut T {
        assert!(self.fits::<T>(offset), "misaligned or out of bounds access");
        unsafe { &mut *(self.base.add(offset) as *mut T) }
    }

    /// Borrow `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// No other party may write those bytes while the slice is alive.
    #[inline]
    pub unsafe fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        let end = offset.checked_add(len).expect("region slice overflow");
        assert!(end <= self.len, "slice out of bounds");
        unsafe { core::slice::from_raw_parts(self.base.add(offset), len) }
    }

    /// Mutably borrow `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must own those bytes exclusively while the slice is alive.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        let end = offset.checked_add(len).expect("region slice overflow");
        assert!(end <= self.len, "slice out of bounds");
        unsafe { core::slice::from_raw_parts_mut(self.base.add(offset), len) }
    }

    /// Narrow the region to `[offset, offset + len)`.
    pub fn subregion(&self, offset: usize, len: usize) -> Option<Region> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        Some(Region {
            // SAFETY: bounds checked above.
            base: unsafe { self.base.add(offset) },
            len,
        })
    }
}

/// Heap-backed zeroed region, for tests and in-process use.
#[cfg(any(test, feature = "alloc"))]
pub struct HeapRegion {
    ptr: *mut u8,
    layout: alloc::alloc::Layout,
}

#[cfg(any(test, feature = "alloc"))]
unsafe impl Send for HeapRegion {}
#[cfg(any(test, feature = "alloc"))]
unsafe impl Sync for HeapRegion {}

#[cfg(any(test, feature = "alloc"))]
impl HeapRegion {
    /// Allocate `len` zeroed bytes, aligned to 4096.
    pub fn new_zeroed(len: usize) -> Self {
        let layout = alloc::alloc::Layout::from_size_align(len.max(1), 4096)
            .expect("invalid heap region layout");
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            alloc::alloc::handle_alloc_error(layout);
        }
        Self { ptr, layout }
    }

    pub fn region(&self) -> Region {
        Region {
            base: self.ptr,
            len: self.layout.size(),
        }
    }
}

#[cfg(any(test, feature = "alloc"))]
impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout.
        unsafe { alloc::alloc::dealloc(self.ptr, self.layout) };
    }
}
