//! Segment lifecycle: create our own segment, map peers' segments, detach.
//!
//! A peer's segment is only touched after its `is_init` flag is observed and
//! its header agrees with the size of the object we mapped. Each mapper holds
//! a count in the owner's header, which the owner drains before unlinking.

use std::ffi::CString;
use std::io;
use std::sync::OnceLock;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use shm_primitives::{AcquireMode, Region};

use crate::EpId;
use crate::error::{LayoutError, SegmentError};
use crate::gpu::SharedDevice;
use crate::layout::{QueueDirectory, QueueSizes, SegmentFeatures, SegmentInfo};
use crate::packet::BulkHeader;
use crate::queue::SegmentQueues;

/// Names tried per endpoint before giving up.
pub const MAX_NAME_ATTEMPTS: u32 = 64;

/// System page size.
pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions.
        let v = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if v > 0 { v as usize } else { 4096 }
    })
}

/// `/<prefix>.<uid>.<epid>.<n>`
pub fn segment_name(prefix: &str, uid: u32, epid: EpId, n: u32) -> CString {
    let name = format!("/{}.{}.{:016x}.{}", prefix, uid, epid.0, n);
    // Neither the prefix nor the numbers contain NUL.
    CString::new(name).unwrap_or_default()
}

fn current_uid() -> u32 {
    // SAFETY: getuid never fails.
    unsafe { libc::getuid() }
}

fn current_pid() -> u32 {
    std::process::id()
}

// =============================================================================
// Mapping
// =============================================================================

/// An mmap'd shared-memory object. Unmapped on drop.
struct Mapping {
    base: *mut u8,
    len: usize,
}

// SAFETY: the mapping is process-wide memory; access is synchronized via atomics.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn map(fd: libc::c_int, len: usize) -> Result<Self, SegmentError> {
        // SAFETY: fd is an open shm object of at least `len` bytes.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(SegmentError::MapFailed(io::Error::last_os_error()));
        }
        Ok(Self {
            base: base as *mut u8,
            len,
        })
    }

    fn region(&self) -> Region {
        // SAFETY: the mapping is valid for `len` bytes until dropped.
        unsafe { Region::from_raw(self.base, self.len) }
    }

    /// Read one byte per page so the whole object is resident.
    fn touch(&self) {
        let page = page_size();
        let mut off = 0;
        while off < self.len {
            // SAFETY: off is within the mapping.
            unsafe { std::ptr::read_volatile(self.base.add(off)) };
            off += page;
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: base and len were valid when created.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

/// Owned file descriptor from `shm_open`.
struct ShmFd(libc::c_int);

impl ShmFd {
    fn open(name: &CString, flags: libc::c_int) -> io::Result<Self> {
        // SAFETY: name is a valid C string.
        let fd = unsafe { libc::shm_open(name.as_ptr(), flags, (libc::S_IRUSR | libc::S_IWUSR) as libc::mode_t) };
        if fd < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(Self(fd))
        }
    }

    fn stat(&self) -> io::Result<libc::stat> {
        // SAFETY: zeroed stat is a valid out parameter.
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: fd is open.
        if unsafe { libc::fstat(self.0, &mut st) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(st)
    }
}

impl Drop for ShmFd {
    fn drop(&mut self) {
        // SAFETY: fd is open and owned.
        unsafe { libc::close(self.0) };
    }
}

// =============================================================================
// Local segment
// =============================================================================

/// The segment this endpoint owns and consumes from.
pub struct LocalSegment {
    mapping: Option<Mapping>,
    name: CString,
    dir: QueueDirectory,
    queues: SegmentQueues,
    qsizes: QueueSizes,
    /// Holds the host registration of the mapping until detach.
    device: SharedDevice,
}

impl LocalSegment {
    /// Create, size, zero and publish a new segment.
    pub fn create(
        prefix: &str,
        epid: EpId,
        qsizes: QueueSizes,
        features: SegmentFeatures,
        mode: AcquireMode,
        device: SharedDevice,
    ) -> Result<Self, SegmentError> {
        let dir = QueueDirectory::calculate(&qsizes, page_size())?;
        let uid = current_uid();

        let mut opened = None;
        for n in 0..MAX_NAME_ATTEMPTS {
            let name = segment_name(prefix, uid, epid, n);
            match ShmFd::open(&name, libc::O_RDWR | libc::O_CREAT) {
                Ok(fd) => {
                    let st = fd.stat().map_err(SegmentError::Io)?;
                    if st.st_uid == uid {
                        opened = Some((name, fd));
                        break;
                    }
                    tracing::debug!(?name, owner = st.st_uid, "segment name owned by another user");
                }
                Err(e) if e.raw_os_error() == Some(libc::EACCES) => continue,
                Err(e) => return Err(SegmentError::Io(e)),
            }
        }
        let (name, fd) = opened.ok_or(SegmentError::ResourceExhausted)?;

        // SAFETY: fd is open for writing.
        if unsafe { libc::ftruncate(fd.0, dir.total_size as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            // SAFETY: name is a valid C string.
            unsafe { libc::shm_unlink(name.as_ptr()) };
            return Err(SegmentError::MapFailed(err));
        }
        let mapping = match Mapping::map(fd.0, dir.total_size) {
            Ok(m) => m,
            Err(e) => {
                // SAFETY: name is a valid C string.
                unsafe { libc::shm_unlink(name.as_ptr()) };
                return Err(e);
            }
        };
        drop(fd);

        // Touch every page.
        // SAFETY: we own the fresh mapping exclusively.
        unsafe { std::ptr::write_bytes(mapping.base, 0, mapping.len) };
        device.register_host(mapping.base, mapping.len);

        let region = mapping.region();
        // SAFETY: the region is zeroed and not yet published.
        let queues = unsafe {
            let info = region.get_mut::<SegmentInfo>(0);
            info.init(current_pid(), epid.0, features, qsizes);
            info.segment_size = dir.total_size as u64;
            info.base_addr = mapping.base as u64;

            let queues = SegmentQueues::init(region, &dir, &qsizes, mode);
            for q in [queues.req.bulk, queues.rep.bulk] {
                for idx in 0..q.capacity() {
                    BulkHeader::init(q.slot_ptr(idx) as *mut BulkHeader, idx);
                }
            }
            queues
        };
        // SAFETY: header initialized above.
        unsafe { region.get::<SegmentInfo>(0) }.mark_ready();

        tracing::debug!(
            ?name,
            %epid,
            size = dir.total_size,
            "created local segment"
        );

        Ok(Self {
            mapping: Some(mapping),
            name,
            dir,
            queues,
            qsizes,
            device,
        })
    }

    pub fn info(&self) -> Option<&SegmentInfo> {
        let mapping = self.mapping.as_ref()?;
        // SAFETY: the header was initialized by create and lives as long as the mapping.
        let region = mapping.region();
        Some(unsafe { &*(region.get::<SegmentInfo>(0) as *const SegmentInfo) })
    }

    pub fn name(&self) -> &CString {
        &self.name
    }

    pub fn directory(&self) -> &QueueDirectory {
        &self.dir
    }

    pub fn qsizes(&self) -> &QueueSizes {
        &self.qsizes
    }

    /// Our own inbound queues.
    ///
    /// Only valid until [`LocalSegment::detach`].
    pub fn queues(&self) -> SegmentQueues {
        self.queues
    }

    pub fn is_attached(&self) -> bool {
        self.mapping.is_some()
    }

    /// Number of peers currently mapping us.
    pub fn mappers(&self) -> u32 {
        self.info()
            .map(|i| i.mappers.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Withdraw the segment: clear `is_init`, wait for mappers, drop the device
    /// registration, unlink, unmap.
    ///
    /// Idempotent.
    pub fn detach(&mut self, wait: Duration) {
        let Some(mapping) = self.mapping.as_ref() else {
            return;
        };
        // SAFETY: header initialized by create.
        let region = mapping.region();
        let info = unsafe { region.get::<SegmentInfo>(0) };
        info.mark_not_ready();

        let deadline = Instant::now() + wait;
        loop {
            let mappers = info.mappers.load(Ordering::Acquire);
            if mappers == 0 {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(mappers, name = ?self.name, "detaching while peers still map us");
                break;
            }
            std::thread::sleep(Duration::from_micros(50));
        }

        self.device.unregister_host(mapping.base, mapping.len);
        // SAFETY: name is a valid C string.
        unsafe { libc::shm_unlink(self.name.as_ptr()) };
        tracing::debug!(name = ?self.name, "detached local segment");
        self.mapping = None;
    }

    #[cfg(test)]
    pub(crate) fn region(&self) -> Option<Region> {
        self.mapping.as_ref().map(|m| m.region())
    }
}

impl Drop for LocalSegment {
    fn drop(&mut self) {
        self.detach(Duration::ZERO);
    }
}

// =============================================================================
// Remote segment
// =============================================================================

/// A peer's segment mapped into our address space.
pub struct RemoteSegment {
    mapping: Mapping,
    epid: EpId,
    size: usize,
}

impl RemoteSegment {
    /// Open and map the segment published by `epid`.
    pub fn map(prefix: &str, epid: EpId, init_wait: Duration) -> Result<Self, SegmentError> {
        let uid = current_uid();
        let mut found = None;
        for n in 0..MAX_NAME_ATTEMPTS {
            let name = segment_name(prefix, uid, epid, n);
            match ShmFd::open(&name, libc::O_RDWR) {
                Ok(fd) => {
                    let st = fd.stat().map_err(SegmentError::Io)?;
                    if st.st_uid == uid && st.st_size > 0 {
                        found = Some((fd, st.st_size as usize));
                        break;
                    }
                }
                Err(e) if e.raw_os_error() == Some(libc::EACCES) => continue,
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                    return Err(SegmentError::Unreachable(epid));
                }
                Err(e) => return Err(SegmentError::Io(e)),
            }
        }
        let (fd, size) = found.ok_or(SegmentError::ResourceExhausted)?;
        if size < std::mem::size_of::<SegmentInfo>() {
            return Err(SegmentError::Layout(LayoutError::SegmentTooSmall {
                required: std::mem::size_of::<SegmentInfo>(),
                found: size,
            }));
        }
        let mapping = Mapping::map(fd.0, size)?;
        drop(fd);

        let segment = Self {
            mapping,
            epid,
            size,
        };
        // Counted from here on: Drop gives the count back on every exit.
        segment.info().mappers.fetch_add(1, Ordering::AcqRel);
        segment.wait_ready(init_wait)?;
        segment.validate()?;
        segment.mapping.touch();

        tracing::debug!(%epid, size, "mapped remote segment");
        Ok(segment)
    }

    fn wait_ready(&self, wait: Duration) -> Result<(), SegmentError> {
        let deadline = Instant::now() + wait;
        while !self.info().is_ready() {
            if Instant::now() >= deadline {
                return Err(SegmentError::Timeout(self.epid));
            }
            std::thread::sleep(Duration::from_micros(1));
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), SegmentError> {
        let info = self.info();
        info.validate()?;
        if info.segment_size as usize != self.size {
            return Err(SegmentError::Fault("published size differs from object size"));
        }
        if info.epid != self.epid.0 {
            return Err(SegmentError::Fault("segment belongs to another endpoint"));
        }
        Ok(())
    }

    /// Wait for the owner to republish, then re-validate.
    pub fn refresh(&self, wait: Duration) -> Result<(), SegmentError> {
        self.wait_ready(wait)?;
        self.validate()
    }

    pub fn info(&self) -> &SegmentInfo {
        // SAFETY: the header is inside the mapping; validated before use.
        let region = self.mapping.region();
        unsafe { &*(region.get::<SegmentInfo>(0) as *const SegmentInfo) }
    }

    pub fn epid(&self) -> EpId {
        self.epid
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Derive the queue directory, checking it against the mapped size.
    pub fn directory(&self) -> Result<QueueDirectory, LayoutError> {
        let qsizes = self.info().qsizes;
        QueueDirectory::calculate_checked(&qsizes, page_size(), self.size)
    }

    /// Attach to the peer's queues.
    pub fn queues(&self, dir: &QueueDirectory) -> Result<SegmentQueues, SegmentError> {
        // SAFETY: is_init was observed and the directory matches the mapping.
        unsafe { SegmentQueues::attach(self.mapping.region(), dir) }
            .map_err(|_| SegmentError::Fault("queue header does not match directory"))
    }
}

impl Drop for RemoteSegment {
    fn drop(&mut self) {
        self.info().mappers.fetch_sub(1, Ordering::AcqRel);
        tracing::trace!(epid = %self.epid, "unmapped remote segment");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{DeviceIpc, NoDevice};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, AtomicUsize};

    static NEXT: AtomicU64 = AtomicU64::new(1);

    pub(crate) fn unique_prefix() -> String {
        format!(
            "shm_am_seg_{}_{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn sizes() -> QueueSizes {
        QueueSizes::new(8, 4, 1024)
    }

    #[test]
    fn test_segment_name_format() {
        let name = segment_name("shm_am", 1000, EpId(0xab), 3);
        assert_eq!(name.to_str().unwrap(), "/shm_am.1000.00000000000000ab.3");
    }

    #[test]
    fn test_create_map_detach() {
        let prefix = unique_prefix();
        let epid = EpId(0x1_0000_0001);
        let mut local = LocalSegment::create(
            &prefix,
            epid,
            sizes(),
            SegmentFeatures::HAVE_CMA,
            AcquireMode::Cas,
            Arc::new(NoDevice),
        )
        .unwrap();
        let info = local.info().unwrap();
        assert!(info.is_ready());
        assert_eq!(info.pid, std::process::id());
        assert_eq!(info.segment_size as usize, local.directory().total_size);

        let remote = RemoteSegment::map(&prefix, epid, Duration::from_secs(1)).unwrap();
        assert_eq!(local.mappers(), 1);
        assert!(remote.info().features().contains(SegmentFeatures::HAVE_CMA));
        let dir = remote.directory().unwrap();
        assert_eq!(&dir, local.directory());
        let queues = remote.queues(&dir).unwrap();
        assert_eq!(queues.req.short.capacity(), 8);
        assert_eq!(queues.rep.bulk.capacity(), 4);

        drop(remote);
        assert_eq!(local.mappers(), 0);
        local.detach(Duration::from_millis(10));
        local.detach(Duration::from_millis(10));
        assert!(!local.is_attached());

        assert!(matches!(
            RemoteSegment::map(&prefix, epid, Duration::from_millis(10)),
            Err(SegmentError::Unreachable(_))
        ));
    }

    #[test]
    fn test_map_missing_is_unreachable() {
        let err = RemoteSegment::map(&unique_prefix(), EpId(42), Duration::from_millis(10))
            .err()
            .unwrap();
        assert!(matches!(err, SegmentError::Unreachable(EpId(42))));
    }

    #[test]
    fn test_not_ready_segment_times_out() {
        let prefix = unique_prefix();
        let epid = EpId(77);
        let local = LocalSegment::create(
            &prefix,
            epid,
            sizes(),
            SegmentFeatures::empty(),
            AcquireMode::SpinLock,
            Arc::new(NoDevice),
        )
        .unwrap();
        local.info().unwrap().mark_not_ready();
        let err = RemoteSegment::map(&prefix, epid, Duration::from_millis(5))
            .err()
            .unwrap();
        assert!(matches!(err, SegmentError::Timeout(_)));
        assert_eq!(local.mappers(), 0);
    }

    #[test]
    fn test_corrupted_queue_sizes_detected() {
        let prefix = unique_prefix();
        let epid = EpId(78);
        let local = LocalSegment::create(
            &prefix,
            epid,
            sizes(),
            SegmentFeatures::empty(),
            AcquireMode::Cas,
            Arc::new(NoDevice),
        )
        .unwrap();
        let region = local.region().unwrap();
        // SAFETY: test-only corruption of our own header.
        unsafe { region.get_mut::<SegmentInfo>(0) }.qsizes.rep_bulk.cnt += 16;

        let remote = RemoteSegment::map(&prefix, epid, Duration::from_secs(1)).unwrap();
        let err = remote.directory().unwrap_err();
        assert!(matches!(err, LayoutError::SizeMismatch { .. }));
    }

    #[derive(Default)]
    struct HostRegistry {
        registered: AtomicUsize,
        unregistered: AtomicUsize,
    }

    impl DeviceIpc for HostRegistry {
        fn register_host(&self, _base: *mut u8, _len: usize) {
            self.registered.fetch_add(1, Ordering::Relaxed);
        }

        fn unregister_host(&self, _base: *mut u8, _len: usize) {
            self.unregistered.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_drop_releases_device_registration() {
        let registry = Arc::new(HostRegistry::default());
        let local = LocalSegment::create(
            &unique_prefix(),
            EpId(79),
            sizes(),
            SegmentFeatures::empty(),
            AcquireMode::Cas,
            registry.clone(),
        )
        .unwrap();
        assert_eq!(registry.registered.load(Ordering::Relaxed), 1);

        drop(local);
        assert_eq!(registry.unregistered.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_failed_map_returns_mapper_count() {
        let prefix = unique_prefix();
        let epid = EpId(80);
        let local = LocalSegment::create(
            &prefix,
            epid,
            sizes(),
            SegmentFeatures::empty(),
            AcquireMode::Cas,
            Arc::new(NoDevice),
        )
        .unwrap();
        let region = local.region().unwrap();
        // SAFETY: test-only corruption of our own header.
        unsafe { region.get_mut::<SegmentInfo>(0) }.epid = 81;

        let err = RemoteSegment::map(&prefix, epid, Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(matches!(err, SegmentError::Fault(_)));
        assert_eq!(local.mappers(), 0);
    }
}
