//! Device memory capability.
//!
//! The transport does not talk to a GPU driver. Everything device-specific
//! goes through [`DeviceIpc`]; hosts without a device use [`NoDevice`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::EpId;

/// Opaque IPC handle bytes exported by a device driver.
pub type IpcHandle = Vec<u8>;

/// Opaque id of a handle imported by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImportId(pub u64);

/// Device operations the rendezvous path may use.
///
/// Implementations are shared between the endpoint and its segment, so every
/// method takes `&self`.
pub trait DeviceIpc {
    /// Register a host range for device DMA.
    fn register_host(&self, _base: *mut u8, _len: usize) {}

    fn unregister_host(&self, _base: *mut u8, _len: usize) {}

    /// Whether `ptr` points into device memory.
    fn is_device(&self, _ptr: *const u8, _len: usize) -> bool {
        false
    }

    /// Export the allocation containing `ptr`. Returns the handle and the
    /// offset of `ptr` within that allocation.
    fn export_handle(&self, _ptr: *const u8, _len: usize) -> Option<(IpcHandle, u32)> {
        None
    }

    /// Open a handle exported by process `pid`.
    fn import_handle(&self, _pid: u32, _handle: &[u8]) -> Option<ImportId> {
        None
    }

    fn release_handle(&self, _id: ImportId) {}

    /// Copy `dst.len()` bytes starting `offset` bytes into an imported allocation.
    fn copy_from_import(&self, _id: ImportId, _offset: u32, _dst: &mut [u8]) -> bool {
        false
    }

    /// Stage device memory into a host buffer.
    fn copy_to_host(&self, _ptr: *const u8, _dst: &mut [u8]) -> bool {
        false
    }

    /// Index of the local device, announced to peers at connect time.
    fn device_index(&self) -> u32 {
        0
    }

    /// Whether the local device can reach device `peer_gpu` directly.
    fn peer_to_peer(&self, _peer_gpu: u32) -> bool {
        true
    }
}

/// Device capability shared by an endpoint and its segment.
pub type SharedDevice = Arc<dyn DeviceIpc + Send + Sync>;

/// Host-only capability: nothing is device memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDevice;

impl DeviceIpc for NoDevice {}

/// Bounded cache of imported IPC handles, evicting the least recently used.
pub struct MemhandleCache {
    capacity: usize,
    entries: HashMap<(EpId, IpcHandle), ImportId>,
    order: VecDeque<(EpId, IpcHandle)>,
}

/// Result of a cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(ImportId),
    Miss(ImportId),
}

impl CacheLookup {
    pub fn id(self) -> ImportId {
        match self {
            Self::Hit(id) | Self::Miss(id) => id,
        }
    }
}

impl MemhandleCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return a cached import or open a new one through `device`.
    pub fn get_or_import(
        &mut self,
        device: &dyn DeviceIpc,
        peer: EpId,
        pid: u32,
        handle: &[u8],
    ) -> Option<CacheLookup> {
        let key = (peer, handle.to_vec());
        if let Some(id) = self.entries.get(&key).copied() {
            if let Some(pos) = self.order.iter().position(|k| *k == key) {
                let k = self.order.remove(pos);
                self.order.extend(k);
            }
            return Some(CacheLookup::Hit(id));
        }

        let id = device.import_handle(pid, handle)?;
        if self.entries.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                if let Some(old_id) = self.entries.remove(&old) {
                    tracing::trace!(peer = %old.0, "evicting imported handle");
                    device.release_handle(old_id);
                }
            }
        }
        self.entries.insert(key.clone(), id);
        self.order.push_back(key);
        Some(CacheLookup::Miss(id))
    }

    /// Release every import that came from `peer`.
    pub fn purge_peer(&mut self, device: &dyn DeviceIpc, peer: EpId) {
        self.order.retain(|k| k.0 != peer);
        self.entries.retain(|k, id| {
            if k.0 == peer {
                device.release_handle(*id);
                false
            } else {
                true
            }
        });
    }

    /// Release everything.
    pub fn clear(&mut self, device: &dyn DeviceIpc) {
        for (_, id) in self.entries.drain() {
            device.release_handle(id);
        }
        self.order.clear();
    }
}
