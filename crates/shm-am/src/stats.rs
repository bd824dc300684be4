//! Per-endpoint counters.

/// Transfer counters of one [`AmPtl`](crate::AmPtl).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AmStats {
    /// Messages handed to the transport (eager, rendezvous and user AM).
    pub tx_num: u64,
    /// Packets written into peer queues.
    pub tx_shm_num: u64,
    /// Payload bytes written into peer queues.
    pub tx_shm_bytes: u64,
    pub tx_eager_num: u64,
    pub tx_eager_bytes: u64,
    pub tx_rndv_num: u64,
    /// Bytes moved by rendezvous, whatever the copy mechanism.
    pub tx_rndv_bytes: u64,
    /// Rendezvous receives completed by pulling from the sender.
    pub rx_rndv_pull_num: u64,
    /// Kernel-assisted copies that failed and fell back.
    pub kassist_fallbacks: u64,
    pub memcache_hits: u64,
    pub memcache_misses: u64,
}

impl AmStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of IPC imports served from the cache.
    pub fn memcache_hit_ratio(&self) -> f64 {
        let total = self.memcache_hits + self.memcache_misses;
        if total == 0 {
            0.0
        } else {
            self.memcache_hits as f64 / total as f64
        }
    }
}
