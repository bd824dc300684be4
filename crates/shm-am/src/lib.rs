//! Intra-node shared-memory Active-Message transport.
//!
//! Every endpoint publishes one POSIX shared-memory segment holding a
//! request channel and a reply channel, each made of a short-packet queue
//! and a bulk queue. Peers map each other's segments and write packets
//! straight into them; the owner drains its own queues from
//! [`AmPtl::poll`].
//!
//! # Layers
//!
//! - [`segment`]: naming, creation, mapping and teardown of segments.
//! - [`layout`] and [`queue`]: the header and the four queues inside a segment.
//! - [`packet`]: short packets and bulk slots as they sit in the queues.
//! - [`directory`]: per-peer state indexed by `shmidx`.
//! - [`AmPtl`]: the endpoint. It runs the connection handshake, dispatches
//!   inbound packets to handlers, moves matched-queue messages (eager or
//!   rendezvous) and retries sends that found a full queue.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use shm_am::{AmConfig, AmPtl, EpId, MatchedQueue};
//!
//! fn run<M: MatchedQueue>(mq: M, peer: EpId) -> Result<(), shm_am::AmError> {
//!     let mut ptl = AmPtl::new(EpId::new(0, 1), AmConfig::from_env(), mq)?;
//!     for result in ptl.connect(&[peer], Duration::from_secs(5))? {
//!         result?;
//!     }
//!     ptl.poll()?;
//!     ptl.fini(Duration::from_secs(1))
//! }
//! ```

pub mod config;
pub mod deferred;
pub mod directory;
pub mod error;
pub mod gpu;
pub mod kassist;
pub mod layout;
pub mod mq;
pub mod packet;
pub mod queue;
pub mod segment;
pub mod stats;

mod connect;
mod dispatch;
mod epid;
mod ptl;
mod rendezvous;
mod send;

pub use config::{AmConfig, KassistMode};
pub use connect::{ConnOp, ConnectionBatch};
pub use directory::{IncomingState, OutgoingState};
pub use epid::EpId;
pub use error::{AmError, LayoutError, SegmentError};
pub use gpu::{DeviceIpc, ImportId, IpcHandle, NoDevice, SharedDevice};
pub use kassist::{CrossMemoryAttach, KernelCopy};
pub use mq::{Completion, MatchedQueue, RecvTarget, RequestId, RtsToken, Tag};
pub use ptl::{
    AmHandler, AmParameters, AmPtl, AmReply, AmToken, HandlerId, MAX_USER_ARGS,
    MAX_USER_HANDLERS, SendFlags,
};
pub use stats::AmStats;

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use crate::mq::{Completion, MatchedQueue, RecvTarget, RequestId, RtsToken, Tag};
    use crate::{AmConfig, EpId, KassistMode};

    static NEXT: AtomicU64 = AtomicU64::new(1);

    /// Small queues under a prefix no other test uses.
    pub fn test_config() -> AmConfig {
        AmConfig {
            prefix: format!(
                "shm_am_unit_{}_{}",
                std::process::id(),
                NEXT.fetch_add(1, Ordering::Relaxed)
            ),
            short_q_depth: 16,
            long_q_depth: 8,
            long_elem_size: 1024,
            kassist_mode: KassistMode::Off,
            init_wait: Duration::from_secs(1),
            detach_wait: Duration::from_millis(10),
            ..AmConfig::default()
        }
    }

    /// Matched queue that ignores everything.
    pub struct NullMq;

    impl MatchedQueue for NullMq {
        fn deliver_envelope(&mut self, _: EpId, _: Tag, _: usize, _: &[u8]) {}

        fn deliver_data(&mut self, _: EpId, _: Tag, _: usize, _: &[u8]) {}

        fn deliver_rts(&mut self, _: EpId, _: Tag, _: usize, _: RtsToken) -> Option<RecvTarget> {
            None
        }

        fn complete_request(&mut self, _: RequestId, _: Completion) {}
    }

    /// Matched queue that keeps completions and drops everything else.
    #[derive(Default)]
    pub struct CompletionLog {
        pub completions: Vec<(RequestId, Completion)>,
    }

    impl MatchedQueue for CompletionLog {
        fn deliver_envelope(&mut self, _: EpId, _: Tag, _: usize, _: &[u8]) {}

        fn deliver_data(&mut self, _: EpId, _: Tag, _: usize, _: &[u8]) {}

        fn deliver_rts(&mut self, _: EpId, _: Tag, _: usize, _: RtsToken) -> Option<RecvTarget> {
            None
        }

        fn complete_request(&mut self, req: RequestId, completion: Completion) {
            self.completions.push((req, completion));
        }
    }
}
