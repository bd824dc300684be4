//! Sends waiting for a free slot.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::EpId;
use crate::packet::{Args, HandlerIdx};

/// How the payload of a deferred send travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredKind {
    /// One packet, inline or with a bulk slot.
    Short,
    /// Chunked into the receive buffer `dest`, starting at `dest_off`.
    Long { dest: u64, dest_off: u32 },
}

/// One send that found no slot.
#[derive(Debug, Clone)]
pub struct DeferredSend {
    /// Our index of the destination peer.
    pub shmidx: u16,
    /// The peer `shmidx` referred to when the send was built.
    pub epid: EpId,
    pub is_reply: bool,
    pub handler: HandlerIdx,
    pub args: Args,
    pub payload: Bytes,
    pub kind: DeferredKind,
}

/// Strict FIFO of deferred sends.
#[derive(Debug, Default)]
pub struct DeferredQueue {
    entries: VecDeque<DeferredSend>,
}

/// Outcome of replaying one entry.
pub enum Replay {
    /// Fully sent, or dropped because its peer is gone.
    Done,
    /// Still no slot; the remainder must stay at the front.
    Stalled(DeferredSend),
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, send: DeferredSend) {
        tracing::trace!(shmidx = send.shmidx, len = send.payload.len(), "deferring send");
        self.entries.push_back(send);
    }

    /// Replay every entry present when the drain starts, in order.
    ///
    /// Entries added while draining wait for the next drain. On the first
    /// entry that stalls, it and everything after it go back to the front,
    /// ahead of anything added meanwhile. Returns the number of entries
    /// completed.
    pub fn drain(&mut self, mut replay: impl FnMut(DeferredSend) -> Replay) -> usize {
        let mut batch = std::mem::take(&mut self.entries);
        let mut done = 0;
        while let Some(send) = batch.pop_front() {
            match replay(send) {
                Replay::Done => done += 1,
                Replay::Stalled(rest) => {
                    batch.push_front(rest);
                    batch.append(&mut self.entries);
                    self.entries = batch;
                    return done;
                }
            }
        }
        done
    }

    /// Move every entry of `later` behind ours.
    pub fn append(&mut self, later: &mut DeferredQueue) {
        self.entries.append(&mut later.entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send(tag: u64) -> DeferredSend {
        DeferredSend {
            shmidx: 0,
            epid: EpId(1),
            is_reply: false,
            handler: HandlerIdx::Am,
            args: Args::from_slice(&[tag]).unwrap(),
            payload: Bytes::new(),
            kind: DeferredKind::Short,
        }
    }

    #[test]
    fn test_drain_is_fifo() {
        let mut q = DeferredQueue::new();
        for i in 0..5 {
            q.add(send(i));
        }
        let mut seen = Vec::new();
        assert_eq!(
            q.drain(|s| {
                seen.push(s.args.get(0));
                Replay::Done
            }),
            5
        );
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_stall_keeps_order() {
        let mut q = DeferredQueue::new();
        for i in 0..4 {
            q.add(send(i));
        }
        let done = q.drain(|s| {
            if s.args.get(0) == 2 {
                Replay::Stalled(s)
            } else {
                Replay::Done
            }
        });
        assert_eq!(done, 2);
        assert_eq!(q.len(), 2);
        let mut rest = Vec::new();
        q.drain(|s| {
            rest.push(s.args.get(0));
            Replay::Done
        });
        assert_eq!(rest, vec![2, 3]);
    }

    #[test]
    fn test_sends_added_during_drain_wait() {
        let mut q = DeferredQueue::new();
        q.add(send(1));
        q.add(send(2));
        let mut extra = DeferredQueue::new();
        let mut calls = 0;
        q.drain(|s| {
            calls += 1;
            // a handler running during the drain defers more work
            extra.add(send(s.args.get(0) + 10));
            Replay::Done
        });
        assert_eq!(calls, 2);
        assert_eq!(extra.len(), 2);
    }

    #[test]
    fn test_stalled_entries_stay_ahead_of_new_ones() {
        let mut pending = DeferredQueue::new();
        pending.add(send(1));
        pending.add(send(2));
        pending.drain(Replay::Stalled);

        let mut newer = DeferredQueue::new();
        newer.add(send(3));
        pending.append(&mut newer);
        assert!(newer.is_empty());

        let mut order = Vec::new();
        pending.drain(|s| {
            order.push(s.args.get(0));
            Replay::Done
        });
        assert_eq!(order, vec![1, 2, 3]);
    }
}
