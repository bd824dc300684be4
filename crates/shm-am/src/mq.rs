//! Upward interface to the matched-queue engine.
//!
//! The transport never matches tags itself. Eager data is handed to the
//! [`MatchedQueue`] as it arrives; rendezvous announcements are offered through
//! [`MatchedQueue::deliver_rts`] and resumed with
//! [`AmPtl::rts_match`](crate::AmPtl::rts_match) once a receive is posted.

use std::fmt;

use crate::EpId;

/// 96-bit message tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Tag(pub [u32; 3]);

impl Tag {
    pub const fn new(a: u32, b: u32, c: u32) -> Self {
        Self([a, b, c])
    }

    /// First two words packed as they travel in one argument.
    pub(crate) fn head_word(&self) -> u64 {
        (self.0[0] as u64) << 32 | self.0[1] as u64
    }

    pub(crate) fn from_words(head: u64, tail: u32) -> Self {
        Self([(head >> 32) as u32, head as u32, tail])
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}.{:08x}.{:08x}", self.0[0], self.0[1], self.0[2])
    }
}

/// Identifier of a send or receive request, owned by the matched queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// Handle on an unmatched rendezvous announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RtsToken(pub(crate) u64);

/// Where a matched rendezvous should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvTarget {
    /// Receive request completed once the data arrives.
    pub req: RequestId,
    /// Capacity of the posted receive; longer messages are truncated.
    pub len: usize,
}

/// How a request finished.
#[derive(Debug, PartialEq, Eq)]
pub enum Completion {
    /// A send request no longer needs its buffer.
    Sent,
    /// A receive request and the bytes it received.
    Received(Vec<u8>),
    /// The peer went away before the transfer finished.
    Failed,
}

/// The matched-queue collaborator.
pub trait MatchedQueue {
    /// First (or only) chunk of an eager message. `msg_len` is the full length.
    fn deliver_envelope(&mut self, src: EpId, tag: Tag, msg_len: usize, payload: &[u8]);

    /// A later chunk of an eager message, `offset` bytes into it.
    fn deliver_data(&mut self, src: EpId, tag: Tag, offset: usize, payload: &[u8]);

    /// A rendezvous announcement. Return a target to match it now, or `None`
    /// to keep the token and match it later.
    fn deliver_rts(&mut self, src: EpId, tag: Tag, msg_len: usize, token: RtsToken)
    -> Option<RecvTarget>;

    fn complete_request(&mut self, req: RequestId, completion: Completion);
}

impl<T: MatchedQueue + ?Sized> MatchedQueue for Box<T> {
    fn deliver_envelope(&mut self, src: EpId, tag: Tag, msg_len: usize, payload: &[u8]) {
        (**self).deliver_envelope(src, tag, msg_len, payload)
    }

    fn deliver_data(&mut self, src: EpId, tag: Tag, offset: usize, payload: &[u8]) {
        (**self).deliver_data(src, tag, offset, payload)
    }

    fn deliver_rts(
        &mut self,
        src: EpId,
        tag: Tag,
        msg_len: usize,
        token: RtsToken,
    ) -> Option<RecvTarget> {
        (**self).deliver_rts(src, tag, msg_len, token)
    }

    fn complete_request(&mut self, req: RequestId, completion: Completion) {
        (**self).complete_request(req, completion)
    }
}
