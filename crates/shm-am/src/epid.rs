use std::fmt;

/// Endpoint identifier.
///
/// The top 16 bits name the node; two endpoints can talk through shared
/// memory only when they share a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EpId(pub u64);

impl EpId {
    pub const fn new(node: u16, local: u64) -> Self {
        Self((node as u64) << 48 | (local & 0xffff_ffff_ffff))
    }

    pub const fn node(self) -> u16 {
        (self.0 >> 48) as u16
    }

    /// Whether `self` may open a shared-memory connection to `peer`.
    pub fn can_reach(self, peer: EpId) -> bool {
        self != peer && self.node() == peer.node()
    }
}

impl fmt::Display for EpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
