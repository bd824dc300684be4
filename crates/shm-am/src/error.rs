//! Error types for the transport.

use std::fmt;
use std::io;

use crate::EpId;

/// Errors from validating a segment header or computing a queue layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// Invalid magic bytes.
    InvalidMagic,
    /// Incompatible protocol version.
    IncompatibleVersion { expected: u32, found: u32 },
    /// Segment smaller than its header.
    SegmentTooSmall { required: usize, found: usize },
    /// Derived queue layout does not match the mapped size.
    SizeMismatch { computed: usize, mapped: usize },
    /// Invalid configuration in header.
    InvalidConfig(&'static str),
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMagic => write!(f, "invalid magic bytes"),
            Self::IncompatibleVersion { expected, found } => {
                write!(
                    f,
                    "incompatible version: expected {}.{}, found {}.{}",
                    expected >> 16,
                    expected & 0xffff,
                    found >> 16,
                    found & 0xffff
                )
            }
            Self::SegmentTooSmall { required, found } => {
                write!(f, "segment too small: need {} bytes, have {}", required, found)
            }
            Self::SizeMismatch { computed, mapped } => {
                write!(
                    f,
                    "queue layout is {} bytes but segment maps {}",
                    computed, mapped
                )
            }
            Self::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for LayoutError {}

/// Errors from creating, mapping or detaching shared-memory segments.
#[derive(Debug)]
pub enum SegmentError {
    /// I/O error from a system call.
    Io(io::Error),
    /// Every name in the candidate range is taken by another user.
    ResourceExhausted,
    /// `ftruncate` or `mmap` failed.
    MapFailed(io::Error),
    /// The peer has not published a segment.
    Unreachable(EpId),
    /// The peer's segment never became ready.
    Timeout(EpId),
    /// The mapped segment is not what its header claims.
    Fault(&'static str),
    /// Header or layout validation failed.
    Layout(LayoutError),
}

impl fmt::Display for SegmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::ResourceExhausted => write!(f, "shared memory namespace exhausted"),
            Self::MapFailed(e) => write!(f, "failed to map segment: {}", e),
            Self::Unreachable(epid) => write!(f, "no segment published for {}", epid),
            Self::Timeout(epid) => write!(f, "segment of {} never became ready", epid),
            Self::Fault(msg) => write!(f, "segment fault: {}", msg),
            Self::Layout(e) => write!(f, "layout error: {}", e),
        }
    }
}

impl std::error::Error for SegmentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) | Self::MapFailed(e) => Some(e),
            Self::Layout(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LayoutError> for SegmentError {
    fn from(e: LayoutError) -> Self {
        Self::Layout(e)
    }
}

/// Errors surfaced by the transport.
#[derive(Debug)]
pub enum AmError {
    /// Out of names, slots or table entries.
    ResourceExhausted,
    /// A peer's segment became invalid or does not match its header.
    SegmentFault(&'static str),
    /// The peer is self, on another node, or has no segment.
    Unreachable(EpId),
    /// The peer speaks an incompatible protocol version.
    InvalidVersion { peer: EpId, found: u32 },
    /// The operation did not finish before its deadline.
    Timeout,
    /// Shared state is corrupt; the endpoint must not continue.
    InternalProtocol(String),
    /// Caller passed arguments outside the transport limits.
    InvalidArgument(&'static str),
    /// An allocation failed.
    NoMemory,
    /// Segment lifecycle error.
    Segment(SegmentError),
}

impl AmError {
    /// Returns true for invariant violations that leave shared memory in an
    /// unknown state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InternalProtocol(_))
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(%msg, "internal protocol error");
        Self::InternalProtocol(msg)
    }
}

impl fmt::Display for AmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceExhausted => write!(f, "resource exhausted"),
            Self::SegmentFault(msg) => write!(f, "segment fault: {}", msg),
            Self::Unreachable(epid) => write!(f, "endpoint {} is unreachable", epid),
            Self::InvalidVersion { peer, found } => write!(
                f,
                "endpoint {} has unsupported version {}.{}",
                peer,
                found >> 16,
                found & 0xffff
            ),
            Self::Timeout => write!(f, "operation timed out"),
            Self::InternalProtocol(msg) => write!(f, "internal protocol error: {}", msg),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Self::NoMemory => write!(f, "out of memory"),
            Self::Segment(e) => write!(f, "segment error: {}", e),
        }
    }
}

impl std::error::Error for AmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Segment(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SegmentError> for AmError {
    fn from(e: SegmentError) -> Self {
        match e {
            SegmentError::ResourceExhausted => Self::ResourceExhausted,
            SegmentError::Unreachable(epid) => Self::Unreachable(epid),
            SegmentError::Timeout(_) => Self::Timeout,
            SegmentError::Fault(msg) => Self::SegmentFault(msg),
            SegmentError::Layout(LayoutError::SizeMismatch { computed, mapped }) => {
                Self::protocol(format!(
                    "queue directory is {} bytes, segment is {}",
                    computed, mapped
                ))
            }
            other => Self::Segment(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_mismatch_is_fatal() {
        let err: AmError = SegmentError::Layout(LayoutError::SizeMismatch {
            computed: 10,
            mapped: 20,
        })
        .into();
        assert!(err.is_fatal());
        assert!(matches!(err, AmError::InternalProtocol(_)));
    }

    #[test]
    fn test_segment_errors_map_to_transport_errors() {
        let peer = EpId(7);
        assert!(matches!(
            AmError::from(SegmentError::Unreachable(peer)),
            AmError::Unreachable(p) if p == peer
        ));
        assert!(matches!(
            AmError::from(SegmentError::Timeout(peer)),
            AmError::Timeout
        ));
        assert!(!AmError::from(SegmentError::ResourceExhausted).is_fatal());
    }

    #[test]
    fn test_version_display() {
        let err = LayoutError::IncompatibleVersion {
            expected: 1 << 16,
            found: 2 << 16 | 3,
        };
        assert_eq!(
            err.to_string(),
            "incompatible version: expected 1.0, found 2.3"
        );
    }
}
