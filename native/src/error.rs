// Error types shared by the queue, the control channel and the segment pool.

use thiserror::Error;

use crate::ipc::protocol::MessageKind;

#[derive(Error, Debug)]
pub enum CommError {
    #[error("Segment pool exhausted ({0} segments in use)")]
    Exhausted(usize),
    #[error("Peer closed the channel after {transferred} of {expected} bytes")]
    PeerGone { transferred: usize, expected: usize },
    #[error("Broken pipe: peer is departing")]
    BrokenPipe,
    #[error("Unknown message discriminant {0}")]
    UnknownDiscriminant(u32),
    #[error("Unexpected message kind: expected {expected:?}, got {actual:?}")]
    UnexpectedKind {
        expected: MessageKind,
        actual: MessageKind,
    },
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Invalid queue slot kind {0}")]
    InvalidSlotKind(i32),
    #[error("Queue cursors out of range (low={low}, high={high})")]
    CorruptQueue { low: i32, high: i32 },
    #[error("Operation cancelled by termination request")]
    Cancelled,
    #[error("Channel failed earlier, no further requests possible")]
    ChannelFailed,
    #[error("Payload of {needed} bytes does not fit segment {id} ({capacity} bytes)")]
    SegmentTooSmall {
        id: i32,
        needed: usize,
        capacity: usize,
    },
    #[error("Shared object not found: {0}")]
    NotFound(String),
    #[error("Channel bootstrap failed: {0}")]
    Bootstrap(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("OS error: {0}")]
    Os(#[from] nix::errno::Errno),
}

impl CommError {
    /// True for failures that mean the peer broke the protocol, as opposed to
    /// the peer simply going away or a local resource running out.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            CommError::UnknownDiscriminant(_)
                | CommError::UnexpectedKind { .. }
                | CommError::Malformed(_)
                | CommError::InvalidSlotKind(_)
                | CommError::CorruptQueue { .. }
        )
    }
}

pub type CommResult<T> = Result<T, CommError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_protocol_violations() {
        assert!(CommError::UnknownDiscriminant(99).is_protocol_violation());
        assert!(CommError::InvalidSlotKind(7).is_protocol_violation());
        assert!(!CommError::BrokenPipe.is_protocol_violation());
        assert!(!CommError::Exhausted(4).is_protocol_violation());
    }
}
