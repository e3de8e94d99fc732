//! RDMA transport capability
//!
//! The channels only need a small slice of verbs: register memory, post
//! sends and receives against registered memory, and drain completion
//! queues without blocking. [`RdmaTransport`] is that slice; a hardware
//! binding and [`crate::loopback::LoopbackTransport`] both implement it.

use fabric_common::{Classify, ErrorClass};

/// Queue pair handle
pub type QpId = u32;

/// Completion queue handle
pub type CqId = u32;

/// Keys returned by memory registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryKeys {
    /// Key for local work requests
    pub lkey: u32,
    /// Key a peer would use for one-sided access
    pub rkey: u32,
}

/// One scatter entry plus its id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkRequest {
    pub wr_id: u64,
    pub addr: u64,
    pub len: u32,
    pub lkey: u32,
}

/// Side of the queue pair a completion belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionKind {
    Send,
    Recv,
}

/// Work completion status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionStatus {
    Success,
    /// Peer had no receive posted
    ReceiverNotReady,
    /// Address range not covered by the key
    LocalProtection,
    /// Receive buffer shorter than the message
    LocalLength,
    /// Peer rejected the request
    RemoteInvalidRequest,
}

/// Drained work completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub wr_id: u64,
    pub status: CompletionStatus,
    pub kind: CompletionKind,
    /// Bytes landed (receives) or sent (sends)
    pub byte_len: u32,
    /// Queue pair the request was posted on
    pub qp: QpId,
}

impl Completion {
    #[inline]
    pub fn is_success(&self) -> bool {
        self.status == CompletionStatus::Success
    }
}

/// Errors raised at post time; failures of posted work come back as
/// completions instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("unknown queue pair {0}")]
    UnknownQp(QpId),

    #[error("unknown completion queue {0}")]
    UnknownCq(CqId),

    #[error("queue pair {0} is not connected")]
    NotConnected(QpId),

    #[error("unknown memory key {0}")]
    UnknownKey(u32),

    #[error("memory registration failed: {0}")]
    Registration(String),
}

impl Classify for TransportError {
    fn class(&self) -> ErrorClass {
        match self {
            TransportError::Registration(_) => ErrorClass::Fatal,
            _ => ErrorClass::Invalid,
        }
    }
}

/// Verbs subset used by channels
pub trait RdmaTransport: Send + Sync {
    /// Register `[addr, addr + len)` for local and remote access.
    ///
    /// # Safety
    ///
    /// The range must be valid, writable memory for as long as it stays
    /// registered; the transport reads and writes it from any thread.
    unsafe fn register_memory(&self, addr: u64, len: u64) -> Result<MemoryKeys, TransportError>;

    /// Drop a registration
    fn deregister_memory(&self, lkey: u32) -> Result<(), TransportError>;

    /// Post a send; `dest` overrides the connected peer
    fn post_send(&self, qp: QpId, dest: Option<QpId>, wr: WorkRequest) -> Result<(), TransportError>;

    /// Post several sends in order
    fn post_send_batch(&self, qp: QpId, dest: Option<QpId>, wrs: &[WorkRequest]) -> Result<(), TransportError> {
        for wr in wrs {
            self.post_send(qp, dest, *wr)?;
        }
        Ok(())
    }

    /// Post a receive buffer
    fn post_recv(&self, qp: QpId, wr: WorkRequest) -> Result<(), TransportError>;

    /// Post several receives in order
    fn post_recv_batch(&self, qp: QpId, wrs: &[WorkRequest]) -> Result<(), TransportError> {
        for wr in wrs {
            self.post_recv(qp, *wr)?;
        }
        Ok(())
    }

    /// Drain up to `max` completions; never blocks
    fn poll_completions(&self, cq: CqId, max: usize) -> Vec<Completion>;
}
