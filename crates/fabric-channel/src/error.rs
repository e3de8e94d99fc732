//! Channel error types

use fabric_common::{Classify, ErrorClass};
use fabric_memory::MemoryError;
use fabric_structures::TableError;

use crate::transport::{CompletionStatus, TransportError};
use crate::wr_id::{MessageType, UnknownMessageType};

/// Errors from channels, data channels and completion handling
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("no free slot in channel of capacity {capacity}")]
    NoFreeSlot { capacity: u32 },

    #[error("no outstanding entry for wr_id {0:#018x}")]
    UnknownWrId(u64),

    #[error("no outstanding packet {0}")]
    UnknownPacket(u32),

    #[error("transfer {0} already in flight")]
    DuplicateTransfer(u32),

    #[error("packet id {0} already in flight")]
    DuplicatePacket(u32),

    #[error("payload of {len} bytes exceeds message size {max}")]
    PayloadTooLarge { len: usize, max: u32 },

    #[error("invalid transfer: {0}")]
    InvalidTransfer(String),

    #[error("operation needs an {0} channel")]
    WrongDirection(&'static str),

    #[error("work request {wr_id:#018x} completed with {status:?}")]
    CompletionFailed { wr_id: u64, status: CompletionStatus },

    #[error("no handler for {0} completions on queue pair {1}")]
    NoHandler(MessageType, u32),

    #[error(transparent)]
    UnknownMessageType(#[from] UnknownMessageType),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("memory: {0}")]
    Memory(#[from] MemoryError),

    #[error("table: {0}")]
    Table(#[from] TableError),
}

impl Classify for ChannelError {
    fn class(&self) -> ErrorClass {
        match self {
            ChannelError::NoFreeSlot { .. } => ErrorClass::Recoverable,
            ChannelError::UnknownWrId(_)
            | ChannelError::UnknownPacket(_)
            | ChannelError::NoHandler(..)
            | ChannelError::UnknownMessageType(_) => ErrorClass::Miss,
            ChannelError::DuplicateTransfer(_)
            | ChannelError::DuplicatePacket(_)
            | ChannelError::PayloadTooLarge { .. }
            | ChannelError::InvalidTransfer(_)
            | ChannelError::WrongDirection(_) => ErrorClass::Invalid,
            ChannelError::CompletionFailed { .. } | ChannelError::Protocol(_) => ErrorClass::Fatal,
            ChannelError::Transport(e) => e.class(),
            ChannelError::Memory(e) => e.class(),
            ChannelError::Table(e) => e.class(),
        }
    }
}

pub type ChannelResult<T> = Result<T, ChannelError>;
