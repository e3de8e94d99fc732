//! Exchange error types

use fabric_common::{Classify, ErrorClass, Fingerprint};

use crate::exchange::ExchangeItemKind;

/// Errors from posting, cancelling and decoding exchange orders
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    #[error("{fingerprint} is outside shard [{start:#x}, {end:#x}]")]
    NotOwner { fingerprint: Fingerprint, start: u64, end: u64 },

    #[error("no {kind} entry for {fingerprint} from node {node_id}")]
    NotFound {
        kind: ExchangeItemKind,
        fingerprint: Fingerprint,
        node_id: u32,
    },

    #[error("{kind} table full ({max} entries)")]
    Full { kind: ExchangeItemKind, max: u64 },

    #[error("unknown order kind {0}")]
    UnknownOrderKind(u8),

    #[error("truncated message: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("match notification lists {0} nodes")]
    TooManyNodes(usize),
}

impl Classify for ExchangeError {
    fn class(&self) -> ErrorClass {
        match self {
            ExchangeError::NotFound { .. } => ErrorClass::Miss,
            ExchangeError::Full { .. } => ErrorClass::Recoverable,
            ExchangeError::NotOwner { .. }
            | ExchangeError::UnknownOrderKind(_)
            | ExchangeError::Truncated { .. }
            | ExchangeError::TooManyNodes(_) => ErrorClass::Invalid,
        }
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;
