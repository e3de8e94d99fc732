//! Fabric Exchange - Where results meet the nodes that need them
//!
//! Nodes post three kinds of orders against a content fingerprint:
//!
//! - **future**: "I will compute this"
//! - **offer**: "I hold this" (retires the node's future)
//! - **bid**: "I need this"
//!
//! A bid and an offer on the same fingerprint produce [`FingerprintMatch`]
//! notifications; the bidder then pulls the bytes over a data channel and
//! confirms with an offer-confirm order, becoming an offer location itself.
//!
//! Each [`Exchange`] owns a contiguous range of fingerprint shard keys.

#![warn(clippy::all)]

pub mod error;
pub mod exchange;
pub mod order;

pub use error::{ExchangeError, ExchangeResult};
pub use exchange::{match_notifications, Exchange, ExchangeItemKind, ExchangeStatsSnapshot, ItemSnapshot};
pub use order::{ExchangeOrder, FingerprintMatch, OrderKind};
