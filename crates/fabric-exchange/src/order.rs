//! Exchange orders and match notifications, plus their control-message
//! encoding.
//!
//! Layouts (little-endian):
//!
//! ```text
//! order:  [kind:1][node_id:4][fingerprint:32]
//! match:  [fingerprint:32][num_nodes:4][node_id:4 * num_nodes]
//! ```
//!
//! Channel slots are zero-padded to the message size, so decoders ignore
//! trailing bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fabric_channel::MessageType;
use fabric_common::config::MAX_FINGERPRINT_MATCH_LOCATIONS;
use fabric_common::{Fingerprint, FINGERPRINT_BYTES};

use crate::error::{ExchangeError, ExchangeResult};

/// Encoded size of an [`ExchangeOrder`]
pub const ORDER_BYTES: usize = 1 + 4 + FINGERPRINT_BYTES;

/// Largest encoded [`FingerprintMatch`]
pub const MATCH_MAX_BYTES: usize = FINGERPRINT_BYTES + 4 + 4 * MAX_FINGERPRINT_MATCH_LOCATIONS;

/// What a node is telling the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OrderKind {
    /// The node needs the object
    Bid = 0,
    /// The node computed the object
    Offer = 1,
    /// The node received the object after a match
    OfferConfirmMatchData = 2,
    /// The node will compute the object
    Future = 3,
}

impl OrderKind {
    /// Control message type this order travels as
    pub fn message_type(&self) -> MessageType {
        match self {
            OrderKind::Bid => MessageType::BidOrder,
            OrderKind::Offer | OrderKind::OfferConfirmMatchData => MessageType::OfferOrder,
            OrderKind::Future => MessageType::FutureOrder,
        }
    }
}

impl TryFrom<u8> for OrderKind {
    type Error = ExchangeError;

    fn try_from(value: u8) -> ExchangeResult<Self> {
        match value {
            0 => Ok(OrderKind::Bid),
            1 => Ok(OrderKind::Offer),
            2 => Ok(OrderKind::OfferConfirmMatchData),
            3 => Ok(OrderKind::Future),
            other => Err(ExchangeError::UnknownOrderKind(other)),
        }
    }
}

/// One order posted by `node_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOrder {
    pub kind: OrderKind,
    pub fingerprint: Fingerprint,
    pub node_id: u32,
}

impl ExchangeOrder {
    pub fn new(kind: OrderKind, fingerprint: Fingerprint, node_id: u32) -> Self {
        Self {
            kind,
            fingerprint,
            node_id,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ORDER_BYTES);
        buf.put_u8(self.kind as u8);
        buf.put_u32_le(self.node_id);
        buf.put_slice(self.fingerprint.as_bytes());
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> ExchangeResult<Self> {
        if buf.len() < ORDER_BYTES {
            return Err(ExchangeError::Truncated {
                need: ORDER_BYTES,
                have: buf.len(),
            });
        }
        let kind = OrderKind::try_from(buf.get_u8())?;
        let node_id = buf.get_u32_le();
        let mut fp = [0u8; FINGERPRINT_BYTES];
        buf.copy_to_slice(&mut fp);
        Ok(Self {
            kind,
            fingerprint: Fingerprint::from_bytes(fp),
            node_id,
        })
    }
}

/// Match notification sent from the exchange (`source`) to `recipient`:
/// `node_ids` hold `fingerprint`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintMatch {
    pub source: u32,
    pub recipient: u32,
    pub fingerprint: Fingerprint,
    pub node_ids: Vec<u32>,
}

impl FingerprintMatch {
    /// Wire body; `source` and `recipient` ride in the work request id and
    /// the channel choice.
    pub fn encode(&self) -> ExchangeResult<Bytes> {
        if self.node_ids.len() > MAX_FINGERPRINT_MATCH_LOCATIONS {
            return Err(ExchangeError::TooManyNodes(self.node_ids.len()));
        }
        let mut buf = BytesMut::with_capacity(FINGERPRINT_BYTES + 4 + 4 * self.node_ids.len());
        buf.put_slice(self.fingerprint.as_bytes());
        buf.put_u32_le(self.node_ids.len() as u32);
        for id in &self.node_ids {
            buf.put_u32_le(*id);
        }
        Ok(buf.freeze())
    }

    pub fn decode(source: u32, recipient: u32, mut buf: &[u8]) -> ExchangeResult<Self> {
        let header = FINGERPRINT_BYTES + 4;
        if buf.len() < header {
            return Err(ExchangeError::Truncated {
                need: header,
                have: buf.len(),
            });
        }
        let mut fp = [0u8; FINGERPRINT_BYTES];
        buf.copy_to_slice(&mut fp);
        let num_nodes = buf.get_u32_le() as usize;
        if num_nodes > MAX_FINGERPRINT_MATCH_LOCATIONS {
            return Err(ExchangeError::TooManyNodes(num_nodes));
        }
        if buf.remaining() < 4 * num_nodes {
            return Err(ExchangeError::Truncated {
                need: header + 4 * num_nodes,
                have: header + buf.remaining(),
            });
        }
        let node_ids = (0..num_nodes).map(|_| buf.get_u32_le()).collect();
        Ok(Self {
            source,
            recipient,
            fingerprint: Fingerprint::from_bytes(fp),
            node_ids,
        })
    }
}
