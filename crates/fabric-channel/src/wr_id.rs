//! Work-request id layout
//!
//! Every posted send and receive carries a 64-bit id that the completion
//! path decodes to find the owning channel entry:
//!
//! ```text
//!  63        56 55                       32 31                         0
//! ┌────────────┬───────────────────────────┬────────────────────────────┐
//! │ msg type 8 │     channel count 24      │        sender id 32        │
//! └────────────┴───────────────────────────┴────────────────────────────┘
//! ```
//!
//! Control channels use a second layout: the upper 32 bits carry a channel
//! id `[type:2][ib_device:8][unused:2][endpoint:20]` and the lower 32 bits a
//! ring-buffer insertion index.

use std::fmt;

pub const MESSAGE_TYPE_BITS: u32 = 8;
pub const CHANNEL_COUNT_BITS: u32 = 24;
pub const SENDER_ID_BITS: u32 = 32;

const MESSAGE_TYPE_SHIFT: u32 = SENDER_ID_BITS + CHANNEL_COUNT_BITS;
const CHANNEL_COUNT_SHIFT: u32 = SENDER_ID_BITS;

/// Channel counts wrap at this value
pub const CHANNEL_COUNT_MASK: u32 = (1 << CHANNEL_COUNT_BITS) - 1;

/// Data-packet field widths
pub const PACKET_ID_BITS: u32 = 24;
pub const TRANSFER_START_ID_BITS: u32 = 24;
pub const PACKET_BYTES_BITS: u32 = 16;

/// Message type of a work request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageType {
    DataRequest = 0,
    DataResponse = 1,
    DataPacket = 2,
    BidOrder = 3,
    BidMatch = 4,
    BidCancel = 5,
    BidQuery = 6,
    BidQueryResponse = 7,
    OfferOrder = 8,
    OfferCancel = 9,
    OfferQuery = 10,
    OfferQueryResponse = 11,
    FutureOrder = 12,
    FutureCancel = 13,
    FutureQuery = 14,
    FutureQueryResponse = 15,
    SchedRequest = 16,
    SchedResponse = 17,
    SchedCancel = 18,
    Heartbeat = 19,
    PeerJoin = 20,
    PeerDelete = 21,
    Pause = 22,
    Shutdown = 23,
}

impl MessageType {
    pub const ALL: [MessageType; 24] = [
        MessageType::DataRequest,
        MessageType::DataResponse,
        MessageType::DataPacket,
        MessageType::BidOrder,
        MessageType::BidMatch,
        MessageType::BidCancel,
        MessageType::BidQuery,
        MessageType::BidQueryResponse,
        MessageType::OfferOrder,
        MessageType::OfferCancel,
        MessageType::OfferQuery,
        MessageType::OfferQueryResponse,
        MessageType::FutureOrder,
        MessageType::FutureCancel,
        MessageType::FutureQuery,
        MessageType::FutureQueryResponse,
        MessageType::SchedRequest,
        MessageType::SchedResponse,
        MessageType::SchedCancel,
        MessageType::Heartbeat,
        MessageType::PeerJoin,
        MessageType::PeerDelete,
        MessageType::Pause,
        MessageType::Shutdown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::DataRequest => "DATA_REQUEST",
            MessageType::DataResponse => "DATA_RESPONSE",
            MessageType::DataPacket => "DATA_PACKET",
            MessageType::BidOrder => "BID_ORDER",
            MessageType::BidMatch => "BID_MATCH",
            MessageType::BidCancel => "BID_CANCEL",
            MessageType::BidQuery => "BID_QUERY",
            MessageType::BidQueryResponse => "BID_QUERY_RESPONSE",
            MessageType::OfferOrder => "OFFER_ORDER",
            MessageType::OfferCancel => "OFFER_CANCEL",
            MessageType::OfferQuery => "OFFER_QUERY",
            MessageType::OfferQueryResponse => "OFFER_QUERY_RESPONSE",
            MessageType::FutureOrder => "FUTURE_ORDER",
            MessageType::FutureCancel => "FUTURE_CANCEL",
            MessageType::FutureQuery => "FUTURE_QUERY",
            MessageType::FutureQueryResponse => "FUTURE_QUERY_RESPONSE",
            MessageType::SchedRequest => "SCHED_REQUEST",
            MessageType::SchedResponse => "SCHED_RESPONSE",
            MessageType::SchedCancel => "SCHED_CANCEL",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::PeerJoin => "PEER_JOIN",
            MessageType::PeerDelete => "PEER_DELETE",
            MessageType::Pause => "PAUSE",
            MessageType::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A type byte outside the known message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown message type {0}")]
pub struct UnknownMessageType(pub u8);

impl TryFrom<u8> for MessageType {
    type Error = UnknownMessageType;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        MessageType::ALL
            .get(value as usize)
            .copied()
            .ok_or(UnknownMessageType(value))
    }
}

/// Pack sender, count and type; the count is truncated to 24 bits
#[inline(always)]
pub const fn encode_wr_id(sender_id: u32, channel_count: u32, message_type: MessageType) -> u64 {
    ((message_type as u64) << MESSAGE_TYPE_SHIFT)
        | (((channel_count & CHANNEL_COUNT_MASK) as u64) << CHANNEL_COUNT_SHIFT)
        | sender_id as u64
}

/// Sender id and message type of `wr_id`
#[inline]
pub fn decode_wr_id(wr_id: u64) -> Result<(u32, MessageType), UnknownMessageType> {
    let message_type = MessageType::try_from(decode_message_type_byte(wr_id))?;
    Ok((decode_sender_id(wr_id), message_type))
}

#[inline(always)]
pub const fn decode_message_type_byte(wr_id: u64) -> u8 {
    (wr_id >> MESSAGE_TYPE_SHIFT) as u8
}

#[inline(always)]
pub const fn decode_sender_id(wr_id: u64) -> u32 {
    wr_id as u32
}

/// Channel count of `wr_id`; for data packets this is the packet id
#[inline(always)]
pub const fn decode_packet_id(wr_id: u64) -> u32 {
    ((wr_id << MESSAGE_TYPE_BITS) >> (MESSAGE_TYPE_BITS + SENDER_ID_BITS)) as u32
}

/// Control channel kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CtrlChannelType {
    Send = 0,
    Recv = 1,
    SharedRecv = 2,
}

impl CtrlChannelType {
    #[inline]
    pub fn is_recv(&self) -> bool {
        matches!(self, CtrlChannelType::Recv | CtrlChannelType::SharedRecv)
    }
}

const CTRL_TYPE_BITS: u32 = 2;
const IB_DEVICE_BITS: u32 = 8;
const ENDPOINT_BITS: u32 = 20;
const CTRL_TYPE_SHIFT: u32 = 32 - CTRL_TYPE_BITS;
const IB_DEVICE_SHIFT: u32 = CTRL_TYPE_SHIFT - IB_DEVICE_BITS;

/// Largest endpoint id a control channel id can carry
pub const MAX_ENDPOINT_ID: u32 = (1 << ENDPOINT_BITS) - 1;

/// Control channel id fields out of range
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CtrlIdError {
    #[error("endpoint id {0} does not fit in 20 bits")]
    EndpointTooLarge(u32),

    #[error("unknown control channel type {0}")]
    UnknownType(u8),
}

/// Pack `[type:2][ib_device:8][unused:2][endpoint:20]`
pub fn encode_ctrl_channel_id(
    channel_type: CtrlChannelType,
    ib_device_id: u8,
    endpoint_id: u32,
) -> Result<u32, CtrlIdError> {
    if endpoint_id > MAX_ENDPOINT_ID {
        return Err(CtrlIdError::EndpointTooLarge(endpoint_id));
    }
    Ok(((channel_type as u32) << CTRL_TYPE_SHIFT) | ((ib_device_id as u32) << IB_DEVICE_SHIFT) | endpoint_id)
}

/// Inverse of [`encode_ctrl_channel_id`]
pub fn decode_ctrl_channel_id(channel_id: u32) -> Result<(CtrlChannelType, u8, u32), CtrlIdError> {
    let channel_type = match (channel_id >> CTRL_TYPE_SHIFT) as u8 {
        0 => CtrlChannelType::Send,
        1 => CtrlChannelType::Recv,
        2 => CtrlChannelType::SharedRecv,
        other => return Err(CtrlIdError::UnknownType(other)),
    };
    let ib_device_id = (channel_id >> IB_DEVICE_SHIFT) as u8;
    let endpoint_id = channel_id & MAX_ENDPOINT_ID;
    Ok((channel_type, ib_device_id, endpoint_id))
}

/// Control wr_id: channel id above, ring index below
#[inline(always)]
pub const fn encode_ctrl_wr_id(channel_id: u32, ring_index: u32) -> u64 {
    ((channel_id as u64) << 32) | ring_index as u64
}

/// `(channel_id, ring_index)`
#[inline(always)]
pub const fn decode_ctrl_wr_id(wr_id: u64) -> (u32, u32) {
    ((wr_id >> 32) as u32, wr_id as u32)
}
