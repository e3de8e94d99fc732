//! Fabric Channel - Messaging over an RDMA-style transport
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  post_send / post_recv   ┌──────────────────┐
//! │   Channel    │─────────────────────────►│  RdmaTransport   │
//! │ DataChannel  │                          │ (verbs/loopback) │
//! └──────▲───────┘                          └────────┬─────────┘
//!        │ extract / ack                             │ completions
//! ┌──────┴────────────┐   route by (qp, kind, type)  │
//! │ MessageDispatcher │◄─────── CompletionPoller ◄───┘
//! └───────────────────┘
//! ```
//!
//! Every work request id carries its message type, a 24-bit channel count
//! and the sender id (see [`wr_id`]), which is all the completion path needs
//! to find the owning slot or packet.

#![warn(clippy::all)]

pub mod channel;
pub mod data_channel;
pub mod error;
pub mod loopback;
pub mod poller;
pub mod stats;
pub mod transport;
pub mod wr_id;

pub use channel::{Channel, ChannelOptions, ChannelReservation, Direction};
pub use data_channel::{DataChannel, DataPacket, Transfer, TransferComplete};
pub use error::{ChannelError, ChannelResult};
pub use loopback::LoopbackTransport;
pub use poller::{
    ChannelHandler, CompletionHandler, CompletionPoller, Delivery, MessageDispatcher, PollStrategy, PollerError,
    TransferHandler,
};
pub use stats::{ChannelStatsSnapshot, PollerStatsSnapshot};
pub use transport::{
    Completion, CompletionKind, CompletionStatus, CqId, MemoryKeys, QpId, RdmaTransport, TransportError,
    WorkRequest,
};
pub use wr_id::{decode_packet_id, decode_wr_id, encode_wr_id, MessageType};
