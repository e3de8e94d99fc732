//! Ring-buffer message channels
//!
//! A channel owns `capacity` fixed-size slots of registered memory and a
//! fixed-size table from outstanding wr_id to slot. Inbound channels post a
//! receive per slot; outbound channels copy a message into a slot and post
//! a send. When the completion arrives the poller calls
//! [`Channel::extract_channel_item`], which copies the slot out, frees it and
//! (for inbound channels) posts a fresh receive in its place.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use fabric_common::config::ChannelConfig;
use fabric_common::TableConfig;
use fabric_memory::HostRegion;
use fabric_structures::{FastTable, TableError};
use parking_lot::Mutex;

use crate::error::{ChannelError, ChannelResult};
use crate::stats::{ChannelStats, ChannelStatsSnapshot};
use crate::transport::{MemoryKeys, QpId, RdmaTransport, WorkRequest};
use crate::wr_id::{encode_wr_id, MessageType, CHANNEL_COUNT_MASK};

/// Which way messages flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Identity of a channel
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    pub self_id: u32,
    pub peer_id: u32,
    pub message_type: MessageType,
    pub direction: Direction,
    /// Fill every slot with a receive at construction (inbound only)
    pub presubmit_recvs: bool,
}

/// A submitted work request and the slot address it uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelReservation {
    pub wr_id: u64,
    pub addr: u64,
}

#[derive(Debug)]
struct Slots {
    outstanding: FastTable<u64, u32>,
    free: VecDeque<u32>,
}

/// Fixed-capacity message channel over one queue pair
pub struct Channel {
    options: ChannelOptions,
    capacity: u32,
    message_size: u32,
    cnt: AtomicU32,
    region: HostRegion,
    keys: MemoryKeys,
    slots: Mutex<Slots>,
    transport: Arc<dyn RdmaTransport>,
    qp: QpId,
    stats: ChannelStats,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("options", &self.options)
            .field("capacity", &self.capacity)
            .field("message_size", &self.message_size)
            .field("qp", &self.qp)
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Allocate and register the slot buffer, then presubmit receives if asked
    pub fn new(
        options: ChannelOptions,
        config: &ChannelConfig,
        transport: Arc<dyn RdmaTransport>,
        qp: QpId,
    ) -> ChannelResult<Self> {
        if config.capacity == 0 || config.message_size == 0 {
            return Err(ChannelError::InvalidTransfer(
                "channel needs capacity and message_size > 0".into(),
            ));
        }

        let bytes = config.capacity as usize * config.message_size as usize;
        let region = HostRegion::new(bytes)?;
        // SAFETY: the region is owned by the channel and deregistered in Drop
        // before it is freed.
        let keys = unsafe { transport.register_memory(region.addr(), bytes as u64)? };

        let channel = Self {
            options,
            capacity: config.capacity,
            message_size: config.message_size,
            cnt: AtomicU32::new(0),
            region,
            keys,
            slots: Mutex::new(Slots {
                outstanding: FastTable::new(TableConfig::fixed(config.capacity as u64))?,
                free: (0..config.capacity).collect(),
            }),
            transport,
            qp,
            stats: ChannelStats::default(),
        };

        if options.direction == Direction::Inbound && options.presubmit_recvs {
            for _ in 0..channel.capacity {
                channel.submit_in_channel_reservation()?;
            }
        }

        tracing::debug!(
            self_id = options.self_id,
            peer_id = options.peer_id,
            message_type = %options.message_type,
            direction = options.direction.as_str(),
            capacity = config.capacity,
            "channel ready"
        );
        Ok(channel)
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn message_size(&self) -> u32 {
        self.message_size
    }

    #[inline]
    pub fn message_type(&self) -> MessageType {
        self.options.message_type
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.options.direction
    }

    #[inline]
    pub fn is_inbound(&self) -> bool {
        self.options.direction == Direction::Inbound
    }

    #[inline]
    pub fn qp(&self) -> QpId {
        self.qp
    }

    /// Work requests posted and not yet extracted
    pub fn outstanding(&self) -> usize {
        self.slots.lock().outstanding.len()
    }

    pub fn stats(&self) -> ChannelStatsSnapshot {
        self.stats.snapshot()
    }

    /// Post a receive for the next message from the peer
    pub fn submit_in_channel_reservation(&self) -> ChannelResult<ChannelReservation> {
        if !self.is_inbound() {
            return Err(ChannelError::WrongDirection(Direction::Inbound.as_str()));
        }

        let wr_id = encode_wr_id(self.options.peer_id, self.next_count(), self.options.message_type);
        let (slot, addr) = self.reserve_slot(wr_id)?;

        let wr = WorkRequest {
            wr_id,
            addr,
            len: self.message_size,
            lkey: self.keys.lkey,
        };
        if let Err(e) = self.transport.post_recv(self.qp, wr) {
            self.release_slot(wr_id, slot);
            return Err(e.into());
        }

        self.stats.record_recv(1);
        Ok(ChannelReservation { wr_id, addr })
    }

    /// Copy `message` into a free slot and post it as a send
    pub fn submit_out_channel_message(&self, message: &[u8]) -> ChannelResult<ChannelReservation> {
        if self.is_inbound() {
            return Err(ChannelError::WrongDirection(Direction::Outbound.as_str()));
        }
        if message.len() > self.message_size as usize {
            return Err(ChannelError::PayloadTooLarge {
                len: message.len(),
                max: self.message_size,
            });
        }

        let wr_id = encode_wr_id(self.options.self_id, self.next_count(), self.options.message_type);
        let (slot, addr) = self.reserve_slot(wr_id)?;

        // SAFETY: the slot was just taken off the free list, so nothing else
        // reads or writes it until this wr_id is extracted.
        unsafe { self.region.write_at(self.slot_offset(slot), message)? };

        let wr = WorkRequest {
            wr_id,
            addr,
            len: self.message_size,
            lkey: self.keys.lkey,
        };
        if let Err(e) = self.transport.post_send(self.qp, None, wr) {
            // SAFETY: as above, the slot is still owned by this call.
            unsafe { self.region.zero(self.slot_offset(slot), self.message_size as usize)? };
            self.release_slot(wr_id, slot);
            return Err(e.into());
        }

        self.stats.record_send(1);
        Ok(ChannelReservation { wr_id, addr })
    }

    /// Take the message held for `wr_id`, free its slot and, when
    /// `replace` is set on an inbound channel, post a new receive.
    pub fn extract_channel_item(&self, wr_id: u64, replace: bool) -> ChannelResult<Bytes> {
        let item = {
            let mut slots = self.slots.lock();
            let slot = slots
                .outstanding
                .remove(&wr_id)
                .ok_or(ChannelError::UnknownWrId(wr_id))?;

            let offset = self.slot_offset(slot);
            let mut item = vec![0u8; self.message_size as usize];
            // SAFETY: the completion for this wr_id has been delivered, so
            // the transport is done with the slot; the lock keeps it off the
            // free list until it is zeroed.
            unsafe {
                self.region.read_at(offset, &mut item)?;
                self.region.zero(offset, item.len())?;
            }
            slots.free.push_back(slot);
            item
        };
        self.stats.record_extract();

        if replace && self.is_inbound() {
            self.submit_in_channel_reservation()?;
        }

        Ok(Bytes::from(item))
    }

    #[inline]
    fn next_count(&self) -> u32 {
        self.cnt.fetch_add(1, Ordering::Relaxed) & CHANNEL_COUNT_MASK
    }

    #[inline]
    fn slot_offset(&self, slot: u32) -> usize {
        slot as usize * self.message_size as usize
    }

    fn reserve_slot(&self, wr_id: u64) -> ChannelResult<(u32, u64)> {
        let mut slots = self.slots.lock();
        let slot = slots.free.pop_front().ok_or(ChannelError::NoFreeSlot {
            capacity: self.capacity,
        })?;
        match slots.outstanding.insert(wr_id, slot) {
            Ok(()) => Ok((slot, self.region.addr() + self.slot_offset(slot) as u64)),
            Err(e) => {
                slots.free.push_front(slot);
                match e {
                    TableError::DuplicateKey => {
                        tracing::error!(wr_id, "wr_id reused while still outstanding");
                        Err(ChannelError::Protocol(format!("wr_id {wr_id:#018x} still outstanding")))
                    }
                    TableError::Full(_) => Err(ChannelError::NoFreeSlot {
                        capacity: self.capacity,
                    }),
                    other => Err(other.into()),
                }
            }
        }
    }

    fn release_slot(&self, wr_id: u64, slot: u32) {
        let mut slots = self.slots.lock();
        slots.outstanding.remove(&wr_id);
        slots.free.push_front(slot);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Err(e) = self.transport.deregister_memory(self.keys.lkey) {
            tracing::warn!(error = %e, lkey = self.keys.lkey, "failed to deregister channel buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackTransport;
    use crate::transport::CompletionKind;
    use crate::wr_id::decode_wr_id;

    struct Link {
        transport: Arc<LoopbackTransport>,
        cq: u32,
        tx: Channel,
        rx: Channel,
    }

    fn link(capacity: u32) -> Link {
        let transport = Arc::new(LoopbackTransport::new());
        let cq = transport.create_cq();
        let a = transport.create_qp(cq).unwrap();
        let b = transport.create_qp(cq).unwrap();
        transport.connect(a, b).unwrap();

        let config = ChannelConfig {
            capacity,
            message_size: 64,
        };
        let tx = Channel::new(
            ChannelOptions {
                self_id: 1,
                peer_id: 2,
                message_type: MessageType::Heartbeat,
                direction: Direction::Outbound,
                presubmit_recvs: false,
            },
            &config,
            transport.clone(),
            a,
        )
        .unwrap();
        let rx = Channel::new(
            ChannelOptions {
                self_id: 2,
                peer_id: 1,
                message_type: MessageType::Heartbeat,
                direction: Direction::Inbound,
                presubmit_recvs: true,
            },
            &config,
            transport.clone(),
            b,
        )
        .unwrap();
        Link { transport, cq, tx, rx }
    }

    #[test]
    fn test_presubmitted_receives_fill_capacity() {
        let l = link(8);
        assert_eq!(l.rx.outstanding(), 8);
        assert_eq!(l.transport.posted_recvs(l.rx.qp()), 8);
        assert_eq!(l.tx.outstanding(), 0);
    }

    #[test]
    fn test_message_round_trip_keeps_capacity() {
        let l = link(4);
        for round in 0..10u8 {
            let sent = l.tx.submit_out_channel_message(&[round; 16]).unwrap();
            assert_eq!(decode_wr_id(sent.wr_id).unwrap(), (1, MessageType::Heartbeat));

            for c in l.transport.poll_completions(l.cq, 8) {
                assert!(c.is_success());
                match c.kind {
                    CompletionKind::Recv => {
                        assert_eq!(decode_wr_id(c.wr_id).unwrap().0, 1);
                        let item = l.rx.extract_channel_item(c.wr_id, true).unwrap();
                        assert_eq!(item.len(), 64);
                        assert_eq!(&item[..16], &[round; 16]);
                        assert!(item[16..].iter().all(|&b| b == 0));
                    }
                    CompletionKind::Send => {
                        l.tx.extract_channel_item(c.wr_id, false).unwrap();
                    }
                }
            }
            assert_eq!(l.rx.outstanding(), 4);
            assert_eq!(l.tx.outstanding(), 0);
        }
        assert_eq!(l.rx.stats().items_extracted, 10);
        assert_eq!(l.rx.stats().recvs_posted, 14);
    }

    #[test]
    fn test_outbound_slots_exhaust() {
        let l = link(2);
        // No receiver drains, but sends still occupy slots until extracted.
        l.tx.submit_out_channel_message(b"a").unwrap();
        l.tx.submit_out_channel_message(b"b").unwrap();
        let err = l.tx.submit_out_channel_message(b"c").unwrap_err();
        assert_eq!(err, ChannelError::NoFreeSlot { capacity: 2 });
        assert!(fabric_common::Classify::is_recoverable(&err));
    }

    #[test]
    fn test_rejections() {
        let l = link(2);
        assert_eq!(
            l.tx.submit_out_channel_message(&[0; 65]).unwrap_err(),
            ChannelError::PayloadTooLarge { len: 65, max: 64 }
        );
        assert!(matches!(
            l.rx.submit_out_channel_message(b"x"),
            Err(ChannelError::WrongDirection(_))
        ));
        assert!(matches!(
            l.tx.submit_in_channel_reservation(),
            Err(ChannelError::WrongDirection(_))
        ));
        assert_eq!(
            l.rx.extract_channel_item(0xDEAD, true).unwrap_err(),
            ChannelError::UnknownWrId(0xDEAD)
        );
    }

    #[test]
    fn test_extract_without_replace_shrinks_outstanding() {
        let l = link(3);
        l.tx.submit_out_channel_message(b"ping").unwrap();
        let recv = l
            .transport
            .poll_completions(l.cq, 8)
            .into_iter()
            .find(|c| c.kind == CompletionKind::Recv)
            .unwrap();
        l.rx.extract_channel_item(recv.wr_id, false).unwrap();
        assert_eq!(l.rx.outstanding(), 2);
        l.rx.submit_in_channel_reservation().unwrap();
        assert_eq!(l.rx.outstanding(), 3);
    }
}
