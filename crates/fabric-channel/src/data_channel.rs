//! Packetised bulk transfers
//!
//! A transfer moves `data_bytes` from (or into) a registered buffer as
//! `ceil(data_bytes / packet_max_bytes)` packets. Each packet id is the
//! channel count of its wr_id, so the completion path can go from wr_id to
//! packet to transfer with two table lookups.
//!
//! The receiving side owns the packet id space: `submit_in_transfer` picks
//! the start id under `transfer_start_id`'s lock and only advances it once
//! every row is inserted and every receive is posted. The sender is told the
//! start id out of band and calls `submit_out_transfer` with it.

use std::sync::Arc;

use fabric_common::config::DataChannelConfig;
use fabric_common::{Fingerprint, Timestamp};
use fabric_structures::{FastTable, TableError};
use parking_lot::Mutex;

use crate::channel::Direction;
use crate::error::{ChannelError, ChannelResult};
use crate::stats::{ChannelStats, ChannelStatsSnapshot};
use crate::transport::{Completion, QpId, RdmaTransport, WorkRequest};
use crate::wr_id::{decode_packet_id, encode_wr_id, MessageType};

/// One in-flight packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPacket {
    pub packet_id: u32,
    pub transfer_start_id: u32,
    pub packet_bytes: u16,
}

#[derive(Debug)]
struct Progress {
    remain_bytes: u64,
    remain_packets: u32,
}

/// One in-flight transfer
#[derive(Debug)]
pub struct Transfer {
    pub start_id: u32,
    pub fingerprint: Fingerprint,
    pub addr: u64,
    pub data_bytes: u64,
    pub lkey: u32,
    pub direction: Direction,
    pub num_packets: u32,
    started: Timestamp,
    progress: Mutex<Progress>,
}

/// Handed back when the last packet of a transfer is acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferComplete {
    pub start_id: u32,
    pub fingerprint: Fingerprint,
    pub addr: u64,
    pub data_bytes: u64,
    pub direction: Direction,
    pub elapsed_micros: u64,
}

/// Data channel endpoint over one queue pair
pub struct DataChannel {
    self_id: u32,
    peer_id: u32,
    direction: Direction,
    packet_max_bytes: u32,
    max_packet_id: u32,
    transfer_start_id: Mutex<u32>,
    packets: Mutex<FastTable<u32, DataPacket>>,
    transfers: Mutex<FastTable<u32, Arc<Transfer>>>,
    transport: Arc<dyn RdmaTransport>,
    qp: QpId,
    stats: ChannelStats,
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("self_id", &self.self_id)
            .field("peer_id", &self.peer_id)
            .field("direction", &self.direction)
            .field("qp", &self.qp)
            .finish_non_exhaustive()
    }
}

impl DataChannel {
    pub fn new(
        self_id: u32,
        peer_id: u32,
        direction: Direction,
        config: &DataChannelConfig,
        transport: Arc<dyn RdmaTransport>,
        qp: QpId,
    ) -> ChannelResult<Self> {
        if config.packet_max_bytes == 0 || config.packet_max_bytes > u16::MAX as u32 {
            return Err(ChannelError::InvalidTransfer(format!(
                "packet_max_bytes {} must be in 1..=65535",
                config.packet_max_bytes
            )));
        }
        if config.max_packet_id == 0 {
            return Err(ChannelError::InvalidTransfer("max_packet_id must be > 0".into()));
        }

        Ok(Self {
            self_id,
            peer_id,
            direction,
            packet_max_bytes: config.packet_max_bytes,
            max_packet_id: config.max_packet_id,
            transfer_start_id: Mutex::new(0),
            packets: Mutex::new(FastTable::new(config.packet_table())?),
            transfers: Mutex::new(FastTable::new(config.transfer_table())?),
            transport,
            qp,
            stats: ChannelStats::default(),
        })
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    #[inline]
    pub fn qp(&self) -> QpId {
        self.qp
    }

    #[inline]
    pub fn packet_max_bytes(&self) -> u32 {
        self.packet_max_bytes
    }

    pub fn in_flight_transfers(&self) -> usize {
        self.transfers.lock().len()
    }

    pub fn in_flight_packets(&self) -> usize {
        self.packets.lock().len()
    }

    /// Next start id an inbound transfer would get
    pub fn next_transfer_start_id(&self) -> u32 {
        *self.transfer_start_id.lock()
    }

    pub fn stats(&self) -> ChannelStatsSnapshot {
        self.stats.snapshot()
    }

    /// Packets needed for `data_bytes`
    #[inline]
    pub fn num_packets(&self, data_bytes: u64) -> u64 {
        data_bytes.div_ceil(self.packet_max_bytes as u64)
    }

    /// Send `data_bytes` from `addr` as packets numbered from `start_id`
    pub fn submit_out_transfer(
        &self,
        fingerprint: Fingerprint,
        addr: u64,
        data_bytes: u64,
        lkey: u32,
        start_id: u32,
    ) -> ChannelResult<()> {
        if self.direction != Direction::Outbound {
            return Err(ChannelError::WrongDirection(Direction::Outbound.as_str()));
        }
        if start_id >= self.max_packet_id {
            return Err(ChannelError::InvalidTransfer(format!(
                "start id {start_id} outside packet id space {}",
                self.max_packet_id
            )));
        }

        let wrs = self.register_transfer(start_id, fingerprint, addr, data_bytes, lkey)?;
        if let Err(e) = self.transport.post_send_batch(self.qp, None, &wrs) {
            tracing::warn!(start_id, error = %e, "posting transfer sends failed");
            self.rollback(start_id, &wrs);
            return Err(e.into());
        }

        self.stats.record_transfer_start();
        self.stats.record_send(wrs.len() as u64);
        tracing::debug!(start_id, packets = wrs.len(), data_bytes, %fingerprint, "outbound transfer posted");
        Ok(())
    }

    /// Post receives for `data_bytes` into `addr`; returns the start id the
    /// sender must use.
    pub fn submit_in_transfer(
        &self,
        fingerprint: Fingerprint,
        addr: u64,
        data_bytes: u64,
        lkey: u32,
    ) -> ChannelResult<u32> {
        if self.direction != Direction::Inbound {
            return Err(ChannelError::WrongDirection(Direction::Inbound.as_str()));
        }

        let mut next_start = self.transfer_start_id.lock();
        let start_id = *next_start;

        let wrs = self.register_transfer(start_id, fingerprint, addr, data_bytes, lkey)?;
        if let Err(e) = self.transport.post_recv_batch(self.qp, &wrs) {
            tracing::warn!(start_id, error = %e, "posting transfer receives failed");
            self.rollback(start_id, &wrs);
            return Err(e.into());
        }

        // Advance only once every row is in and every receive is posted.
        *next_start = ((start_id as u64 + wrs.len() as u64) % self.max_packet_id as u64) as u32;
        drop(next_start);

        self.stats.record_transfer_start();
        self.stats.record_recv(wrs.len() as u64);
        tracing::debug!(start_id, packets = wrs.len(), data_bytes, %fingerprint, "inbound transfer posted");
        Ok(start_id)
    }

    /// Account for one finished packet.
    ///
    /// Returns the transfer summary when this was its last packet; the
    /// transfer row is removed while its lock is held, then the packet row.
    pub fn ack_packet_local(&self, packet_id: u32) -> ChannelResult<Option<TransferComplete>> {
        let packet = self
            .packets
            .lock()
            .get(&packet_id)
            .copied()
            .ok_or(ChannelError::UnknownPacket(packet_id))?;

        let transfer = self
            .transfers
            .lock()
            .get(&packet.transfer_start_id)
            .cloned()
            .ok_or_else(|| {
                tracing::error!(packet_id, start_id = packet.transfer_start_id, "packet names a missing transfer");
                ChannelError::Protocol(format!(
                    "packet {packet_id} names missing transfer {}",
                    packet.transfer_start_id
                ))
            })?;

        let complete = {
            let mut progress = transfer.progress.lock();
            let packet_bytes = packet.packet_bytes as u64;
            if packet_bytes > progress.remain_bytes || progress.remain_packets == 0 {
                tracing::error!(packet_id, start_id = transfer.start_id, "packet overruns its transfer");
                return Err(ChannelError::Protocol(format!(
                    "packet {packet_id} overruns transfer {}",
                    transfer.start_id
                )));
            }
            let remain_bytes = progress.remain_bytes - packet_bytes;
            let remain_packets = progress.remain_packets - 1;
            if remain_packets == 0 && remain_bytes != 0 {
                tracing::error!(packet_id, start_id = transfer.start_id, remain_bytes, "last packet leaves bytes outstanding");
                return Err(ChannelError::Protocol(format!(
                    "transfer {} finished with {} bytes outstanding",
                    transfer.start_id, remain_bytes
                )));
            }
            // Commit only once the ack is known to be consistent
            progress.remain_bytes = remain_bytes;
            progress.remain_packets = remain_packets;

            if remain_packets == 0 {
                self.transfers.lock().remove(&transfer.start_id);
                Some(TransferComplete {
                    start_id: transfer.start_id,
                    fingerprint: transfer.fingerprint,
                    addr: transfer.addr,
                    data_bytes: transfer.data_bytes,
                    direction: transfer.direction,
                    elapsed_micros: transfer.started.elapsed_micros(),
                })
            } else {
                None
            }
        };

        if self.packets.lock().remove(&packet_id).is_none() {
            return Err(ChannelError::Protocol(format!("packet {packet_id} vanished during ack")));
        }

        self.stats.record_packet_ack(complete.is_some());
        if let Some(done) = &complete {
            tracing::debug!(
                start_id = done.start_id,
                data_bytes = done.data_bytes,
                elapsed_us = done.elapsed_micros,
                direction = done.direction.as_str(),
                "transfer complete"
            );
        }
        Ok(complete)
    }

    /// Ack the packet named by a data-packet completion
    pub fn handle_completion(&self, completion: &Completion) -> ChannelResult<Option<TransferComplete>> {
        if !completion.is_success() {
            return Err(ChannelError::CompletionFailed {
                wr_id: completion.wr_id,
                status: completion.status,
            });
        }
        self.ack_packet_local(decode_packet_id(completion.wr_id))
    }

    /// Insert the transfer and its packet rows, returning the work requests
    /// to post. Nothing is left behind on error.
    fn register_transfer(
        &self,
        start_id: u32,
        fingerprint: Fingerprint,
        addr: u64,
        data_bytes: u64,
        lkey: u32,
    ) -> ChannelResult<Vec<WorkRequest>> {
        if data_bytes == 0 {
            return Err(ChannelError::InvalidTransfer("zero-byte transfer".into()));
        }
        let num_packets = self.num_packets(data_bytes);
        if num_packets > self.max_packet_id as u64 {
            return Err(ChannelError::InvalidTransfer(format!(
                "{num_packets} packets exceed packet id space {}",
                self.max_packet_id
            )));
        }
        let num_packets = num_packets as u32;

        let transfer = Arc::new(Transfer {
            start_id,
            fingerprint,
            addr,
            data_bytes,
            lkey,
            direction: self.direction,
            num_packets,
            started: Timestamp::now(),
            progress: Mutex::new(Progress {
                remain_bytes: data_bytes,
                remain_packets: num_packets,
            }),
        });
        self.transfers.lock().insert(start_id, transfer).map_err(|e| match e {
            TableError::DuplicateKey => ChannelError::DuplicateTransfer(start_id),
            other => other.into(),
        })?;

        // Sends carry our id, receives the peer's.
        let sender_id = match self.direction {
            Direction::Outbound => self.self_id,
            Direction::Inbound => self.peer_id,
        };
        let packet_max = self.packet_max_bytes as u64;

        let mut wrs: Vec<WorkRequest> = Vec::with_capacity(num_packets as usize);
        let mut packets = self.packets.lock();
        for i in 0..num_packets {
            let packet_id = ((start_id as u64 + i as u64) % self.max_packet_id as u64) as u32;
            let offset = i as u64 * packet_max;
            let packet_bytes = (data_bytes - offset).min(packet_max) as u16;

            let row = DataPacket {
                packet_id,
                transfer_start_id: start_id,
                packet_bytes,
            };
            if let Err(e) = packets.insert(packet_id, row) {
                for wr in &wrs {
                    packets.remove(&decode_packet_id(wr.wr_id));
                }
                drop(packets);
                self.transfers.lock().remove(&start_id);
                tracing::warn!(start_id, packet_id, error = %e, "transfer rejected");
                return Err(match e {
                    TableError::DuplicateKey => ChannelError::DuplicatePacket(packet_id),
                    other => other.into(),
                });
            }

            wrs.push(WorkRequest {
                wr_id: encode_wr_id(sender_id, packet_id, MessageType::DataPacket),
                addr: addr + offset,
                len: packet_bytes as u32,
                lkey,
            });
        }
        Ok(wrs)
    }

    fn rollback(&self, start_id: u32, wrs: &[WorkRequest]) {
        {
            let mut packets = self.packets.lock();
            for wr in wrs {
                packets.remove(&decode_packet_id(wr.wr_id));
            }
        }
        self.transfers.lock().remove(&start_id);
    }
}
