//! Two endpoints wired over the loopback transport with a live poller.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::unbounded;
use fabric_channel::{
    Channel, ChannelOptions, CompletionKind, CompletionPoller, DataChannel, Direction, LoopbackTransport,
    MessageDispatcher, MessageType, RdmaTransport,
};
use fabric_common::config::{ChannelConfig, DataChannelConfig, MemoryConfig, PollStrategyKind, PollerConfig};
use fabric_common::Fingerprint;
use fabric_memory::{Memory, PoolId};
use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;

const WAIT: Duration = Duration::from_secs(5);

struct Wire {
    transport: Arc<LoopbackTransport>,
    cq: u32,
    a: u32,
    b: u32,
}

fn wire() -> Wire {
    let transport = Arc::new(LoopbackTransport::new());
    let cq = transport.create_cq();
    let a = transport.create_qp(cq).unwrap();
    let b = transport.create_qp(cq).unwrap();
    transport.connect(a, b).unwrap();
    Wire { transport, cq, a, b }
}

#[test]
fn control_messages_flow_through_poller() {
    let w = wire();
    let config = ChannelConfig {
        capacity: 16,
        message_size: 128,
    };
    let tx = Arc::new(
        Channel::new(
            ChannelOptions {
                self_id: 10,
                peer_id: 20,
                message_type: MessageType::BidOrder,
                direction: Direction::Outbound,
                presubmit_recvs: false,
            },
            &config,
            w.transport.clone(),
            w.a,
        )
        .unwrap(),
    );
    let rx = Arc::new(
        Channel::new(
            ChannelOptions {
                self_id: 20,
                peer_id: 10,
                message_type: MessageType::BidOrder,
                direction: Direction::Inbound,
                presubmit_recvs: true,
            },
            &config,
            w.transport.clone(),
            w.b,
        )
        .unwrap(),
    );

    let (deliveries_tx, deliveries) = unbounded();
    let mut dispatcher = MessageDispatcher::new();
    dispatcher
        .route_channel(tx.clone(), None)
        .route_channel(rx.clone(), Some(deliveries_tx));

    let mut poller = CompletionPoller::new(PollerConfig {
        strategy: PollStrategyKind::Yield,
        ..PollerConfig::default()
    });
    poller.start(w.transport.clone(), &[w.cq], Arc::new(dispatcher)).unwrap();

    for i in 0..200u32 {
        // Outbound slots come back as send completions are handled.
        loop {
            match tx.submit_out_channel_message(&i.to_le_bytes()) {
                Ok(_) => break,
                Err(e) if fabric_common::Classify::is_recoverable(&e) => std::thread::yield_now(),
                Err(e) => panic!("send failed: {e}"),
            }
        }
        let d = deliveries.recv_timeout(WAIT).unwrap();
        assert_eq!(d.sender_id, 10);
        assert_eq!(d.message_type, MessageType::BidOrder);
        assert_eq!(&d.payload[..4], &i.to_le_bytes());
    }

    poller.stop();
    assert_eq!(rx.outstanding(), 16);
    assert_eq!(w.transport.posted_recvs(w.b), 16);
    assert_eq!(poller.stats().handler_errors, 0);
}

#[test]
fn data_transfer_between_memory_pools() {
    let w = wire();
    let memory = Memory::new(&MemoryConfig {
        chunk_size: 4096,
        system_num_chunks: 256,
        ..MemoryConfig::default()
    })
    .unwrap();
    let region = memory.system_region();
    let keys = unsafe {
        w.transport
            .register_memory(region.addr(), region.len() as u64)
            .unwrap()
    };

    let config = DataChannelConfig {
        packet_max_bytes: 4096,
        ..DataChannelConfig::default()
    };
    let sender = Arc::new(DataChannel::new(1, 2, Direction::Outbound, &config, w.transport.clone(), w.a).unwrap());
    let receiver = Arc::new(DataChannel::new(2, 1, Direction::Inbound, &config, w.transport.clone(), w.b).unwrap());

    let (done_tx, done) = unbounded();
    let mut dispatcher = MessageDispatcher::new();
    dispatcher
        .route_data_channel(sender.clone(), done_tx.clone())
        .route_data_channel(receiver.clone(), done_tx);

    let mut poller = CompletionPoller::new(PollerConfig::default());
    poller.start(w.transport.clone(), &[w.cq], Arc::new(dispatcher)).unwrap();

    let len = 10 * 4096 + 17;
    let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
    let fp = Fingerprint::of(&data);

    let src = memory.reserve_memory(PoolId::System, len as u64).unwrap();
    let dst = memory.reserve_memory(PoolId::System, len as u64).unwrap();
    let offset = |addr: u64| (addr - region.addr()) as usize;
    unsafe { region.write_at(offset(src.buffer), &data).unwrap() };

    let start = receiver.submit_in_transfer(fp, dst.buffer, len as u64, keys.lkey).unwrap();
    sender.submit_out_transfer(fp, src.buffer, len as u64, keys.lkey, start).unwrap();

    let mut finished = vec![done.recv_timeout(WAIT).unwrap(), done.recv_timeout(WAIT).unwrap()];
    finished.sort_by_key(|d| d.direction == Direction::Inbound);
    assert_eq!(finished[0].direction, Direction::Outbound);
    assert_eq!(finished[1].addr, dst.buffer);
    assert!(finished.iter().all(|d| d.fingerprint == fp && d.start_id == start));

    poller.stop();

    let mut landed = vec![0u8; len];
    unsafe { region.read_at(offset(dst.buffer), &mut landed).unwrap() };
    assert_eq!(Fingerprint::of(&landed), fp);

    memory.release_memory(&src).unwrap();
    memory.release_memory(&dst).unwrap();
    assert_eq!(memory.free_chunks(PoolId::System).unwrap(), 256);
    assert_eq!(receiver.in_flight_packets(), 0);
    assert_eq!(sender.in_flight_transfers(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Any interleaving of sends and extracts leaves an inbound channel with
    /// exactly `capacity` receives outstanding once drained.
    #[test]
    fn inbound_capacity_is_preserved(capacity in 1u32..16, bursts in prop::collection::vec(1usize..16, 1..12)) {
        let w = wire();
        let config = ChannelConfig { capacity, message_size: 32 };
        let options = |direction, presubmit_recvs| ChannelOptions {
            self_id: 1,
            peer_id: 1,
            message_type: MessageType::Heartbeat,
            direction,
            presubmit_recvs,
        };
        let tx = Channel::new(options(Direction::Outbound, false), &config, w.transport.clone(), w.a).unwrap();
        let rx = Channel::new(options(Direction::Inbound, true), &config, w.transport.clone(), w.b).unwrap();

        for burst in bursts {
            for _ in 0..burst.min(capacity as usize) {
                tx.submit_out_channel_message(b"hb").unwrap();
            }
            for c in w.transport.poll_completions(w.cq, usize::MAX) {
                match c.kind {
                    CompletionKind::Recv => { rx.extract_channel_item(c.wr_id, true).unwrap(); }
                    CompletionKind::Send => { tx.extract_channel_item(c.wr_id, false).unwrap(); }
                }
            }
            prop_assert_eq!(rx.outstanding(), capacity as usize);
            prop_assert_eq!(w.transport.posted_recvs(w.b), capacity as usize);
            prop_assert_eq!(tx.outstanding(), 0);
        }
    }

    /// Completion fires exactly once, on the last ack, whatever the order.
    #[test]
    fn transfer_completes_exactly_once(data_bytes in 1u64..40_000, seed in any::<u64>()) {
        let w = wire();
        let config = DataChannelConfig { packet_max_bytes: 1000, ..DataChannelConfig::default() };
        let rx = DataChannel::new(2, 1, Direction::Inbound, &config, w.transport.clone(), w.b).unwrap();
        let fp = Fingerprint::of(&seed.to_le_bytes());

        let start = rx.submit_in_transfer(fp, 0x1000, data_bytes, 0).unwrap();
        let n = data_bytes.div_ceil(1000) as u32;
        let mut ids: Vec<u32> = (start..start + n).collect();
        ids.shuffle(&mut rand::rngs::StdRng::seed_from_u64(seed));

        let mut completions = 0;
        for (i, id) in ids.iter().enumerate() {
            let done = rx.ack_packet_local(*id).unwrap();
            if i + 1 < ids.len() {
                prop_assert!(done.is_none());
            } else {
                prop_assert_eq!(done.as_ref().map(|d| d.data_bytes), Some(data_bytes));
            }
            completions += done.is_some() as u32;
        }
        prop_assert_eq!(completions, 1);
        prop_assert_eq!(rx.in_flight_transfers(), 0);
        prop_assert_eq!(rx.in_flight_packets(), 0);
    }
}
