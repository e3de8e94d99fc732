//! A bid and an offer meet at the exchange, the bidder pulls the object over
//! a data channel and confirms, all across the loopback transport.
//!
//! Node ids: exchange 0, offerer 1, bidder 2.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver};
use fabric_channel::{
    Channel, ChannelOptions, CompletionPoller, DataChannel, Delivery, Direction, LoopbackTransport, MessageDispatcher,
    MessageType, QpId, RdmaTransport,
};
use fabric_common::config::{ChannelConfig, DataChannelConfig, ExchangeConfig, MemoryConfig, PollerConfig};
use fabric_common::Fingerprint;
use fabric_exchange::{Exchange, ExchangeItemKind, ExchangeOrder, FingerprintMatch, OrderKind};
use fabric_memory::{Memory, PoolId};

const WAIT: Duration = Duration::from_secs(5);
const EXCHANGE: u32 = 0;
const OFFERER: u32 = 1;
const BIDDER: u32 = 2;

fn control(
    transport: &Arc<LoopbackTransport>,
    qp: QpId,
    self_id: u32,
    peer_id: u32,
    message_type: MessageType,
    direction: Direction,
) -> Arc<Channel> {
    let config = ChannelConfig {
        capacity: 8,
        message_size: 256,
    };
    let options = ChannelOptions {
        self_id,
        peer_id,
        message_type,
        direction,
        presubmit_recvs: direction == Direction::Inbound,
    };
    Arc::new(Channel::new(options, &config, transport.clone(), qp).unwrap())
}

fn link(transport: &LoopbackTransport, cq: u32) -> (QpId, QpId) {
    let a = transport.create_qp(cq).unwrap();
    let b = transport.create_qp(cq).unwrap();
    transport.connect(a, b).unwrap();
    (a, b)
}

fn send(channel: &Channel, body: &[u8]) {
    channel.submit_out_channel_message(body).unwrap();
}

fn serve_one(exchange: &Exchange, inbox: &Receiver<Delivery>, match_out: &Channel) -> Vec<FingerprintMatch> {
    let delivery = inbox.recv_timeout(WAIT).unwrap();
    let order = ExchangeOrder::decode(&delivery.payload).unwrap();
    assert_eq!(order.node_id, delivery.sender_id);
    assert_eq!(order.kind.message_type(), delivery.message_type);

    let matches = exchange.handle_order(&order).unwrap();
    for m in &matches {
        // Only the bidder is reachable from the exchange in this topology
        assert_eq!(m.recipient, BIDDER);
        send(match_out, &m.encode().unwrap());
    }
    matches
}

#[test]
fn bid_offer_transfer_confirm() {
    let transport = Arc::new(LoopbackTransport::new());
    let cq = transport.create_cq();

    // offerer -> exchange (offers)
    let (o_ord, e_from_o) = link(&transport, cq);
    // bidder <-> exchange (bids out, matches back)
    let (b_ord, e_from_b) = link(&transport, cq);
    // bidder -> exchange (confirmations)
    let (b_conf, e_conf) = link(&transport, cq);
    // offerer -> bidder (data)
    let (o_data, b_data) = link(&transport, cq);

    let offer_out = control(&transport, o_ord, OFFERER, EXCHANGE, MessageType::OfferOrder, Direction::Outbound);
    let offer_in = control(&transport, e_from_o, EXCHANGE, OFFERER, MessageType::OfferOrder, Direction::Inbound);
    let bid_out = control(&transport, b_ord, BIDDER, EXCHANGE, MessageType::BidOrder, Direction::Outbound);
    let bid_in = control(&transport, e_from_b, EXCHANGE, BIDDER, MessageType::BidOrder, Direction::Inbound);
    let match_out = control(&transport, e_from_b, EXCHANGE, BIDDER, MessageType::BidMatch, Direction::Outbound);
    let match_in = control(&transport, b_ord, BIDDER, EXCHANGE, MessageType::BidMatch, Direction::Inbound);
    let confirm_out = control(&transport, b_conf, BIDDER, EXCHANGE, MessageType::OfferOrder, Direction::Outbound);
    let confirm_in = control(&transport, e_conf, EXCHANGE, BIDDER, MessageType::OfferOrder, Direction::Inbound);

    let data_config = DataChannelConfig {
        packet_max_bytes: 4096,
        ..DataChannelConfig::default()
    };
    let data_out =
        Arc::new(DataChannel::new(OFFERER, BIDDER, Direction::Outbound, &data_config, transport.clone(), o_data).unwrap());
    let data_in =
        Arc::new(DataChannel::new(BIDDER, OFFERER, Direction::Inbound, &data_config, transport.clone(), b_data).unwrap());

    let (to_exchange, exchange_inbox) = unbounded();
    let (to_bidder, bidder_inbox) = unbounded();
    let (to_done, done) = unbounded();
    let mut dispatcher = MessageDispatcher::new();
    dispatcher
        .route_channel(offer_out.clone(), None)
        .route_channel(bid_out.clone(), None)
        .route_channel(match_out.clone(), None)
        .route_channel(confirm_out.clone(), None)
        .route_channel(offer_in, Some(to_exchange.clone()))
        .route_channel(bid_in, Some(to_exchange.clone()))
        .route_channel(confirm_in, Some(to_exchange))
        .route_channel(match_in, Some(to_bidder))
        .route_data_channel(data_out.clone(), to_done.clone())
        .route_data_channel(data_in.clone(), to_done);

    let mut poller = CompletionPoller::new(PollerConfig::default());
    poller.start(transport.clone(), &[cq], Arc::new(dispatcher)).unwrap();

    let exchange = Exchange::new(EXCHANGE, &ExchangeConfig::default());
    let memory = Memory::new(&MemoryConfig {
        chunk_size: 4096,
        system_num_chunks: 64,
        ..MemoryConfig::default()
    })
    .unwrap();
    let region = memory.system_region();
    let keys = unsafe { transport.register_memory(region.addr(), region.len() as u64).unwrap() };
    let offset = |addr: u64| (addr - region.addr()) as usize;

    // The offerer computed an object the bidder will need
    let object: Vec<u8> = (0..3 * 4096 + 100).map(|i| (i % 251) as u8).collect();
    let fp = Fingerprint::of(&object);
    let src = memory.reserve_memory(PoolId::System, object.len() as u64).unwrap();
    unsafe { region.write_at(offset(src.buffer), &object).unwrap() };

    // 1. Bid arrives first: nothing to match yet
    send(&bid_out, &ExchangeOrder::new(OrderKind::Bid, fp, BIDDER).encode());
    assert!(serve_one(&exchange, &exchange_inbox, &match_out).is_empty());

    // 2. Offer triggers a notification to the bidder naming the offerer
    send(&offer_out, &ExchangeOrder::new(OrderKind::Offer, fp, OFFERER).encode());
    assert_eq!(serve_one(&exchange, &exchange_inbox, &match_out).len(), 1);

    let note = bidder_inbox.recv_timeout(WAIT).unwrap();
    let m = FingerprintMatch::decode(note.sender_id, BIDDER, &note.payload).unwrap();
    assert_eq!(m.source, EXCHANGE);
    assert_eq!(m.fingerprint, fp);
    assert_eq!(m.node_ids, vec![OFFERER]);

    // 3. Bidder pulls the object from the offerer
    let dst = memory.reserve_memory(PoolId::System, object.len() as u64).unwrap();
    let start = data_in
        .submit_in_transfer(fp, dst.buffer, object.len() as u64, keys.lkey)
        .unwrap();
    data_out
        .submit_out_transfer(fp, src.buffer, object.len() as u64, keys.lkey, start)
        .unwrap();
    let finished = [done.recv_timeout(WAIT).unwrap(), done.recv_timeout(WAIT).unwrap()];
    let landed = finished.iter().find(|t| t.direction == Direction::Inbound).unwrap();
    assert_eq!(landed.fingerprint, fp);

    let mut received = vec![0u8; object.len()];
    unsafe { region.read_at(offset(landed.addr), &mut received).unwrap() };
    assert_eq!(Fingerprint::of(&received), fp);

    // 4. Bidder confirms and becomes an offer location
    send(
        &confirm_out,
        &ExchangeOrder::new(OrderKind::OfferConfirmMatchData, fp, BIDDER).encode(),
    );
    assert!(serve_one(&exchange, &exchange_inbox, &match_out).is_empty());

    poller.stop();

    assert_eq!(exchange.len(ExchangeItemKind::Bid), 0);
    let offers = exchange.query(ExchangeItemKind::Offer, &fp).unwrap().unwrap();
    assert_eq!(offers.participants, vec![OFFERER, BIDDER]);
    assert_eq!(exchange.stats().orders, 3);
    assert_eq!(exchange.stats().notifications, 1);

    memory.release_memory(&src).unwrap();
    memory.release_memory(&dst).unwrap();
    assert_eq!(memory.free_chunks(PoolId::System).unwrap(), 64);
    assert_eq!(data_in.in_flight_transfers(), 0);
}
