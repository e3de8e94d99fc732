//! Fingerprint-keyed order book
//!
//! Three tables (bids, offers, futures) map a fingerprint to the queue of
//! nodes that posted it. An entry lives only while its queue is non-empty.
//! Matching is driven by the order that arrives second: an offer on a
//! fingerprint with waiting bidders notifies each bidder, a bid on a
//! fingerprint with known offers tells the bidder where to fetch from.

use std::collections::VecDeque;
use std::fmt;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fabric_common::config::ExchangeConfig;
use fabric_common::{AtomicCounter, Fingerprint, FingerprintBuildHasher, Timestamp};

use crate::error::{ExchangeError, ExchangeResult};
use crate::order::{ExchangeOrder, FingerprintMatch, OrderKind};

type ItemTable = DashMap<Fingerprint, ExchangeItem, FingerprintBuildHasher>;

/// Which table an entry lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeItemKind {
    Bid,
    Offer,
    Future,
}

impl ExchangeItemKind {
    pub const ALL: [ExchangeItemKind; 3] = [ExchangeItemKind::Bid, ExchangeItemKind::Offer, ExchangeItemKind::Future];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeItemKind::Bid => "bid",
            ExchangeItemKind::Offer => "offer",
            ExchangeItemKind::Future => "future",
        }
    }
}

impl fmt::Display for ExchangeItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One table entry
#[derive(Debug)]
struct ExchangeItem {
    participants: VecDeque<u32>,
    lookups: u64,
    modifications: u64,
    last_lookup: Timestamp,
    last_modify: Timestamp,
}

impl ExchangeItem {
    fn new(node_id: u32) -> Self {
        Self {
            participants: VecDeque::from([node_id]),
            lookups: 0,
            modifications: 0,
            last_lookup: Timestamp::default(),
            last_modify: Timestamp::now(),
        }
    }

    fn record_lookup(&mut self) {
        self.lookups += 1;
        self.last_lookup = Timestamp::now();
    }

    fn record_modify(&mut self) {
        self.modifications += 1;
        self.last_modify = Timestamp::now();
    }

    /// Drop the first occurrence of `node_id`
    fn remove_participant(&mut self, node_id: u32) -> bool {
        match self.participants.iter().position(|id| *id == node_id) {
            Some(pos) => {
                self.participants.remove(pos);
                true
            }
            None => false,
        }
    }

    fn snapshot(&self) -> ItemSnapshot {
        ItemSnapshot {
            participants: self.participants.iter().copied().collect(),
            lookups: self.lookups,
            modifications: self.modifications,
            last_lookup: self.last_lookup,
            last_modify: self.last_modify,
        }
    }
}

/// Copy of an entry returned by [`Exchange::query`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemSnapshot {
    /// Posting nodes, oldest first
    pub participants: Vec<u32>,
    pub lookups: u64,
    pub modifications: u64,
    /// Zero until the first lookup
    pub last_lookup: Timestamp,
    pub last_modify: Timestamp,
}

#[derive(Debug, Default)]
struct ExchangeStats {
    orders: AtomicCounter,
    rejected: AtomicCounter,
    notifications: AtomicCounter,
}

/// Exchange counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeStatsSnapshot {
    pub orders: u64,
    pub rejected: u64,
    pub notifications: u64,
}

/// One shard of the exchange
pub struct Exchange {
    self_id: u32,
    config: ExchangeConfig,
    bids: ItemTable,
    offers: ItemTable,
    futures: ItemTable,
    stats: ExchangeStats,
}

impl Exchange {
    pub fn new(self_id: u32, config: &ExchangeConfig) -> Self {
        tracing::debug!(
            self_id,
            start = config.start_val,
            end = config.end_val,
            "exchange shard created"
        );
        Self {
            self_id,
            config: *config,
            bids: DashMap::with_hasher(FingerprintBuildHasher),
            offers: DashMap::with_hasher(FingerprintBuildHasher),
            futures: DashMap::with_hasher(FingerprintBuildHasher),
            stats: ExchangeStats::default(),
        }
    }

    pub fn self_id(&self) -> u32 {
        self.self_id
    }

    /// Whether `fingerprint` falls in this shard
    pub fn owns(&self, fingerprint: &Fingerprint) -> bool {
        (self.config.start_val..=self.config.end_val).contains(&fingerprint.low_u64())
    }

    /// Entries in one table
    pub fn len(&self, kind: ExchangeItemKind) -> usize {
        self.table(kind).len()
    }

    pub fn is_empty(&self) -> bool {
        ExchangeItemKind::ALL.iter().all(|k| self.table(*k).is_empty())
    }

    pub fn stats(&self) -> ExchangeStatsSnapshot {
        ExchangeStatsSnapshot {
            orders: self.stats.orders.get(),
            rejected: self.stats.rejected.get(),
            notifications: self.stats.notifications.get(),
        }
    }

    /// Post a bid. Returns the nodes currently offering `fingerprint`.
    ///
    /// The bidder stays in the bid table even on a match, until it confirms
    /// receipt with [`post_offer_confirm_match_data`](Self::post_offer_confirm_match_data).
    pub fn post_bid(&self, fingerprint: Fingerprint, node_id: u32) -> ExchangeResult<Vec<u32>> {
        self.check_owner(&fingerprint)?;
        let offers = self.participants_of(ExchangeItemKind::Offer, &fingerprint);
        self.append(ExchangeItemKind::Bid, fingerprint, node_id)?;
        Ok(offers)
    }

    /// Post an offer. Returns the nodes currently bidding on `fingerprint`
    /// and retires the node's matching future.
    pub fn post_offer(&self, fingerprint: Fingerprint, node_id: u32) -> ExchangeResult<Vec<u32>> {
        self.check_owner(&fingerprint)?;
        self.append(ExchangeItemKind::Offer, fingerprint, node_id)?;
        let bids = self.participants_of(ExchangeItemKind::Bid, &fingerprint);

        match self.remove_participant(ExchangeItemKind::Future, &fingerprint, node_id) {
            Some(true) => {}
            Some(false) => {
                tracing::warn!(node_id, %fingerprint, "offer from node without a matching future")
            }
            None => tracing::debug!(node_id, %fingerprint, "offer without any future"),
        }
        Ok(bids)
    }

    /// The node received the object it bid on: it becomes an offer location
    /// and its bid is retired.
    pub fn post_offer_confirm_match_data(&self, fingerprint: Fingerprint, node_id: u32) -> ExchangeResult<()> {
        self.check_owner(&fingerprint)?;
        self.append(ExchangeItemKind::Offer, fingerprint, node_id)?;

        if self.remove_participant(ExchangeItemKind::Bid, &fingerprint, node_id) != Some(true) {
            tracing::warn!(node_id, %fingerprint, "match confirmed without an outstanding bid");
        }
        Ok(())
    }

    /// Announce that `node_id` will compute `fingerprint`
    pub fn post_future(&self, fingerprint: Fingerprint, node_id: u32) -> ExchangeResult<()> {
        self.check_owner(&fingerprint)?;
        self.append(ExchangeItemKind::Future, fingerprint, node_id)
    }

    /// Withdraw one posting of `node_id`
    pub fn cancel(&self, kind: ExchangeItemKind, fingerprint: Fingerprint, node_id: u32) -> ExchangeResult<()> {
        self.check_owner(&fingerprint)?;
        match self.remove_participant(kind, &fingerprint, node_id) {
            Some(true) => Ok(()),
            _ => Err(ExchangeError::NotFound {
                kind,
                fingerprint,
                node_id,
            }),
        }
    }

    /// Current entry for `fingerprint`, counting as a lookup
    pub fn query(&self, kind: ExchangeItemKind, fingerprint: &Fingerprint) -> ExchangeResult<Option<ItemSnapshot>> {
        self.check_owner(fingerprint)?;
        Ok(self.table(kind).get_mut(fingerprint).map(|mut item| {
            item.record_lookup();
            item.snapshot()
        }))
    }

    /// Apply one order and build the notifications it triggers
    pub fn handle_order(&self, order: &ExchangeOrder) -> ExchangeResult<Vec<FingerprintMatch>> {
        self.stats.orders.inc();
        metrics::counter!("fabric.exchange.orders").increment(1);

        let result = match order.kind {
            OrderKind::Bid => self.post_bid(order.fingerprint, order.node_id).map(|offers| {
                match_notifications(
                    self.self_id,
                    order.node_id,
                    ExchangeItemKind::Bid,
                    order.fingerprint,
                    &offers,
                    self.config.max_match_locations,
                )
            }),
            OrderKind::Offer => self.post_offer(order.fingerprint, order.node_id).map(|bids| {
                match_notifications(
                    self.self_id,
                    order.node_id,
                    ExchangeItemKind::Offer,
                    order.fingerprint,
                    &bids,
                    self.config.max_match_locations,
                )
            }),
            OrderKind::OfferConfirmMatchData => self
                .post_offer_confirm_match_data(order.fingerprint, order.node_id)
                .map(|()| Vec::new()),
            OrderKind::Future => self.post_future(order.fingerprint, order.node_id).map(|()| Vec::new()),
        };

        match &result {
            Ok(matches) if !matches.is_empty() => {
                self.stats.notifications.add(matches.len() as u64);
                metrics::counter!("fabric.exchange.notifications").increment(matches.len() as u64);
                tracing::trace!(
                    node_id = order.node_id,
                    fingerprint = %order.fingerprint,
                    notifications = matches.len(),
                    "order matched"
                );
            }
            Ok(_) => {}
            Err(e) => {
                self.stats.rejected.inc();
                tracing::warn!(node_id = order.node_id, kind = ?order.kind, error = %e, "order rejected");
            }
        }
        result
    }

    fn check_owner(&self, fingerprint: &Fingerprint) -> ExchangeResult<()> {
        if self.owns(fingerprint) {
            Ok(())
        } else {
            Err(ExchangeError::NotOwner {
                fingerprint: *fingerprint,
                start: self.config.start_val,
                end: self.config.end_val,
            })
        }
    }

    fn table(&self, kind: ExchangeItemKind) -> &ItemTable {
        match kind {
            ExchangeItemKind::Bid => &self.bids,
            ExchangeItemKind::Offer => &self.offers,
            ExchangeItemKind::Future => &self.futures,
        }
    }

    fn max_entries(&self, kind: ExchangeItemKind) -> u64 {
        match kind {
            ExchangeItemKind::Bid => self.config.max_bids,
            ExchangeItemKind::Offer => self.config.max_offers,
            ExchangeItemKind::Future => self.config.max_futures,
        }
    }

    fn append(&self, kind: ExchangeItemKind, fingerprint: Fingerprint, node_id: u32) -> ExchangeResult<()> {
        let table = self.table(kind);
        let max = self.max_entries(kind);
        // len() visits every shard, so it must run before entry() locks one
        let full = table.len() as u64 >= max;

        match table.entry(fingerprint) {
            Entry::Occupied(mut entry) => {
                let item = entry.get_mut();
                item.participants.push_back(node_id);
                item.record_modify();
            }
            Entry::Vacant(entry) => {
                if full {
                    return Err(ExchangeError::Full { kind, max });
                }
                entry.insert(ExchangeItem::new(node_id));
            }
        }
        Ok(())
    }

    fn participants_of(&self, kind: ExchangeItemKind, fingerprint: &Fingerprint) -> Vec<u32> {
        match self.table(kind).get_mut(fingerprint) {
            Some(mut item) => {
                item.record_lookup();
                item.participants.iter().copied().collect()
            }
            None => Vec::new(),
        }
    }

    /// `None` when no entry exists, otherwise whether `node_id` was removed.
    /// Empty entries are deleted under the same shard lock.
    fn remove_participant(&self, kind: ExchangeItemKind, fingerprint: &Fingerprint, node_id: u32) -> Option<bool> {
        match self.table(kind).entry(*fingerprint) {
            Entry::Occupied(mut entry) => {
                let item = entry.get_mut();
                let removed = item.remove_participant(node_id);
                if removed {
                    item.record_modify();
                }
                if item.participants.is_empty() {
                    entry.remove();
                }
                Some(removed)
            }
            Entry::Vacant(_) => None,
        }
    }
}

/// Notifications for an order on `fingerprint` posted by `trigger`, given
/// the nodes waiting on the opposite side.
///
/// An offer trigger produces one notification per bidder naming the
/// offerer. A bid trigger produces `ceil(n / max_locations)` notifications
/// to the bidder, each listing up to `max_locations` offerers.
pub fn match_notifications(
    source: u32,
    trigger: u32,
    trigger_kind: ExchangeItemKind,
    fingerprint: Fingerprint,
    participants: &[u32],
    max_locations: usize,
) -> Vec<FingerprintMatch> {
    match trigger_kind {
        ExchangeItemKind::Offer => participants
            .iter()
            .map(|bidder| FingerprintMatch {
                source,
                recipient: *bidder,
                fingerprint,
                node_ids: vec![trigger],
            })
            .collect(),
        ExchangeItemKind::Bid => participants
            .chunks(max_locations.max(1))
            .map(|offerers| FingerprintMatch {
                source,
                recipient: trigger,
                fingerprint,
                node_ids: offerers.to_vec(),
            })
            .collect(),
        ExchangeItemKind::Future => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_common::{Classify, ErrorClass};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn exchange() -> Exchange {
        Exchange::new(0, &ExchangeConfig::default())
    }

    fn fp(tag: u8) -> Fingerprint {
        Fingerprint::of(&[tag])
    }

    fn participants(ex: &Exchange, kind: ExchangeItemKind, f: &Fingerprint) -> Vec<u32> {
        ex.query(kind, f).unwrap().map(|s| s.participants).unwrap_or_default()
    }

    #[test]
    fn test_offer_notifies_each_waiting_bidder() {
        let ex = exchange();
        let f = fp(1);
        assert!(ex.handle_order(&ExchangeOrder::new(OrderKind::Bid, f, 3)).unwrap().is_empty());
        assert!(ex.handle_order(&ExchangeOrder::new(OrderKind::Bid, f, 4)).unwrap().is_empty());

        let matches = ex.handle_order(&ExchangeOrder::new(OrderKind::Offer, f, 9)).unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].recipient, 3);
        assert_eq!(matches[1].recipient, 4);
        assert!(matches.iter().all(|m| m.node_ids == vec![9] && m.fingerprint == f && m.source == 0));

        // Bids stay until the data is confirmed
        assert_eq!(participants(&ex, ExchangeItemKind::Bid, &f), vec![3, 4]);
        assert_eq!(ex.stats().notifications, 2);
    }

    #[test]
    fn test_bid_gets_offer_locations_in_chunks() {
        let ex = exchange();
        let f = fp(2);
        for node in 0..50 {
            ex.post_offer(f, node).unwrap();
        }

        let matches = ex.handle_order(&ExchangeOrder::new(OrderKind::Bid, f, 100)).unwrap();
        let sizes: Vec<usize> = matches.iter().map(|m| m.node_ids.len()).collect();
        assert_eq!(sizes, vec![24, 24, 2]);
        assert!(matches.iter().all(|m| m.recipient == 100));
        let all: Vec<u32> = matches.iter().flat_map(|m| m.node_ids.iter().copied()).collect();
        assert_eq!(all, (0..50).collect::<Vec<_>>());
        assert_eq!(participants(&ex, ExchangeItemKind::Bid, &f), vec![100]);
    }

    #[test]
    fn test_bid_without_offers_only_records() {
        let ex = exchange();
        assert!(ex.post_bid(fp(3), 1).unwrap().is_empty());
        assert_eq!(ex.len(ExchangeItemKind::Bid), 1);
        assert_eq!(ex.len(ExchangeItemKind::Offer), 0);
    }

    #[test]
    fn test_offer_retires_future() {
        let ex = exchange();
        let f = fp(4);
        ex.post_future(f, 1).unwrap();
        ex.post_future(f, 2).unwrap();

        ex.post_offer(f, 1).unwrap();
        assert_eq!(participants(&ex, ExchangeItemKind::Future, &f), vec![2]);

        ex.post_offer(f, 2).unwrap();
        assert_eq!(ex.len(ExchangeItemKind::Future), 0);
        assert_eq!(participants(&ex, ExchangeItemKind::Offer, &f), vec![1, 2]);

        // A stray offer with no future is still accepted
        ex.post_offer(f, 7).unwrap();
        assert_eq!(participants(&ex, ExchangeItemKind::Offer, &f), vec![1, 2, 7]);
    }

    #[test]
    fn test_confirm_moves_bidder_to_offers() {
        let ex = exchange();
        let f = fp(5);
        ex.post_offer(f, 1).unwrap();
        ex.post_bid(f, 2).unwrap();

        assert!(ex
            .handle_order(&ExchangeOrder::new(OrderKind::OfferConfirmMatchData, f, 2))
            .unwrap()
            .is_empty());
        assert_eq!(ex.len(ExchangeItemKind::Bid), 0);
        assert_eq!(participants(&ex, ExchangeItemKind::Offer, &f), vec![1, 2]);

        // Confirming without a bid is tolerated
        ex.post_offer_confirm_match_data(f, 3).unwrap();
        assert_eq!(participants(&ex, ExchangeItemKind::Offer, &f), vec![1, 2, 3]);
    }

    #[test]
    fn test_cancel() {
        let ex = exchange();
        let f = fp(6);
        ex.post_bid(f, 1).unwrap();
        ex.post_bid(f, 1).unwrap();

        ex.cancel(ExchangeItemKind::Bid, f, 1).unwrap();
        assert_eq!(participants(&ex, ExchangeItemKind::Bid, &f), vec![1]);
        ex.cancel(ExchangeItemKind::Bid, f, 1).unwrap();
        assert_eq!(ex.len(ExchangeItemKind::Bid), 0);

        let err = ex.cancel(ExchangeItemKind::Bid, f, 1).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Miss);
        let err = ex.cancel(ExchangeItemKind::Offer, f, 1).unwrap_err();
        assert!(matches!(err, ExchangeError::NotFound { kind: ExchangeItemKind::Offer, .. }));
    }

    #[test]
    fn test_shard_ownership() {
        let f = fp(7);
        let key = f.low_u64();
        let ex = Exchange::new(
            1,
            &ExchangeConfig {
                start_val: key.wrapping_add(1),
                end_val: u64::MAX,
                ..ExchangeConfig::default()
            },
        );
        if key == u64::MAX {
            return;
        }
        assert!(!ex.owns(&f));
        let err = ex.handle_order(&ExchangeOrder::new(OrderKind::Bid, f, 1)).unwrap_err();
        assert!(matches!(err, ExchangeError::NotOwner { .. }));
        assert_eq!(err.class(), ErrorClass::Invalid);
        assert_eq!(ex.stats().rejected, 1);
        assert!(ex.is_empty());

        let ex = Exchange::new(
            1,
            &ExchangeConfig {
                start_val: key,
                end_val: key,
                ..ExchangeConfig::default()
            },
        );
        assert!(ex.owns(&f));
    }

    #[test]
    fn test_table_full() {
        let ex = Exchange::new(
            0,
            &ExchangeConfig {
                max_bids: 2,
                ..ExchangeConfig::default()
            },
        );
        ex.post_bid(fp(1), 1).unwrap();
        ex.post_bid(fp(2), 1).unwrap();
        let err = ex.post_bid(fp(3), 1).unwrap_err();
        assert_eq!(err, ExchangeError::Full { kind: ExchangeItemKind::Bid, max: 2 });
        assert!(err.is_recoverable());

        // Existing entries still take participants
        ex.post_bid(fp(1), 2).unwrap();
        assert_eq!(participants(&ex, ExchangeItemKind::Bid, &fp(1)), vec![1, 2]);
    }

    #[test]
    fn test_lookup_and_modify_counters() {
        let ex = exchange();
        let f = fp(8);
        ex.post_offer(f, 1).unwrap();
        ex.post_offer(f, 2).unwrap();
        ex.post_bid(f, 3).unwrap();
        ex.post_bid(f, 4).unwrap();

        let snap = ex.query(ExchangeItemKind::Offer, &f).unwrap().unwrap();
        assert_eq!(snap.modifications, 1);
        // Two bids looked the offer up, plus this query
        assert_eq!(snap.lookups, 3);
        assert!(snap.last_lookup >= snap.last_modify);

        assert_eq!(ex.query(ExchangeItemKind::Future, &f).unwrap(), None);
    }

    #[test]
    fn test_match_notifications_respect_location_limit() {
        let ids: Vec<u32> = (0..7).collect();
        let out = match_notifications(1, 2, ExchangeItemKind::Bid, fp(9), &ids, 3);
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].node_ids, vec![6]);
        assert!(match_notifications(1, 2, ExchangeItemKind::Bid, fp(9), &[], 3).is_empty());
        assert!(match_notifications(1, 2, ExchangeItemKind::Future, fp(9), &ids, 3).is_empty());
    }

    #[test]
    fn test_concurrent_bids() {
        let ex = Arc::new(exchange());
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let ex = ex.clone();
                std::thread::spawn(move || {
                    for i in 0..250u8 {
                        ex.post_bid(fp(i % 16), t).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let total: usize = (0..16)
            .map(|i| participants(&ex, ExchangeItemKind::Bid, &fp(i)).len())
            .sum();
        assert_eq!(total, 1000);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Post(ExchangeItemKind, u8, u32),
        Cancel(ExchangeItemKind, u8, u32),
    }

    fn kind() -> impl Strategy<Value = ExchangeItemKind> {
        prop_oneof![
            Just(ExchangeItemKind::Bid),
            Just(ExchangeItemKind::Offer),
            Just(ExchangeItemKind::Future),
        ]
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (kind(), 0u8..4, 0u32..4).prop_map(|(k, f, n)| Op::Post(k, f, n)),
            (kind(), 0u8..4, 0u32..4).prop_map(|(k, f, n)| Op::Cancel(k, f, n)),
        ]
    }

    proptest! {
        /// Queues follow post/cancel order and empty entries disappear.
        #[test]
        fn prop_entries_track_model(ops in prop::collection::vec(op(), 1..200)) {
            let ex = exchange();
            let mut model: std::collections::HashMap<(ExchangeItemKind, u8), Vec<u32>> = Default::default();

            for op in ops {
                match op {
                    Op::Post(k, f, n) => {
                        ex.append(k, fp(f), n).unwrap();
                        model.entry((k, f)).or_default().push(n);
                    }
                    Op::Cancel(k, f, n) => {
                        let queue = model.entry((k, f)).or_default();
                        let expected = queue.iter().position(|x| *x == n).map(|p| queue.remove(p));
                        prop_assert_eq!(ex.cancel(k, fp(f), n).is_ok(), expected.is_some());
                    }
                }
                for k in ExchangeItemKind::ALL {
                    let live = model.iter().filter(|((mk, _), q)| *mk == k && !q.is_empty()).count();
                    prop_assert_eq!(ex.len(k), live);
                }
            }
            for ((k, f), queue) in &model {
                prop_assert_eq!(&participants(&ex, *k, &fp(*f)), queue);
            }
        }
    }
}
