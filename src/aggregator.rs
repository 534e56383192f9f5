//! Market Data Aggregator.
//!
//! Merges the latest price and yield feed readings into a single immutable
//! [`MarketSnapshot`], published via atomic pointer swap (`ArcSwap`) —
//! readers never block a writer and never see a torn snapshot.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::event_bus::{Event, EventBus};
use crate::feed::yield_feed::YieldFeed;
use crate::model::{MarketSnapshot, PriceTick};

#[derive(Debug, Clone)]
pub struct FeedEventLogEntry {
    pub at: DateTime<Utc>,
    pub chain_tag: String,
    pub message: String,
}

/// Bounded live event feed: human-readable strings with timestamp and
/// chain tag, capped at `capacity` (default 100).
pub struct LiveEventFeed {
    capacity: usize,
    entries: Mutex<VecDeque<FeedEventLogEntry>>,
}

impl LiveEventFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, chain_tag: impl Into<String>, message: impl Into<String>) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(FeedEventLogEntry {
            at: Utc::now(),
            chain_tag: chain_tag.into(),
            message: message.into(),
        });
    }

    pub fn snapshot(&self) -> Vec<FeedEventLogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Merges feed output into one [`MarketSnapshot`]. Pool/TVL data comes
/// straight from the yield feed; price ticks are folded in as they arrive
/// on the event bus via [`MarketDataAggregator::record_price`], since the
/// price feed itself only exposes per-`(chain, pair)` point lookups (spec
/// §4.2's `latestPrice`), not a bulk snapshot.
pub struct MarketDataAggregator {
    yield_feed: Arc<YieldFeed>,
    event_bus: Arc<EventBus>,
    current: ArcSwap<MarketSnapshot>,
    price_cache: Mutex<BTreeMap<String, PriceTick>>,
    live_feed: LiveEventFeed,
}

impl MarketDataAggregator {
    pub fn new(yield_feed: Arc<YieldFeed>, event_bus: Arc<EventBus>, live_feed_capacity: usize) -> Self {
        Self {
            yield_feed,
            event_bus,
            current: ArcSwap::from_pointee(MarketSnapshot::default()),
            price_cache: Mutex::new(BTreeMap::new()),
            live_feed: LiveEventFeed::new(live_feed_capacity),
        }
    }

    /// Exposes the immutable latest snapshot. Consumers hold an `Arc` so
    /// they see a fully-formed snapshot even if a new one is published
    /// mid-read: a new snapshot supersedes the old one atomically.
    pub fn current_snapshot(&self) -> Arc<MarketSnapshot> {
        self.current.load_full()
    }

    /// Records a newly observed price tick so the next recompute folds it
    /// into the snapshot. Wired by the Supervisor as a `priceUpdate`
    /// subscriber.
    pub fn record_price(&self, tick: PriceTick) {
        self.live_feed
            .push("price", format!("{}: tick recorded", tick.pair));
        self.price_cache.lock().insert(tick.pair.clone(), tick);
    }

    /// Recomputes the snapshot from the latest feed readings. Called
    /// after every feed emission.
    pub fn recompute(&self) {
        let pools = self.yield_feed.latest_yields();
        let prices = self.price_cache.lock().clone();
        let taken_at = Utc::now();
        let pool_count = pools.len();

        let new_snapshot = MarketSnapshot::new(pools, prices, taken_at);
        self.current.store(Arc::new(new_snapshot));

        self.live_feed.push(
            "aggregate",
            format!("snapshot recomputed: {pool_count} pools tracked"),
        );
        self.event_bus.publish(Event::Snapshot { taken_at });
    }

    pub fn live_feed(&self) -> &LiveEventFeed {
        &self.live_feed
    }
}
