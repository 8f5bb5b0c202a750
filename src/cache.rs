use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::model::{Candle, ExchangeKind, Interval, OrderBook, Trade};

/// Maximum candles retained per (exchange, symbol, interval) slot.
pub const CANDLE_RING_CAPACITY: usize = 100;

/// How often the bucket clock samples the wall clock.
const BUCKET_CLOCK_PERIOD: Duration = Duration::from_millis(300);

pub type MarketKey = (ExchangeKind, String);
pub type CandleKey = (ExchangeKind, String, Interval);

#[derive(Default)]
struct Slots {
    candles: HashMap<CandleKey, VecDeque<Candle>>,
    order_books: HashMap<MarketKey, Option<OrderBook>>,
}

/// In-memory store for live/backfilled candles and latest order books.
///
/// The only shared mutable state of the watcher. All operations take the
/// lock for a short synchronous section; nothing is held across an await.
#[derive(Default)]
pub struct Cache {
    slots: RwLock<Slots>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an empty candle ring for the slot. Idempotent.
    pub fn create_candle_storage(&self, exchange: ExchangeKind, symbol: &str, interval: Interval) {
        let mut slots = self.slots.write().expect("cache lock poisoned");
        slots
            .candles
            .entry((exchange, symbol.to_owned(), interval))
            .or_default();
    }

    /// Allocate the latest-order-book slot for the market. Idempotent.
    pub fn create_order_book_storage(&self, exchange: ExchangeKind, symbol: &str) {
        let mut slots = self.slots.write().expect("cache lock poisoned");
        slots
            .order_books
            .entry((exchange, symbol.to_owned()))
            .or_default();
    }

    /// Overwrite the market's latest order-book snapshot.
    pub fn cache_order_book(&self, order_book: OrderBook, exchange: ExchangeKind, symbol: &str) {
        let mut slots = self.slots.write().expect("cache lock poisoned");
        slots
            .order_books
            .insert((exchange, symbol.to_owned()), Some(order_book));
    }

    pub fn order_book(&self, exchange: ExchangeKind, symbol: &str) -> Option<OrderBook> {
        let slots = self.slots.read().expect("cache lock poisoned");
        slots
            .order_books
            .get(&(exchange, symbol.to_owned()))
            .and_then(|slot| slot.clone())
    }

    /// Append a candle to its slot, keeping timestamps unique and strictly
    /// ascending. Returns `false` (no-op) for a duplicate timestamp, a
    /// missing slot, or an out-of-order insert.
    pub fn add_candle(&self, candle: Candle) -> bool {
        let key = (
            candle.exchange,
            candle.symbol.clone(),
            candle.interval,
        );
        let mut slots = self.slots.write().expect("cache lock poisoned");
        let Some(ring) = slots.candles.get_mut(&key) else {
            debug!(exchange = %candle.exchange, symbol = %key.1, interval = %candle.interval,
                   "dropping candle for unallocated slot");
            return false;
        };
        push_candle(ring, candle)
    }

    /// Buffer a trade into the last candle of every live interval bucket of
    /// the trade's market. Never creates candles.
    pub fn cache_trade(&self, trade: &Trade, exchange: ExchangeKind) {
        let symbol = trade.market_symbol().to_owned();
        let mut slots = self.slots.write().expect("cache lock poisoned");
        for (key, ring) in slots.candles.iter_mut() {
            if key.0 != exchange || key.1 != symbol {
                continue;
            }
            if let Some(last) = ring.back_mut() {
                last.add_trade(trade.clone());
            }
        }
    }

    /// Snapshot of a slot's candles, optionally filtered to the half-open
    /// unix-second range `[since, until)`.
    pub fn get_candles(
        &self,
        exchange: ExchangeKind,
        symbol: &str,
        interval: Interval,
        since: Option<i64>,
        until: Option<i64>,
    ) -> Vec<Candle> {
        let slots = self.slots.read().expect("cache lock poisoned");
        let Some(ring) = slots
            .candles
            .get(&(exchange, symbol.to_owned(), interval))
        else {
            return Vec::new();
        };
        ring.iter()
            .filter(|c| since.is_none_or(|s| c.timestamp() >= s))
            .filter(|c| until.is_none_or(|u| c.timestamp() < u))
            .cloned()
            .collect()
    }

    /// Bucket-start timestamp of the newest candle in the slot.
    pub fn last_candle_timestamp(
        &self,
        exchange: ExchangeKind,
        symbol: &str,
        interval: Interval,
    ) -> Option<i64> {
        let slots = self.slots.read().expect("cache lock poisoned");
        slots
            .candles
            .get(&(exchange, symbol.to_owned(), interval))
            .and_then(|ring| ring.back())
            .map(Candle::timestamp)
    }

    /// Close out interval buckets that end at `now` and open their
    /// successors. Called by the bucket clock once per wall-clock second.
    ///
    /// A fresh candle is created even when the previous one saw no trades,
    /// so an interval closes in the absence of activity.
    pub fn roll_buckets(&self, now: i64) {
        let mut slots = self.slots.write().expect("cache lock poisoned");
        for (key, ring) in slots.candles.iter_mut() {
            let interval = key.2;
            let seconds = interval.seconds();
            if seconds <= 0 || now.rem_euclid(seconds) != 0 {
                continue;
            }
            if let Some(last) = ring.back_mut() {
                if now < last.time_limit() {
                    continue;
                }
                last.clear_trades();
            }
            let Some(open_time) = DateTime::from_timestamp(interval.truncate(now), 0) else {
                continue;
            };
            let candle = Candle::new(key.0, key.1.clone(), open_time, interval);
            push_candle(ring, candle);
        }
    }

    /// Drop every slot belonging to the market.
    pub fn release_market(&self, exchange: ExchangeKind, symbol: &str) {
        let mut slots = self.slots.write().expect("cache lock poisoned");
        slots
            .candles
            .retain(|key, _| !(key.0 == exchange && key.1 == symbol));
        slots.order_books.remove(&(exchange, symbol.to_owned()));
    }

    /// Drop a single interval ring of the market.
    pub fn release_interval(&self, exchange: ExchangeKind, symbol: &str, interval: Interval) {
        let mut slots = self.slots.write().expect("cache lock poisoned");
        slots
            .candles
            .remove(&(exchange, symbol.to_owned(), interval));
    }

    /// Every market that currently owns at least one slot.
    pub fn market_keys(&self) -> Vec<MarketKey> {
        let slots = self.slots.read().expect("cache lock poisoned");
        let mut keys: Vec<MarketKey> = slots.order_books.keys().cloned().collect();
        for key in slots.candles.keys() {
            let market = (key.0, key.1.clone());
            if !keys.contains(&market) {
                keys.push(market);
            }
        }
        keys
    }

    /// Every allocated candle slot.
    pub fn candle_keys(&self) -> Vec<CandleKey> {
        let slots = self.slots.read().expect("cache lock poisoned");
        slots.candles.keys().cloned().collect()
    }
}

fn push_candle(ring: &mut VecDeque<Candle>, candle: Candle) -> bool {
    if ring.iter().any(|c| c.timestamp() == candle.timestamp()) {
        return false;
    }
    if let Some(last) = ring.back()
        && last.timestamp() > candle.timestamp()
    {
        // Would break the ascending-order invariant. A bug upstream:
        // loud in debug builds, dropped in release.
        debug_assert!(
            false,
            "out-of-order candle insert: {} after {}",
            candle.timestamp(),
            last.timestamp()
        );
        debug!(
            symbol = %candle.symbol,
            interval = %candle.interval,
            timestamp = candle.timestamp(),
            "dropping out-of-order candle"
        );
        return false;
    }
    ring.push_back(candle);
    if ring.len() > CANDLE_RING_CAPACITY {
        ring.pop_front();
    }
    true
}

/// Long-lived task that watches the wall clock and rolls interval buckets
/// whenever the observed unix second changes.
pub async fn run_bucket_clock(cache: Arc<Cache>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(BUCKET_CLOCK_PERIOD);
    let mut last_second = Utc::now().timestamp();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let now = Utc::now().timestamp();
                if now != last_second {
                    cache.roll_buckets(now);
                }
                last_second = now;
            }
        }
    }
}
