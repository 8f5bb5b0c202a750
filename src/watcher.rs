pub mod dispatch;
pub mod evaluate;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use error_stack::Report;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{self, Cache};
use crate::error::ExchangeError;
use crate::exchange::Exchange;
use crate::model::{AlarmRecord, Condition, ExchangeKind, Interval, Trade};
use crate::notifier::Notifier;
use crate::store::AlarmStore;

const REGISTRY_POLL_PERIOD: Duration = Duration::from_secs(5);
const BACKFILL_CANDLE_LIMIT: usize = 100;
const ORDER_BOOK_LIMIT: usize = 20;
const TRADE_READ_TIMEOUT: Duration = Duration::from_secs(30);
const ORDER_BOOK_POLL_PERIOD: Duration = Duration::from_millis(100);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const JANITOR_WARMUP: Duration = Duration::from_secs(10 * 60);
const JANITOR_PERIOD: Duration = Duration::from_secs(5 * 60);

/// A registered alarm with its runtime alert state.
#[derive(Debug, Clone)]
pub struct Alarm {
    pub id: i64,
    pub channel_id: i64,
    pub exchange: ExchangeKind,
    pub base_symbol: String,
    pub quote_symbol: String,
    pub symbol: String,
    pub condition: Condition,
    /// Bucket timestamp of the shortest watched interval when this alarm
    /// last fired; 0 until the first alert. Never decreases.
    pub alerted_candle_timestamp: i64,
}

impl Alarm {
    pub fn from_record(record: AlarmRecord, condition: Condition) -> Self {
        let symbol = record.symbol();
        Self {
            id: record.alarm_id,
            channel_id: record.channel_id,
            exchange: record.exchange,
            base_symbol: record.base_symbol,
            quote_symbol: record.quote_symbol,
            symbol,
            condition,
            alerted_candle_timestamp: 0,
        }
    }

    pub fn watched_intervals(&self) -> Vec<Interval> {
        self.condition.watched_intervals()
    }

    pub fn shortest_interval(&self) -> Option<Interval> {
        self.condition.shortest_interval()
    }
}

/// Shared snapshot of the registered-alarm set.
///
/// Watch tasks consult this each iteration instead of holding a reference
/// back into the registrar, which keeps shutdown observable.
#[derive(Default)]
pub struct Registry {
    alarms: RwLock<HashMap<i64, Alarm>>,
    /// Markets that currently have a running task pair.
    live_markets: Mutex<HashSet<(ExchangeKind, String)>>,
}

impl Registry {
    pub fn register(&self, alarm: Alarm) {
        let mut alarms = self.alarms.write().expect("registry lock poisoned");
        alarms.insert(alarm.id, alarm);
    }

    pub fn unregister(&self, alarm_id: i64) {
        let mut alarms = self.alarms.write().expect("registry lock poisoned");
        alarms.remove(&alarm_id);
    }

    pub fn alarm_ids(&self) -> Vec<i64> {
        let alarms = self.alarms.read().expect("registry lock poisoned");
        alarms.keys().copied().collect()
    }

    pub fn condition_of(&self, alarm_id: i64) -> Option<Condition> {
        let alarms = self.alarms.read().expect("registry lock poisoned");
        alarms.get(&alarm_id).map(|a| a.condition.clone())
    }

    pub fn replace_condition(&self, alarm_id: i64, condition: Condition) {
        let mut alarms = self.alarms.write().expect("registry lock poisoned");
        if let Some(alarm) = alarms.get_mut(&alarm_id) {
            alarm.condition = condition;
        }
    }

    /// Advance the alarm's alerted-candle timestamp; never moves backwards.
    pub fn mark_alerted(&self, alarm_id: i64, candle_timestamp: i64) {
        let mut alarms = self.alarms.write().expect("registry lock poisoned");
        if let Some(alarm) = alarms.get_mut(&alarm_id) {
            alarm.alerted_candle_timestamp = alarm.alerted_candle_timestamp.max(candle_timestamp);
        }
    }

    pub fn is_market_registered(&self, exchange: ExchangeKind, symbol: &str) -> bool {
        let alarms = self.alarms.read().expect("registry lock poisoned");
        alarms
            .values()
            .any(|a| a.exchange == exchange && a.symbol == symbol)
    }

    pub fn alarms_on_market(&self, exchange: ExchangeKind, symbol: &str) -> Vec<Alarm> {
        let alarms = self.alarms.read().expect("registry lock poisoned");
        alarms
            .values()
            .filter(|a| a.exchange == exchange && a.symbol == symbol)
            .cloned()
            .collect()
    }

    /// Every market at least one registered alarm points at.
    pub fn registered_markets(&self) -> HashSet<(ExchangeKind, String)> {
        let alarms = self.alarms.read().expect("registry lock poisoned");
        alarms
            .values()
            .map(|a| (a.exchange, a.symbol.clone()))
            .collect()
    }

    pub fn watched_intervals_on(&self, exchange: ExchangeKind, symbol: &str) -> HashSet<Interval> {
        let alarms = self.alarms.read().expect("registry lock poisoned");
        alarms
            .values()
            .filter(|a| a.exchange == exchange && a.symbol == symbol)
            .flat_map(|a| a.watched_intervals())
            .collect()
    }

    /// Claim the market for a new task pair. False when already claimed.
    pub fn claim_market(&self, exchange: ExchangeKind, symbol: &str) -> bool {
        let mut markets = self.live_markets.lock().expect("registry lock poisoned");
        markets.insert((exchange, symbol.to_owned()))
    }

    pub fn release_market(&self, exchange: ExchangeKind, symbol: &str) {
        let mut markets = self.live_markets.lock().expect("registry lock poisoned");
        markets.remove(&(exchange, symbol.to_owned()));
    }
}

/// Owns the registered-alarm lifecycle and the per-market watch tasks.
pub struct Watcher {
    store: Arc<dyn AlarmStore>,
    notifier: Arc<dyn Notifier>,
    upbit: Arc<dyn Exchange>,
    binance: Arc<dyn Exchange>,
    cache: Arc<Cache>,
    registry: Arc<Registry>,
}

impl Watcher {
    pub fn new(
        store: Arc<dyn AlarmStore>,
        notifier: Arc<dyn Notifier>,
        upbit: Arc<dyn Exchange>,
        binance: Arc<dyn Exchange>,
    ) -> Self {
        Self {
            store,
            notifier,
            upbit,
            binance,
            cache: Arc::new(Cache::new()),
            registry: Arc::new(Registry::default()),
        }
    }

    fn exchange(&self, kind: ExchangeKind) -> &Arc<dyn Exchange> {
        match kind {
            ExchangeKind::Upbit => &self.upbit,
            ExchangeKind::Binance => &self.binance,
        }
    }

    /// Run the watcher until cancelled: bucket clock, janitor, and the 5 s
    /// registrar loop reconciling the enabled-alarm set with running tasks.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(cache::run_bucket_clock(
            Arc::clone(&self.cache),
            cancel.clone(),
        ));
        tokio::spawn(run_janitor(Arc::clone(&self), cancel.clone()));

        let mut poll = tokio::time::interval(REGISTRY_POLL_PERIOD);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = poll.tick() => update_registered_alarms(&self, &cancel).await,
            }
        }
        info!("watcher stopped");
    }
}

/// One registrar pass: load the enabled set, register/reconcile/unregister.
async fn update_registered_alarms(watcher: &Arc<Watcher>, cancel: &CancellationToken) {
    let records = match watcher.store.select_enabled_alarms().await {
        Ok(records) => records,
        Err(report) => {
            warn!(error = ?report, "failed to load enabled alarms");
            return;
        }
    };

    let mut enabled_ids = HashSet::with_capacity(records.len());
    for record in records {
        enabled_ids.insert(record.alarm_id);

        let condition = match watcher.store.select_condition(record.alarm_id).await {
            Ok(condition) => condition,
            Err(report) => {
                warn!(alarm_id = record.alarm_id, error = ?report,
                      "skipping alarm with unreadable condition");
                continue;
            }
        };

        match watcher.registry.condition_of(record.alarm_id) {
            None => {
                let alarm_id = record.alarm_id;
                if let Err(report) = register_alarm(watcher, record, condition, cancel).await {
                    warn!(alarm_id, error = ?report,
                          "alarm registration failed, will retry next cycle");
                }
            }
            Some(current) if current != condition => {
                if let Err(report) = reconcile_alarm(watcher, &record, &current, condition).await {
                    warn!(alarm_id = record.alarm_id, error = ?report,
                          "alarm reconciliation failed, will retry next cycle");
                }
            }
            Some(_) => {}
        }
    }

    for alarm_id in watcher.registry.alarm_ids() {
        if !enabled_ids.contains(&alarm_id) {
            watcher.registry.unregister(alarm_id);
            info!(alarm_id, "alarm unregistered");
        }
    }

    // A task pair may have observed an empty market and exited in the same
    // window a new alarm arrived on it; the claim guard makes this a no-op
    // for markets whose tasks are still running.
    for (kind, symbol) in watcher.registry.registered_markets() {
        spawn_market_tasks(watcher, kind, &symbol, cancel);
    }
}

async fn register_alarm(
    watcher: &Arc<Watcher>,
    record: AlarmRecord,
    condition: Condition,
    cancel: &CancellationToken,
) -> Result<(), Report<ExchangeError>> {
    let kind = record.exchange;
    let symbol = record.symbol();
    let exchange = watcher.exchange(kind);

    for interval in condition.watched_intervals() {
        watcher.cache.create_candle_storage(kind, &symbol, interval);
    }
    watcher.cache.create_order_book_storage(kind, &symbol);

    for interval in condition.watched_intervals() {
        backfill_interval(watcher, exchange, kind, &symbol, interval).await?;
    }
    let order_book = exchange.fetch_order_book(&symbol, ORDER_BOOK_LIMIT).await?;
    watcher.cache.cache_order_book(order_book, kind, &symbol);

    let alarm_id = record.alarm_id;
    watcher.registry.register(Alarm::from_record(record, condition));
    spawn_market_tasks(watcher, kind, &symbol, cancel);
    info!(alarm_id, exchange = %kind, symbol = %symbol, "alarm registered");
    Ok(())
}

/// Apply an edited condition: backfill intervals it newly watches, then
/// swap it in. The alarm's alert state and the market tasks are untouched.
async fn reconcile_alarm(
    watcher: &Arc<Watcher>,
    record: &AlarmRecord,
    current: &Condition,
    next: Condition,
) -> Result<(), Report<ExchangeError>> {
    let kind = record.exchange;
    let symbol = record.symbol();
    let exchange = watcher.exchange(kind);

    let current_intervals = current.watched_intervals();
    for interval in next.watched_intervals() {
        if current_intervals.contains(&interval) {
            continue;
        }
        watcher.cache.create_candle_storage(kind, &symbol, interval);
        backfill_interval(watcher, exchange, kind, &symbol, interval).await?;
    }

    watcher.registry.replace_condition(record.alarm_id, next);
    info!(alarm_id = record.alarm_id, "alarm condition reconciled");
    Ok(())
}

/// Fetch recent history for one interval and cache it, skipping candles
/// already present.
async fn backfill_interval(
    watcher: &Watcher,
    exchange: &Arc<dyn Exchange>,
    kind: ExchangeKind,
    symbol: &str,
    interval: Interval,
) -> Result<(), Report<ExchangeError>> {
    let candles = exchange
        .fetch_ohlcv(symbol, interval, BACKFILL_CANDLE_LIMIT)
        .await?;
    let mut added = 0;
    for candle in candles {
        if watcher.cache.add_candle(candle) {
            added += 1;
        }
    }
    debug!(exchange = %kind, symbol, %interval, added, "backfilled candles");
    Ok(())
}

fn spawn_market_tasks(
    watcher: &Arc<Watcher>,
    kind: ExchangeKind,
    symbol: &str,
    cancel: &CancellationToken,
) {
    if !watcher.registry.claim_market(kind, symbol) {
        return;
    }
    tokio::spawn(run_trade_task(
        Arc::clone(watcher),
        kind,
        symbol.to_owned(),
        cancel.clone(),
    ));
    tokio::spawn(run_order_book_task(
        Arc::clone(watcher),
        kind,
        symbol.to_owned(),
        cancel.clone(),
    ));
}

/// Streams trades for one market, drives the candle rollup, and evaluates
/// every alarm on the market against each trade. Self-terminates once the
/// market has no registered alarms, releasing its cache slots.
async fn run_trade_task(
    watcher: Arc<Watcher>,
    kind: ExchangeKind,
    symbol: String,
    cancel: CancellationToken,
) {
    info!(exchange = %kind, symbol = %symbol, "trade task started");
    let exchange = Arc::clone(watcher.exchange(kind));

    'run: loop {
        if cancel.is_cancelled() || !watcher.registry.is_market_registered(kind, &symbol) {
            break;
        }
        let mut feed = match exchange.watch_trades(&symbol).await {
            Ok(feed) => feed,
            Err(report) => {
                warn!(exchange = %kind, symbol = %symbol, error = ?report,
                      "trade stream connect failed, retrying");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                continue;
            }
        };
        loop {
            if cancel.is_cancelled() || !watcher.registry.is_market_registered(kind, &symbol) {
                break 'run;
            }
            match tokio::time::timeout(TRADE_READ_TIMEOUT, feed.next_batch()).await {
                Err(_elapsed) => {
                    debug!(exchange = %kind, symbol = %symbol,
                           "trade read timed out, reopening stream");
                    continue 'run;
                }
                Ok(Err(report)) => {
                    warn!(exchange = %kind, symbol = %symbol, error = ?report,
                          "trade stream failed, reopening");
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                    continue 'run;
                }
                Ok(Ok(batch)) => {
                    for trade in &batch {
                        process_trade(&watcher, kind, &symbol, trade).await;
                    }
                }
            }
        }
    }

    watcher.registry.release_market(kind, &symbol);
    // The market may have regained an alarm while this task was winding
    // down; leave its slots for the replacement task pair in that case.
    if !watcher.registry.is_market_registered(kind, &symbol) {
        watcher.cache.release_market(kind, &symbol);
    }
    info!(exchange = %kind, symbol = %symbol, "trade task closed");
}

/// Cache the trade, then evaluate and dispatch each alarm on the market,
/// honoring the once-per-candle suppression.
async fn process_trade(watcher: &Watcher, kind: ExchangeKind, symbol: &str, trade: &Trade) {
    watcher.cache.cache_trade(trade, kind);

    for alarm in watcher.registry.alarms_on_market(kind, symbol) {
        let last_candle_timestamp = alarm
            .shortest_interval()
            .and_then(|interval| watcher.cache.last_candle_timestamp(kind, symbol, interval));

        // Already alerted for the current candle of the shortest watched
        // interval; alarms without interval conditions are never suppressed.
        if let Some(timestamp) = last_candle_timestamp
            && alarm.alerted_candle_timestamp == timestamp
        {
            continue;
        }

        let result = evaluate::check(&alarm, trade, &watcher.cache);
        if !result.is_alarm_triggered {
            continue;
        }

        match dispatch::send(watcher.notifier.as_ref(), &alarm, &result).await {
            Ok(()) => {
                if let Some(timestamp) = last_candle_timestamp {
                    watcher.registry.mark_alerted(alarm.id, timestamp);
                }
            }
            Err(report) => {
                debug!(alarm_id = alarm.id, error = ?report, "alert delivery failed");
            }
        }
    }
}

/// Keeps the market's latest order-book snapshot fresh for whale checks.
/// Terminates on the same condition as the trade task.
async fn run_order_book_task(
    watcher: Arc<Watcher>,
    kind: ExchangeKind,
    symbol: String,
    cancel: CancellationToken,
) {
    info!(exchange = %kind, symbol = %symbol, "order book task started");
    let exchange = Arc::clone(watcher.exchange(kind));

    'run: loop {
        if cancel.is_cancelled() || !watcher.registry.is_market_registered(kind, &symbol) {
            break;
        }
        let feed = match exchange.watch_order_book(&symbol, ORDER_BOOK_LIMIT).await {
            Ok(feed) => feed,
            Err(report) => {
                warn!(exchange = %kind, symbol = %symbol, error = ?report,
                      "order book stream connect failed, retrying");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                continue;
            }
        };
        loop {
            if cancel.is_cancelled() || !watcher.registry.is_market_registered(kind, &symbol) {
                break 'run;
            }
            if !feed.is_alive() {
                debug!(exchange = %kind, symbol = %symbol,
                       "order book stream died, reopening");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                continue 'run;
            }
            if let Some(order_book) = feed.latest() {
                watcher.cache.cache_order_book(order_book, kind, &symbol);
            }
            tokio::time::sleep(ORDER_BOOK_POLL_PERIOD).await;
        }
    }

    watcher.registry.release_market(kind, &symbol);
    // The market may have regained an alarm while this task was winding
    // down; leave its slots for the replacement task pair in that case.
    if !watcher.registry.is_market_registered(kind, &symbol) {
        watcher.cache.release_market(kind, &symbol);
    }
    info!(exchange = %kind, symbol = %symbol, "order book task closed");
}

/// Reclaims cache slots whose markets or intervals lost their alarms.
async fn run_janitor(watcher: Arc<Watcher>, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(JANITOR_WARMUP) => {}
    }

    let mut period = tokio::time::interval(JANITOR_PERIOD);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = period.tick() => {
                for (kind, symbol) in watcher.cache.market_keys() {
                    if !watcher.registry.is_market_registered(kind, &symbol) {
                        watcher.cache.release_market(kind, &symbol);
                        debug!(exchange = %kind, symbol = %symbol, "janitor dropped market cache");
                    }
                }
                for (kind, symbol, interval) in watcher.cache.candle_keys() {
                    if !watcher
                        .registry
                        .watched_intervals_on(kind, &symbol)
                        .contains(&interval)
                    {
                        watcher.cache.release_interval(kind, &symbol, interval);
                        debug!(exchange = %kind, symbol = %symbol, %interval,
                               "janitor dropped interval cache");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{NotifyError, StoreError};
    use crate::exchange::{OrderBookFeed, TradeFeed};
    use crate::model::{
        BookLevel, Candle, OrderBook, RsiCondition, Timeframe, WhaleCondition,
    };
    use chrono::{DateTime, Utc};
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::{mpsc, watch};

    const UPBIT: ExchangeKind = ExchangeKind::Upbit;

    fn minute(length: u32) -> Interval {
        Interval::new(length, Timeframe::Minute)
    }

    // ── Mocks ────────────────────────────────────────────────────────────────

    #[derive(Default)]
    struct MockStore {
        rows: Mutex<HashMap<i64, (AlarmRecord, Condition)>>,
    }

    impl MockStore {
        fn put(&self, record: AlarmRecord, condition: Condition) {
            self.rows
                .lock()
                .unwrap()
                .insert(record.alarm_id, (record, condition));
        }

        fn remove(&self, alarm_id: i64) {
            self.rows.lock().unwrap().remove(&alarm_id);
        }
    }

    impl AlarmStore for MockStore {
        fn select_enabled_alarms(
            &self,
        ) -> BoxFuture<'_, Result<Vec<AlarmRecord>, Report<StoreError>>> {
            Box::pin(async move {
                let rows = self.rows.lock().unwrap();
                let mut records: Vec<AlarmRecord> =
                    rows.values().map(|(record, _)| record.clone()).collect();
                records.sort_by_key(|r| r.alarm_id);
                Ok(records)
            })
        }

        fn select_condition(
            &self,
            alarm_id: i64,
        ) -> BoxFuture<'_, Result<Condition, Report<StoreError>>> {
            Box::pin(async move {
                let rows = self.rows.lock().unwrap();
                match rows.get(&alarm_id) {
                    Some((_, condition)) => Ok(condition.clone()),
                    None => Err(Report::new(StoreError::MalformedCondition { alarm_id })),
                }
            })
        }
    }

    struct MockExchange {
        kind: ExchangeKind,
        candles: Mutex<HashMap<(String, Interval), Vec<Candle>>>,
        order_book: Mutex<OrderBook>,
        trade_senders: Mutex<Vec<mpsc::Sender<Trade>>>,
        book_senders: Mutex<Vec<watch::Sender<Option<OrderBook>>>>,
        fail_backfill: AtomicBool,
    }

    impl MockExchange {
        fn new(kind: ExchangeKind) -> Self {
            Self {
                kind,
                candles: Mutex::new(HashMap::new()),
                order_book: Mutex::new(OrderBook::default()),
                trade_senders: Mutex::new(Vec::new()),
                book_senders: Mutex::new(Vec::new()),
                fail_backfill: AtomicBool::new(false),
            }
        }

        fn set_candles(&self, symbol: &str, interval: Interval, closes: &[f64]) {
            let candles = closes
                .iter()
                .enumerate()
                .map(|(i, &close)| {
                    let ts = interval.seconds() * (i as i64 + 1);
                    Candle::from_ohlcv(
                        self.kind,
                        symbol,
                        DateTime::from_timestamp(ts, 0).unwrap(),
                        interval,
                        close,
                        close,
                        close,
                        close,
                    )
                })
                .collect();
            self.candles
                .lock()
                .unwrap()
                .insert((symbol.to_owned(), interval), candles);
        }

        async fn push_trade(&self, trade: Trade) {
            let senders: Vec<mpsc::Sender<Trade>> =
                self.trade_senders.lock().unwrap().clone();
            for sender in senders {
                let _ = sender.send(trade.clone()).await;
            }
        }
    }

    impl Exchange for MockExchange {
        fn kind(&self) -> ExchangeKind {
            self.kind
        }

        fn fetch_ohlcv(
            &self,
            symbol: &str,
            interval: Interval,
            _limit: usize,
        ) -> BoxFuture<'_, Result<Vec<Candle>, Report<ExchangeError>>> {
            let symbol = symbol.to_owned();
            Box::pin(async move {
                if self.fail_backfill.load(Ordering::SeqCst) {
                    return Err(Report::new(ExchangeError::Request {
                        exchange: "mock".into(),
                    }));
                }
                let candles = self.candles.lock().unwrap();
                Ok(candles.get(&(symbol, interval)).cloned().unwrap_or_default())
            })
        }

        fn fetch_order_book(
            &self,
            _symbol: &str,
            _limit: usize,
        ) -> BoxFuture<'_, Result<OrderBook, Report<ExchangeError>>> {
            Box::pin(async move { Ok(self.order_book.lock().unwrap().clone()) })
        }

        fn watch_trades(
            &self,
            _symbol: &str,
        ) -> BoxFuture<'_, Result<TradeFeed, Report<ExchangeError>>> {
            Box::pin(async move {
                let (tx, rx) = mpsc::channel(64);
                self.trade_senders.lock().unwrap().push(tx);
                Ok(TradeFeed::new(self.kind, rx, CancellationToken::new()))
            })
        }

        fn watch_order_book(
            &self,
            _symbol: &str,
            _limit: usize,
        ) -> BoxFuture<'_, Result<OrderBookFeed, Report<ExchangeError>>> {
            Box::pin(async move {
                let book = self.order_book.lock().unwrap().clone();
                let (tx, rx) = watch::channel(Some(book));
                self.book_senders.lock().unwrap().push(tx);
                Ok(OrderBookFeed::new(rx, CancellationToken::new()))
            })
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(i64, String)>>,
        fail_all: AtomicBool,
    }

    impl Notifier for RecordingNotifier {
        fn send(
            &self,
            channel_id: i64,
            text: &str,
        ) -> BoxFuture<'_, Result<(), Report<NotifyError>>> {
            let text = text.to_owned();
            Box::pin(async move {
                if self.fail_all.load(Ordering::SeqCst) {
                    return Err(Report::new(NotifyError::Transport));
                }
                self.sent.lock().unwrap().push((channel_id, text));
                Ok(())
            })
        }
    }

    struct Fixture {
        watcher: Arc<Watcher>,
        store: Arc<MockStore>,
        upbit: Arc<MockExchange>,
        binance: Arc<MockExchange>,
        notifier: Arc<RecordingNotifier>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MockStore::default());
        let upbit = Arc::new(MockExchange::new(ExchangeKind::Upbit));
        let binance = Arc::new(MockExchange::new(ExchangeKind::Binance));
        let notifier = Arc::new(RecordingNotifier::default());
        let watcher = Arc::new(Watcher::new(
            Arc::clone(&store) as Arc<dyn AlarmStore>,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            Arc::clone(&upbit) as Arc<dyn Exchange>,
            Arc::clone(&binance) as Arc<dyn Exchange>,
        ));
        Fixture {
            watcher,
            store,
            upbit,
            binance,
            notifier,
        }
    }

    fn record(alarm_id: i64, exchange: ExchangeKind, base: &str, quote: &str) -> AlarmRecord {
        AlarmRecord {
            alarm_id,
            channel_id: 1000 + alarm_id,
            exchange,
            base_symbol: base.into(),
            quote_symbol: quote.into(),
        }
    }

    fn rsi_condition(interval: Interval) -> Condition {
        Condition {
            rsi: Some(RsiCondition {
                length: 14,
                interval,
                upper_bound: 70.0,
                lower_bound: 30.0,
            }),
            ..Condition::default()
        }
    }

    fn whale_condition(quantity: f64) -> Condition {
        Condition {
            whale: Some(WhaleCondition { quantity }),
            ..Condition::default()
        }
    }

    fn make_trade(exchange: ExchangeKind, symbol: &str, timestamp: i64, price: f64) -> Trade {
        Trade {
            exchange,
            symbol: symbol.to_owned(),
            timestamp: DateTime::from_timestamp(timestamp, 0).unwrap(),
            price,
            amount: 1.0,
            cost: price,
        }
    }

    /// Seed rising closes ending at the current 1m bucket so RSI trips its
    /// upper bound.
    fn seed_rising_candles(watcher: &Watcher, symbol: &str) -> i64 {
        let interval = minute(1);
        watcher.cache.create_candle_storage(UPBIT, symbol, interval);
        let end = interval.truncate(Utc::now().timestamp());
        for i in 0..15i64 {
            let ts = end - 60 * (14 - i);
            watcher.cache.add_candle(Candle::from_ohlcv(
                UPBIT,
                symbol,
                DateTime::from_timestamp(ts, 0).unwrap(),
                interval,
                (i + 1) as f64,
                (i + 1) as f64,
                (i + 1) as f64,
                (i + 1) as f64,
            ));
        }
        end
    }

    // ── Registry ─────────────────────────────────────────────────────────────

    #[test]
    fn registry_market_membership_follows_alarms() {
        let registry = Registry::default();
        assert!(!registry.is_market_registered(UPBIT, "BTC/KRW"));

        registry.register(Alarm::from_record(
            record(1, UPBIT, "BTC", "KRW"),
            Condition::default(),
        ));
        assert!(registry.is_market_registered(UPBIT, "BTC/KRW"));
        assert!(!registry.is_market_registered(ExchangeKind::Binance, "BTC/KRW"));

        registry.unregister(1);
        assert!(!registry.is_market_registered(UPBIT, "BTC/KRW"));
    }

    #[test]
    fn registry_market_claims_are_exclusive() {
        let registry = Registry::default();
        assert!(registry.claim_market(UPBIT, "BTC/KRW"));
        assert!(!registry.claim_market(UPBIT, "BTC/KRW"));
        registry.release_market(UPBIT, "BTC/KRW");
        assert!(registry.claim_market(UPBIT, "BTC/KRW"));
    }

    #[test]
    fn registry_mark_alerted_never_regresses() {
        let registry = Registry::default();
        registry.register(Alarm::from_record(
            record(1, UPBIT, "BTC", "KRW"),
            Condition::default(),
        ));
        registry.mark_alerted(1, 600);
        registry.mark_alerted(1, 540);
        let alarm = &registry.alarms_on_market(UPBIT, "BTC/KRW")[0];
        assert_eq!(alarm.alerted_candle_timestamp, 600);
        registry.mark_alerted(1, 660);
        let alarm = &registry.alarms_on_market(UPBIT, "BTC/KRW")[0];
        assert_eq!(alarm.alerted_candle_timestamp, 660);
    }

    #[test]
    fn registry_watched_intervals_union_across_alarms() {
        let registry = Registry::default();
        registry.register(Alarm::from_record(
            record(1, UPBIT, "BTC", "KRW"),
            rsi_condition(minute(1)),
        ));
        registry.register(Alarm::from_record(
            record(2, UPBIT, "BTC", "KRW"),
            rsi_condition(minute(5)),
        ));
        let intervals = registry.watched_intervals_on(UPBIT, "BTC/KRW");
        assert_eq!(intervals.len(), 2);
        assert!(intervals.contains(&minute(1)));
        assert!(intervals.contains(&minute(5)));
    }

    // ── Registrar ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn registrar_registers_alarm_with_backfill_and_tasks() {
        let f = fixture();
        f.upbit.set_candles("BTC/KRW", minute(1), &[1.0, 2.0, 3.0]);
        *f.upbit.order_book.lock().unwrap() = OrderBook {
            bids: vec![BookLevel::new(10.0, 1.0)],
            asks: vec![],
        };
        f.store.put(record(1, UPBIT, "BTC", "KRW"), rsi_condition(minute(1)));

        let cancel = CancellationToken::new();
        update_registered_alarms(&f.watcher, &cancel).await;

        assert_eq!(f.watcher.registry.alarm_ids(), vec![1]);
        assert_eq!(
            f.watcher
                .cache
                .get_candles(UPBIT, "BTC/KRW", minute(1), None, None)
                .len(),
            3
        );
        assert!(f.watcher.cache.order_book(UPBIT, "BTC/KRW").is_some());
        // Task pair claimed the market
        assert!(!f.watcher.registry.claim_market(UPBIT, "BTC/KRW"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn registrar_skips_alarm_until_backfill_succeeds() {
        let f = fixture();
        f.upbit.fail_backfill.store(true, Ordering::SeqCst);
        f.store.put(record(1, UPBIT, "BTC", "KRW"), rsi_condition(minute(1)));

        let cancel = CancellationToken::new();
        update_registered_alarms(&f.watcher, &cancel).await;
        assert!(f.watcher.registry.alarm_ids().is_empty());

        // Next cycle the exchange recovered
        f.upbit.fail_backfill.store(false, Ordering::SeqCst);
        f.upbit.set_candles("BTC/KRW", minute(1), &[1.0, 2.0]);
        update_registered_alarms(&f.watcher, &cancel).await;
        assert_eq!(f.watcher.registry.alarm_ids(), vec![1]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn registrar_unregisters_disabled_alarms() {
        let f = fixture();
        f.store.put(record(1, UPBIT, "BTC", "KRW"), whale_condition(1.0));
        let cancel = CancellationToken::new();
        update_registered_alarms(&f.watcher, &cancel).await;
        assert_eq!(f.watcher.registry.alarm_ids(), vec![1]);

        f.store.remove(1);
        update_registered_alarms(&f.watcher, &cancel).await;
        assert!(f.watcher.registry.alarm_ids().is_empty());
        assert!(!f.watcher.registry.is_market_registered(UPBIT, "BTC/KRW"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn registrar_reconciles_condition_change_and_new_market() {
        let f = fixture();
        f.upbit.set_candles("BTC/KRW", minute(1), &[1.0, 2.0]);
        f.upbit.set_candles("BTC/KRW", minute(5), &[1.0, 2.0, 3.0]);
        f.binance.set_candles("ETH/USDT", minute(1), &[5.0]);
        f.store.put(record(1, UPBIT, "BTC", "KRW"), rsi_condition(minute(1)));

        let cancel = CancellationToken::new();
        update_registered_alarms(&f.watcher, &cancel).await;
        f.watcher.registry.mark_alerted(1, 600);

        // A's condition moves to a new interval, B appears on another market
        f.store.put(record(1, UPBIT, "BTC", "KRW"), rsi_condition(minute(5)));
        f.store
            .put(record(2, ExchangeKind::Binance, "ETH", "USDT"), rsi_condition(minute(1)));
        update_registered_alarms(&f.watcher, &cancel).await;

        let mut ids = f.watcher.registry.alarm_ids();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(
            f.watcher.registry.condition_of(1),
            Some(rsi_condition(minute(5)))
        );
        // New interval was backfilled
        assert_eq!(
            f.watcher
                .cache
                .get_candles(UPBIT, "BTC/KRW", minute(5), None, None)
                .len(),
            3
        );
        // Reconciliation kept A's alert state and its market claim
        let alarm = &f.watcher.registry.alarms_on_market(UPBIT, "BTC/KRW")[0];
        assert_eq!(alarm.alerted_candle_timestamp, 600);
        assert!(!f.watcher.registry.claim_market(UPBIT, "BTC/KRW"));
        assert!(!f
            .watcher
            .registry
            .claim_market(ExchangeKind::Binance, "ETH/USDT"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn registrar_respawns_tasks_after_pair_exit() {
        let f = fixture();
        f.store.put(record(1, UPBIT, "BTC", "KRW"), whale_condition(1.0));

        // Another task pair still holds the market when the alarm arrives
        assert!(f.watcher.registry.claim_market(UPBIT, "BTC/KRW"));
        let cancel = CancellationToken::new();
        update_registered_alarms(&f.watcher, &cancel).await;
        assert_eq!(f.watcher.registry.alarm_ids(), vec![1]);

        // That pair exits; the next registrar pass restores the tasks
        f.watcher.registry.release_market(UPBIT, "BTC/KRW");
        update_registered_alarms(&f.watcher, &cancel).await;
        assert!(!f.watcher.registry.claim_market(UPBIT, "BTC/KRW"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn registrar_skips_alarm_with_unreadable_condition() {
        let f = fixture();
        // Row present in the alarm table but condition lookup fails
        f.store.put(record(1, UPBIT, "BTC", "KRW"), Condition::default());
        struct NoConditionStore(Arc<MockStore>);
        impl AlarmStore for NoConditionStore {
            fn select_enabled_alarms(
                &self,
            ) -> BoxFuture<'_, Result<Vec<AlarmRecord>, Report<StoreError>>> {
                self.0.select_enabled_alarms()
            }
            fn select_condition(
                &self,
                alarm_id: i64,
            ) -> BoxFuture<'_, Result<Condition, Report<StoreError>>> {
                Box::pin(async move {
                    Err(Report::new(StoreError::MalformedCondition { alarm_id }))
                })
            }
        }
        let watcher = Arc::new(Watcher::new(
            Arc::new(NoConditionStore(Arc::clone(&f.store))),
            Arc::clone(&f.notifier) as Arc<dyn Notifier>,
            Arc::clone(&f.upbit) as Arc<dyn Exchange>,
            Arc::clone(&f.binance) as Arc<dyn Exchange>,
        ));

        let cancel = CancellationToken::new();
        update_registered_alarms(&watcher, &cancel).await;
        assert!(watcher.registry.alarm_ids().is_empty());
        cancel.cancel();
    }

    // ── Trade processing ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn whale_alarm_fires_with_ladder_message() {
        let f = fixture();
        f.watcher.registry.register(Alarm::from_record(
            record(1, UPBIT, "BTC", "KRW"),
            whale_condition(100_000.0),
        ));
        f.watcher.cache.create_order_book_storage(UPBIT, "BTC/KRW");
        f.watcher.cache.cache_order_book(
            OrderBook {
                bids: vec![BookLevel::new(10.0, 20_000.0)],
                asks: vec![BookLevel::new(11.0, 10_000.0)],
            },
            UPBIT,
            "BTC/KRW",
        );

        let trade = make_trade(UPBIT, "BTC/KRW", Utc::now().timestamp(), 10.0);
        process_trade(&f.watcher, UPBIT, "BTC/KRW", &trade).await;

        let sent = f.notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].1.contains("조건 돌파!"));
        assert!(sent[1].1.contains("고래 정보"));
        drop(sent);

        // No interval-bearing condition: fires again on the next trade
        process_trade(&f.watcher, UPBIT, "BTC/KRW", &trade).await;
        assert_eq!(f.notifier.sent.lock().unwrap().len(), 4);
        // and the alerted timestamp was never advanced
        let alarm = &f.watcher.registry.alarms_on_market(UPBIT, "BTC/KRW")[0];
        assert_eq!(alarm.alerted_candle_timestamp, 0);
    }

    #[tokio::test]
    async fn interval_alarm_fires_once_per_candle() {
        let f = fixture();
        let symbol = "BTC/KRW";
        let bucket = seed_rising_candles(&f.watcher, symbol);
        f.watcher.registry.register(Alarm::from_record(
            record(1, UPBIT, "BTC", "KRW"),
            rsi_condition(minute(1)),
        ));

        for i in 0..50i64 {
            let trade = make_trade(UPBIT, symbol, bucket + i % 60, 20.0);
            process_trade(&f.watcher, UPBIT, symbol, &trade).await;
        }
        assert_eq!(f.notifier.sent.lock().unwrap().len(), 1);
        let alarm = &f.watcher.registry.alarms_on_market(UPBIT, symbol)[0];
        assert_eq!(alarm.alerted_candle_timestamp, bucket);

        // The next bucket opens; the alarm may fire once more
        f.watcher.cache.roll_buckets(bucket + 60);
        for i in 0..10i64 {
            let trade = make_trade(UPBIT, symbol, bucket + 60 + i, 21.0);
            process_trade(&f.watcher, UPBIT, symbol, &trade).await;
        }
        assert_eq!(f.notifier.sent.lock().unwrap().len(), 2);
        let alarm = &f.watcher.registry.alarms_on_market(UPBIT, symbol)[0];
        assert_eq!(alarm.alerted_candle_timestamp, bucket + 60);
    }

    #[tokio::test]
    async fn failed_delivery_leaves_alarm_unalerted() {
        let f = fixture();
        let symbol = "BTC/KRW";
        let bucket = seed_rising_candles(&f.watcher, symbol);
        f.watcher.registry.register(Alarm::from_record(
            record(1, UPBIT, "BTC", "KRW"),
            rsi_condition(minute(1)),
        ));

        f.notifier.fail_all.store(true, Ordering::SeqCst);
        let trade = make_trade(UPBIT, symbol, bucket + 1, 20.0);
        process_trade(&f.watcher, UPBIT, symbol, &trade).await;
        let alarm = &f.watcher.registry.alarms_on_market(UPBIT, symbol)[0];
        assert_eq!(alarm.alerted_candle_timestamp, 0);

        // Delivery recovers within the same candle: the alarm still fires
        f.notifier.fail_all.store(false, Ordering::SeqCst);
        process_trade(&f.watcher, UPBIT, symbol, &trade).await;
        assert_eq!(f.notifier.sent.lock().unwrap().len(), 1);
        let alarm = &f.watcher.registry.alarms_on_market(UPBIT, symbol)[0];
        assert_eq!(alarm.alerted_candle_timestamp, bucket);
    }

    #[tokio::test]
    async fn processed_trade_lands_in_current_candle() {
        let f = fixture();
        let symbol = "BTC/KRW";
        let interval = minute(1);
        f.watcher.cache.create_candle_storage(UPBIT, symbol, interval);
        let bucket = interval.truncate(Utc::now().timestamp());
        f.watcher.cache.roll_buckets(bucket);

        let trade = make_trade(UPBIT, symbol, bucket + 5, 42.0);
        process_trade(&f.watcher, UPBIT, symbol, &trade).await;

        let candles = f.watcher.cache.get_candles(UPBIT, symbol, interval, None, None);
        let last = candles.last().unwrap();
        assert_eq!(last.close(), Some(42.0));
        assert_eq!(interval.truncate(trade.timestamp.timestamp()), last.timestamp());
    }

    // ── Task lifecycle ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn trade_task_exits_and_releases_when_market_unregistered() {
        let f = fixture();
        f.watcher.cache.create_candle_storage(UPBIT, "BTC/KRW", minute(1));
        assert!(f.watcher.registry.claim_market(UPBIT, "BTC/KRW"));

        // No registered alarms: the task must exit on its first iteration
        let task = tokio::spawn(run_trade_task(
            Arc::clone(&f.watcher),
            UPBIT,
            "BTC/KRW".to_owned(),
            CancellationToken::new(),
        ));
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("trade task did not terminate")
            .unwrap();

        assert!(f.watcher.registry.claim_market(UPBIT, "BTC/KRW"));
        assert!(f.watcher.cache.candle_keys().is_empty());
    }

    #[tokio::test]
    async fn trade_task_streams_and_then_terminates() {
        let f = fixture();
        let symbol = "BTC/KRW";
        let bucket = seed_rising_candles(&f.watcher, symbol);
        f.watcher.registry.register(Alarm::from_record(
            record(1, UPBIT, "BTC", "KRW"),
            rsi_condition(minute(1)),
        ));
        f.watcher.registry.claim_market(UPBIT, symbol);

        let task = tokio::spawn(run_trade_task(
            Arc::clone(&f.watcher),
            UPBIT,
            symbol.to_owned(),
            CancellationToken::new(),
        ));

        // Wait for the task to subscribe, then deliver a triggering trade
        for _ in 0..50 {
            if !f.upbit.trade_senders.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        f.upbit
            .push_trade(make_trade(UPBIT, symbol, bucket + 1, 20.0))
            .await;

        for _ in 0..50 {
            if !f.notifier.sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(f.notifier.sent.lock().unwrap().len(), 1);

        // Unregister, then unblock the read; the task exits on its next check
        f.watcher.registry.unregister(1);
        f.upbit
            .push_trade(make_trade(UPBIT, symbol, bucket + 2, 20.0))
            .await;
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("trade task did not terminate")
            .unwrap();
        assert!(f.watcher.registry.claim_market(UPBIT, symbol));
    }

    #[tokio::test]
    async fn order_book_task_caches_snapshots_and_terminates() {
        let f = fixture();
        let symbol = "BTC/KRW";
        *f.upbit.order_book.lock().unwrap() = OrderBook {
            bids: vec![BookLevel::new(10.0, 3.0)],
            asks: vec![BookLevel::new(11.0, 4.0)],
        };
        f.watcher.registry.register(Alarm::from_record(
            record(1, UPBIT, "BTC", "KRW"),
            whale_condition(1.0),
        ));
        f.watcher.cache.create_order_book_storage(UPBIT, symbol);
        assert!(f.watcher.registry.claim_market(UPBIT, symbol));

        let task = tokio::spawn(run_order_book_task(
            Arc::clone(&f.watcher),
            UPBIT,
            symbol.to_owned(),
            CancellationToken::new(),
        ));

        for _ in 0..50 {
            if f.watcher.cache.order_book(UPBIT, symbol).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let book = f.watcher.cache.order_book(UPBIT, symbol).unwrap();
        assert_eq!(book.bids, vec![BookLevel::new(10.0, 3.0)]);

        f.watcher.registry.unregister(1);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("order book task did not terminate")
            .unwrap();
        assert!(f.watcher.registry.claim_market(UPBIT, symbol));
    }
}
