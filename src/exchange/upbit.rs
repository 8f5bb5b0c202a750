use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use error_stack::{Report, ResultExt, bail};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ExchangeError;
use crate::exchange::{Exchange, OrderBookFeed, TradeFeed};
use crate::model::{BookLevel, Candle, ExchangeKind, Interval, OrderBook, Trade};

const UPBIT_BASE_URL: &str = "https://api.upbit.com";
const UPBIT_WS_URL: &str = "wss://api.upbit.com/websocket/v1";
const MAX_CANDLES_PER_REQUEST: usize = 200;
const WS_PING_INTERVAL: Duration = Duration::from_secs(60);
/// Upbit allows 10 req/s; use 8 for safety margin
const UPBIT_REQUESTS_PER_SECOND: u32 = 8;

pub struct UpbitExchange {
    client: reqwest::Client,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
    /// Interval string → candle REST endpoint.
    timeframes: HashMap<String, String>,
}

impl UpbitExchange {
    pub fn new() -> Self {
        let mut timeframes: HashMap<String, String> = [
            ("1s", "/v1/candles/seconds"),
            ("1m", "/v1/candles/minutes/1"),
            ("3m", "/v1/candles/minutes/3"),
            ("5m", "/v1/candles/minutes/5"),
            ("15m", "/v1/candles/minutes/15"),
            ("30m", "/v1/candles/minutes/30"),
            ("1h", "/v1/candles/minutes/60"),
            ("4h", "/v1/candles/minutes/240"),
            ("1d", "/v1/candles/days"),
            ("1w", "/v1/candles/weeks"),
            ("1M", "/v1/candles/months"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
        // The stock table is missing the ten-minute candles Upbit serves.
        timeframes.insert("10m".to_owned(), "/v1/candles/minutes/10".to_owned());

        Self {
            client: reqwest::Client::new(),
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_second(nonzero!(
                UPBIT_REQUESTS_PER_SECOND
            )))),
            timeframes,
        }
    }

    fn candle_endpoint(&self, interval: Interval) -> Result<&str, Report<ExchangeError>> {
        match self.timeframes.get(&interval.to_string()) {
            Some(endpoint) => Ok(endpoint),
            None => bail!(ExchangeError::UnsupportedInterval {
                exchange: "upbit".into(),
                interval: interval.to_string(),
            }),
        }
    }
}

impl Default for UpbitExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Exchange for UpbitExchange {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Upbit
    }

    fn fetch_ohlcv(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Candle>, Report<ExchangeError>>> {
        let symbol = symbol.to_owned();
        Box::pin(async move {
            let endpoint = self.candle_endpoint(interval)?;
            let market = market_code(&symbol)?;
            let url = format!("{UPBIT_BASE_URL}{endpoint}");
            let count = limit.min(MAX_CANDLES_PER_REQUEST).to_string();

            self.rate_limiter.until_ready().await;

            let response = self
                .client
                .get(&url)
                .query(&[("market", market.as_str()), ("count", count.as_str())])
                .send()
                .await
                .change_context(ExchangeError::Request {
                    exchange: "upbit".into(),
                })?;

            if !response.status().is_success() {
                return Err(Report::new(ExchangeError::Request {
                    exchange: "upbit".into(),
                })
                .attach(format!("HTTP status: {}", response.status())));
            }

            let raw: Vec<UpbitCandle> =
                response
                    .json()
                    .await
                    .change_context(ExchangeError::ResponseParse {
                        exchange: "upbit".into(),
                    })?;

            // Upbit returns newest-first; reverse to oldest-first
            let mut candles = Vec::with_capacity(raw.len());
            for row in raw.into_iter().rev() {
                candles.push(row.into_candle(&symbol, interval)?);
            }
            Ok(candles)
        })
    }

    fn fetch_order_book(
        &self,
        symbol: &str,
        limit: usize,
    ) -> BoxFuture<'_, Result<OrderBook, Report<ExchangeError>>> {
        let symbol = symbol.to_owned();
        Box::pin(async move {
            let market = market_code(&symbol)?;
            let url = format!("{UPBIT_BASE_URL}/v1/orderbook");

            self.rate_limiter.until_ready().await;

            let response = self
                .client
                .get(&url)
                .query(&[("markets", market.as_str())])
                .send()
                .await
                .change_context(ExchangeError::Request {
                    exchange: "upbit".into(),
                })?;

            if !response.status().is_success() {
                return Err(Report::new(ExchangeError::Request {
                    exchange: "upbit".into(),
                })
                .attach(format!("HTTP status: {}", response.status())));
            }

            let mut books: Vec<UpbitOrderBookMsg> =
                response
                    .json()
                    .await
                    .change_context(ExchangeError::ResponseParse {
                        exchange: "upbit".into(),
                    })?;

            if books.is_empty() {
                return Err(Report::new(ExchangeError::ResponseParse {
                    exchange: "upbit".into(),
                })
                .attach(format!("empty order book response for {market}")));
            }
            Ok(books.remove(0).into_order_book(limit))
        })
    }

    fn watch_trades(
        &self,
        symbol: &str,
    ) -> BoxFuture<'_, Result<TradeFeed, Report<ExchangeError>>> {
        let symbol = symbol.to_owned();
        Box::pin(async move {
            let market = market_code(&symbol)?;
            let (ws_stream, _) =
                connect_async(UPBIT_WS_URL)
                    .await
                    .change_context(ExchangeError::Connection {
                        exchange: "upbit".into(),
                    })?;

            let (tx, rx) = mpsc::channel(1024);
            let cancel = CancellationToken::new();
            tokio::spawn(run_trade_pump(
                ws_stream,
                market,
                symbol,
                tx,
                cancel.clone(),
            ));
            Ok(TradeFeed::new(ExchangeKind::Upbit, rx, cancel))
        })
    }

    fn watch_order_book(
        &self,
        symbol: &str,
        limit: usize,
    ) -> BoxFuture<'_, Result<OrderBookFeed, Report<ExchangeError>>> {
        let symbol = symbol.to_owned();
        Box::pin(async move {
            let market = market_code(&symbol)?;
            let (ws_stream, _) =
                connect_async(UPBIT_WS_URL)
                    .await
                    .change_context(ExchangeError::Connection {
                        exchange: "upbit".into(),
                    })?;

            let (tx, rx) = watch::channel(None);
            let cancel = CancellationToken::new();
            tokio::spawn(run_order_book_pump(ws_stream, market, limit, tx, cancel.clone()));
            Ok(OrderBookFeed::new(rx, cancel))
        })
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn run_trade_pump(
    ws_stream: WsStream,
    market: String,
    symbol: String,
    tx: mpsc::Sender<Trade>,
    cancel: CancellationToken,
) {
    let (mut write, mut read) = ws_stream.split();

    let subscribe = build_subscribe("trade", &market);
    if let Err(e) = write.send(Message::Text(subscribe.into())).await {
        warn!(error = %e, market = %market, "upbit trade subscribe failed");
        return;
    }
    debug!(market = %market, "upbit trade ws subscribed");

    let mut ping_timer = tokio::time::interval(WS_PING_INTERVAL);
    ping_timer.tick().await; // skip immediate first tick

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ping_timer.tick() => {
                if write.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            msg = read.next() => {
                let data = match msg {
                    None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, market = %market, "upbit trade ws error");
                        break;
                    }
                    Some(Ok(Message::Binary(data))) => data.to_vec(),
                    Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                    Some(Ok(_)) => continue,
                };
                match serde_json::from_slice::<UpbitTradeMsg>(&data) {
                    Ok(raw) => {
                        if tx.send(raw.into_trade(&symbol)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "upbit trade parse error");
                    }
                }
            }
        }
    }
}

async fn run_order_book_pump(
    ws_stream: WsStream,
    market: String,
    limit: usize,
    tx: watch::Sender<Option<OrderBook>>,
    cancel: CancellationToken,
) {
    let (mut write, mut read) = ws_stream.split();

    let subscribe = build_subscribe("orderbook", &market);
    if let Err(e) = write.send(Message::Text(subscribe.into())).await {
        warn!(error = %e, market = %market, "upbit orderbook subscribe failed");
        return;
    }
    debug!(market = %market, "upbit orderbook ws subscribed");

    let mut ping_timer = tokio::time::interval(WS_PING_INTERVAL);
    ping_timer.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ping_timer.tick() => {
                if write.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            msg = read.next() => {
                let data = match msg {
                    None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, market = %market, "upbit orderbook ws error");
                        break;
                    }
                    Some(Ok(Message::Binary(data))) => data.to_vec(),
                    Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                    Some(Ok(_)) => continue,
                };
                match serde_json::from_slice::<UpbitOrderBookMsg>(&data) {
                    Ok(raw) => {
                        if tx.send(Some(raw.into_order_book(limit))).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "upbit orderbook parse error");
                    }
                }
            }
        }
    }
}

/// `BASE/QUOTE` → Upbit market code (`QUOTE-BASE`).
fn market_code(symbol: &str) -> Result<String, Report<ExchangeError>> {
    match symbol.split_once('/') {
        Some((base, quote)) => Ok(format!("{quote}-{base}")),
        None => bail!(ExchangeError::Request {
            exchange: "upbit".into(),
        }),
    }
}

fn build_subscribe(channel: &str, market: &str) -> String {
    let ticket = Uuid::new_v4().to_string();
    serde_json::json!([
        { "ticket": ticket },
        {
            "type": channel,
            "codes": [market],
            "is_only_realtime": true
        },
        { "format": "DEFAULT" }
    ])
    .to_string()
}

// ── REST response types ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct UpbitCandle {
    candle_date_time_utc: String,
    opening_price: f64,
    high_price: f64,
    low_price: f64,
    trade_price: f64,
}

impl UpbitCandle {
    fn into_candle(
        self,
        symbol: &str,
        interval: Interval,
    ) -> Result<Candle, Report<ExchangeError>> {
        let open_time = NaiveDateTime::parse_from_str(&self.candle_date_time_utc, "%Y-%m-%dT%H:%M:%S")
            .map(|naive| naive.and_utc())
            .change_context(ExchangeError::ResponseParse {
                exchange: "upbit".into(),
            })?;

        Ok(Candle::from_ohlcv(
            ExchangeKind::Upbit,
            symbol,
            open_time,
            interval,
            self.opening_price,
            self.high_price,
            self.low_price,
            self.trade_price,
        ))
    }
}

// ── WebSocket message types ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct UpbitTradeMsg {
    trade_price: f64,
    trade_volume: f64,
    timestamp: i64,
}

impl UpbitTradeMsg {
    fn into_trade(self, symbol: &str) -> Trade {
        let timestamp =
            chrono::DateTime::from_timestamp_millis(self.timestamp).unwrap_or_else(chrono::Utc::now);
        Trade {
            exchange: ExchangeKind::Upbit,
            symbol: symbol.to_owned(),
            timestamp,
            price: self.trade_price,
            amount: self.trade_volume,
            cost: self.trade_price * self.trade_volume,
        }
    }
}

/// Shared by the REST orderbook response rows and WS orderbook messages.
#[derive(Debug, Deserialize)]
struct UpbitOrderBookMsg {
    orderbook_units: Vec<UpbitOrderBookUnit>,
}

#[derive(Debug, Deserialize)]
struct UpbitOrderBookUnit {
    ask_price: f64,
    bid_price: f64,
    ask_size: f64,
    bid_size: f64,
}

impl UpbitOrderBookMsg {
    fn into_order_book(self, limit: usize) -> OrderBook {
        let mut book = OrderBook::default();
        for unit in self.orderbook_units.into_iter().take(limit) {
            book.bids.push(BookLevel::new(unit.bid_price, unit.bid_size));
            book.asks.push(BookLevel::new(unit.ask_price, unit.ask_size));
        }
        book
    }
}
