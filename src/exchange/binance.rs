use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
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

use crate::error::ExchangeError;
use crate::exchange::{Exchange, OrderBookFeed, TradeFeed};
use crate::model::{BookLevel, Candle, ExchangeKind, Interval, OrderBook, Trade};

const BINANCE_BASE_URL: &str = "https://api.binance.com";
const BINANCE_WS_BASE: &str = "wss://stream.binance.com:9443/stream";
const MAX_CANDLES_PER_REQUEST: usize = 1000;
// Reconnect before Binance's 24-hour auto-disconnect (23 hours)
const WS_RECONNECT_SECS: u64 = 23 * 60 * 60;
/// Binance kline endpoint costs weight 2; limit ~2500 req/min (5000 weight/min)
/// = ~40 req/s. Use 20 for safety margin.
const BINANCE_REQUESTS_PER_SECOND: u32 = 20;

const SUPPORTED_INTERVALS: &[&str] = &[
    "1s", "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w",
    "1M",
];

pub struct BinanceExchange {
    client: reqwest::Client,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
}

impl BinanceExchange {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_second(nonzero!(
                BINANCE_REQUESTS_PER_SECOND
            )))),
        }
    }
}

impl Default for BinanceExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Exchange for BinanceExchange {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Binance
    }

    fn fetch_ohlcv(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Candle>, Report<ExchangeError>>> {
        let symbol = symbol.to_owned();
        Box::pin(async move {
            let interval_str = kline_interval(interval)?;
            let market = market_code(&symbol)?;
            let url = format!("{BINANCE_BASE_URL}/api/v3/klines");
            let limit_str = limit.min(MAX_CANDLES_PER_REQUEST).to_string();

            self.rate_limiter.until_ready().await;

            let response = self
                .client
                .get(&url)
                .query(&[
                    ("symbol", market.as_str()),
                    ("interval", interval_str.as_str()),
                    ("limit", limit_str.as_str()),
                ])
                .send()
                .await
                .change_context(ExchangeError::Request {
                    exchange: "binance".into(),
                })?;

            if !response.status().is_success() {
                return Err(Report::new(ExchangeError::Request {
                    exchange: "binance".into(),
                })
                .attach(format!("HTTP status: {}", response.status())));
            }

            let raw: Vec<BinanceKlineRow> =
                response
                    .json()
                    .await
                    .change_context(ExchangeError::ResponseParse {
                        exchange: "binance".into(),
                    })?;

            raw.into_iter()
                .map(|row| row.into_candle(&symbol, interval))
                .collect()
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
            let url = format!("{BINANCE_BASE_URL}/api/v3/depth");
            let limit_str = limit.to_string();

            self.rate_limiter.until_ready().await;

            let response = self
                .client
                .get(&url)
                .query(&[("symbol", market.as_str()), ("limit", limit_str.as_str())])
                .send()
                .await
                .change_context(ExchangeError::Request {
                    exchange: "binance".into(),
                })?;

            if !response.status().is_success() {
                return Err(Report::new(ExchangeError::Request {
                    exchange: "binance".into(),
                })
                .attach(format!("HTTP status: {}", response.status())));
            }

            let raw: BinanceDepthMsg =
                response
                    .json()
                    .await
                    .change_context(ExchangeError::ResponseParse {
                        exchange: "binance".into(),
                    })?;

            Ok(raw.into_order_book(limit))
        })
    }

    fn watch_trades(
        &self,
        symbol: &str,
    ) -> BoxFuture<'_, Result<TradeFeed, Report<ExchangeError>>> {
        let symbol = symbol.to_owned();
        Box::pin(async move {
            let market = market_code(&symbol)?;
            let ws_url = stream_url(&format!("{}@trade", market.to_lowercase()));
            let (ws_stream, _) =
                connect_async(&ws_url)
                    .await
                    .change_context(ExchangeError::Connection {
                        exchange: "binance".into(),
                    })?;

            let (tx, rx) = mpsc::channel(1024);
            let cancel = CancellationToken::new();
            tokio::spawn(run_trade_pump(ws_stream, symbol, tx, cancel.clone()));
            Ok(TradeFeed::new(ExchangeKind::Binance, rx, cancel))
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
            let stream = format!(
                "{}@depth{}@100ms",
                market.to_lowercase(),
                depth_levels(limit)
            );
            let ws_url = stream_url(&stream);
            let (ws_stream, _) =
                connect_async(&ws_url)
                    .await
                    .change_context(ExchangeError::Connection {
                        exchange: "binance".into(),
                    })?;

            let (tx, rx) = watch::channel(None);
            let cancel = CancellationToken::new();
            tokio::spawn(run_order_book_pump(ws_stream, limit, tx, cancel.clone()));
            Ok(OrderBookFeed::new(rx, cancel))
        })
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn run_trade_pump(
    ws_stream: WsStream,
    symbol: String,
    tx: mpsc::Sender<Trade>,
    cancel: CancellationToken,
) {
    let (mut write, mut read) = ws_stream.split();
    debug!(symbol = %symbol, "binance trade ws connected");

    // End the pump before Binance's 24h disconnect; the owner reopens.
    let reconnect_timer = tokio::time::sleep(Duration::from_secs(WS_RECONNECT_SECS));
    tokio::pin!(reconnect_timer);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = &mut reconnect_timer => {
                debug!(symbol = %symbol, "binance trade ws 23h limit reached");
                break;
            }
            msg = read.next() => {
                match msg {
                    None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, symbol = %symbol, "binance trade ws error");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<BinanceCombinedMsg<BinanceTradeData>>(&text) {
                            Ok(combined) => {
                                if tx.send(combined.data.into_trade(&symbol)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, "binance trade parse error");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        // Server sends ping every 20s; must pong within 60s
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn run_order_book_pump(
    ws_stream: WsStream,
    limit: usize,
    tx: watch::Sender<Option<OrderBook>>,
    cancel: CancellationToken,
) {
    let (mut write, mut read) = ws_stream.split();

    let reconnect_timer = tokio::time::sleep(Duration::from_secs(WS_RECONNECT_SECS));
    tokio::pin!(reconnect_timer);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = &mut reconnect_timer => break,
            msg = read.next() => {
                match msg {
                    None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "binance orderbook ws error");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<BinanceCombinedMsg<BinanceDepthMsg>>(&text) {
                            Ok(combined) => {
                                if tx.send(Some(combined.data.into_order_book(limit))).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, "binance orderbook parse error");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

/// `BASE/QUOTE` → Binance market code (`BASEQUOTE`).
fn market_code(symbol: &str) -> Result<String, Report<ExchangeError>> {
    match symbol.split_once('/') {
        Some((base, quote)) => Ok(format!("{base}{quote}")),
        None => bail!(ExchangeError::Request {
            exchange: "binance".into(),
        }),
    }
}

fn kline_interval(interval: Interval) -> Result<String, Report<ExchangeError>> {
    let s = interval.to_string();
    if !SUPPORTED_INTERVALS.contains(&s.as_str()) {
        bail!(ExchangeError::UnsupportedInterval {
            exchange: "binance".into(),
            interval: s,
        });
    }
    Ok(s)
}

fn stream_url(stream: &str) -> String {
    format!("{BINANCE_WS_BASE}?streams={stream}")
}

/// Partial book depth streams come in 5/10/20 level flavors.
fn depth_levels(limit: usize) -> usize {
    match limit {
        0..=5 => 5,
        6..=10 => 10,
        _ => 20,
    }
}

// ── REST response types ───────────────────────────────────────────────────────

/// Binance kline row: 12-element array
/// [open_time, open, high, low, close, volume, close_time, ...]
#[derive(Debug, Deserialize)]
struct BinanceKlineRow(
    i64,                        // 0: open_time (ms)
    String,                     // 1: open
    String,                     // 2: high
    String,                     // 3: low
    String,                     // 4: close
    #[allow(dead_code)] String, // 5: volume
    #[allow(dead_code)] i64,    // 6: close_time
    #[allow(dead_code)] String, // 7: quote asset volume
    #[allow(dead_code)] i64,    // 8: number of trades
    #[allow(dead_code)] String, // 9: taker buy base volume
    #[allow(dead_code)] String, // 10: taker buy quote volume
    #[allow(dead_code)] String, // 11: ignore
);

impl BinanceKlineRow {
    fn into_candle(
        self,
        symbol: &str,
        interval: Interval,
    ) -> Result<Candle, Report<ExchangeError>> {
        let parse_f64 = |s: &str| -> Result<f64, Report<ExchangeError>> {
            s.parse::<f64>()
                .change_context(ExchangeError::ResponseParse {
                    exchange: "binance".into(),
                })
        };

        let open_time = DateTime::from_timestamp_millis(self.0).unwrap_or_else(Utc::now);

        Ok(Candle::from_ohlcv(
            ExchangeKind::Binance,
            symbol,
            open_time,
            interval,
            parse_f64(&self.1)?,
            parse_f64(&self.2)?,
            parse_f64(&self.3)?,
            parse_f64(&self.4)?,
        ))
    }
}

// ── WebSocket message types ───────────────────────────────────────────────────

/// Combined stream wrapper: `{ "stream": "...", "data": { ... } }`
#[derive(Debug, Deserialize)]
struct BinanceCombinedMsg<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct BinanceTradeData {
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    trade_time: i64,
}

impl BinanceTradeData {
    fn into_trade(self, symbol: &str) -> Trade {
        let price = self.price.parse::<f64>().unwrap_or(0.0);
        let amount = self.quantity.parse::<f64>().unwrap_or(0.0);
        let timestamp = DateTime::from_timestamp_millis(self.trade_time).unwrap_or_else(Utc::now);

        Trade {
            exchange: ExchangeKind::Binance,
            symbol: symbol.to_owned(),
            timestamp,
            price,
            amount,
            cost: price * amount,
        }
    }
}

/// Depth payload, shared by the REST endpoint and partial-book streams:
/// `{ "bids": [["price", "qty"], ...], "asks": [...] }`
#[derive(Debug, Deserialize)]
struct BinanceDepthMsg {
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

impl BinanceDepthMsg {
    fn into_order_book(self, limit: usize) -> OrderBook {
        let parse_side = |side: Vec<[String; 2]>| {
            side.into_iter()
                .take(limit)
                .filter_map(|[price, amount]| {
                    Some(BookLevel::new(price.parse().ok()?, amount.parse().ok()?))
                })
                .collect()
        };
        OrderBook {
            bids: parse_side(self.bids),
            asks: parse_side(self.asks),
        }
    }
}
