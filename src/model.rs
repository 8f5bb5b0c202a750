use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ExchangeKind {
    Upbit,
    Binance,
}

impl ExchangeKind {
    /// Numeric id used by the alarm database. Wire-stable.
    #[allow(dead_code)]
    pub fn id(self) -> i64 {
        match self {
            Self::Upbit => 1,
            Self::Binance => 2,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(Self::Upbit),
            2 => Some(Self::Binance),
            _ => None,
        }
    }

    /// Display name used in alert messages.
    pub fn korean_name(self) -> &'static str {
        match self {
            Self::Upbit => "업비트",
            Self::Binance => "바이낸스",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upbit => write!(f, "upbit"),
            Self::Binance => write!(f, "binance"),
        }
    }
}

/// Candle bucket width unit.
///
/// Serialized as the one-letter codes stored in condition records
/// (e.g. `"m"`, `"h"`). `Month` is a display label only; it carries a
/// nominal 30-day length so intervals stay totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "s")]
    Second,
    #[serde(rename = "m")]
    Minute,
    #[serde(rename = "h")]
    Hour,
    #[serde(rename = "d")]
    Day,
    #[serde(rename = "w")]
    Week,
    #[serde(rename = "M")]
    Month,
}

impl Timeframe {
    pub fn seconds(self) -> i64 {
        match self {
            Self::Second => 1,
            Self::Minute => 60,
            Self::Hour => 3_600,
            Self::Day => 86_400,
            Self::Week => 604_800,
            Self::Month => 2_592_000,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Self::Second => "s",
            Self::Minute => "m",
            Self::Hour => "h",
            Self::Day => "d",
            Self::Week => "w",
            Self::Month => "M",
        }
    }

}

/// A candle bucket width: a positive length and a timeframe unit.
///
/// Equality and hashing are structural; ordering is by seconds-equivalent
/// (length as a tie-breaker so `Ord` stays consistent with `Eq`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub length: u32,
    pub timeframe: Timeframe,
}

impl Interval {
    pub fn new(length: u32, timeframe: Timeframe) -> Self {
        Self { length, timeframe }
    }

    pub fn seconds(self) -> i64 {
        self.length as i64 * self.timeframe.seconds()
    }

    /// Truncate a unix-second timestamp to this interval's bucket start.
    /// A degenerate zero-length interval truncates to the timestamp itself.
    pub fn truncate(self, timestamp: i64) -> i64 {
        let seconds = self.seconds();
        if seconds <= 0 {
            return timestamp;
        }
        timestamp - timestamp.rem_euclid(seconds)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.length, self.timeframe.suffix())
    }
}

impl PartialOrd for Interval {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Interval {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seconds()
            .cmp(&other.seconds())
            .then_with(|| self.length.cmp(&other.length))
    }
}

/// A single executed trade as delivered by an exchange stream.
#[derive(Debug, Clone)]
pub struct Trade {
    pub exchange: ExchangeKind,
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub amount: f64,
    pub cost: f64,
}

impl Trade {
    /// The market symbol, with any `:settle` suffix stripped.
    pub fn market_symbol(&self) -> &str {
        self.symbol.split(':').next().unwrap_or(&self.symbol)
    }
}

/// One price level of an order book side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookLevel {
    pub price: f64,
    pub amount: f64,
}

impl BookLevel {
    pub fn new(price: f64, amount: f64) -> Self {
        Self { price, amount }
    }

    pub fn notional(self) -> f64 {
        self.price * self.amount
    }
}

/// Latest order-book snapshot, typically truncated to the top 20 levels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

/// A price aggregate over one interval bucket.
///
/// While live, OHLC values are derived from the buffered trades; once
/// `clear_trades` runs they are frozen and the buffer is released. A candle
/// that never saw a trade keeps `None` OHLC.
#[derive(Debug, Clone)]
pub struct Candle {
    pub exchange: ExchangeKind,
    pub symbol: String,
    pub open_time: DateTime<Utc>,
    pub interval: Interval,
    trades: Vec<Trade>,
    frozen_open: Option<f64>,
    frozen_high: Option<f64>,
    frozen_low: Option<f64>,
    frozen_close: Option<f64>,
}

impl Candle {
    /// An empty live candle, ready to buffer trades.
    pub fn new(
        exchange: ExchangeKind,
        symbol: impl Into<String>,
        open_time: DateTime<Utc>,
        interval: Interval,
    ) -> Self {
        Self {
            exchange,
            symbol: symbol.into(),
            open_time,
            interval,
            trades: Vec::new(),
            frozen_open: None,
            frozen_high: None,
            frozen_low: None,
            frozen_close: None,
        }
    }

    /// A finalized candle built from exchange-provided OHLCV history.
    pub fn from_ohlcv(
        exchange: ExchangeKind,
        symbol: impl Into<String>,
        open_time: DateTime<Utc>,
        interval: Interval,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    ) -> Self {
        Self {
            exchange,
            symbol: symbol.into(),
            open_time,
            interval,
            trades: Vec::new(),
            frozen_open: Some(open),
            frozen_high: Some(high),
            frozen_low: Some(low),
            frozen_close: Some(close),
        }
    }

    pub fn open(&self) -> Option<f64> {
        self.trades
            .first()
            .map(|t| t.price)
            .or(self.frozen_open)
    }

    pub fn high(&self) -> Option<f64> {
        self.trades
            .iter()
            .map(|t| t.price)
            .reduce(f64::max)
            .or(self.frozen_high)
    }

    pub fn low(&self) -> Option<f64> {
        self.trades
            .iter()
            .map(|t| t.price)
            .reduce(f64::min)
            .or(self.frozen_low)
    }

    pub fn close(&self) -> Option<f64> {
        self.trades
            .last()
            .map(|t| t.price)
            .or(self.frozen_close)
    }

    pub fn timestamp(&self) -> i64 {
        self.open_time.timestamp()
    }

    /// Exclusive upper bound of this bucket, in unix seconds.
    pub fn time_limit(&self) -> i64 {
        self.timestamp() + self.interval.seconds()
    }

    #[allow(dead_code)]
    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn add_trade(&mut self, trade: Trade) {
        self.trades.push(trade);
    }

    /// Freeze OHLC from the buffered trades and release the buffer.
    pub fn clear_trades(&mut self) {
        self.frozen_open = self.open();
        self.frozen_high = self.high();
        self.frozen_low = self.low();
        self.frozen_close = self.close();
        self.trades = Vec::new();
    }
}

// ── Alarm conditions ──────────────────────────────────────────────────────────
//
// Shapes match the JSON persisted in the condition table; every sub-condition
// is optional and equality is structural (used to detect edits).

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WhaleCondition {
    /// Minimum notional (price × amount) of a single level to count as a whale.
    pub quantity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TickCondition {
    /// Minimum trade size in base units.
    pub quantity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RsiCondition {
    pub length: u32,
    pub interval: Interval,
    pub upper_bound: f64,
    pub lower_bound: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BollingerBandCondition {
    pub length: u32,
    pub interval: Interval,
    pub coefficient: f64,
    pub on_over_upper_band: bool,
    pub on_under_lower_band: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default)]
    pub whale: Option<WhaleCondition>,
    #[serde(default)]
    pub tick: Option<TickCondition>,
    #[serde(default)]
    pub rsi: Option<RsiCondition>,
    #[serde(default)]
    pub bollinger_band: Option<BollingerBandCondition>,
}

impl Condition {
    /// The intervals this condition needs candle data for (rsi, then
    /// bollinger band), deduplicated.
    pub fn watched_intervals(&self) -> Vec<Interval> {
        let mut intervals = Vec::new();
        if let Some(rsi) = &self.rsi {
            intervals.push(rsi.interval);
        }
        if let Some(bb) = &self.bollinger_band
            && !intervals.contains(&bb.interval)
        {
            intervals.push(bb.interval);
        }
        intervals
    }

    pub fn shortest_interval(&self) -> Option<Interval> {
        self.watched_intervals().into_iter().min()
    }
}

/// One enabled row of the alarm table.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmRecord {
    pub alarm_id: i64,
    pub channel_id: i64,
    pub exchange: ExchangeKind,
    pub base_symbol: String,
    pub quote_symbol: String,
}

impl AlarmRecord {
    pub fn symbol(&self) -> String {
        format!("{}/{}", self.base_symbol, self.quote_symbol)
    }
}
