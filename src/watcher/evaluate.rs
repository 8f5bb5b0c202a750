use chrono::Utc;
use tracing::debug;

use crate::cache::Cache;
use crate::indicator;
use crate::model::{BookLevel, Trade};
use crate::watcher::Alarm;

/// Which Bollinger band the trade price broke through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossedBand {
    Upper,
    Lower,
}

impl CrossedBand {
    pub fn korean(self) -> &'static str {
        match self {
            Self::Upper => "상단선",
            Self::Lower => "하단선",
        }
    }
}

/// Order-book levels that met the whale threshold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WhaleHits {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl WhaleHits {
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

/// Outcome of checking one alarm against one trade. Partial fields stay
/// populated when a later sub-condition fails.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub is_alarm_triggered: bool,
    pub whales: Option<WhaleHits>,
    pub rsi: Option<f64>,
    pub crossed_band: Option<CrossedBand>,
    pub trade: Trade,
}

/// Evaluate the alarm's configured sub-conditions against a trade, in fixed
/// order (whale, tick, rsi, bollinger band), short-circuiting on the first
/// failure.
pub fn check(alarm: &Alarm, trade: &Trade, cache: &Cache) -> CheckResult {
    let mut result = CheckResult {
        is_alarm_triggered: false,
        whales: None,
        rsi: None,
        crossed_band: None,
        trade: trade.clone(),
    };

    if let Some(whale) = &alarm.condition.whale {
        let Some(order_book) = cache.order_book(alarm.exchange, &alarm.symbol) else {
            debug!(alarm_id = alarm.id, "whale check skipped: no order book cached");
            return result;
        };
        let qualifies = |level: &&BookLevel| level.notional() >= whale.quantity;
        let hits = WhaleHits {
            bids: order_book.bids.iter().filter(qualifies).copied().collect(),
            asks: order_book.asks.iter().filter(qualifies).copied().collect(),
        };
        if hits.is_empty() {
            return result;
        }
        result.whales = Some(hits);
    }

    if let Some(tick) = &alarm.condition.tick
        && trade.amount < tick.quantity
    {
        return result;
    }

    if let Some(rsi_condition) = &alarm.condition.rsi {
        let since = Utc::now().timestamp() - rsi_condition.length as i64 * 86_400;
        let candles = cache.get_candles(
            alarm.exchange,
            &alarm.symbol,
            rsi_condition.interval,
            Some(since),
            None,
        );
        let closes: Vec<f64> = candles.iter().filter_map(|c| c.close()).collect();
        let rsi_value = match indicator::rsi(&closes, rsi_condition.length) {
            Ok(value) => value,
            Err(report) => {
                debug!(alarm_id = alarm.id, error = ?report, "rsi check skipped");
                return result;
            }
        };
        let is_over_upper_bound = rsi_condition.upper_bound <= rsi_value;
        let is_under_lower_bound = rsi_condition.lower_bound >= rsi_value;
        if !(is_over_upper_bound || is_under_lower_bound) {
            return result;
        }
        result.rsi = Some(rsi_value);
    }

    if let Some(bb) = &alarm.condition.bollinger_band {
        let length = bb.length as usize;
        let candles = cache.get_candles(alarm.exchange, &alarm.symbol, bb.interval, None, None);
        if candles.len() < length {
            return result;
        }
        let closes: Vec<f64> = candles[candles.len() - length..]
            .iter()
            .filter_map(|c| c.close())
            .collect();
        // A window containing candles without trades has no usable closes
        if closes.len() < length {
            return result;
        }
        let (_basis, upper_band, lower_band) =
            match indicator::bollinger_band(&closes, bb.coefficient) {
                Ok(bands) => bands,
                Err(report) => {
                    debug!(alarm_id = alarm.id, error = ?report, "bollinger check skipped");
                    return result;
                }
            };
        let is_over_upper_band = upper_band <= trade.price;
        let is_under_lower_band = lower_band >= trade.price;
        result.crossed_band = if bb.on_over_upper_band && is_over_upper_band {
            Some(CrossedBand::Upper)
        } else if bb.on_under_lower_band && is_under_lower_band {
            Some(CrossedBand::Lower)
        } else {
            None
        };
        if result.crossed_band.is_none() {
            return result;
        }
    }

    result.is_alarm_triggered = true;
    result
}
