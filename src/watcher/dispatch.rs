use error_stack::Report;
use tracing::debug;

use crate::error::NotifyError;
use crate::notifier::Notifier;
use crate::watcher::Alarm;
use crate::watcher::evaluate::{CheckResult, WhaleHits};

/// Render and deliver the alert for a triggered check.
///
/// The alerted-candle timestamp must only advance when this returns `Ok`,
/// so a failed primary message surfaces as an error. The follow-up whale
/// ladder is best-effort once the primary message went out.
pub async fn send(
    notifier: &dyn Notifier,
    alarm: &Alarm,
    result: &CheckResult,
) -> Result<(), Report<NotifyError>> {
    notifier
        .send(alarm.channel_id, &alert_message(alarm, result))
        .await?;

    if let Some(whales) = &result.whales {
        if let Err(report) = notifier
            .send(alarm.channel_id, &whale_message(alarm, whales))
            .await
        {
            debug!(alarm_id = alarm.id, error = ?report, "whale ladder delivery failed");
        }
    }
    Ok(())
}

pub fn alert_message(alarm: &Alarm, result: &CheckResult) -> String {
    let trade = &result.trade;
    let mut msg = format!(
        "{} {} 조건 돌파!\n",
        alarm.exchange.korean_name(),
        alarm.symbol
    );
    msg.push_str(&format!(
        "가격: {} {}\n거래량: {} {}\n총 체결 금액: {} {}\n",
        format_price(trade.price),
        alarm.quote_symbol,
        group_digits(trade.amount, 4),
        alarm.base_symbol,
        group_digits(trade.cost, 2),
        alarm.quote_symbol,
    ));
    if let Some(rsi) = result.rsi {
        msg.push_str(&format!("RSI: {rsi:.2}\n"));
    }
    if let Some(band) = result.crossed_band {
        msg.push_str(&format!("볼린저 밴드 {} 돌파!", band.korean()));
    }
    msg
}

pub fn whale_message(alarm: &Alarm, whales: &WhaleHits) -> String {
    let mut msg = String::from("고래 정보\n");
    msg.push_str("=============\n매도벽\n");
    for level in whales.asks.iter().rev() {
        msg.push_str(&ladder_line(alarm, level.price, level.amount));
    }
    msg.push_str("=============\n매수벽\n");
    for level in &whales.bids {
        msg.push_str(&ladder_line(alarm, level.price, level.amount));
    }
    msg
}

fn ladder_line(alarm: &Alarm, price: f64, amount: f64) -> String {
    format!(
        "{} {}@{} {} / 총액: {} {}\n",
        group_digits(amount, 2),
        alarm.base_symbol,
        group_digits(price, 2),
        alarm.quote_symbol,
        group_digits(price * amount, 2),
        alarm.quote_symbol,
    )
}

fn format_price(price: f64) -> String {
    let decimals = if price.fract() == 0.0 { 0 } else { 2 };
    group_digits(price, decimals)
}

/// Fixed-decimal rendering with thousands separators in the integer part.
fn group_digits(value: f64, decimals: usize) -> String {
    let formatted = format!("{value:.decimals$}");
    let (int_part, frac_part) = match formatted.split_once('.') {
        Some((int_part, frac_part)) => (int_part, Some(frac_part)),
        None => (formatted.as_str(), None),
    };
    let (sign, digits) = match int_part.strip_prefix('-') {
        Some(digits) => ("-", digits),
        None => ("", int_part),
    };

    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    match frac_part {
        Some(frac) => format!("{sign}{grouped}.{frac}"),
        None => format!("{sign}{grouped}"),
    }
}
