use error_stack::{Report, bail};

use crate::error::IndicatorError;

/// Arithmetic mean.
pub fn sma(values: &[f64]) -> Result<f64, Report<IndicatorError>> {
    if values.is_empty() {
        bail!(IndicatorError::InsufficientData {
            required: 1,
            available: 0,
        });
    }
    Ok(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation.
pub fn pstdev(values: &[f64]) -> Result<f64, Report<IndicatorError>> {
    let mean = sma(values)?;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    Ok(variance.sqrt())
}

/// Exponential moving average with `alpha = 2 / (1 + length)`, seeded by the
/// first value; returns the value at the final index.
#[allow(dead_code)]
pub fn ema(values: &[f64], length: u32) -> Result<f64, Report<IndicatorError>> {
    if values.is_empty() {
        bail!(IndicatorError::InsufficientData {
            required: 1,
            available: 0,
        });
    }
    let alpha = 2.0 / (1.0 + length as f64);
    let mut current = values[0];
    for value in &values[1..] {
        current = alpha * value + (1.0 - alpha) * current;
    }
    Ok(current)
}

/// Wilder-style moving average with `alpha = 1 / length`, seeded by the
/// simple mean of the whole input; returns the value at the final index.
pub fn rma(values: &[f64], length: u32) -> Result<f64, Report<IndicatorError>> {
    let alpha = 1.0 / length as f64;
    let mut current = sma(values)?;
    for value in &values[1..] {
        current = alpha * value + (1.0 - alpha) * current;
    }
    Ok(current)
}

/// Bollinger bands: `(basis, upper, lower)` where basis is the mean of the
/// closes and the band half-width is `k` population standard deviations.
pub fn bollinger_band(
    closes: &[f64],
    k: f64,
) -> Result<(f64, f64, f64), Report<IndicatorError>> {
    let basis = sma(closes)?;
    let stdev = pstdev(closes)?;
    Ok((basis, basis + stdev * k, basis - stdev * k))
}

/// Relative Strength Index over the given closes.
///
/// Gains and losses are smoothed with `rma`; a flat series (zero average
/// movement) reports the neutral 50.0 instead of dividing by zero.
pub fn rsi(closes: &[f64], length: u32) -> Result<f64, Report<IndicatorError>> {
    if closes.len() < 2 {
        bail!(IndicatorError::InsufficientData {
            required: 2,
            available: closes.len(),
        });
    }

    let ups: Vec<f64> = closes.windows(2).map(|w| (w[1] - w[0]).max(0.0)).collect();
    let downs: Vec<f64> = closes.windows(2).map(|w| (w[0] - w[1]).max(0.0)).collect();

    let average_up = rma(&ups, length)?;
    let average_down = rma(&downs, length)?;

    let total = average_up + average_down;
    if total == 0.0 {
        return Ok(50.0);
    }
    Ok(average_up / total * 100.0)
}
