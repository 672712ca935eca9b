//! Technical indicator library.
//!
//! Pure functions over price series. Every function returns a defined
//! fallback value on short or empty input and never panics.

use serde::{Deserialize, Serialize};

/// Fixed Fibonacci retracement ratios.
pub const FIBONACCI_RATIOS: [f64; 7] = [0.0, 0.236, 0.382, 0.5, 0.618, 0.786, 1.0];

// ---------------------------------------------------------------------------
// Moving averages
// ---------------------------------------------------------------------------

/// Exponential moving average, seeded with the first value.
///
/// Returns the last element (or 0.0 for an empty series) when the series
/// is shorter than `period`.
pub fn ema(series: &[f64], period: usize) -> f64 {
    if series.len() < period || series.is_empty() || period == 0 {
        return series.last().copied().unwrap_or(0.0);
    }
    let k = 2.0 / (period as f64 + 1.0);
    series[1..]
        .iter()
        .fold(series[0], |acc, &x| (x - acc) * k + acc)
}

/// Full EMA series, same length as the input.
pub fn ema_series(series: &[f64], period: usize) -> Vec<f64> {
    let Some(&first) = series.first() else {
        return Vec::new();
    };
    let k = 2.0 / (period.max(1) as f64 + 1.0);
    let mut out = Vec::with_capacity(series.len());
    let mut acc = first;
    out.push(acc);
    for &x in &series[1..] {
        acc = (x - acc) * k + acc;
        out.push(acc);
    }
    out
}

/// Simple moving average of the last `period` values.
pub fn sma(series: &[f64], period: usize) -> f64 {
    if series.len() < period || series.is_empty() || period == 0 {
        return series.last().copied().unwrap_or(0.0);
    }
    let window = &series[series.len() - period..];
    window.iter().sum::<f64>() / period as f64
}

// ---------------------------------------------------------------------------
// Oscillators
// ---------------------------------------------------------------------------

/// Relative strength index with Wilder smoothing, in [0, 100].
///
/// Needs `period + 1` points, otherwise 50. Zero average loss gives 100.
pub fn rsi(series: &[f64], period: usize) -> f64 {
    if period == 0 || series.len() < period + 1 {
        return 50.0;
    }
    let p = period as f64;
    let (mut gains, mut losses) = (0.0, 0.0);
    for i in 1..=period {
        let change = series[i] - series[i - 1];
        if change > 0.0 {
            gains += change;
        } else {
            losses -= change;
        }
    }
    let mut avg_gain = gains / p;
    let mut avg_loss = losses / p;

    for i in (period + 1)..series.len() {
        let change = series[i] - series[i - 1];
        avg_gain = (avg_gain * (p - 1.0) + change.max(0.0)) / p;
        avg_loss = (avg_loss * (p - 1.0) + (-change).max(0.0)) / p;
    }

    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    (100.0 - 100.0 / (1.0 + rs)).clamp(0.0, 100.0)
}

/// Stochastic oscillator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stochastic {
    pub k: f64,
    pub d: f64,
}

/// %K over the last `k_period` bars. %D is reported equal to %K.
///
/// A flat window or empty input reads 50.
pub fn stochastic(
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    k_period: usize,
    _d_period: usize,
) -> Stochastic {
    let n = highs.len().min(lows.len()).min(closes.len());
    if n == 0 || k_period == 0 {
        return Stochastic { k: 50.0, d: 50.0 };
    }
    let start = n.saturating_sub(k_period);
    let highest = highs[start..n].iter().copied().fold(f64::MIN, f64::max);
    let lowest = lows[start..n].iter().copied().fold(f64::MAX, f64::min);
    let range = highest - lowest;
    let k = if range > 0.0 {
        ((closes[n - 1] - lowest) / range * 100.0).clamp(0.0, 100.0)
    } else {
        50.0
    };
    Stochastic { k, d: k }
}

// ---------------------------------------------------------------------------
// Volatility and trend strength
// ---------------------------------------------------------------------------

/// True range for bars 1..n (one shorter than the input).
pub fn true_range(highs: &[f64], lows: &[f64], closes: &[f64]) -> Vec<f64> {
    let n = highs.len().min(lows.len()).min(closes.len());
    (1..n)
        .map(|i| {
            let hl = highs[i] - lows[i];
            let hc = (highs[i] - closes[i - 1]).abs();
            let lc = (lows[i] - closes[i - 1]).abs();
            hl.max(hc).max(lc)
        })
        .collect()
}

/// Average true range (simple average of the last `period` true ranges).
///
/// With fewer than `period + 1` bars returns the first bar's high-low range.
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> f64 {
    let n = highs.len().min(lows.len()).min(closes.len());
    if n < period + 1 {
        return match (highs.first(), lows.first()) {
            (Some(h), Some(l)) => h - l,
            _ => 0.0,
        };
    }
    sma(&true_range(highs, lows, closes), period)
}

/// Average directional index, final DX after Wilder smoothing.
///
/// Returns 25 (neutral trend strength) with fewer than `2 * period` bars
/// or when the smoothed true range is zero.
pub fn adx(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> f64 {
    let n = highs.len().min(lows.len()).min(closes.len());
    if period == 0 || n < period * 2 {
        return 25.0;
    }

    let mut plus_dm = Vec::with_capacity(n - 1);
    let mut minus_dm = Vec::with_capacity(n - 1);
    for i in 1..n {
        let up = highs[i] - highs[i - 1];
        let down = lows[i - 1] - lows[i];
        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });
    }
    let tr = true_range(&highs[..n], &lows[..n], &closes[..n]);

    let p = period as f64;
    let mut s_plus: f64 = plus_dm[..period].iter().sum();
    let mut s_minus: f64 = minus_dm[..period].iter().sum();
    let mut s_tr: f64 = tr[..period].iter().sum();
    for i in period..plus_dm.len() {
        s_plus = s_plus - s_plus / p + plus_dm[i];
        s_minus = s_minus - s_minus / p + minus_dm[i];
        s_tr = s_tr - s_tr / p + tr[i];
    }

    if s_tr == 0.0 {
        return 25.0;
    }
    let plus_di = 100.0 * s_plus / s_tr;
    let minus_di = 100.0 * s_minus / s_tr;
    let di_sum = plus_di + minus_di;
    if di_sum == 0.0 {
        return 0.0;
    }
    100.0 * (plus_di - minus_di).abs() / di_sum
}

/// Bollinger bands around an SMA.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Bollinger bands with population standard deviation over the last
/// `period` values. Short input collapses all three bands to the last value.
pub fn bollinger_bands(series: &[f64], period: usize, std_dev: f64) -> Bands {
    let middle = sma(series, period);
    if period == 0 || series.len() < period {
        return Bands {
            upper: middle,
            middle,
            lower: middle,
        };
    }
    let window = &series[series.len() - period..];
    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let sd = variance.sqrt();
    Bands {
        upper: middle + std_dev * sd,
        middle,
        lower: middle - std_dev * sd,
    }
}

// ---------------------------------------------------------------------------
// MACD
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Macd {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// MACD line, signal line (EMA of the MACD series) and histogram.
pub fn macd(series: &[f64], fast: usize, slow: usize, signal: usize) -> Macd {
    if series.is_empty() {
        return Macd::default();
    }
    let fast_series = ema_series(series, fast);
    let slow_series = ema_series(series, slow);
    let macd_series: Vec<f64> = fast_series
        .iter()
        .zip(&slow_series)
        .map(|(f, s)| f - s)
        .collect();
    let macd_line = macd_series.last().copied().unwrap_or(0.0);
    let signal_line = ema(&macd_series, signal);
    Macd {
        macd: macd_line,
        signal: signal_line,
        histogram: macd_line - signal_line,
    }
}

// ---------------------------------------------------------------------------
// Levels and volume
// ---------------------------------------------------------------------------

/// Retracement levels between `high` and `low`, as `(ratio, price)` pairs.
/// Ratio 0 is the high, ratio 1 the low.
pub fn fibonacci_retracement(high: f64, low: f64) -> Vec<(f64, f64)> {
    let diff = high - low;
    FIBONACCI_RATIOS
        .iter()
        .map(|&r| (r, high - diff * r))
        .collect()
}

/// Last volume divided by the mean of the `lookback` volumes before it.
///
/// Returns 1.0 on insufficient data or a zero average.
pub fn volume_ratio(volumes: &[f64], lookback: usize) -> f64 {
    if lookback == 0 || volumes.len() < lookback + 1 {
        return 1.0;
    }
    let n = volumes.len();
    let avg = volumes[n - 1 - lookback..n - 1].iter().sum::<f64>() / lookback as f64;
    if avg > 0.0 {
        volumes[n - 1] / avg
    } else {
        1.0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
