//! Indicator kernel: pure numerical routines over OHLCV sequences.
//!
//! Every function is deterministic and total: insufficient input yields 0
//! (or an empty output), never a panic. Callers decide whether a zero is
//! meaningful enough to forward.

use perp_common::Kline;

use crate::types::{Bollinger, IntradaySeries, LongerTermContext, VolumeAnalysis};

/// Taker buy/sell ratio sentinel when the sell side is zero or negative.
pub const TAKER_RATIO_SATURATED: f64 = 999.0;

/// Relative-volume threshold for the spike flag.
const VOLUME_SPIKE_THRESHOLD: f64 = 2.5;

/// Exponential moving average, seeded with the SMA of the first `period`
/// closes, then the standard recursive update with k = 2/(period+1).
pub fn ema(klines: &[Kline], period: usize) -> f64 {
    if period == 0 || klines.len() < period {
        return 0.0;
    }

    let seed: f64 = klines[..period].iter().map(|k| k.close).sum::<f64>() / period as f64;
    let multiplier = 2.0 / (period as f64 + 1.0);

    klines[period..]
        .iter()
        .fold(seed, |acc, k| (k.close - acc) * multiplier + acc)
}

/// MACD line: EMA(12) − EMA(26). Undefined (0) below 26 samples.
pub fn macd(klines: &[Kline]) -> f64 {
    if klines.len() < 26 {
        return 0.0;
    }
    ema(klines, 12) - ema(klines, 26)
}

/// RSI with Wilder smoothing, seeded from the first `period` differences.
/// Returns 100 when the average loss is zero.
pub fn rsi(klines: &[Kline], period: usize) -> f64 {
    if period == 0 || klines.len() <= period {
        return 0.0;
    }

    let mut gains = 0.0;
    let mut losses = 0.0;
    for i in 1..=period {
        let change = klines[i].close - klines[i - 1].close;
        if change > 0.0 {
            gains += change;
        } else {
            losses += -change;
        }
    }

    let mut avg_gain = gains / period as f64;
    let mut avg_loss = losses / period as f64;
    let p = period as f64;

    for i in (period + 1)..klines.len() {
        let change = klines[i].close - klines[i - 1].close;
        if change > 0.0 {
            avg_gain = (avg_gain * (p - 1.0) + change) / p;
            avg_loss = (avg_loss * (p - 1.0)) / p;
        } else {
            avg_gain = (avg_gain * (p - 1.0)) / p;
            avg_loss = (avg_loss * (p - 1.0) + (-change)) / p;
        }
    }

    if avg_loss == 0.0 {
        return 100.0;
    }

    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

/// Average true range with Wilder smoothing.
/// True range = max(h−l, |h−prevClose|, |l−prevClose|).
pub fn atr(klines: &[Kline], period: usize) -> f64 {
    if period == 0 || klines.len() <= period {
        return 0.0;
    }

    let mut trs = vec![0.0; klines.len()];
    for i in 1..klines.len() {
        let high = klines[i].high;
        let low = klines[i].low;
        let prev_close = klines[i - 1].close;
        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        trs[i] = tr;
    }

    let mut value: f64 = trs[1..=period].iter().sum::<f64>() / period as f64;
    let p = period as f64;
    for tr in &trs[period + 1..] {
        value = (value * (p - 1.0) + tr) / p;
    }

    value
}

/// Bollinger bands: SMA ± k·σ over the last `period` closes (population σ).
pub fn bollinger(klines: &[Kline], period: usize, k: f64) -> Bollinger {
    if period == 0 || klines.len() < period {
        return Bollinger::default();
    }

    let subset = &klines[klines.len() - period..];
    let sma: f64 = subset.iter().map(|b| b.close).sum::<f64>() / period as f64;
    let variance: f64 = subset
        .iter()
        .map(|b| {
            let d = b.close - sma;
            d * d
        })
        .sum::<f64>()
        / period as f64;
    let sigma = variance.sqrt();

    Bollinger {
        upper: sma + sigma * k,
        middle: sma,
        lower: sma - sigma * k,
    }
}

/// Aggregate fixed-count buckets of bars into one bar each: open of the
/// first, close of the last, high/low extrema, summed volume, close time of
/// the last. Used to derive 15m/30m/1h/4h from 3m. A trailing partial group
/// is dropped.
pub fn aggregate(klines: &[Kline], group_size: usize) -> Vec<Kline> {
    if group_size <= 1 || klines.is_empty() {
        return klines.to_vec();
    }

    klines
        .chunks_exact(group_size)
        .map(|group| {
            let mut bar = Kline {
                open: group[0].open,
                high: group[0].high,
                low: group[0].low,
                close: group[group.len() - 1].close,
                volume: 0.0,
                close_time: group[group.len() - 1].close_time,
                taker_buy_volume: 0.0,
            };
            for k in group {
                bar.high = bar.high.max(k.high);
                bar.low = bar.low.min(k.low);
                bar.volume += k.volume;
                bar.taker_buy_volume += k.taker_buy_volume;
            }
            bar
        })
        .collect()
}

/// The last ~10 samples of the 3m series with per-point indicator values.
pub fn intraday_series(klines: &[Kline]) -> IntradaySeries {
    let mut data = IntradaySeries::default();
    let start = klines.len().saturating_sub(10);

    for i in start..klines.len() {
        data.mid_prices.push(klines[i].close);
        data.volume.push(klines[i].volume);

        if i >= 19 {
            data.ema20.push(ema(&klines[..=i], 20));
        }
        if i >= 25 {
            data.macd.push(macd(&klines[..=i]));
        }
        if i >= 7 {
            data.rsi7.push(rsi(&klines[..=i], 7));
        }
        if i >= 14 {
            data.rsi14.push(rsi(&klines[..=i], 14));
        }
    }

    data.atr14 = atr(klines, 14);
    data
}

/// 4h (or fallback) context: slow EMAs, two ATR horizons, volume, and short
/// MACD/RSI tails over the last 10 bars.
pub fn longer_term_context(klines: &[Kline]) -> LongerTermContext {
    let mut data = LongerTermContext {
        ema20: ema(klines, 20),
        ema50: ema(klines, 50),
        atr3: atr(klines, 3),
        atr14: atr(klines, 14),
        ..Default::default()
    };

    if let Some(last) = klines.last() {
        data.current_volume = last.volume;
        data.average_volume = klines.iter().map(|k| k.volume).sum::<f64>() / klines.len() as f64;
    }

    let start = klines.len().saturating_sub(10);
    for i in start..klines.len() {
        if i >= 25 {
            data.macd.push(macd(&klines[..=i]));
        }
        if i >= 14 {
            data.rsi14.push(rsi(&klines[..=i], 14));
        }
    }

    data
}

/// Relative volume against the mean of the last `lookback` non-zero bars
/// plus the taker buy/sell ratio of the latest bar.
pub fn volume_analysis(klines: &[Kline], lookback: usize) -> Option<VolumeAnalysis> {
    let last = klines.last()?;
    let current_vol = last.volume;
    if current_vol <= 0.0 {
        return Some(VolumeAnalysis::default());
    }

    let start = klines.len().saturating_sub(lookback);
    let mut sum = 0.0;
    let mut count = 0usize;
    for k in &klines[start..] {
        if k.volume > 0.0 {
            sum += k.volume;
            count += 1;
        }
    }

    let relative = if count > 0 && sum > 0.0 {
        current_vol / (sum / count as f64)
    } else {
        0.0
    };

    let buy_vol = last.taker_buy_volume;
    let ratio = if buy_vol <= 0.0 {
        0.0
    } else {
        let sell_vol = current_vol - buy_vol;
        if sell_vol <= 0.0 {
            TAKER_RATIO_SATURATED
        } else {
            buy_vol / sell_vol
        }
    };

    Some(VolumeAnalysis {
        relative_volume_3m: relative,
        taker_buy_sell_ratio: ratio,
        is_volume_spike: relative >= VOLUME_SPIKE_THRESHOLD,
    })
}

/// Sample standard deviation of simple close-to-close returns over the last
/// `lookback` bars.
pub fn realized_volatility(klines: &[Kline], lookback: usize) -> f64 {
    if klines.len() < lookback + 1 {
        return 0.0;
    }

    let start = klines.len().saturating_sub(lookback + 1);
    let mut returns = Vec::with_capacity(lookback);
    for w in klines[start..].windows(2) {
        let (p0, p1) = (w[0].close, w[1].close);
        if p0 > 0.0 && p1 > 0.0 {
            returns.push((p1 - p0) / p0);
        }
    }

    if returns.is_empty() {
        return 0.0;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / returns.len() as f64;
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bars_from_closes(closes: &[f64]) -> Vec<Kline> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Kline {
                open: c,
                high: c + 1.0,
                low: c - 1.0,
                close: c,
                volume: 100.0,
                close_time: (i as i64 + 1) * 180_000,
                taker_buy_volume: 60.0,
            })
            .collect()
    }

    #[test]
    fn ema_of_constant_series_is_the_constant() {
        let bars = bars_from_closes(&[50.0; 40]);
        assert!((ema(&bars, 20) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn ema_insufficient_data_is_zero() {
        let bars = bars_from_closes(&[1.0, 2.0, 3.0]);
        assert_eq!(ema(&bars, 20), 0.0);
    }

    #[test]
    fn ema_seed_matches_sma() {
        // Exactly `period` samples: the EMA is just the seed SMA.
        let closes: Vec<f64> = (1..=5).map(|i| i as f64).collect();
        let bars = bars_from_closes(&closes);
        assert!((ema(&bars, 5) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn macd_requires_26_bars() {
        let bars = bars_from_closes(&[10.0; 25]);
        assert_eq!(macd(&bars), 0.0);
        let bars = bars_from_closes(&[10.0; 26]);
        // Constant series: both EMAs equal the constant.
        assert!((macd(&bars)).abs() < 1e-9);
    }

    #[test]
    fn macd_positive_in_uptrend() {
        let closes: Vec<f64> = (1..=60).map(|i| 100.0 + i as f64).collect();
        let bars = bars_from_closes(&closes);
        assert!(macd(&bars) > 0.0);
    }

    #[test]
    fn rsi_is_100_when_only_gains() {
        let closes: Vec<f64> = (1..=30).map(|i| i as f64).collect();
        let bars = bars_from_closes(&closes);
        assert_eq!(rsi(&bars, 14), 100.0);
    }

    #[test]
    fn rsi_is_bounded() {
        let closes: Vec<f64> = (0..50)
            .map(|i| 100.0 + if i % 2 == 0 { 3.0 } else { -2.0 })
            .collect();
        let bars = bars_from_closes(&closes);
        let v = rsi(&bars, 14);
        assert!(v > 0.0 && v < 100.0, "rsi out of range: {v}");
    }

    #[test]
    fn atr_constant_range() {
        // Every bar has high-low = 2 and no gaps, so ATR converges to 2.
        let bars = bars_from_closes(&[100.0; 40]);
        assert!((atr(&bars, 14) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn atr_insufficient_data_is_zero() {
        let bars = bars_from_closes(&[100.0; 14]);
        assert_eq!(atr(&bars, 14), 0.0);
    }

    #[test]
    fn bollinger_constant_series_collapses() {
        let bars = bars_from_closes(&[42.0; 25]);
        let bb = bollinger(&bars, 20, 2.0);
        assert!((bb.upper - 42.0).abs() < 1e-9);
        assert!((bb.middle - 42.0).abs() < 1e-9);
        assert!((bb.lower - 42.0).abs() < 1e-9);
    }

    #[test]
    fn bollinger_bands_are_symmetric() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + (i % 5) as f64).collect();
        let bars = bars_from_closes(&closes);
        let bb = bollinger(&bars, 20, 2.0);
        assert!((bb.upper - bb.middle - (bb.middle - bb.lower)).abs() < 1e-9);
        assert!(bb.upper > bb.middle && bb.middle > bb.lower);
    }

    #[test]
    fn aggregate_merges_fixed_groups() {
        let mut bars = bars_from_closes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        bars[2].high = 99.0;
        bars[1].low = -5.0;
        let agg = aggregate(&bars, 3);
        // 7 bars / 3 = 2 full groups, trailing bar dropped.
        assert_eq!(agg.len(), 2);
        assert_eq!(agg[0].open, 1.0);
        assert_eq!(agg[0].close, 3.0);
        assert_eq!(agg[0].high, 99.0);
        assert_eq!(agg[0].low, -5.0);
        assert!((agg[0].volume - 300.0).abs() < 1e-9);
        assert_eq!(agg[0].close_time, bars[2].close_time);
        assert_eq!(agg[1].open, 4.0);
        assert_eq!(agg[1].close, 6.0);
    }

    #[test]
    fn aggregate_group_size_one_is_identity() {
        let bars = bars_from_closes(&[1.0, 2.0]);
        assert_eq!(aggregate(&bars, 1), bars);
    }

    #[test]
    fn intraday_series_holds_last_ten() {
        let closes: Vec<f64> = (1..=40).map(|i| i as f64).collect();
        let bars = bars_from_closes(&closes);
        let s = intraday_series(&bars);
        assert_eq!(s.mid_prices.len(), 10);
        assert_eq!(s.mid_prices[0], 31.0);
        assert_eq!(s.ema20.len(), 10);
        assert_eq!(s.rsi7.len(), 10);
        assert!(s.atr14 > 0.0);
    }

    #[test]
    fn volume_spike_flag() {
        let mut bars = bars_from_closes(&[100.0; 21]);
        bars.last_mut().unwrap().volume = 1000.0;
        bars.last_mut().unwrap().taker_buy_volume = 900.0;
        let va = volume_analysis(&bars, 20).unwrap();
        assert!(va.is_volume_spike);
        assert!(va.relative_volume_3m > VOLUME_SPIKE_THRESHOLD);
        // 900 buy vs 100 sell.
        assert!((va.taker_buy_sell_ratio - 9.0).abs() < 1e-9);
    }

    #[test]
    fn taker_ratio_saturates_when_all_buys() {
        let mut bars = bars_from_closes(&[100.0; 5]);
        bars.last_mut().unwrap().volume = 50.0;
        bars.last_mut().unwrap().taker_buy_volume = 50.0;
        let va = volume_analysis(&bars, 20).unwrap();
        assert_eq!(va.taker_buy_sell_ratio, TAKER_RATIO_SATURATED);
    }

    #[test]
    fn realized_volatility_zero_for_flat_series() {
        let bars = bars_from_closes(&[100.0; 30]);
        assert_eq!(realized_volatility(&bars, 20), 0.0);
    }

    #[test]
    fn realized_volatility_positive_for_noisy_series() {
        let closes: Vec<f64> = (0..30)
            .map(|i| 100.0 * (1.0 + 0.01 * ((i % 3) as f64 - 1.0)))
            .collect();
        let bars = bars_from_closes(&closes);
        assert!(realized_volatility(&bars, 20) > 0.0);
    }
}
