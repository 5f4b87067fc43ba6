//! Momentum factor computation.
//!
//! Scores one candle series at a time. Two policies are available:
//! - `Enhanced`: multi-horizon returns blended with volatility-adjusted momentum,
//!   moving-average trend confirmation and volume momentum
//! - `Simple`: the return across the last 24 bars
//!
//! Series that are too short or fail data-quality checks produce an error
//! instead of a score, so the instrument drops out of ranking for the cycle.

use crate::exchange::CandleSeries;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// (horizon in bars, weight) for the multi-horizon return.
const HORIZONS: [(usize, f64); 5] = [(1, 0.10), (4, 0.20), (24, 0.30), (72, 0.25), (168, 0.15)];

const VOLATILITY_WINDOW: usize = 24;
const BASELINE_VOLATILITY: f64 = 0.02;
const SHORT_MA: usize = 10;
const LONG_MA: usize = 30;
/// Bars required before the trend sub-score is computed
const TREND_MIN_BARS: usize = 50;
const VOLUME_WINDOW: usize = 24;
const VOLUME_CLAMP: f64 = 0.5;

const WEIGHT_RAW: f64 = 0.5;
const WEIGHT_VOL_ADJUSTED: f64 = 0.2;
const WEIGHT_TREND: f64 = 0.2;
const WEIGHT_VOLUME: f64 = 0.1;

const SIMPLE_BARS: usize = 24;

/// How a candle series is turned into a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoringPolicy {
    #[default]
    Enhanced,
    Simple,
}

impl ScoringPolicy {
    /// Bars required before a series can be scored.
    pub fn min_history(&self) -> usize {
        match self {
            ScoringPolicy::Enhanced => 168,
            ScoringPolicy::Simple => SIMPLE_BARS,
        }
    }
}

/// A finite momentum score. Higher ranks longer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MomentumScore(f64);

impl MomentumScore {
    /// Returns `None` for NaN or infinite values.
    pub fn new(value: f64) -> Option<Self> {
        value.is_finite().then_some(Self(value))
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl Eq for MomentumScore {}

impl PartialOrd for MomentumScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MomentumScore {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for MomentumScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.0)
    }
}

/// Why a series could not be scored.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FactorError {
    #[error("insufficient history: {have} bars, need {need}")]
    Insufficient { have: usize, need: usize },

    #[error("data quality: {0}")]
    Quality(String),
}

/// Sub-scores behind an enhanced score, kept for debug logging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub raw_momentum: f64,
    pub volatility_adjusted: f64,
    pub trend: f64,
    pub volume: f64,
    pub score: MomentumScore,
}

/// Scores candle series under one policy.
#[derive(Debug, Clone)]
pub struct FactorEngine {
    policy: ScoringPolicy,
    max_bar_move: f64,
}

impl FactorEngine {
    /// Create an engine; `max_bar_move` is the largest accepted absolute one-bar return.
    pub fn new(policy: ScoringPolicy, max_bar_move: f64) -> Self {
        Self {
            policy,
            max_bar_move,
        }
    }

    pub fn policy(&self) -> ScoringPolicy {
        self.policy
    }

    /// Score a series, or explain why it cannot be scored.
    pub fn score(&self, series: &CandleSeries) -> Result<MomentumScore, FactorError> {
        self.breakdown(series).map(|b| b.score)
    }

    /// Score a series and return the sub-scores that produced it.
    pub fn breakdown(&self, series: &CandleSeries) -> Result<ScoreBreakdown, FactorError> {
        let need = self.policy.min_history();
        if series.len() < need {
            return Err(FactorError::Insufficient {
                have: series.len(),
                need,
            });
        }

        self.check_quality(series)?;

        let closes = series.closes();
        let breakdown = match self.policy {
            ScoringPolicy::Enhanced => {
                let volumes = series.volumes();
                let raw_momentum = multi_horizon_return(&closes);
                let volatility_adjusted = volatility_adjusted_momentum(&closes);
                let trend = trend_confirmation(&closes);
                let volume = volume_momentum(&volumes);
                let total = WEIGHT_RAW * raw_momentum
                    + WEIGHT_VOL_ADJUSTED * volatility_adjusted
                    + WEIGHT_TREND * trend
                    + WEIGHT_VOLUME * volume;

                ScoreBreakdown {
                    raw_momentum,
                    volatility_adjusted,
                    trend,
                    volume,
                    score: finite(total)?,
                }
            }
            ScoringPolicy::Simple => {
                let n = closes.len();
                let raw_momentum = pct_change(closes[n - 1], closes[n - SIMPLE_BARS]);
                ScoreBreakdown {
                    raw_momentum,
                    volatility_adjusted: 0.0,
                    trend: 0.0,
                    volume: 0.0,
                    score: finite(raw_momentum)?,
                }
            }
        };

        Ok(breakdown)
    }

    fn check_quality(&self, series: &CandleSeries) -> Result<(), FactorError> {
        if !series.is_strictly_increasing() {
            return Err(FactorError::Quality(
                "timestamps are not strictly increasing".into(),
            ));
        }

        for candle in &series.candles {
            if !candle.close.is_finite() || candle.close <= 0.0 {
                return Err(FactorError::Quality(format!(
                    "invalid close {} at {}",
                    candle.close, candle.timestamp
                )));
            }
            if !candle.volume.is_finite() || candle.volume < 0.0 {
                return Err(FactorError::Quality(format!(
                    "invalid volume {} at {}",
                    candle.volume, candle.timestamp
                )));
            }
        }

        for pair in series.candles.windows(2) {
            let change = pct_change(pair[1].close, pair[0].close);
            if change.abs() > self.max_bar_move {
                return Err(FactorError::Quality(format!(
                    "bar move {:.2}% at {} exceeds {:.2}%",
                    change * 100.0,
                    pair[1].timestamp,
                    self.max_bar_move * 100.0
                )));
            }
        }

        Ok(())
    }
}

fn finite(value: f64) -> Result<MomentumScore, FactorError> {
    MomentumScore::new(value)
        .ok_or_else(|| FactorError::Quality(format!("non-finite score {}", value)))
}

/// Percentage change from `from` to `to`; zero when `from` is zero.
fn pct_change(to: f64, from: f64) -> f64 {
    if from == 0.0 {
        0.0
    } else {
        (to - from) / from
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1 denominator).
fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance =
        values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

/// Weighted mean of close-to-close returns over the horizons the history covers.
fn multi_horizon_return(closes: &[f64]) -> f64 {
    let n = closes.len();
    let last = closes[n - 1];

    let (weighted, total_weight) = HORIZONS
        .iter()
        .filter(|(horizon, _)| n > *horizon)
        .fold((0.0, 0.0), |(sum, weights), (horizon, weight)| {
            let ret = pct_change(last, closes[n - 1 - horizon]);
            (sum + ret * weight, weights + weight)
        });

    if total_weight > 0.0 {
        weighted / total_weight
    } else {
        0.0
    }
}

/// 24-bar return damped by recent volatility relative to a 2% baseline.
fn volatility_adjusted_momentum(closes: &[f64]) -> f64 {
    let n = closes.len();
    if n < VOLATILITY_WINDOW + 1 {
        return 0.0;
    }

    let returns: Vec<f64> = closes[n - VOLATILITY_WINDOW - 1..]
        .windows(2)
        .map(|pair| pct_change(pair[1], pair[0]))
        .collect();
    let volatility = sample_std(&returns);
    let momentum = pct_change(closes[n - 1], closes[n - 1 - VOLATILITY_WINDOW]);

    if volatility > 0.0 {
        momentum * (BASELINE_VOLATILITY / volatility).min(1.0)
    } else {
        momentum
    }
}

/// Signed trend strength from a 10/30-bar moving-average crossover, in [-1, 1].
fn trend_confirmation(closes: &[f64]) -> f64 {
    let n = closes.len();
    if n < TREND_MIN_BARS {
        return 0.0;
    }

    let short_ma = mean(&closes[n - SHORT_MA..]);
    let long_ma = mean(&closes[n - LONG_MA..]);
    if long_ma == 0.0 {
        return 0.0;
    }

    let gap = ((closes[n - 1] - long_ma) / long_ma).abs();
    let strength = (gap * 2.0).min(1.0);

    if short_ma > long_ma {
        strength
    } else {
        -strength
    }
}

/// Change in mean volume between the last 24 bars and the 24 before, clamped to ±0.5.
fn volume_momentum(volumes: &[f64]) -> f64 {
    let n = volumes.len();
    if n < VOLUME_WINDOW * 2 {
        return 0.0;
    }

    let recent = mean(&volumes[n - VOLUME_WINDOW..]);
    let previous = mean(&volumes[n - 2 * VOLUME_WINDOW..n - VOLUME_WINDOW]);
    if previous == 0.0 {
        return 0.0;
    }

    ((recent - previous) / previous).clamp(-VOLUME_CLAMP, VOLUME_CLAMP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Candle, Instrument};

    fn series_from(closes: &[f64], volumes: &[f64]) -> CandleSeries {
        let candles = closes
            .iter()
            .zip(volumes)
            .enumerate()
            .map(|(i, (close, volume))| Candle {
                timestamp: i as i64 * 3_600_000,
                open: *close,
                high: *close,
                low: *close,
                close: *close,
                volume: *volume,
            })
            .collect();
        CandleSeries::new(Instrument::new("BTCUSDT"), "1h", candles)
    }

    fn flat_series(len: usize) -> CandleSeries {
        series_from(&vec![100.0; len], &vec![10.0; len])
    }

    /// Closes growing by `rate` per bar with constant volume.
    fn trending_series(len: usize, rate: f64) -> CandleSeries {
        let closes: Vec<f64> = (0..len).map(|i| 100.0 * (1.0 + rate).powi(i as i32)).collect();
        series_from(&closes, &vec![10.0; len])
    }

    fn engine(policy: ScoringPolicy) -> FactorEngine {
        FactorEngine::new(policy, 0.5)
    }

    // ===== History requirements =====

    #[test]
    fn test_short_history_is_insufficient_not_zero() {
        let result = engine(ScoringPolicy::Enhanced).score(&flat_series(167));
        assert_eq!(
            result,
            Err(FactorError::Insufficient {
                have: 167,
                need: 168
            })
        );

        let result = engine(ScoringPolicy::Simple).score(&flat_series(23));
        assert!(matches!(result, Err(FactorError::Insufficient { need: 24, .. })));
    }

    #[test]
    fn test_flat_market_scores_zero() {
        let score = engine(ScoringPolicy::Enhanced).score(&flat_series(200)).unwrap();
        assert_eq!(score.value(), 0.0);
    }

    // ===== Simple policy =====

    #[test]
    fn test_simple_policy_is_24_bar_return() {
        let mut closes = vec![100.0; 30];
        closes[6] = 80.0; // closes[n - 24]
        for c in closes.iter_mut().skip(7) {
            *c = 88.0;
        }
        let series = series_from(&closes, &vec![1.0; 30]);

        let score = engine(ScoringPolicy::Simple).score(&series).unwrap();
        assert!((score.value() - 0.1).abs() < 1e-12);
    }

    // ===== Enhanced sub-scores =====

    #[test]
    fn test_multi_horizon_excludes_uncovered_weights() {
        // 25 bars: only 1, 4 and 24 bar horizons are covered
        let closes: Vec<f64> = (0..25).map(|i| if i == 24 { 110.0 } else { 100.0 }).collect();
        let raw = multi_horizon_return(&closes);
        // Every covered horizon returns 10%, so the normalized mean is 10%
        assert!((raw - 0.1).abs() < 1e-12);
    }

    /// Closes produced by alternating one-bar returns of `up` and `down`.
    fn zigzag_closes(len: usize, up: f64, down: f64) -> Vec<f64> {
        let mut closes = vec![100.0];
        for i in 1..len {
            let step = if i % 2 == 1 { up } else { down };
            closes.push(closes[i - 1] * (1.0 + step));
        }
        closes
    }

    #[test]
    fn test_volatility_adjustment_damps_noisy_series() {
        let closes = zigzag_closes(26, 0.05, -0.03);
        let returns: Vec<f64> = closes[1..]
            .windows(2)
            .map(|pair| pct_change(pair[1], pair[0]))
            .collect();
        let m = returns.iter().sum::<f64>() / 24.0;
        let sigma = (returns.iter().map(|r| (r - m).powi(2)).sum::<f64>() / 23.0).sqrt();
        let momentum = pct_change(closes[25], closes[1]);

        assert!(sigma > 0.02);
        assert!(momentum > 0.0);

        let adjusted = volatility_adjusted_momentum(&closes);
        assert!((adjusted - momentum * 0.02 / sigma).abs() < 1e-12);
        assert!(adjusted < momentum);
    }

    #[test]
    fn test_volatility_adjustment_low_or_zero_volatility_is_unscaled() {
        // Every one-bar return is exactly 100%, so the deviation is exactly zero
        let doubling: Vec<f64> = (0..26).map(|i| 100.0 * 2f64.powi(i)).collect();
        let momentum = pct_change(doubling[25], doubling[1]);
        assert_eq!(volatility_adjusted_momentum(&doubling), momentum);

        let steady: Vec<f64> = (0..26).map(|i| 100.0 + i as f64).collect();
        let momentum = pct_change(steady[25], steady[1]);
        assert!((volatility_adjusted_momentum(&steady) - momentum).abs() < 1e-12);
    }

    #[test]
    fn test_enhanced_score_is_weighted_sum_of_parts() {
        let mut closes = zigzag_closes(200, 0.012, -0.008);
        // Pull the latest bars above their averages so the trend term is non-trivial
        for c in closes.iter_mut().skip(190) {
            *c *= 1.01;
        }
        let mut volumes = vec![10.0; 176];
        volumes.extend(vec![13.0; 24]);

        let b = engine(ScoringPolicy::Enhanced)
            .breakdown(&series_from(&closes, &volumes))
            .unwrap();

        assert!(b.raw_momentum != 0.0);
        assert!(b.volatility_adjusted != 0.0);
        assert!(b.trend != 0.0);
        assert!((b.volume - 0.3).abs() < 1e-12);

        let expected = 0.5 * b.raw_momentum + 0.2 * b.volatility_adjusted + 0.2 * b.trend + 0.1 * b.volume;
        assert!((b.score.value() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_trend_sign_and_cap() {
        let rising: Vec<f64> = (0..60).map(|i| 100.0 * 1.05f64.powi(i)).collect();
        assert_eq!(trend_confirmation(&rising), 1.0);

        let falling: Vec<f64> = (0..60).map(|i| 400.0 - i as f64).collect();
        let trend = trend_confirmation(&falling);
        assert!(trend < 0.0 && trend > -1.0);

        assert_eq!(trend_confirmation(&rising[..49]), 0.0);
    }

    #[test]
    fn test_volume_momentum_clamped_and_zero_guarded() {
        let mut volumes = vec![10.0; 24];
        volumes.extend(vec![100.0; 24]);
        assert_eq!(volume_momentum(&volumes), 0.5);

        let mut volumes = vec![0.0; 24];
        volumes.extend(vec![100.0; 24]);
        assert_eq!(volume_momentum(&volumes), 0.0);

        let mut volumes = vec![10.0; 24];
        volumes.extend(vec![12.0; 24]);
        assert!((volume_momentum(&volumes) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_uptrend_outranks_downtrend() {
        let engine = engine(ScoringPolicy::Enhanced);
        let up = engine.breakdown(&trending_series(200, 0.001)).unwrap();
        let down = engine.breakdown(&trending_series(200, -0.001)).unwrap();

        assert!(up.raw_momentum > 0.0);
        assert!(up.trend > 0.0);
        assert!(down.trend < 0.0);
        assert!(up.score > down.score);
    }

    // ===== Data quality =====

    #[test]
    fn test_rejects_large_single_bar_move() {
        let mut closes = vec![100.0; 200];
        closes[150] = 160.0;
        let result = engine(ScoringPolicy::Enhanced).score(&series_from(&closes, &vec![1.0; 200]));
        assert!(matches!(result, Err(FactorError::Quality(_))));
    }

    #[test]
    fn test_rejects_bad_values_and_ordering() {
        let engine = engine(ScoringPolicy::Simple);

        let mut closes = vec![100.0; 30];
        closes[10] = f64::NAN;
        assert!(matches!(
            engine.score(&series_from(&closes, &vec![1.0; 30])),
            Err(FactorError::Quality(_))
        ));

        let mut closes = vec![100.0; 30];
        closes[10] = 0.0;
        assert!(engine.score(&series_from(&closes, &vec![1.0; 30])).is_err());

        let mut volumes = vec![1.0; 30];
        volumes[3] = -1.0;
        assert!(engine.score(&series_from(&vec![100.0; 30], &volumes)).is_err());

        let mut series = flat_series(30);
        series.candles[5].timestamp = series.candles[4].timestamp;
        assert!(matches!(engine.score(&series), Err(FactorError::Quality(_))));
    }

    // ===== Score type =====

    #[test]
    fn test_momentum_score_rejects_non_finite() {
        assert!(MomentumScore::new(f64::NAN).is_none());
        assert!(MomentumScore::new(f64::INFINITY).is_none());
        assert!(MomentumScore::new(-0.25).unwrap() < MomentumScore::new(0.1).unwrap());
    }
}
