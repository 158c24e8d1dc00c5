// =============================================================================
// Market regime detection (§4.4)
// =============================================================================
//
// Classifies the last `lookback` (default 20) one-hour candles into one of
// four regimes, driving both the risk manager's dynamic SL/TP multipliers
// and the signal validator's threshold adjustment (§4.3).
//
//   σ = stdev(closes) / mean(closes) > 0.05        -> Volatile
//   ADX(14) > 25 and regression slope > 0          -> Bull   (trending up)
//   ADX(14) > 25 and regression slope < 0          -> Bear   (trending down)
//   otherwise                                       -> Sideways
// =============================================================================

use crate::candles::Candle;
use crate::indicators::adx::calculate_adx;
use crate::types::MarketRegime;

/// Lookback window for slope/stdev, per §4.4.
pub const DEFAULT_LOOKBACK: usize = 20;

/// ADX period used for trend-strength confirmation.
const ADX_PERIOD: usize = 14;

/// Realized-volatility threshold above which the market is `Volatile`.
const VOLATILE_SIGMA: f64 = 0.05;

/// ADX threshold above which directional movement counts as a trend.
const TREND_ADX: f64 = 25.0;

/// Detect the market regime from the trailing `lookback` candles (oldest
/// first). Returns `None` if there isn't enough data for ADX, matching the
/// indicator's own insufficient-data contract.
pub fn detect_regime(candles: &[Candle], lookback: usize) -> Option<MarketRegime> {
    let window = tail(candles, lookback);
    if window.len() < 2 {
        return None;
    }

    let closes: Vec<f64> = window.iter().map(|c| c.close).collect();
    let sigma = coefficient_of_variation(&closes);
    if sigma > VOLATILE_SIGMA {
        return Some(MarketRegime::Volatile);
    }

    let adx = calculate_adx(candles, ADX_PERIOD).unwrap_or(0.0);
    let slope = linear_regression_slope(&closes);

    let regime = if adx > TREND_ADX && slope > 0.0 {
        MarketRegime::Bull
    } else if adx > TREND_ADX && slope < 0.0 {
        MarketRegime::Bear
    } else {
        MarketRegime::Sideways
    };
    Some(regime)
}

/// Realized volatility over `period` candles, as used by the signal
/// validator's volatility-adjusted confidence threshold (§4.3) and the risk
/// manager's sizing volatility multiplier (§4.4 step 4). Defined as the
/// coefficient of variation of closing prices.
pub fn realized_volatility(candles: &[Candle], period: usize) -> f64 {
    let window = tail(candles, period);
    coefficient_of_variation(&window.iter().map(|c| c.close).collect::<Vec<_>>())
}

fn tail(candles: &[Candle], n: usize) -> &[Candle] {
    if candles.len() <= n {
        candles
    } else {
        &candles[candles.len() - n..]
    }
}

fn coefficient_of_variation(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean: f64 = values.iter().sum::<f64>() / values.len() as f64;
    if mean.abs() < f64::EPSILON {
        return 0.0;
    }
    let variance: f64 =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt() / mean
}

/// Slope of the ordinary-least-squares regression line over `values`,
/// indexed 0..n. Sign indicates direction; magnitude is in price units per
/// candle, which is all the classifier needs.
fn linear_regression_slope(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    if n < 2.0 {
        return 0.0;
    }
    let xs: Vec<f64> = (0..values.len()).map(|i| i as f64).collect();
    let x_mean = xs.iter().sum::<f64>() / n;
    let y_mean = values.iter().sum::<f64>() / n;

    let mut num = 0.0;
    let mut den = 0.0;
    for (x, y) in xs.iter().zip(values.iter()) {
        num += (x - x_mean) * (y - y_mean);
        den += (x - x_mean).powi(2);
    }
    if den.abs() < f64::EPSILON {
        0.0
    } else {
        num / den
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open: close,
            high: close * 1.001,
            low: close * 0.999,
            close,
            volume: 10.0,
        }
    }

    #[test]
    fn slope_detects_uptrend() {
        let values: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        assert!(linear_regression_slope(&values) > 0.0);
    }

    #[test]
    fn slope_detects_downtrend() {
        let values: Vec<f64> = (0..30).map(|i| 200.0 - i as f64).collect();
        assert!(linear_regression_slope(&values) < 0.0);
    }

    #[test]
    fn flat_series_has_zero_slope() {
        let values = vec![100.0; 30];
        assert!(linear_regression_slope(&values).abs() < 1e-9);
    }

    #[test]
    fn volatile_regime_wins_over_trend() {
        // Wild swings but still net upward: sigma should dominate.
        let candles: Vec<Candle> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64;
                let swing = if i % 2 == 0 { 1.0 } else { -1.0 } * base * 0.2;
                candle(base + swing)
            })
            .collect();
        assert_eq!(detect_regime(&candles, DEFAULT_LOOKBACK), Some(MarketRegime::Volatile));
    }

    #[test]
    fn sideways_regime_when_no_trend_strength() {
        let candles: Vec<Candle> = (0..30)
            .map(|i| candle(100.0 + (i as f64 * 0.1).sin()))
            .collect();
        assert_eq!(detect_regime(&candles, DEFAULT_LOOKBACK), Some(MarketRegime::Sideways));
    }

    #[test]
    fn insufficient_data_returns_none() {
        let candles = vec![candle(100.0)];
        assert_eq!(detect_regime(&candles, DEFAULT_LOOKBACK), None);
    }
}
