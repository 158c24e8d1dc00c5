// =============================================================================
// Risk Manager (§4.4) — position sizing, dynamic ATR-based SL/TP, regime
// detection. Regime detection itself lives in `crate::regime`; this module
// owns the sizing and SL/TP math that consumes it.
// =============================================================================
//
// Every threshold here is a named constant, per §9 ("Kelly, ATR, ADX ...
// document all thresholds as named constants").
// =============================================================================

use crate::candles::Candle;
use crate::indicators::atr::calculate_atr;
use crate::regime::realized_volatility;
use crate::store::KellyStats;
use crate::types::{MarketRegime, Side};

const ATR_PERIOD: usize = 14;
const VOL_LOOKBACK: usize = 20;

/// Low/high realized-volatility thresholds for the sizing multiplier
/// (§4.4 step 4).
const LOW_VOL_THRESHOLD: f64 = 0.02;
const HIGH_VOL_THRESHOLD: f64 = 0.05;
const LOW_VOL_MULTIPLIER: f64 = 1.2;
const HIGH_VOL_MULTIPLIER: f64 = 0.7;

/// Minimum closed-trade sample before Kelly sizing is trusted (§4.4 step 3,
/// shared with the signal validator's historical-accuracy gate, §4.3 step 2).
pub const MIN_TRADES_FOR_KELLY: u32 = 20;

/// Half-Kelly fraction is clamped to this range before being applied.
const KELLY_MAX_FRACTION: f64 = 0.25;

/// Position cap as a fraction of account equity (§4.4 step 6).
const MAX_EQUITY_FRACTION: f64 = 0.25;

/// Minimum acceptable reward:risk ratio; TP is widened to meet it (§4.4).
const MIN_REWARD_RISK_RATIO: f64 = 1.5;

/// Hard cap on how far TP may be widened past entry, as a fraction of price.
const MAX_TP_WIDEN_PCT: f64 = 0.10;

/// SL/TP distance multipliers by regime, in units of ATR (§4.4).
fn sl_tp_multipliers(regime: MarketRegime) -> (f64, f64) {
    match regime {
        MarketRegime::Bull | MarketRegime::Bear => (1.5, 3.0),
        MarketRegime::Sideways => (2.0, 2.0),
        MarketRegime::Volatile => (2.5, 2.5),
    }
}

/// `(stop_loss, take_profit)` computed from ATR(14) on 1h candles, the
/// detected regime's multipliers, the user's max-SL-distance cap, and a
/// minimum 1:1.5 reward:risk ratio (§4.4 "Dynamic SL/TP"). `candles` must be
/// oldest-first and end at (or near) `entry_price`'s bar.
pub fn dynamic_stop_loss_take_profit(
    candles: &[Candle],
    entry_price: f64,
    side: Side,
    regime: MarketRegime,
    max_stop_loss_pct: f64,
) -> Option<(f64, f64)> {
    let atr = calculate_atr(candles, ATR_PERIOD)?;
    let (sl_mult, tp_mult) = sl_tp_multipliers(regime);

    let sl_distance = (atr * sl_mult).min(entry_price * max_stop_loss_pct);
    let mut tp_distance = atr * tp_mult;

    if tp_distance < sl_distance * MIN_REWARD_RISK_RATIO {
        tp_distance = sl_distance * MIN_REWARD_RISK_RATIO;
    }
    let max_tp_distance = entry_price * MAX_TP_WIDEN_PCT;
    if tp_distance > max_tp_distance {
        tp_distance = max_tp_distance;
    }

    let (stop_loss, take_profit) = match side {
        Side::Long => (entry_price - sl_distance, entry_price + tp_distance),
        Side::Short => (entry_price + sl_distance, entry_price - tp_distance),
    };
    Some((stop_loss, take_profit))
}

/// If the signal itself carries an SL/TP, use it only when it is *strictly
/// tighter* than the computed one (§4.6 step 4e): a smaller SL distance, or
/// a smaller (more conservative) TP distance, both measured from entry.
pub fn tighten_with_signal(
    computed: (f64, f64),
    signal_sl: Option<f64>,
    signal_tp: Option<f64>,
    entry_price: f64,
    side: Side,
) -> (f64, f64) {
    let (mut sl, mut tp) = computed;
    if let Some(signal_sl) = signal_sl {
        let computed_dist = (entry_price - sl).abs();
        let signal_dist = (entry_price - signal_sl).abs();
        if signal_dist < computed_dist {
            sl = signal_sl;
        }
    }
    if let Some(signal_tp) = signal_tp {
        let computed_dist = (entry_price - tp).abs();
        let signal_dist = (entry_price - signal_tp).abs();
        if signal_dist < computed_dist {
            tp = signal_tp;
        }
    }
    let _ = side;
    (sl, tp)
}

/// Inputs to position sizing (§4.4 "Position sizing").
pub struct SizingInput<'a> {
    pub balance: f64,
    pub risk_per_trade_pct: f64,
    pub stop_loss_pct: f64,
    pub max_position_usd: f64,
    pub confidence: f64,
    pub candles: &'a [Candle],
    pub kelly_stats: Option<KellyStats>,
}

/// Final USD-notional size for a new position, following §4.4 steps 1-6.
pub fn size_position(input: &SizingInput) -> f64 {
    let base = input.balance * input.risk_per_trade_pct;
    let sized_from_sl = if input.stop_loss_pct > 0.0 { base / input.stop_loss_pct } else { base };

    let kelly_size = input.kelly_stats.as_ref().and_then(|stats| {
        if stats.count < MIN_TRADES_FOR_KELLY || stats.avg_loss <= 0.0 {
            return None;
        }
        let p = stats.win_rate;
        let w = stats.avg_win;
        let l = stats.avg_loss;
        let f_star = (p * w - (1.0 - p) * l) / w;
        let clamped = f_star.clamp(0.0, KELLY_MAX_FRACTION);
        Some(input.balance * clamped / 2.0)
    });

    let sigma = realized_volatility(input.candles, VOL_LOOKBACK);
    let vol_mult = if sigma < LOW_VOL_THRESHOLD {
        LOW_VOL_MULTIPLIER
    } else if sigma > HIGH_VOL_THRESHOLD {
        HIGH_VOL_MULTIPLIER
    } else {
        1.0
    };

    let risk_based = match kelly_size {
        Some(k) => sized_from_sl.min(k),
        None => sized_from_sl,
    };

    let scaled = risk_based * vol_mult * input.confidence;
    let equity_cap = input.balance * MAX_EQUITY_FRACTION;

    scaled.min(input.max_position_usd).min(equity_cap).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_candles(n: usize, price: f64, atr_seed: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = price + (i as f64 * 0.01);
                Candle::new(i as i64, close - atr_seed / 2.0, close + atr_seed / 2.0, close - atr_seed, close, 10.0, i as i64 + 1)
            })
            .collect()
    }

    #[test]
    fn sl_tp_trending_uses_1_5_3_0_multipliers() {
        let candles = flat_candles(30, 100.0, 1.0);
        let result = dynamic_stop_loss_take_profit(&candles, 100.0, Side::Long, MarketRegime::Bull, 0.5);
        assert!(result.is_some());
    }

    #[test]
    fn insufficient_candles_returns_none() {
        let candles = flat_candles(5, 100.0, 1.0);
        assert!(dynamic_stop_loss_take_profit(&candles, 100.0, Side::Long, MarketRegime::Bull, 0.5).is_none());
    }

    #[test]
    fn reward_risk_ratio_is_enforced() {
        let candles = flat_candles(30, 100.0, 1.0);
        let (sl, tp) = dynamic_stop_loss_take_profit(&candles, 100.0, Side::Long, MarketRegime::Sideways, 0.5).unwrap();
        let risk = 100.0 - sl;
        let reward = tp - 100.0;
        assert!(reward / risk >= MIN_REWARD_RISK_RATIO - 1e-6);
    }

    #[test]
    fn signal_sl_tightens_when_closer() {
        let (sl, tp) = tighten_with_signal((95.0, 110.0), Some(97.0), None, 100.0, Side::Long);
        assert_eq!(sl, 97.0);
        assert_eq!(tp, 110.0);
    }

    #[test]
    fn signal_sl_ignored_when_looser() {
        let (sl, _) = tighten_with_signal((95.0, 110.0), Some(90.0), None, 100.0, Side::Long);
        assert_eq!(sl, 95.0);
    }

    #[test]
    fn kelly_skipped_without_enough_trades() {
        let input = SizingInput {
            balance: 10_000.0,
            risk_per_trade_pct: 0.02,
            stop_loss_pct: 0.02,
            max_position_usd: 5_000.0,
            confidence: 1.0,
            candles: &flat_candles(30, 100.0, 1.0),
            kelly_stats: Some(KellyStats { win_rate: 0.6, avg_win: 100.0, avg_loss: 50.0, count: 5 }),
        };
        // base/stop_loss_pct = 200/0.02 = 10_000, capped by equity_cap 2_500
        let size = size_position(&input);
        assert!(size <= 2_500.0 + 1e-6);
    }

    #[test]
    fn zero_avg_loss_skips_kelly() {
        let input = SizingInput {
            balance: 10_000.0,
            risk_per_trade_pct: 0.02,
            stop_loss_pct: 0.02,
            max_position_usd: 50_000.0,
            confidence: 1.0,
            candles: &flat_candles(30, 100.0, 1.0),
            kelly_stats: Some(KellyStats { win_rate: 0.6, avg_win: 100.0, avg_loss: 0.0, count: 50 }),
        };
        let size = size_position(&input);
        assert!(size > 0.0);
    }
}
