// =============================================================================
// Signal Validator (§4.3)
// =============================================================================
//
// Input: one deduplicated signal plus the context the validator needs to
// score it (historical accuracy, consensus count, current regime). Output:
// `(accept, score, reasons)`. Each step multiplies or gates the score; the
// reasons are returned for both accept and reject so the caller can persist
// them for observability (§4.3 closing paragraph).
// =============================================================================

use crate::models::Signal;
use crate::store::AccuracyStats;
use crate::types::{MarketRegime, SignalAction};

/// Minimum sample size before historical accuracy is trusted (§4.3 step 2),
/// shared with the risk manager's Kelly-sizing threshold.
pub const MIN_TRADES_FOR_ACCURACY: u32 = 20;

const ACCURACY_FLOOR: f64 = 0.4;
const ACCURACY_PENALTY_MULTIPLIER: f64 = 0.8;

const CONSENSUS_MIN_COUNT: u32 = 2;
const CONSENSUS_BOOST_MULTIPLIER: f64 = 1.2;

const REGIME_COUNTERTREND_THRESHOLD_BUMP: f64 = 0.1;
const REGIME_VOLATILE_THRESHOLD_BUMP: f64 = 0.05;

pub struct ValidationResult {
    pub accept: bool,
    pub score: f64,
    pub reasons: Vec<String>,
}

/// Context the caller gathers once per candidate signal before validating it.
pub struct ValidationContext {
    pub min_confidence: f64,
    pub volatility_capped_confidence: f64,
    pub volatility_cap_threshold: f64,
    pub realized_volatility_24h: f64,
    pub accuracy: Option<AccuracyStats>,
    pub consensus_count: u32,
    pub regime: Option<MarketRegime>,
}

/// Validate `signal` against `ctx`, following §4.3 steps 1-5.
pub fn validate(signal: &Signal, ctx: &ValidationContext) -> ValidationResult {
    let mut reasons = Vec::new();

    // Step 1: base gate, with the volatility-adjusted threshold cap.
    let base_threshold = if ctx.realized_volatility_24h > ctx.volatility_cap_threshold {
        ctx.volatility_capped_confidence
    } else {
        ctx.min_confidence
    };
    if signal.confidence < base_threshold {
        reasons.push(format!(
            "confidence {:.2} below base threshold {:.2}",
            signal.confidence, base_threshold
        ));
        return ValidationResult { accept: false, score: 0.0, reasons };
    }
    reasons.push(format!("confidence {:.2} clears base threshold {:.2}", signal.confidence, base_threshold));

    let mut score = signal.confidence;

    // Step 2: historical accuracy.
    if let Some(accuracy) = &ctx.accuracy {
        if accuracy.total >= MIN_TRADES_FOR_ACCURACY {
            let rate = accuracy.win_rate();
            if rate < ACCURACY_FLOOR {
                score *= ACCURACY_PENALTY_MULTIPLIER;
                reasons.push(format!("historical accuracy {:.2} below floor {:.2}, score penalized", rate, ACCURACY_FLOOR));
            } else {
                reasons.push(format!("historical accuracy {:.2} acceptable", rate));
            }
        }
    }

    // Step 3: consensus.
    if ctx.consensus_count >= CONSENSUS_MIN_COUNT {
        score = (score * CONSENSUS_BOOST_MULTIPLIER).min(1.0);
        reasons.push(format!("consensus from {} other signals, score boosted", ctx.consensus_count));
    }

    // Step 4: regime adjustment raises the acceptance threshold rather than
    // touching the score directly.
    let mut threshold = base_threshold;
    if let Some(regime) = ctx.regime {
        let countertrend = matches!(
            (regime, signal.action),
            (MarketRegime::Bear, SignalAction::Buy) | (MarketRegime::Bull, SignalAction::Sell)
        );
        if countertrend {
            threshold += REGIME_COUNTERTREND_THRESHOLD_BUMP;
            reasons.push(format!("counter-trend in {regime} regime, threshold raised to {threshold:.2}"));
        } else if matches!(regime, MarketRegime::Volatile) {
            threshold += REGIME_VOLATILE_THRESHOLD_BUMP;
            reasons.push(format!("volatile regime, threshold raised to {threshold:.2}"));
        }
    }

    // Step 5: final decision.
    let accept = score >= threshold;
    if accept {
        reasons.push(format!("score {score:.2} clears final threshold {threshold:.2}"));
    } else {
        reasons.push(format!("score {score:.2} below final threshold {threshold:.2}"));
    }

    ValidationResult { accept, score, reasons }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn signal(confidence: f64, action: SignalAction) -> Signal {
        Signal {
            id: Uuid::new_v4(),
            symbol: "BTC/USDT".to_string(),
            action,
            confidence,
            source: "titan_v3".to_string(),
            reasoning: None,
            user_id: None,
            stop_loss: None,
            take_profit: None,
            expires_at: None,
            created_at: Utc::now(),
        }
    }

    fn base_ctx() -> ValidationContext {
        ValidationContext {
            min_confidence: 0.35,
            volatility_capped_confidence: 0.65,
            volatility_cap_threshold: 0.05,
            realized_volatility_24h: 0.01,
            accuracy: None,
            consensus_count: 0,
            regime: None,
        }
    }

    #[test]
    fn rejects_below_base_threshold() {
        let s = signal(0.2, SignalAction::Buy);
        let result = validate(&s, &base_ctx());
        assert!(!result.accept);
    }

    #[test]
    fn high_volatility_raises_base_threshold() {
        let s = signal(0.5, SignalAction::Buy);
        let mut ctx = base_ctx();
        ctx.realized_volatility_24h = 0.1;
        let result = validate(&s, &ctx);
        assert!(!result.accept, "0.5 confidence should fail the 0.65 volatility-capped threshold");
    }

    #[test]
    fn poor_accuracy_penalizes_score() {
        let s = signal(0.8, SignalAction::Buy);
        let mut ctx = base_ctx();
        ctx.accuracy = Some(AccuracyStats { wins: 5, total: 25 });
        let result = validate(&s, &ctx);
        assert!((result.score - 0.8 * 0.8).abs() < 1e-9);
    }

    #[test]
    fn consensus_boosts_score_capped_at_one() {
        let s = signal(0.9, SignalAction::Buy);
        let mut ctx = base_ctx();
        ctx.consensus_count = 3;
        let result = validate(&s, &ctx);
        assert!((result.score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn countertrend_regime_raises_threshold() {
        let s = signal(0.4, SignalAction::Buy);
        let mut ctx = base_ctx();
        ctx.regime = Some(MarketRegime::Bear);
        let result = validate(&s, &ctx);
        assert!(!result.accept, "0.4 score should fail a 0.45 threshold in a bear regime");
    }

    #[test]
    fn accepts_clean_signal() {
        let s = signal(0.8, SignalAction::Buy);
        let result = validate(&s, &base_ctx());
        assert!(result.accept);
        assert!(!result.reasons.is_empty());
    }
}
