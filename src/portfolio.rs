// =============================================================================
// Portfolio Manager (§4.5)
// =============================================================================
//
// Pure with respect to its inputs (§4.5 closing line): never calls the
// broker, only consumes the caller's snapshot of open positions and
// balances and returns a sizing decision.
// =============================================================================

/// Asset category used for concentration caps (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetCategory {
    L1,
    Meme,
    DeFi,
    Other,
}

/// Static symbol → category classification. A handful of representative
/// entries; anything absent falls back to `Other` with the default 40% cap.
fn classify(symbol: &str) -> AssetCategory {
    let base = symbol.split('/').next().unwrap_or(symbol).to_uppercase();
    match base.as_str() {
        "BTC" | "ETH" | "SOL" | "AVAX" | "ADA" | "DOT" | "NEAR" => AssetCategory::L1,
        "DOGE" | "SHIB" | "PEPE" | "WIF" | "FLOKI" => AssetCategory::Meme,
        "UNI" | "AAVE" | "MKR" | "CRV" | "LDO" | "COMP" => AssetCategory::DeFi,
        _ => AssetCategory::Other,
    }
}

fn category_cap(category: AssetCategory) -> f64 {
    match category {
        AssetCategory::L1 => 4.0,
        AssetCategory::Meme => 0.10,
        AssetCategory::DeFi => 0.50,
        AssetCategory::Other => 0.40,
    }
}

const SINGLE_POSITION_EQUITY_CAP: f64 = 0.25;
const STABLE_RESERVE_MIN_FRACTION: f64 = 0.10;
const STABLE_RESERVE_PENALTY_MULTIPLIER: f64 = 0.5;
const HHI_CONCENTRATION_THRESHOLD: f64 = 0.7;
const HHI_PENALTY_MULTIPLIER: f64 = 0.8;

/// One open position's notional exposure, as the portfolio manager sees it.
pub struct OpenExposure {
    pub symbol: String,
    pub notional_usd: f64,
}

pub struct PortfolioCheckInput<'a> {
    pub symbol: &'a str,
    pub proposed_usd_size: f64,
    pub equity: f64,
    pub stablecoin_balance_usd: f64,
    pub open_positions: &'a [OpenExposure],
}

pub struct PortfolioDecision {
    pub execute: bool,
    pub size_multiplier: f64,
    pub reasons: Vec<String>,
}

/// Evaluate concentration, category-exposure, stablecoin-reserve, and HHI
/// limits for a proposed new position (§4.5). Each hard-limit check either
/// rejects outright or multiplies `size_multiplier` down; multipliers
/// compose multiplicatively across checks.
pub fn check(input: &PortfolioCheckInput) -> PortfolioDecision {
    let mut reasons = Vec::new();
    let mut multiplier = 1.0;

    // Single position ≤ 25% of equity -> scale down.
    if input.equity > 0.0 {
        let position_fraction = input.proposed_usd_size / input.equity;
        if position_fraction > SINGLE_POSITION_EQUITY_CAP {
            let scale = SINGLE_POSITION_EQUITY_CAP / position_fraction;
            multiplier *= scale;
            reasons.push(format!(
                "position would be {:.1}% of equity, scaled down to {:.1}%",
                position_fraction * 100.0,
                SINGLE_POSITION_EQUITY_CAP * 100.0
            ));
        }
    }

    // Category exposure cap.
    let category = classify(input.symbol);
    let cap = category_cap(category);
    let existing_category_notional: f64 = input
        .open_positions
        .iter()
        .filter(|p| classify(&p.symbol) == category)
        .map(|p| p.notional_usd)
        .sum();
    if input.equity > 0.0 {
        let projected_fraction = (existing_category_notional + input.proposed_usd_size) / input.equity;
        if projected_fraction > cap {
            let room = (cap * input.equity - existing_category_notional).max(0.0);
            if room <= 0.0 {
                reasons.push(format!("{category:?} category exposure already at cap {:.0}%", cap * 100.0));
                return PortfolioDecision { execute: false, size_multiplier: 0.0, reasons };
            }
            let scale = room / input.proposed_usd_size;
            multiplier *= scale.min(1.0);
            reasons.push(format!("{category:?} category exposure scaled to stay under {:.0}% cap", cap * 100.0));
        }
    }

    // Stablecoin reserve.
    if input.equity > 0.0 {
        let reserve_fraction = input.stablecoin_balance_usd / input.equity;
        if reserve_fraction < STABLE_RESERVE_MIN_FRACTION {
            multiplier *= STABLE_RESERVE_PENALTY_MULTIPLIER;
            reasons.push(format!(
                "stablecoin reserve {:.1}% below {:.0}% minimum, size halved",
                reserve_fraction * 100.0,
                STABLE_RESERVE_MIN_FRACTION * 100.0
            ));
        }
    }

    // Herfindahl-Hirschman concentration index over open-position notionals
    // plus the proposed size.
    let hhi = herfindahl_hirschman_index(input.open_positions, input.proposed_usd_size);
    if hhi > HHI_CONCENTRATION_THRESHOLD {
        multiplier *= HHI_PENALTY_MULTIPLIER;
        reasons.push(format!("portfolio HHI {hhi:.2} exceeds {HHI_CONCENTRATION_THRESHOLD:.2}, size reduced"));
    }

    if reasons.is_empty() {
        reasons.push("within all portfolio limits".to_string());
    }

    PortfolioDecision { execute: multiplier > 0.0, size_multiplier: multiplier.clamp(0.0, 1.0), reasons }
}

/// HHI = sum of squared notional shares (0..1 each), including the proposed
/// new position as if it were already open.
fn herfindahl_hirschman_index(open_positions: &[OpenExposure], proposed_usd_size: f64) -> f64 {
    let total: f64 = open_positions.iter().map(|p| p.notional_usd).sum::<f64>() + proposed_usd_size;
    if total <= 0.0 {
        return 0.0;
    }
    let mut hhi = (proposed_usd_size / total).powi(2);
    for p in open_positions {
        hhi += (p.notional_usd / total).powi(2);
    }
    hhi
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_down_oversized_single_position() {
        let input = PortfolioCheckInput {
            symbol: "BTC/USDT",
            proposed_usd_size: 4_000.0,
            equity: 10_000.0,
            stablecoin_balance_usd: 2_000.0,
            open_positions: &[],
        };
        let decision = check(&input);
        assert!(decision.execute);
        assert!(decision.size_multiplier < 1.0);
    }

    #[test]
    fn meme_category_cap_is_tight() {
        let input = PortfolioCheckInput {
            symbol: "DOGE/USDT",
            proposed_usd_size: 2_000.0,
            equity: 10_000.0,
            stablecoin_balance_usd: 2_000.0,
            open_positions: &[],
        };
        let decision = check(&input);
        // 10% cap of 10_000 = 1_000, so a 2_000 proposal must scale down hard.
        assert!(decision.size_multiplier < 0.6);
    }

    #[test]
    fn low_stablecoin_reserve_halves_size() {
        let input = PortfolioCheckInput {
            symbol: "ETH/USDT",
            proposed_usd_size: 500.0,
            equity: 10_000.0,
            stablecoin_balance_usd: 200.0,
            open_positions: &[],
        };
        let decision = check(&input);
        assert!((decision.size_multiplier - 0.5).abs() < 1e-6);
    }

    #[test]
    fn unknown_symbol_uses_default_cap() {
        assert_eq!(classify("XYZABC/USDT"), AssetCategory::Other);
        assert!((category_cap(AssetCategory::Other) - 0.40).abs() < 1e-9);
    }

    #[test]
    fn high_hhi_reduces_size() {
        let existing = vec![OpenExposure { symbol: "BTC/USDT".to_string(), notional_usd: 9_000.0 }];
        let input = PortfolioCheckInput {
            symbol: "BTC/USDT",
            proposed_usd_size: 100.0,
            equity: 20_000.0,
            stablecoin_balance_usd: 5_000.0,
            open_positions: &existing,
        };
        let decision = check(&input);
        assert!(decision.size_multiplier < 1.0);
    }
}
