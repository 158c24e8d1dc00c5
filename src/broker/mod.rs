// =============================================================================
// Broker Adapter (§4.1) — uniform order/position/balance operations over
// heterogeneous spot/margin/futures venues.
// =============================================================================
//
// `Broker` is the duck-typed capability set from §9: a small trait any venue
// adapter implements. The trading-mode tag carried by each instance encodes
// the spot/margin/futures differences instead of branching all over the
// call sites (§9 "Duck-typed broker swap").
// =============================================================================

pub mod binance;

use async_trait::async_trait;

use crate::candles::Candle;
use crate::error::BrokerError;
use crate::types::{OrderType, Side, TradingMode};

/// A resting or filled order as reported by the venue.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub reduce_only: bool,
}

/// A position as currently reported by the venue (§4.8 reconciliation input).
#[derive(Debug, Clone)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
}

/// Free balance of the account's quote/margin currency.
#[derive(Debug, Clone, Copy)]
pub struct Balance {
    pub free: f64,
}

/// Equity and used margin, for the liquidation-protection check (§4.7 step 7,
/// non-spot only).
#[derive(Debug, Clone, Copy)]
pub struct MarginSnapshot {
    pub equity: f64,
    pub used_margin: f64,
}

impl MarginSnapshot {
    /// `margin_level = equity / used_margin * 100%` (§4.7). `None` when
    /// there's no open exposure (nothing to divide by).
    pub fn margin_level_pct(&self) -> Option<f64> {
        if self.used_margin <= 0.0 {
            None
        } else {
            Some(self.equity / self.used_margin * 100.0)
        }
    }
}

/// Request to open a new position (§4.1 `place_order`).
#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub leverage: Option<f64>,
    pub reduce_only: bool,
}

/// Outcome of `place_order`: the filled/resting order plus whether SL/TP
/// were accepted as exchange-side conditional orders or must be enforced by
/// the Position Monitor instead (§4.1).
#[derive(Debug, Clone)]
pub struct PlaceOrderResult {
    pub order: Order,
    pub sl_tp_exchange_side: bool,
}

/// Uniform, mode-aware interface over a single user's exchange account
/// (§4.1). One instance is constructed per `(user, exchange, trading_mode)`.
#[async_trait]
pub trait Broker: Send + Sync {
    fn trading_mode(&self) -> TradingMode;

    /// In spot mode, `reduce_only` is silently dropped and `leverage` forced
    /// to 1.0 (never an error — see §4.1). In margin/futures, SL/TP are
    /// submitted as exchange-side conditional orders when the venue supports
    /// it, otherwise the caller must treat them as monitor-side obligations
    /// (`sl_tp_exchange_side = false`).
    async fn place_order(&self, req: PlaceOrderRequest) -> Result<PlaceOrderResult, BrokerError>;

    /// Full-quantity close. `reduce_only` is set only for non-spot modes.
    async fn close_position(&self, symbol: &str, side: Side, quantity: f64) -> Result<Order, BrokerError>;

    /// Partial close of `qty` out of `remaining`. If `remaining - qty` would
    /// fall below the venue's dust threshold, closes the position entirely
    /// instead (§4.1).
    async fn partial_close(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        remaining: f64,
    ) -> Result<Order, BrokerError>;

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>, BrokerError>;

    async fn get_balance(&self) -> Result<Balance, BrokerError>;

    /// `None` in spot mode — there is no margin concept to report.
    async fn get_margin_snapshot(&self) -> Result<Option<MarginSnapshot>, BrokerError>;

    async fn get_market_price(&self, symbol: &str) -> Result<f64, BrokerError>;

    /// `fetch_ohlcv(timeframe, limit)` (§6).
    async fn get_ohlcv(&self, symbol: &str, timeframe: &str, limit: u32) -> Result<Vec<Candle>, BrokerError>;

    async fn set_leverage(&self, symbol: &str, leverage: f64) -> Result<(), BrokerError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), BrokerError>;
}

/// Per-market dust threshold below which a partial close is escalated to a
/// full close (§4.1). A fixed fraction of the original quantity is a
/// reasonable stand-in for the venue's real `minQty`/`stepSize` filters,
/// which are exchange-protocol detail out of scope for the core (§1).
pub const DUST_THRESHOLD_FRACTION: f64 = 0.001;

/// Whether closing `qty` out of `remaining` would leave a dust residual,
/// given the position's `original_quantity`.
pub fn leaves_dust(remaining: f64, qty: f64, original_quantity: f64) -> bool {
    let residual = remaining - qty;
    residual > 0.0 && residual < original_quantity * DUST_THRESHOLD_FRACTION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn margin_level_none_when_no_exposure() {
        let snap = MarginSnapshot { equity: 1000.0, used_margin: 0.0 };
        assert_eq!(snap.margin_level_pct(), None);
    }

    #[test]
    fn margin_level_computed() {
        let snap = MarginSnapshot { equity: 350.0, used_margin: 1000.0 };
        assert!((snap.margin_level_pct().unwrap() - 35.0).abs() < 1e-9);
    }

    #[test]
    fn dust_detection() {
        assert!(leaves_dust(1.0, 0.999, 1.0));
        assert!(!leaves_dust(1.0, 0.5, 1.0));
        assert!(!leaves_dust(1.0, 1.0, 1.0));
    }
}
