// =============================================================================
// Binance-backed `Broker` implementation (§4.1)
// =============================================================================
//
// Wraps `crate::binance::client::BinanceClient` with the mode-aware
// invariants the spec requires (spot forces leverage 1.0 and drops
// `reduceOnly`) and the retry policy from §7: transient/rate-limited errors
// get up to 3 attempts with jittered exponential backoff before they're
// surfaced to the caller.
// =============================================================================

use async_trait::async_trait;
use rand::Rng;
use tracing::{instrument, warn};

use crate::binance::client::BinanceClient;
use crate::binance::rate_limit::RateLimitTracker;
use crate::broker::{
    Balance, Broker, ExchangePosition, MarginSnapshot, Order, PlaceOrderRequest, PlaceOrderResult,
};
use crate::candles::Candle;
use crate::error::BrokerError;
use crate::types::{OrderType, Side, TradingMode};

const MAX_RETRIES: u32 = 3;

pub struct BinanceBroker {
    client: BinanceClient,
    mode: TradingMode,
    rate_limiter: RateLimitTracker,
}

impl BinanceBroker {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>, mode: TradingMode) -> Self {
        Self {
            client: BinanceClient::new(api_key, api_secret, mode),
            mode,
            rate_limiter: RateLimitTracker::new(),
        }
    }

    /// Jittered exponential backoff: `attempt` is 0-indexed.
    async fn backoff(attempt: u32) {
        let base_ms = 200u64 * 2u64.pow(attempt);
        let jitter_ms = rand::thread_rng().gen_range(0..=100);
        tokio::time::sleep(std::time::Duration::from_millis(base_ms + jitter_ms)).await;
    }

    /// Run `f` with up to `MAX_RETRIES` attempts, retrying only on errors
    /// classified transient/rate-limited by the venue's response text (§4.1,
    /// §7). Business rejections (insufficient funds, margin too low) are
    /// never retried — they're returned to the caller immediately.
    async fn with_retry<T, F, Fut>(&self, op: &str, mut f: F) -> Result<T, BrokerError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let classified = classify_error(&e);
                    if !classified.is_retryable() || attempt + 1 >= MAX_RETRIES {
                        if classified.is_retryable() {
                            warn!(op, attempt, "broker call exhausted retries");
                        }
                        return Err(classified);
                    }
                    warn!(op, attempt, error = %e, "retryable broker error, backing off");
                    Self::backoff(attempt).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Map a raw venue error (currently string-based, since `BinanceClient` uses
/// `anyhow`) into the semantic taxonomy from §7. Real CCXT-style adapters
/// branch on exchange error codes; we branch on the substrings the reference
/// client's `anyhow::bail!` messages already carry.
fn classify_error(e: &anyhow::Error) -> BrokerError {
    let msg = e.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("insufficient") {
        BrokerError::InsufficientFunds(msg)
    } else if lower.contains("margin") && lower.contains("low") {
        BrokerError::MarginTooLow(msg)
    } else if lower.contains("429") || lower.contains("rate limit") || lower.contains("-1003") {
        BrokerError::RateLimited(msg)
    } else if lower.contains("timeout") || lower.contains("connection") || lower.contains("5") {
        BrokerError::Transient(msg)
    } else {
        BrokerError::Transient(msg)
    }
}

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Long => "BUY",
        Side::Short => "SELL",
    }
}

fn order_type_str(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
    }
}

#[async_trait]
impl Broker for BinanceBroker {
    fn trading_mode(&self) -> TradingMode {
        self.mode
    }

    #[instrument(skip(self, req), fields(symbol = %req.symbol, side = %req.side))]
    async fn place_order(&self, req: PlaceOrderRequest) -> Result<PlaceOrderResult, BrokerError> {
        // Spot invariant (§4.1): reduceOnly silently dropped, leverage forced.
        let is_spot = self.mode.is_spot();
        let reduce_only = req.reduce_only && !is_spot;
        let leverage = if is_spot { 1.0 } else { req.leverage.unwrap_or(1.0) };

        if !is_spot && req.leverage.is_some() {
            self.set_leverage(&req.symbol, leverage).await?;
        }

        self.rate_limiter.record_order_sent();
        let body = self
            .with_retry("place_order", || {
                self.client.place_order(
                    &req.symbol,
                    side_str(req.side),
                    order_type_str(req.order_type),
                    req.quantity,
                    req.price,
                    if matches!(req.order_type, OrderType::Limit) {
                        Some("GTC")
                    } else {
                        None
                    },
                    None,
                    reduce_only,
                )
            })
            .await?;

        let order = Order {
            id: body["orderId"].as_u64().map(|n| n.to_string()).unwrap_or_default(),
            symbol: req.symbol.clone(),
            side: req.side,
            quantity: req.quantity,
            price: req.price.unwrap_or(0.0),
            reduce_only,
        };

        // SL/TP are never submitted exchange-side by this adapter: the
        // reference account family exposes conditional orders through a
        // separate signed endpoint this core does not call, so SL/TP stay
        // monitor-side obligations in every mode (§4.1's fallback clause).
        Ok(PlaceOrderResult { order, sl_tp_exchange_side: false })
    }

    #[instrument(skip(self), fields(symbol))]
    async fn close_position(&self, symbol: &str, side: Side, quantity: f64) -> Result<Order, BrokerError> {
        let close_side = side.opposite();
        let reduce_only = !self.mode.is_spot();

        self.rate_limiter.record_order_sent();
        let body = self
            .with_retry("close_position", || {
                self.client.place_order(
                    symbol,
                    side_str(close_side),
                    "MARKET",
                    quantity,
                    None,
                    None,
                    None,
                    reduce_only,
                )
            })
            .await?;

        Ok(Order {
            id: body["orderId"].as_u64().map(|n| n.to_string()).unwrap_or_default(),
            symbol: symbol.to_string(),
            side: close_side,
            quantity,
            price: 0.0,
            reduce_only,
        })
    }

    async fn partial_close(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        remaining: f64,
    ) -> Result<Order, BrokerError> {
        if crate::broker::leaves_dust(remaining, qty, remaining) {
            return self.close_position(symbol, side, remaining).await;
        }
        let close_side = side.opposite();
        let reduce_only = !self.mode.is_spot();

        self.rate_limiter.record_order_sent();
        let body = self
            .with_retry("partial_close", || {
                self.client.place_order(symbol, side_str(close_side), "MARKET", qty, None, None, None, reduce_only)
            })
            .await?;

        Ok(Order {
            id: body["orderId"].as_u64().map(|n| n.to_string()).unwrap_or_default(),
            symbol: symbol.to_string(),
            side: close_side,
            quantity: qty,
            price: 0.0,
            reduce_only,
        })
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>, BrokerError> {
        if self.mode.is_spot() {
            // Spot has no "position" concept on the venue side; the core
            // treats every filled spot buy as a position it already tracks.
            return Ok(Vec::new());
        }
        let rows = self.with_retry("get_positions", || self.client.get_position_risk()).await?;

        let positions = rows
            .into_iter()
            .filter_map(|row| {
                let qty: f64 = row["positionAmt"].as_str()?.parse().ok()?;
                if qty.abs() < f64::EPSILON {
                    return None;
                }
                let side = if qty > 0.0 { Side::Long } else { Side::Short };
                let entry_price: f64 = row["entryPrice"].as_str()?.parse().ok()?;
                Some(ExchangePosition {
                    symbol: row["symbol"].as_str()?.to_string(),
                    side,
                    quantity: qty.abs(),
                    entry_price,
                })
            })
            .collect();
        Ok(positions)
    }

    async fn get_balance(&self) -> Result<Balance, BrokerError> {
        let asset = if self.mode.is_spot() { "USDT" } else { "USDT" };
        let free = self.with_retry("get_balance", || self.client.get_balance(asset)).await?;
        Ok(Balance { free })
    }

    async fn get_margin_snapshot(&self) -> Result<Option<MarginSnapshot>, BrokerError> {
        if self.mode.is_spot() {
            return Ok(None);
        }
        let (equity, used_margin) = self
            .with_retry("get_margin_snapshot", || self.client.get_margin_snapshot())
            .await?;
        Ok(Some(MarginSnapshot { equity, used_margin }))
    }

    async fn get_market_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        self.with_retry("get_market_price", || self.client.get_price(symbol)).await
    }

    async fn get_ohlcv(&self, symbol: &str, timeframe: &str, limit: u32) -> Result<Vec<Candle>, BrokerError> {
        self.with_retry("get_ohlcv", || self.client.get_klines(symbol, timeframe, limit)).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: f64) -> Result<(), BrokerError> {
        if self.mode.is_spot() {
            // Never attempted on spot — forcing leverage to 1.0 is implicit.
            return Ok(());
        }
        self.with_retry("set_leverage", || self.client.set_leverage(symbol, leverage.round() as u32))
            .await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), BrokerError> {
        self.with_retry("cancel_order", || self.client.cancel_order(symbol, order_id))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_insufficient_funds() {
        let e = anyhow::anyhow!("Binance POST order returned 400: insufficient balance");
        assert!(matches!(classify_error(&e), BrokerError::InsufficientFunds(_)));
    }

    #[test]
    fn classify_rate_limited() {
        let e = anyhow::anyhow!("Binance GET klines returned 429: rate limit exceeded");
        let classified = classify_error(&e);
        assert!(matches!(classified, BrokerError::RateLimited(_)));
        assert!(classified.is_retryable());
    }

    #[test]
    fn classify_margin_too_low() {
        let e = anyhow::anyhow!("margin too low for requested leverage");
        assert!(matches!(classify_error(&e), BrokerError::MarginTooLow(_)));
    }
}
