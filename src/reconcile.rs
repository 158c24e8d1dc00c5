// =============================================================================
// Hybrid Persistence & Reconciliation (§4.8) — the matching logic shared by
// startup reconciliation and the Auto-Trader's per-cycle broker reconcile
// (§4.6 step 3).
// =============================================================================

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::config::Config;
use crate::models::{Position, Trade};
use crate::regime::{self, DEFAULT_LOOKBACK};
use crate::risk::dynamic_stop_loss_take_profit;
use crate::store::Store;
use crate::types::{CloseReason, Side, TradingMode};

/// Default SL/TP distance (as a fraction of entry price) used when ATR
/// candles aren't available for a freshly ingested, broker-only position —
/// falls back to the user's configured `stop_loss_pct`/`take_profit_pct`
/// rather than leaving a position unprotected.
fn fallback_stop_loss_take_profit(entry_price: f64, side: Side, stop_loss_pct: f64, take_profit_pct: f64) -> (f64, f64) {
    match side {
        Side::Long => (entry_price * (1.0 - stop_loss_pct), entry_price * (1.0 + take_profit_pct)),
        Side::Short => (entry_price * (1.0 + stop_loss_pct), entry_price * (1.0 - take_profit_pct)),
    }
}

/// For every position the broker reports that isn't already tracked in the
/// store, ingest it as a new `Position` with SL/TP computed from current
/// market state and no trailing/partial-TP history (§4.8 step 2, §4.6 step
/// 3). Returns the newly ingested positions.
pub async fn ingest_unmonitored_positions(
    broker: &dyn Broker,
    store: &dyn Store,
    user_id: Uuid,
    trading_mode: TradingMode,
    stop_loss_pct: f64,
    take_profit_pct: f64,
    config: &Config,
) -> anyhow::Result<Vec<Position>> {
    let exchange_positions = broker.get_positions().await?;
    if exchange_positions.is_empty() {
        return Ok(Vec::new());
    }

    let tracked = store.load_open_positions().await?;
    let mut ingested = Vec::new();

    for exch_pos in exchange_positions {
        let already_tracked = tracked
            .iter()
            .any(|p| p.user_id == user_id && p.symbol == exch_pos.symbol && p.side == exch_pos.side);
        if already_tracked {
            continue;
        }

        let candles = broker.get_ohlcv(&exch_pos.symbol, "1h", 60).await.ok();
        let regime = candles.as_deref().and_then(|c| regime::detect_regime(c, DEFAULT_LOOKBACK));

        let (stop_loss, take_profit) = match (candles.as_deref(), regime) {
            (Some(candles), Some(regime)) => dynamic_stop_loss_take_profit(
                candles,
                exch_pos.entry_price,
                exch_pos.side,
                regime,
                stop_loss_pct,
            )
            .unwrap_or_else(|| fallback_stop_loss_take_profit(exch_pos.entry_price, exch_pos.side, stop_loss_pct, take_profit_pct)),
            _ => fallback_stop_loss_take_profit(exch_pos.entry_price, exch_pos.side, stop_loss_pct, take_profit_pct),
        };

        let position = Position::new(
            user_id,
            exch_pos.symbol.clone(),
            exch_pos.side,
            exch_pos.quantity,
            exch_pos.entry_price,
            stop_loss,
            take_profit,
            1.0,
            trading_mode,
            Utc::now(),
        );
        store.upsert_position(&position).await?;
        info!(symbol = %position.symbol, position_id = %position.id, "ingested unmonitored broker position");
        ingested.push(position);
    }

    Ok(ingested)
}

/// For every in-memory OPEN position for `user_id` that the broker no
/// longer reports and which has aged past `grace`, close it with reason
/// `ghost_cleanup` using `last_price_fn` for the exit price (§4.8 step 2
/// "ghost cleanup"). Returns the resulting trades.
pub async fn ghost_cleanup<F, Fut>(
    store: &dyn Store,
    broker: &dyn Broker,
    user_id: Uuid,
    grace_minutes: i64,
    now: DateTime<Utc>,
    last_price_fn: F,
) -> anyhow::Result<Vec<Trade>>
where
    F: Fn(String) -> Fut,
    Fut: std::future::Future<Output = f64>,
{
    let tracked = store.load_open_positions().await?;
    let exchange_positions = broker.get_positions().await.unwrap_or_default();

    let mut trades = Vec::new();
    for mut position in tracked.into_iter().filter(|p| p.user_id == user_id) {
        let still_open_on_exchange = exchange_positions
            .iter()
            .any(|e| e.symbol == position.symbol && e.side == position.side);
        if still_open_on_exchange {
            continue;
        }
        let age_minutes = (now - position.opened_at).num_minutes();
        if age_minutes < grace_minutes {
            continue;
        }

        let exit_price = last_price_fn(position.symbol.clone()).await;
        let trade = Trade::new(&position, position.quantity, exit_price, CloseReason::GhostCleanup, now);

        position.quantity = 0.0;
        position.status = crate::types::PositionStatus::Closed;
        position.closed_at = Some(now);

        store.upsert_position(&position).await?;
        store.insert_trade(&trade).await?;
        warn!(symbol = %position.symbol, position_id = %position.id, "ghost position cleaned up on reconciliation");
        trades.push(trade);
    }

    Ok(trades)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Balance, ExchangePosition, MarginSnapshot, Order, PlaceOrderRequest, PlaceOrderResult};
    use crate::candles::Candle;
    use crate::error::BrokerError;
    use crate::store::memory::InMemoryStore;
    use crate::types::OrderType;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct FakeBroker {
        positions: Vec<ExchangePosition>,
        price: Mutex<f64>,
    }

    #[async_trait]
    impl Broker for FakeBroker {
        fn trading_mode(&self) -> TradingMode {
            TradingMode::Futures
        }
        async fn place_order(&self, _req: PlaceOrderRequest) -> Result<PlaceOrderResult, BrokerError> {
            unimplemented!()
        }
        async fn close_position(&self, _symbol: &str, _side: Side, _quantity: f64) -> Result<Order, BrokerError> {
            unimplemented!()
        }
        async fn partial_close(&self, _symbol: &str, _side: Side, _qty: f64, _remaining: f64) -> Result<Order, BrokerError> {
            unimplemented!()
        }
        async fn get_positions(&self) -> Result<Vec<ExchangePosition>, BrokerError> {
            Ok(self.positions.clone())
        }
        async fn get_balance(&self) -> Result<Balance, BrokerError> {
            unimplemented!()
        }
        async fn get_margin_snapshot(&self) -> Result<Option<MarginSnapshot>, BrokerError> {
            Ok(None)
        }
        async fn get_market_price(&self, _symbol: &str) -> Result<f64, BrokerError> {
            Ok(*self.price.lock())
        }
        async fn get_ohlcv(&self, _symbol: &str, _timeframe: &str, _limit: u32) -> Result<Vec<Candle>, BrokerError> {
            Ok(Vec::new())
        }
        async fn set_leverage(&self, _symbol: &str, _leverage: f64) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn ingests_broker_only_position() {
        let broker = FakeBroker {
            positions: vec![ExchangePosition { symbol: "BTC/USDT".to_string(), side: Side::Long, quantity: 0.1, entry_price: 50_000.0 }],
            price: Mutex::new(50_000.0),
        };
        let store = InMemoryStore::new();
        let user_id = Uuid::new_v4();

        let config = Config::default();
        let ingested = ingest_unmonitored_positions(&broker, &store, user_id, TradingMode::Futures, 0.02, 0.04, &config)
            .await
            .unwrap();

        assert_eq!(ingested.len(), 1);
        assert_eq!(ingested[0].symbol, "BTC/USDT");
        assert_eq!(store.load_open_positions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ghost_cleanup_closes_stale_position() {
        let broker = FakeBroker { positions: vec![], price: Mutex::new(49_000.0) };
        let store = InMemoryStore::new();
        let user_id = Uuid::new_v4();

        let opened_at = Utc::now() - chrono::Duration::minutes(10);
        let position = Position::new(user_id, "BTC/USDT", Side::Long, 0.1, 50_000.0, 49_000.0, 52_000.0, 1.0, TradingMode::Futures, opened_at);
        store.upsert_position(&position).await.unwrap();

        let trades = ghost_cleanup(&store, &broker, user_id, 2, Utc::now(), |_symbol| async { 49_000.0 }).await.unwrap();

        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].close_reason, CloseReason::GhostCleanup);
        assert!(store.load_open_positions().await.unwrap().is_empty());
    }
}
